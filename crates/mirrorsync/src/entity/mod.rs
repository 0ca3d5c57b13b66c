//! SeaORM entity definitions for the mirrorsync database schema.

pub mod cache_record;
pub mod sync_task;
pub mod prelude;
