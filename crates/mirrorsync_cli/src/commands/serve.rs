//! The `serve` command: expose the orchestrator over HTTP.

use std::net::SocketAddr;
use std::path::Path;

use crate::config::Config;

pub(crate) async fn handle_serve(
    manifest: &Path,
    dest: &Path,
    listen: &str,
    config: &Config,
    database_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| format!("invalid listen address {listen:?}: {e}"))?;

    let (orchestrator, target) =
        super::build_orchestrator(manifest, dest, config, database_url).await?;

    println!("Serving sync API for {target} on http://{addr}");
    println!("Press Ctrl+C to stop.");

    tokio::select! {
        result = mirrorsync::server::serve(orchestrator, addr) => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down.");
        }
    }

    Ok(())
}
