//! File-backed source and store used by the CLI.
//!
//! [`JsonFileSource`] serves a JSON manifest as a paginated remote dataset,
//! which makes local mirrors and pipeline rehearsals work without network
//! access. [`DirStore`] persists normalized records as one JSON document
//! per record under a destination directory, with a fingerprint index for
//! incremental runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mirrorsync::{
    LocalStore, NormalizedRecord, RecordPage, RemoteRecord, RemoteSource, Result, SyncError,
};

/// A paginated source backed by a JSON manifest file.
///
/// The manifest is a JSON array of objects. Each object needs an `id`
/// (string or number); an optional `asset` field names a file relative to
/// the manifest to serve as the record's binary asset.
#[derive(Debug)]
pub(crate) struct JsonFileSource {
    name: String,
    items: Vec<RemoteRecord>,
    base: PathBuf,
}

impl JsonFileSource {
    /// Load a manifest from disk.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SyncError::fatal(format!("cannot read manifest {}: {e}", path.display())))?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::fatal(format!("manifest is not valid JSON: {e}")))?;
        let entries = value
            .as_array()
            .ok_or_else(|| SyncError::fatal("manifest must be a JSON array of objects"))?;

        let mut items = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let remote_id = match entry.get("id") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                _ => {
                    return Err(SyncError::fatal(format!(
                        "manifest entry {index} is missing an id"
                    )));
                }
            };
            let asset_ref = entry
                .get("asset")
                .and_then(|v| v.as_str())
                .map(String::from);
            let updated_at = entry
                .get("updated_at")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.to_utc());
            items.push(RemoteRecord {
                remote_id,
                payload: entry.clone(),
                asset_ref,
                updated_at,
            });
        }

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "manifest".to_string());
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self { name, items, base })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[async_trait]
impl RemoteSource for JsonFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_page(&self, cursor: Option<&str>, page_size: usize) -> Result<RecordPage> {
        let start = match cursor {
            None => 0,
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| SyncError::fatal(format!("malformed cursor {c:?}")))?,
        };
        let end = start.saturating_add(page_size).min(self.items.len());
        Ok(RecordPage {
            items: self.items[start.min(end)..end].to_vec(),
            next_cursor: (end < self.items.len()).then(|| end.to_string()),
            total_hint: Some(self.items.len()),
        })
    }

    async fn fetch_asset(&self, asset_ref: &str) -> Result<Vec<u8>> {
        let path = self.base.join(asset_ref);
        tokio::fs::read(&path)
            .await
            .map_err(|e| SyncError::transient(format!("asset {} unavailable: {e}", path.display())))
    }
}

/// A content store writing one JSON document per record.
///
/// Layout under the destination directory:
/// - `records/<id>.json` - fingerprint, sync time and normalized content
/// - `assets/<id>` - the record's binary asset, when present
/// - `index.json` - id -> fingerprint map, rebuilt by `refresh_index`
pub(crate) struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, remote_id: &str) -> PathBuf {
        self.root
            .join("records")
            .join(format!("{}.json", sanitize(remote_id)))
    }

    fn asset_path(&self, remote_id: &str) -> PathBuf {
        self.root.join("assets").join(sanitize(remote_id))
    }

    async fn scan_fingerprints(&self) -> Result<HashMap<String, String>> {
        let records_dir = self.root.join("records");
        let mut known = HashMap::new();

        let mut entries = match tokio::fs::read_dir(&records_dir).await {
            Ok(entries) => entries,
            // No records yet: a fresh destination is an empty store.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(known),
            Err(e) => return Err(SyncError::fatal(format!("cannot scan store: {e}"))),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::fatal(format!("cannot scan store: {e}")))?
        {
            let Ok(bytes) = tokio::fs::read(entry.path()).await else {
                continue;
            };
            let Ok(doc) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
                continue;
            };
            if let (Some(id), Some(fingerprint)) = (
                doc.get("remote_id").and_then(|v| v.as_str()),
                doc.get("fingerprint").and_then(|v| v.as_str()),
            ) {
                known.insert(id.to_string(), fingerprint.to_string());
            }
        }
        Ok(known)
    }
}

#[async_trait]
impl LocalStore for DirStore {
    async fn upsert(&self, record: &NormalizedRecord) -> Result<()> {
        let map_err = |e: std::io::Error| SyncError::persistence(&record.remote_id, e.to_string());

        let path = self.record_path(&record.remote_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(map_err)?;
        }
        let doc = serde_json::json!({
            "remote_id": record.remote_id,
            "fingerprint": record.fingerprint,
            "synced_at": record.synced_at,
            "content": record.content,
        });
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| SyncError::persistence(&record.remote_id, e.to_string()))?;
        tokio::fs::write(&path, bytes).await.map_err(map_err)?;

        if let Some(asset) = &record.asset {
            let asset_path = self.asset_path(&record.remote_id);
            if let Some(parent) = asset_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(map_err)?;
            }
            tokio::fs::write(&asset_path, asset).await.map_err(map_err)?;
        }
        Ok(())
    }

    async fn delete(&self, remote_id: &str) -> Result<()> {
        for path in [self.record_path(remote_id), self.asset_path(remote_id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(SyncError::persistence(remote_id, e.to_string())),
            }
        }
        Ok(())
    }

    async fn known_fingerprints(&self) -> Result<HashMap<String, String>> {
        // Prefer the index; fall back to a directory scan when it is
        // missing or stale-looking (not parseable).
        let index_path = self.root.join("index.json");
        if let Ok(bytes) = tokio::fs::read(&index_path).await
            && let Ok(known) = serde_json::from_slice::<HashMap<String, String>>(&bytes)
        {
            return Ok(known);
        }
        self.scan_fingerprints().await
    }

    async fn refresh_index(&self) -> Result<()> {
        let known = self.scan_fingerprints().await?;
        let bytes = serde_json::to_vec_pretty(&known)
            .map_err(|e| SyncError::fatal(format!("cannot serialize index: {e}")))?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| SyncError::fatal(format!("cannot create store directory: {e}")))?;
        tokio::fs::write(self.root.join("index.json"), bytes)
            .await
            .map_err(|e| SyncError::fatal(format!("cannot write index: {e}")))
    }
}

/// Keep record ids filesystem-safe.
fn sanitize(remote_id: &str) -> String {
    remote_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str) -> NormalizedRecord {
        NormalizedRecord {
            remote_id: id.to_string(),
            fingerprint: format!("fp-{id}"),
            content: serde_json::json!({"id": id}),
            asset: None,
            synced_at: Utc::now(),
        }
    }

    #[test]
    fn sanitize_replaces_path_characters() {
        assert_eq!(sanitize("org/repo"), "org-repo");
        assert_eq!(sanitize("plain_id-1.2"), "plain_id-1.2");
    }

    #[tokio::test]
    async fn manifest_pages_and_reports_total() {
        let dir = std::env::temp_dir().join(format!("mirrorsync-test-{}", uuid_suffix()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let manifest = dir.join("catalog.json");
        let entries: Vec<serde_json::Value> = (0..25)
            .map(|i| serde_json::json!({"id": i, "title": format!("item {i}")}))
            .collect();
        tokio::fs::write(&manifest, serde_json::to_vec(&entries).unwrap())
            .await
            .unwrap();

        let source = JsonFileSource::load(&manifest).await.unwrap();
        assert_eq!(source.name(), "catalog");
        assert_eq!(source.len(), 25);

        let first = source.fetch_page(None, 10).await.unwrap();
        assert_eq!(first.items.len(), 10);
        assert_eq!(first.total_hint, Some(25));
        let cursor = first.next_cursor.unwrap();

        let second = source.fetch_page(Some(&cursor), 10).await.unwrap();
        assert_eq!(second.items[0].remote_id, "10");

        let last = source.fetch_page(Some("20"), 10).await.unwrap();
        assert_eq!(last.items.len(), 5);
        assert!(last.next_cursor.is_none());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn manifest_rejects_entries_without_id() {
        let dir = std::env::temp_dir().join(format!("mirrorsync-test-{}", uuid_suffix()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let manifest = dir.join("bad.json");
        tokio::fs::write(&manifest, br#"[{"title": "no id"}]"#)
            .await
            .unwrap();

        let err = JsonFileSource::load(&manifest).await.unwrap_err();
        assert!(err.to_string().contains("missing an id"));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn store_round_trips_records_and_index() {
        let dir = std::env::temp_dir().join(format!("mirrorsync-test-{}", uuid_suffix()));
        let store = DirStore::new(&dir);

        store.upsert(&record("a")).await.unwrap();
        store.upsert(&record("b")).await.unwrap();
        store.refresh_index().await.unwrap();

        let known = store.known_fingerprints().await.unwrap();
        assert_eq!(known.len(), 2);
        assert_eq!(known.get("a").map(String::as_str), Some("fp-a"));

        store.delete("a").await.unwrap();
        store.refresh_index().await.unwrap();
        let known = store.known_fingerprints().await.unwrap();
        assert_eq!(known.len(), 1);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn empty_store_has_no_fingerprints() {
        let dir = std::env::temp_dir().join(format!("mirrorsync-test-{}", uuid_suffix()));
        let store = DirStore::new(&dir);
        assert!(store.known_fingerprints().await.unwrap().is_empty());
    }

    fn uuid_suffix() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        format!("{}-{nanos}", std::process::id())
    }
}
