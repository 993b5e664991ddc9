use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::events::now_utc_iso;

/// One persisted requester-to-external-account link.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub requester_id: u64,
    pub external_id: u64,
    pub created_at: String,
}

/// Durable mapping from requester identity to external-account identity,
/// backed by a single JSON object file keyed by requester id.
///
/// Reads refresh from disk and writes merge per-key with whatever another
/// instance flushed in the meantime, so two stores pointed at the same
/// file do not clobber each other's rows.
#[derive(Debug, Clone)]
pub struct LinkStore {
    path: PathBuf,
    payload: Option<Map<String, Value>>,
    dirty_keys: Vec<String>,
}

impl LinkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: None,
            dirty_keys: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolves a requester to their linked external id, if any.
    pub fn get(&mut self, requester_id: u64) -> Option<u64> {
        self.get_link(requester_id).map(|link| link.external_id)
    }

    pub fn get_link(&mut self, requester_id: u64) -> Option<Link> {
        let key = requester_id.to_string();
        let payload = self.ensure_loaded(true);
        let row = payload.get(&key).and_then(Value::as_object)?;
        let external_id = row.get("external_id").and_then(Value::as_u64)?;
        let created_at = row
            .get("created_at")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(Link {
            requester_id,
            external_id,
            created_at,
        })
    }

    /// Last-write-wins upsert; a new link for the same requester overwrites
    /// the old row. Timestamped at write time.
    pub fn upsert(&mut self, requester_id: u64, external_id: u64) -> anyhow::Result<()> {
        let key = requester_id.to_string();
        let mut row = Map::new();
        row.insert("external_id".to_string(), Value::Number(external_id.into()));
        row.insert("created_at".to_string(), Value::String(now_utc_iso()));

        let payload = self.ensure_loaded(true);
        payload.insert(key.clone(), Value::Object(row));
        if !self.dirty_keys.contains(&key) {
            self.dirty_keys.push(key);
        }
        self.flush()
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if self.payload.is_none() || self.dirty_keys.is_empty() {
            return Ok(());
        }

        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if let Some(payload) = &self.payload {
            for key in &self.dirty_keys {
                if let Some(value) = payload.get(key) {
                    on_disk.insert(key.clone(), value.clone());
                }
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = Some(on_disk);
        self.dirty_keys.clear();
        Ok(())
    }

    fn ensure_loaded(&mut self, refresh: bool) -> &mut Map<String, Value> {
        if refresh || self.payload.is_none() {
            self.payload = Some(read_json_object(&self.path).unwrap_or_default());
        }
        self.payload.as_mut().expect("link payload initialized")
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::LinkStore;

    #[test]
    fn upsert_and_get_round_trip() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("links.json");
        let mut store = LinkStore::new(path);
        store.upsert(42, 999)?;
        assert_eq!(store.get(42), Some(999));
        assert_eq!(store.get(43), None);
        Ok(())
    }

    #[test]
    fn upsert_overwrites_prior_row_for_requester() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("links.json");
        let mut store = LinkStore::new(&path);
        store.upsert(42, 999)?;
        store.upsert(42, 1000)?;

        let mut reloaded = LinkStore::new(path);
        assert_eq!(reloaded.get(42), Some(1000));
        Ok(())
    }

    #[test]
    fn link_rows_are_timestamped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("links.json");
        let mut store = LinkStore::new(path);
        store.upsert(42, 999)?;

        let link = store.get_link(42).unwrap();
        assert_eq!(link.external_id, 999);
        DateTime::parse_from_rfc3339(&link.created_at)?;
        Ok(())
    }

    #[test]
    fn upsert_merges_with_concurrent_writer() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("links.json");
        let mut store_a = LinkStore::new(&path);
        let mut store_b = LinkStore::new(&path);

        store_a.upsert(1, 100)?;
        store_b.upsert(2, 200)?;
        store_a.upsert(3, 300)?;

        let mut reloaded = LinkStore::new(path);
        assert_eq!(reloaded.get(1), Some(100));
        assert_eq!(reloaded.get(2), Some(200));
        assert_eq!(reloaded.get(3), Some(300));
        Ok(())
    }

    #[test]
    fn get_refreshes_between_instances() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("links.json");
        let mut store_a = LinkStore::new(&path);
        let mut store_b = LinkStore::new(&path);

        store_a.upsert(42, 999)?;
        assert_eq!(store_b.get(42), Some(999));

        store_b.upsert(42, 1000)?;
        assert_eq!(store_a.get(42), Some(1000));
        Ok(())
    }
}
