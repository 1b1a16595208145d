//! Persisted per-camera counters, upserted by camera id.
//!
//! The store is an external collaborator as far as the engine is concerned:
//! saves that fail are logged and the pipeline keeps counting in memory.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::traffic::data::{counts_total, Counts};

pub trait CounterStore: Send + Sync {
    /// Upsert counts for a camera. Returns whether the write was persisted.
    fn save(&self, camera_id: &str, camera_name: &str, counts: &Counts) -> bool;
    fn load(&self, camera_id: &str) -> Option<Counts>;
    fn all(&self) -> Vec<CameraRecord>;
}

#[derive(Clone, Debug, Serialize)]
pub struct CameraRecord {
    pub camera_id: String,
    pub camera_name: String,
    pub counts: Counts,
    pub total: u64,
    pub last_updated: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredEntry {
    camera_name: String,
    counts: Counts,
    last_updated: String,
}

/// JSON-file-backed store. The whole table is kept in memory and flushed
/// with a write-temp-then-rename on every save, so a crash mid-write never
/// corrupts the previous snapshot.
pub struct JsonFileStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, StoredEntry>>,
}

impl JsonFileStore {
    pub fn new(path: &Path) -> Self {
        let cache = match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, StoredEntry>>(&raw) {
                Ok(table) => {
                    info!("loaded {} camera record(s) from {}", table.len(), path.display());
                    table
                }
                Err(err) => {
                    warn!("ignoring unreadable counter store {}: {err}", path.display());
                    BTreeMap::new()
                }
            },
            Err(_) => {
                debug!("no counter store at {}; starting empty", path.display());
                BTreeMap::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            cache: Mutex::new(cache),
        }
    }

    fn flush(&self, table: &BTreeMap<String, StoredEntry>) -> std::io::Result<()> {
        let raw = serde_json::to_string_pretty(table)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)
    }
}

impl CounterStore for JsonFileStore {
    fn save(&self, camera_id: &str, camera_name: &str, counts: &Counts) -> bool {
        let Ok(mut table) = self.cache.lock() else {
            return false;
        };
        table.insert(
            camera_id.to_string(),
            StoredEntry {
                camera_name: camera_name.to_string(),
                counts: counts.clone(),
                last_updated: Utc::now().to_rfc3339(),
            },
        );
        match self.flush(&table) {
            Ok(()) => {
                debug!("saved counts for camera {camera_id}");
                true
            }
            Err(err) => {
                warn!("failed to persist counts for {camera_id}: {err}");
                false
            }
        }
    }

    fn load(&self, camera_id: &str) -> Option<Counts> {
        let table = self.cache.lock().ok()?;
        let entry = table.get(camera_id)?;
        info!("resumed counts for camera {camera_id}");
        Some(entry.counts.clone())
    }

    fn all(&self) -> Vec<CameraRecord> {
        let Ok(table) = self.cache.lock() else {
            return Vec::new();
        };
        table
            .iter()
            .map(|(camera_id, entry)| CameraRecord {
                camera_id: camera_id.clone(),
                camera_name: entry.camera_name.clone(),
                counts: entry.counts.clone(),
                total: counts_total(&entry.counts),
                last_updated: entry.last_updated.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::data::{new_counts, VehicleClass};

    fn temp_store(tag: &str) -> (JsonFileStore, PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "trafficwatch-store-{}-{}.json",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_file(&path);
        (JsonFileStore::new(&path), path)
    }

    #[test]
    fn save_then_load_roundtrips() {
        let (store, path) = temp_store("roundtrip");
        let mut counts = new_counts();
        counts.insert(VehicleClass::Car, 12);
        counts.insert(VehicleClass::Bus, 3);

        assert!(store.save("cam-1", "North Gate", &counts));
        assert_eq!(store.load("cam-1"), Some(counts.clone()));

        // a fresh store instance reads the flushed file
        let reopened = JsonFileStore::new(&path);
        assert_eq!(reopened.load("cam-1"), Some(counts));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn save_upserts_by_camera_id() {
        let (store, path) = temp_store("upsert");
        let mut counts = new_counts();
        counts.insert(VehicleClass::Car, 1);
        store.save("cam-1", "Gate", &counts);

        counts.insert(VehicleClass::Car, 5);
        store.save("cam-1", "Gate", &counts);

        assert_eq!(store.all().len(), 1);
        assert_eq!(store.load("cam-1").unwrap()[&VehicleClass::Car], 5);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn unknown_camera_loads_nothing() {
        let (store, path) = temp_store("missing");
        assert!(store.load("nope").is_none());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn unwritable_path_degrades_to_memory_only() {
        let path = std::env::temp_dir()
            .join("trafficwatch-no-such-dir")
            .join("counters.json");
        let store = JsonFileStore::new(&path);
        let counts = new_counts();

        // the flush fails, but the in-memory table still answers loads
        assert!(!store.save("cam-1", "Gate", &counts));
        assert_eq!(store.load("cam-1"), Some(counts));
    }

    #[test]
    fn all_reports_totals() {
        let (store, path) = temp_store("all");
        let mut counts = new_counts();
        counts.insert(VehicleClass::Car, 2);
        counts.insert(VehicleClass::Truck, 1);
        store.save("cam-1", "Gate", &counts);

        let records = store.all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total, 3);
        assert_eq!(records[0].camera_name, "Gate");
        let _ = fs::remove_file(&path);
    }
}
