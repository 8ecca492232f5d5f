//! Statistics snapshot file.
//!
//! The whole retained statistics state plus the WSPRNet counters is written
//! as one JSON document. Writes go to a sibling temp file which is fsynced
//! and then renamed over the target, so a crash mid-write leaves the old
//! snapshot intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::stats::StatsSnapshot;
use crate::wsprnet::WsprNetStats;

/// On-disk document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub saved_at: DateTime<Utc>,

    #[serde(flatten)]
    pub stats: StatsSnapshot,

    #[serde(default)]
    pub wsprnet_stats: WsprNetStats,
}

/// Reads and writes the snapshot file.
#[derive(Debug)]
pub struct Persister {
    path: PathBuf,
    saves: AtomicU64,
    failures: AtomicU64,
}

impl Persister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            saves: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. Missing or unreadable files yield `None`.
    pub fn load(&self) -> Option<PersistedState> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No saved stats at {}, starting empty", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to read {}: {}, starting empty", self.path.display(), e);
                return None;
            }
        };

        match serde_json::from_slice::<PersistedState>(&bytes) {
            Ok(state) => {
                info!(
                    "Restored stats saved at {} ({} windows, {} instances)",
                    state.saved_at,
                    state.stats.windows.len(),
                    state.stats.instances.len()
                );
                Some(state)
            }
            Err(e) => {
                warn!("Ignoring corrupt stats file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Write `state` via temp file, fsync and rename.
    ///
    /// Failures are counted and returned; the next save simply tries again.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        match write_atomic(&self.path, state) {
            Ok(()) => {
                self.saves.fetch_add(1, Ordering::Relaxed);
                debug!("Saved stats to {}", self.path.display());
                Ok(())
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to save stats to {}: {}", self.path.display(), e);
                Err(e)
            }
        }
    }

    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_atomic(path: &Path, state: &PersistedState) -> Result<()> {
    let io = |e: std::io::Error| Error::PersistenceIo(e.to_string());

    let json = serde_json::to_vec_pretty(state).map_err(|e| Error::PersistenceIo(e.to_string()))?;

    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir).map_err(io)?;
    }

    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp).map_err(io)?;
        file.write_all(&json).map_err(io)?;
        file.sync_all().map_err(io)?;
    }
    fs::rename(&tmp, path).map_err(io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::test_support::{make_spot, make_spot_at};
    use crate::stats::{StatsTracker, WindowStats};

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("wspr-agg-{}-{}", std::process::id(), name));
        let _ = fs::remove_dir_all(&dir);
        dir.join("stats.json")
    }

    fn populated_tracker() -> StatsTracker {
        let stats = StatsTracker::new("FN42");
        stats.register_instances(["kiwi-a", "kiwi-b"]);

        let a = make_spot("kiwi-a", "G0XYZ", -14);
        let mut b = make_spot("kiwi-b", "G0XYZ", -10);
        b.dt = -0.7;
        let mut c = make_spot_at("kiwi-a", "JA1ZZZ", -21, 130);
        c.grid = "PM95".to_string();
        c.country = "Japan".to_string();
        for s in [&a, &b, &c] {
            stats.record_spot(s);
        }
        stats.record_best_snr("kiwi-b", "20m");
        stats.record_duplicate("kiwi-a", "20m", "kiwi-b");
        stats.record_unique("kiwi-a", "20m");
        stats.record_parse_failure();

        for spot in [&a, &c] {
            stats.finish_window(WindowStats {
                window_time: spot.epoch_time,
                total_spots: 1,
                deduped_spots: 1,
                ..Default::default()
            });
        }
        stats
    }

    #[test]
    fn test_save_load_round_trip() {
        let path = scratch("roundtrip");
        let persister = Persister::new(&path);
        let original = populated_tracker();

        let state = PersistedState {
            saved_at: Utc::now(),
            stats: original.snapshot(),
            wsprnet_stats: WsprNetStats {
                successful: 17,
                failed: 2,
                retries: 5,
            },
        };
        persister.save(&state).unwrap();
        assert!(!temp_path(&path).exists());

        let loaded = persister.load().expect("Should load");
        assert_eq!(loaded, state);

        let restored = StatsTracker::new("FN42");
        restored.restore(loaded.stats);
        assert_eq!(restored.snapshot(), original.snapshot());
        assert_eq!(persister.saves(), 1);
    }

    #[test]
    fn test_document_keys() {
        let path = scratch("keys");
        let persister = Persister::new(&path);
        let state = PersistedState {
            saved_at: Utc::now(),
            stats: populated_tracker().snapshot(),
            wsprnet_stats: WsprNetStats::default(),
        };
        persister.save(&state).unwrap();

        let doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        for key in [
            "saved_at",
            "windows",
            "instances",
            "country_stats",
            "map_spots",
            "snr_history",
            "total_stats",
            "wsprnet_stats",
        ] {
            assert!(doc.get(key).is_some(), "missing key {}", key);
        }
        assert!(doc["wsprnet_stats"].get("retries").is_some());
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let persister = Persister::new(scratch("missing"));
        assert!(persister.load().is_none());
    }

    #[test]
    fn test_corrupt_file_is_empty_state() {
        let path = scratch("corrupt");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{\"saved_at\": \"not a date\", \"windows\": [").unwrap();

        let persister = Persister::new(&path);
        assert!(persister.load().is_none());
    }

    #[test]
    fn test_save_failure_counted() {
        let path = scratch("blocked");
        // A directory where the file should be makes the rename fail
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("occupant"), b"x").unwrap();

        let persister = Persister::new(&path);
        let state = PersistedState {
            saved_at: Utc::now(),
            stats: StatsTracker::new("FN42").snapshot(),
            wsprnet_stats: WsprNetStats::default(),
        };
        assert!(matches!(
            persister.save(&state),
            Err(Error::PersistenceIo(_))
        ));
        assert_eq!(persister.failures(), 1);
    }
}
