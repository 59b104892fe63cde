//! One JSON record per instance under `configs/`, keyed by id.
//!
//! Records are never rewritten in place: `save` only succeeds when no record
//! for the id exists yet. Identity reservations (`<id>.lock`) live next to the
//! records so the allocator sees both in a single listing.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{self, InstanceConfig};
use crate::error::QvmError;
use crate::settings::Settings;
use crate::util;

/// Keeps temp names unique across threads of one process.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
    settings: Settings,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            dir: dir.into(),
            settings,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn record_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn lock_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("{id}.lock"))
    }

    /// Ids with a persisted record, ascending.
    pub fn list(&self) -> Result<Vec<u32>, QvmError> {
        Ok(self.scan("json")?.into_iter().collect())
    }

    /// Ids with a reservation file, ascending.
    pub fn reservations(&self) -> Result<Vec<u32>, QvmError> {
        Ok(self.scan("lock")?.into_iter().collect())
    }

    /// Every id that is taken, by a record or by an in-flight reservation.
    pub fn keyspace(&self) -> Result<BTreeSet<u32>, QvmError> {
        let mut ids = self.scan("json")?;
        ids.extend(self.scan("lock")?);
        Ok(ids)
    }

    fn scan(&self, ext: &str) -> Result<BTreeSet<u32>, QvmError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => {
                return Err(QvmError::Io {
                    context: format!("reading {}", self.dir.display()),
                    source: e,
                });
            }
        };

        let suffix = format!(".{ext}");
        Ok(entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                let stem = name.strip_suffix(&suffix)?;
                if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                stem.parse().ok()
            })
            .collect())
    }

    pub fn exists(&self, id: u32) -> bool {
        self.record_path(id).is_file()
    }

    /// Persist a new record. Fails with `AlreadyExists` instead of replacing
    /// an existing one.
    pub fn save(&self, cfg: &InstanceConfig) -> Result<(), QvmError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| QvmError::Io {
            context: format!("creating {}", self.dir.display()),
            source: e,
        })?;

        let target = self.record_path(cfg.id);
        if target.exists() {
            return Err(QvmError::AlreadyExists { id: cfg.id });
        }

        let json = facet_json::to_string(cfg).expect("JSON serialization");
        if !self.link_new(&target, json.as_bytes())? {
            return Err(QvmError::AlreadyExists { id: cfg.id });
        }
        tracing::debug!(id = cfg.id, path = %target.display(), "saved config");
        Ok(())
    }

    /// Write `contents` to a temp file and hard-link it to `target`, so the
    /// target never exists without its contents. Returns `false` when the
    /// target is already taken.
    fn link_new(&self, target: &Path, contents: &[u8]) -> Result<bool, QvmError> {
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("record");
        let tmp = self.dir.join(format!(
            ".{name}.{}.{}.tmp",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(contents)?;
            file.sync_all()
        };
        if let Err(e) = write() {
            let _ = std::fs::remove_file(&tmp);
            return Err(QvmError::Io {
                context: format!("writing {}", tmp.display()),
                source: e,
            });
        }

        // hard_link refuses to replace an existing target, so two racing
        // writers cannot both win.
        let linked = std::fs::hard_link(&tmp, target);
        let _ = std::fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(QvmError::Io {
                context: format!("linking {}", target.display()),
                source: e,
            }),
        }
    }

    /// Read and re-validate a record.
    pub fn load(&self, id: u32) -> Result<InstanceConfig, QvmError> {
        let path = self.record_path(id);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(QvmError::NotFound { id });
            }
            Err(source) => {
                return Err(QvmError::ConfigLoad {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        let cfg: InstanceConfig =
            facet_json::from_str(&contents).map_err(|e| QvmError::ConfigParse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        if cfg.id != id {
            return Err(QvmError::Validation {
                message: format!("{} holds a record for id {}", path.display(), cfg.id),
            });
        }
        config::validate(&cfg, &self.settings)
    }

    /// Remove a record. Returns whether one existed.
    pub fn delete(&self, id: u32) -> Result<bool, QvmError> {
        util::remove_if_exists(&self.record_path(id))
    }

    /// Atomically claim `id` for an in-flight create.
    ///
    /// Fails with `AlreadyExists` when a record or another reservation
    /// already holds the id.
    pub fn reserve(&self, id: u32) -> Result<Reservation, QvmError> {
        if self.exists(id) {
            return Err(QvmError::AlreadyExists { id });
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| QvmError::Io {
            context: format!("creating {}", self.dir.display()),
            source: e,
        })?;

        // The owner pid is in place before the lock becomes visible, so a
        // concurrent sweep never sees an ownerless reservation.
        let path = self.lock_path(id);
        let owner = format!("{}\n", std::process::id());
        if !self.link_new(&path, owner.as_bytes())? {
            return Err(QvmError::AlreadyExists { id });
        }

        // A record may have landed between the existence check and the lock.
        if self.exists(id) {
            let _ = std::fs::remove_file(&path);
            return Err(QvmError::AlreadyExists { id });
        }

        tracing::debug!(id, "reserved id");
        Ok(Reservation { id, path })
    }

    /// Owning pid recorded in a reservation, if readable.
    pub fn reservation_owner(&self, id: u32) -> Option<u32> {
        std::fs::read_to_string(self.lock_path(id))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Drop a reservation regardless of owner.
    pub fn release(&self, id: u32) -> Result<bool, QvmError> {
        util::remove_if_exists(&self.lock_path(id))
    }
}

/// A held identity. The lock file is removed when this is dropped.
#[derive(Debug)]
pub struct Reservation {
    id: u32,
    path: PathBuf,
}

impl Reservation {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::debug!(id = self.id, error = %e, "failed to remove reservation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u32) -> InstanceConfig {
        InstanceConfig {
            id,
            hostname: format!("vm-{id}"),
            memory: 512,
            cpus: 1,
            accelerator: "tcg".into(),
            disk_path: format!("/state/vms/{id}-0.qcow2"),
            cloud_init_path: format!("/state/vms/{id}-cloud-init.iso"),
            uuid: "6f1c2b9e-2f7a-4d55-9a55-1b2f3c4d5e6f".into(),
            ..InstanceConfig::default()
        }
    }

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("configs"), Settings::default());
        (dir, store)
    }

    #[test]
    fn save_then_load_returns_validated_record() {
        let (_dir, store) = store();
        let cfg = record(150);
        store.save(&cfg).unwrap();
        let loaded = store.load(150).unwrap();
        assert_eq!(loaded, config::validate(&cfg, store.settings()).unwrap());
    }

    #[test]
    fn save_never_overwrites() {
        let (_dir, store) = store();
        store.save(&record(150)).unwrap();
        let mut other = record(150);
        other.hostname = "intruder".into();
        assert!(matches!(
            store.save(&other),
            Err(QvmError::AlreadyExists { id: 150 })
        ));
        assert_eq!(store.load(150).unwrap().hostname, "vm-150");
    }

    #[test]
    fn load_missing_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(store.load(404), Err(QvmError::NotFound { id: 404 })));
    }

    #[test]
    fn load_corrupt_is_parse_error() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.dir().join("150.json"), "{not json").unwrap();
        assert!(matches!(store.load(150), Err(QvmError::ConfigParse { .. })));
    }

    #[test]
    fn list_only_counts_numeric_json() {
        let (_dir, store) = store();
        store.save(&record(300)).unwrap();
        store.save(&record(120)).unwrap();
        for junk in ["abc.json", "12a.json", "130.json.bak", ".131.json.9.tmp", "140.lock"] {
            std::fs::write(store.dir().join(junk), "x").unwrap();
        }
        assert_eq!(store.list().unwrap(), vec![120, 300]);
        assert_eq!(
            store.keyspace().unwrap().into_iter().collect::<Vec<_>>(),
            vec![120, 140, 300]
        );
    }

    #[test]
    fn list_of_missing_dir_is_empty() {
        let (_dir, store) = store();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn delete_reports_presence() {
        let (_dir, store) = store();
        store.save(&record(150)).unwrap();
        assert!(store.delete(150).unwrap());
        assert!(!store.delete(150).unwrap());
        assert!(!store.exists(150));
    }

    #[test]
    fn reservation_is_exclusive_and_released_on_drop() {
        let (_dir, store) = store();
        let held = store.reserve(150).unwrap();
        assert_eq!(held.id(), 150);
        assert_eq!(store.reservation_owner(150), Some(std::process::id()));
        assert!(matches!(
            store.reserve(150),
            Err(QvmError::AlreadyExists { id: 150 })
        ));
        drop(held);
        assert!(store.reservations().unwrap().is_empty());
        store.reserve(150).unwrap();
    }

    #[test]
    fn visible_lock_always_names_its_owner() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.dir()).unwrap();
        let lock = store.dir().join("150.lock");
        let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        let watcher = {
            let done = done.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    if let Ok(contents) = std::fs::read_to_string(&lock) {
                        assert_eq!(contents.trim(), std::process::id().to_string());
                    }
                }
            })
        };
        for _ in 0..300 {
            drop(store.reserve(150).unwrap());
        }
        done.store(true, Ordering::Relaxed);
        watcher.join().unwrap();

        assert!(store.reservations().unwrap().is_empty());
        let leftovers: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn cannot_reserve_persisted_id() {
        let (_dir, store) = store();
        store.save(&record(150)).unwrap();
        assert!(matches!(
            store.reserve(150),
            Err(QvmError::AlreadyExists { id: 150 })
        ));
    }
}
