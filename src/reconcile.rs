use crate::process::{self, ProcessTable};
use crate::store::ConfigStore;

/// Drop pid markers whose process is gone, and reservations whose creator
/// has died. Returns the number of pid markers removed.
///
/// Never fails: anything unreadable is logged and skipped.
pub fn sweep(store: &ConfigStore, table: &ProcessTable) -> usize {
    let mut removed = 0;

    match store.list() {
        Ok(ids) => {
            for id in ids {
                if !table.exists(id) {
                    continue;
                }
                let stale = match table.read(id) {
                    Some(pid) => !process::is_alive(pid),
                    None => true,
                };
                if !stale {
                    continue;
                }
                match table.remove(id) {
                    Ok(true) => {
                        tracing::info!(id, "removed stale pid marker");
                        removed += 1;
                    }
                    Ok(false) => {}
                    Err(e) => tracing::debug!(id, error = %e, "failed to remove pid marker"),
                }
            }
        }
        Err(e) => tracing::debug!(error = %e, "reconcile: cannot list configs"),
    }

    match store.reservations() {
        Ok(ids) => {
            for id in ids {
                let owner_alive = store
                    .reservation_owner(id)
                    .is_some_and(process::is_alive);
                if owner_alive {
                    continue;
                }
                match store.release(id) {
                    Ok(true) => tracing::info!(id, "removed orphaned reservation"),
                    Ok(false) => {}
                    Err(e) => tracing::debug!(id, error = %e, "failed to remove reservation"),
                }
            }
        }
        Err(e) => tracing::debug!(error = %e, "reconcile: cannot list reservations"),
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use crate::settings::Settings;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn setup(ids: &[u32]) -> (tempfile::TempDir, ConfigStore, ProcessTable) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("configs"), Settings::default());
        let table = ProcessTable::new(dir.path().join("pids"));
        for &id in ids {
            store
                .save(&InstanceConfig {
                    id,
                    hostname: format!("vm-{id}"),
                    memory: 512,
                    cpus: 1,
                    disk_path: "disk".into(),
                    cloud_init_path: "seed".into(),
                    uuid: "6f1c2b9e-2f7a-4d55-9a55-1b2f3c4d5e6f".into(),
                    ..InstanceConfig::default()
                })
                .unwrap();
        }
        (dir, store, table)
    }

    #[test]
    fn removes_exactly_the_dead_markers() {
        let (dir, store, table) = setup(&[100, 101, 102]);
        table.write(100, std::process::id()).unwrap();
        table.write(101, dead_pid()).unwrap();
        std::fs::write(dir.path().join("pids/102.pid"), "garbage").unwrap();

        assert_eq!(sweep(&store, &table), 2);
        assert!(table.exists(100));
        assert!(!table.exists(101));
        assert!(!table.exists(102));
    }

    #[test]
    fn sweep_is_idempotent() {
        let (_dir, store, table) = setup(&[100, 101]);
        table.write(100, dead_pid()).unwrap();
        table.write(101, std::process::id()).unwrap();
        assert_eq!(sweep(&store, &table), 1);
        assert_eq!(sweep(&store, &table), 0);
        assert!(table.exists(101));
    }

    #[test]
    fn orphaned_reservations_are_released() {
        let (_dir, store, table) = setup(&[]);
        let _mine = store.reserve(150).unwrap();
        std::fs::write(store.dir().join("151.lock"), dead_pid().to_string()).unwrap();
        std::fs::write(store.dir().join("152.lock"), "").unwrap();

        sweep(&store, &table);
        assert_eq!(store.reservations().unwrap(), vec![150]);
    }

    #[test]
    fn missing_directories_are_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nope"), Settings::default());
        let table = ProcessTable::new(dir.path().join("nope-either"));
        assert_eq!(sweep(&store, &table), 0);
    }
}
