use std::path::{Path, PathBuf};

use crate::error::QvmError;

/// Default state root: `$QVM_HOME`, else `~/.local/share/qvm/`.
pub fn default_root() -> PathBuf {
    if let Some(home) = std::env::var_os("QVM_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("qvm")
}

/// On-disk layout of the state root. Every artifact is keyed by VM id so
/// that all state can be rebuilt from directory listings alone.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root and every per-kind directory below it.
    pub fn ensure(&self) -> Result<(), QvmError> {
        for dir in [
            self.root.clone(),
            self.configs_dir(),
            self.pids_dir(),
            self.logs_dir(),
            self.monitors_dir(),
            self.vms_dir(),
            self.images_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| QvmError::Io {
                context: format!("creating directory {}", dir.display()),
                source: e,
            })?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.root.join("pids")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn monitors_dir(&self) -> PathBuf {
        self.root.join("monitors")
    }

    /// Working disks and seed ISOs. Also the hypervisor's working directory.
    pub fn vms_dir(&self) -> PathBuf {
        self.root.join("vms")
    }

    /// Downloaded base images, shared across VMs.
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("settings.toml")
    }

    /// The manager's own debug log.
    pub fn manager_log(&self) -> PathBuf {
        self.root.join("qvm.log")
    }

    pub fn config_file(&self, id: u32) -> PathBuf {
        self.configs_dir().join(format!("{id}.json"))
    }

    pub fn pid_file(&self, id: u32) -> PathBuf {
        self.pids_dir().join(format!("{id}.pid"))
    }

    pub fn log_file(&self, id: u32) -> PathBuf {
        self.logs_dir().join(format!("{id}.log"))
    }

    pub fn monitor_socket(&self, id: u32) -> PathBuf {
        self.monitors_dir().join(format!("{id}.sock"))
    }

    pub fn seed_iso(&self, id: u32) -> PathBuf {
        self.vms_dir().join(format!("{id}-cloud-init.iso"))
    }

    /// Primary working disk, `<id>-0.<ext>`.
    pub fn disk_file(&self, id: u32, ext: &str) -> PathBuf {
        self.vms_dir().join(format!("{id}-0.{ext}"))
    }

    /// Every file in `vms/` that belongs to `id` (`<id>-*.img|qcow2|iso`).
    pub fn vm_artifacts(&self, id: u32) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(self.vms_dir()) else {
            return Vec::new();
        };
        let prefix = format!("{id}-");
        let mut found: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .and_then(|f| f.to_str())
                    .is_some_and(|f| {
                        f.starts_with(&prefix)
                            && (f.ends_with(".img") || f.ends_with(".qcow2") || f.ends_with(".iso"))
                    })
            })
            .collect();
        found.sort();
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_names_are_keyed_by_id() {
        let layout = Layout::new("/state");
        assert_eq!(layout.config_file(150), PathBuf::from("/state/configs/150.json"));
        assert_eq!(layout.pid_file(150), PathBuf::from("/state/pids/150.pid"));
        assert_eq!(layout.log_file(150), PathBuf::from("/state/logs/150.log"));
        assert_eq!(
            layout.monitor_socket(150),
            PathBuf::from("/state/monitors/150.sock")
        );
        assert_eq!(
            layout.seed_iso(150),
            PathBuf::from("/state/vms/150-cloud-init.iso")
        );
        assert_eq!(
            layout.disk_file(150, "qcow2"),
            PathBuf::from("/state/vms/150-0.qcow2")
        );
    }

    #[test]
    fn vm_artifacts_only_match_own_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.ensure().unwrap();
        for name in [
            "15-0.qcow2",
            "150-0.qcow2",
            "150-cloud-init.iso",
            "150-notes.txt",
            "1500-0.img",
        ] {
            std::fs::write(layout.vms_dir().join(name), b"x").unwrap();
        }

        let found: Vec<String> = layout
            .vm_artifacts(150)
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(found, vec!["150-0.qcow2", "150-cloud-init.iso"]);
    }
}
