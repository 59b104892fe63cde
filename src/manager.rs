//! Lifecycle operations over instances: create, start, stop, delete, list.
//!
//! Every mutating operation starts with a reconcile sweep so decisions are
//! made against live process state rather than leftovers from a crash.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::allocator;
use crate::config::{self, CloudInitConfig, InstanceConfig, NetworkInterface};
use crate::error::QvmError;
use crate::image::{ImageCache, ImageSource};
use crate::paths::Layout;
use crate::provision::{CloudInit, ProvisionRequest, Provisioner};
use crate::reconcile;
use crate::settings::Settings;
use crate::store::ConfigStore;
use crate::supervisor::Supervisor;
use crate::util;

/// Extra wait after SIGKILL when SIGTERM was ignored.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Stopped,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured instance and its observed process state.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub config: InstanceConfig,
    pub state: InstanceState,
    pub pid: Option<u32>,
}

/// Where to reach a running instance's display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VncEndpoint {
    pub url: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Explicit id; allocated from the configured range when `None`.
    pub id: Option<u32>,
    pub hostname: Option<String>,
    /// OS image to download and provision.
    pub os: Option<String>,
    pub version: Option<String>,
    /// Existing disk to boot instead of a downloaded image.
    pub disk: Option<PathBuf>,
    pub disk_size: Option<String>,
    /// Existing seed ISO to attach instead of generating one.
    pub seed: Option<PathBuf>,
    pub accelerator: Option<String>,
    pub firmware: Option<String>,
    pub firmware_path: Option<String>,
    pub memory: u64,
    pub cpus: u32,
    pub vnc_password: Option<String>,
    pub network: Vec<NetworkInterface>,
    pub cloud_init: CloudInitConfig,
}

impl Default for CreateRequest {
    fn default() -> Self {
        Self {
            id: None,
            hostname: None,
            os: None,
            version: None,
            disk: None,
            disk_size: None,
            seed: None,
            accelerator: None,
            firmware: None,
            firmware_path: None,
            memory: 2048,
            cpus: 2,
            vnc_password: None,
            network: Vec::new(),
            cloud_init: CloudInitConfig::default(),
        }
    }
}

pub struct Manager<P = CloudInit, I = ImageCache> {
    layout: Layout,
    settings: Settings,
    store: ConfigStore,
    supervisor: Supervisor,
    provisioner: P,
    images: I,
}

impl Manager {
    /// Open (creating if needed) the state root with the default cloud-init
    /// and image-cache collaborators.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, QvmError> {
        let layout = Layout::new(root);
        layout.ensure()?;
        let settings = Settings::load(&layout.settings_file())?;
        let provisioner = CloudInit::new(layout.clone());
        let images = ImageCache::new(layout.clone(), settings.images.clone());
        Self::with_collaborators(layout, settings, provisioner, images)
    }
}

impl<P: Provisioner, I: ImageSource> Manager<P, I> {
    pub fn with_collaborators(
        layout: Layout,
        settings: Settings,
        provisioner: P,
        images: I,
    ) -> Result<Self, QvmError> {
        layout.ensure()?;
        settings.validate()?;
        let store = ConfigStore::new(layout.configs_dir(), settings.clone());
        let supervisor = Supervisor::new(layout.clone(), settings.clone());
        Ok(Self {
            layout,
            settings,
            store,
            supervisor,
            provisioner,
            images,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn reconcile(&self) -> usize {
        reconcile::sweep(&self.store, self.supervisor.table())
    }

    // ── Create ───────────────────────────────────────────

    /// Allocate an id, prepare disk and seed, persist the record and boot.
    ///
    /// Nothing is persisted unless every step up to the save succeeds, and a
    /// host already at its hypervisor ceiling is refused before any of them.
    /// If the launch itself fails the record stays and `start` can retry.
    /// The returned state is observed after startup, so a hypervisor that
    /// died during its grace period reports `Stopped`.
    pub async fn create(&self, req: CreateRequest) -> Result<Instance, QvmError> {
        self.reconcile();

        let reservation = match req.id {
            Some(id) => allocator::claim(&self.store, id, self.settings.id_range())?,
            None => allocator::allocate(&self.store, self.settings.id_range())?,
        };
        let id = reservation.id();
        tracing::info!(id, "creating VM");

        let os = req.os.as_deref().map(str::to_ascii_lowercase).unwrap_or_default();
        let version = req.version.clone().unwrap_or_default();
        if !os.is_empty() && version.is_empty() && req.disk.is_none() {
            return Err(QvmError::Validation {
                message: format!("--version is required to download a {os} image"),
            });
        }
        if os.is_empty() && req.disk.is_none() {
            return Err(QvmError::Validation {
                message: "either an OS image or an existing disk is required".into(),
            });
        }
        if os.is_empty() && req.seed.is_none() {
            return Err(QvmError::Validation {
                message: "an OS is required to generate a cloud-init seed (or pass a seed ISO)"
                    .into(),
            });
        }

        let hostname = req.hostname.clone().unwrap_or_else(|| {
            if os.is_empty() {
                format!("vm-{id}")
            } else {
                format!("{os}-{id}.vm")
            }
        });
        let uuid = uuid::Uuid::new_v4().to_string();
        let vnc_password = req
            .vnc_password
            .clone()
            .unwrap_or_else(|| uuid.chars().filter(|c| *c != '-').take(8).collect());

        let mut draft = InstanceConfig {
            id,
            hostname,
            os,
            version,
            accelerator: req.accelerator.clone().unwrap_or_default(),
            memory: req.memory,
            cpus: req.cpus,
            firmware: req.firmware.clone().unwrap_or_default(),
            firmware_path: req.firmware_path.clone().unwrap_or_default(),
            disk_path: self.layout.disk_file(id, "qcow2").display().to_string(),
            disk_size: req.disk_size.clone().unwrap_or_default(),
            cloud_init_path: self.layout.seed_iso(id).display().to_string(),
            vnc_port: 0,
            vnc_password,
            uuid,
            network: req.network.clone(),
            cloud_init: req.cloud_init.clone(),
        };
        if draft.cloud_init.hostname.is_empty() {
            draft.cloud_init.hostname = draft.hostname.clone();
        }

        // Reject bad input before any download or seed generation.
        let draft = config::validate(&draft, &self.settings)?;
        require_file(id, "firmware", Path::new(&draft.firmware_path))?;
        self.supervisor.check_capacity().await?;

        let disk = match &req.disk {
            Some(disk) => {
                require_file(id, "disk", disk)?;
                disk.clone()
            }
            None => {
                self.images
                    .prepare_disk(&draft.os, &draft.version, id, &draft.disk_size)
                    .await?
            }
        };

        let seed = match &req.seed {
            Some(seed) => {
                require_file(id, "seed ISO", seed)?;
                seed.clone()
            }
            None => {
                self.provisioner
                    .provision(&ProvisionRequest {
                        id,
                        uuid: &draft.uuid,
                        os: &draft.os,
                        hostname: &draft.hostname,
                        cloud_init: &draft.cloud_init,
                    })
                    .await?
            }
        };

        let mut cfg = draft;
        cfg.disk_path = disk.display().to_string();
        cfg.cloud_init_path = seed.display().to_string();
        let cfg = config::validate(&cfg, &self.settings)?;

        self.store.save(&cfg)?;
        drop(reservation);
        tracing::info!(id, hostname = %cfg.hostname, "VM created");

        let pid = self.supervisor.spawn(&cfg).await?;
        let mut instance = self.observe(cfg);
        if instance.state == InstanceState::Stopped {
            tracing::warn!(id, pid, "VM exited right after creation");
        }
        instance.pid = Some(pid);
        Ok(instance)
    }

    // ── Start / Stop ─────────────────────────────────────

    pub async fn start(&self, id: u32) -> Result<u32, QvmError> {
        self.reconcile();
        let cfg = self.store.load(id)?;
        if let Some(pid) = self.supervisor.table().live_pid(id) {
            return Err(QvmError::AlreadyRunning { id, pid });
        }
        require_file(id, "disk", Path::new(&cfg.disk_path))?;
        require_file(id, "firmware", Path::new(&cfg.firmware_path))?;
        require_file(id, "seed ISO", Path::new(&cfg.cloud_init_path))?;

        let pid = self.supervisor.spawn(&cfg).await?;
        tracing::info!(id, pid, "VM started");
        Ok(pid)
    }

    pub async fn stop(&self, id: u32) -> Result<(), QvmError> {
        self.reconcile();
        self.store.load(id)?;
        self.stop_process(id).await?;
        self.reconcile();
        Ok(())
    }

    async fn stop_process(&self, id: u32) -> Result<(), QvmError> {
        let pid = self.supervisor.terminate(id)?;
        let timeout = self.settings.stop_timeout();
        if !self.supervisor.wait_for_exit(id, pid, timeout).await {
            tracing::warn!(id, pid, timeout_ms = timeout.as_millis() as u64, "VM ignored SIGTERM, killing");
            crate::process::kill(pid)
                .map_err(|source| QvmError::SignalFailed { id, pid, source })?;
            self.supervisor.wait_for_exit(id, pid, KILL_GRACE).await;
        }
        self.supervisor.table().remove(id)?;
        tracing::info!(id, pid, "VM stopped");
        Ok(())
    }

    // ── Delete ───────────────────────────────────────────

    /// Stop the instance if needed and remove everything keyed by its id.
    /// A missing or unreadable record does not prevent artifact cleanup.
    pub async fn delete(&self, id: u32) -> Result<(), QvmError> {
        self.reconcile();

        let had_config = match self.store.load(id) {
            Ok(_) => true,
            Err(QvmError::NotFound { .. }) => false,
            Err(e) => {
                tracing::warn!(id, error = %e, "deleting VM with unreadable config");
                true
            }
        };

        if self.supervisor.table().live_pid(id).is_some() {
            self.stop_process(id).await?;
        }

        let mut removed = 0usize;
        if self.store.delete(id)? {
            removed += 1;
        }

        let mut files = self.layout.vm_artifacts(id);
        files.extend([
            self.layout.seed_iso(id),
            self.layout.log_file(id),
            self.layout.monitor_socket(id),
            self.layout.pid_file(id),
        ]);
        files.sort();
        files.dedup();
        for path in files {
            if util::remove_if_exists(&path)? {
                tracing::debug!(id, path = %path.display(), "removed");
                removed += 1;
            }
        }

        self.reconcile();

        if !had_config && removed == 0 {
            return Err(QvmError::NotFound { id });
        }
        tracing::info!(id, "VM deleted");
        Ok(())
    }

    // ── Queries ──────────────────────────────────────────

    /// Every loadable instance, ascending by id. Read-only.
    pub fn list(&self) -> Result<Vec<Instance>, QvmError> {
        let mut out = Vec::new();
        for id in self.store.list()? {
            match self.store.load(id) {
                Ok(config) => out.push(self.observe(config)),
                Err(e) => tracing::warn!(id, error = %e, "skipping unreadable config"),
            }
        }
        Ok(out)
    }

    pub fn status(&self, id: u32) -> Result<Instance, QvmError> {
        let config = self.store.load(id)?;
        Ok(self.observe(config))
    }

    fn observe(&self, config: InstanceConfig) -> Instance {
        let pid = self.supervisor.table().live_pid(config.id);
        Instance {
            state: if pid.is_some() {
                InstanceState::Running
            } else {
                InstanceState::Stopped
            },
            pid,
            config,
        }
    }

    /// Remove stale pid markers and orphaned reservations.
    pub fn cleanup(&self) -> usize {
        self.reconcile()
    }

    /// VNC endpoint of a running instance.
    pub fn display(&self, id: u32) -> Result<VncEndpoint, QvmError> {
        let cfg = self.store.load(id)?;
        if self.supervisor.table().live_pid(id).is_none() {
            return Err(QvmError::NotRunning { id });
        }
        Ok(VncEndpoint {
            url: format!("vnc://localhost:{}", cfg.vnc_port),
            password: cfg.vnc_password,
        })
    }
}

fn require_file(id: u32, what: &'static str, path: &Path) -> Result<(), QvmError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(QvmError::MissingArtifact {
            id,
            what,
            path: path.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_defaults() {
        let req = CreateRequest::default();
        assert_eq!(req.memory, 2048);
        assert_eq!(req.cpus, 2);
        assert!(req.id.is_none());
    }

    #[test]
    fn state_names() {
        assert_eq!(InstanceState::Running.to_string(), "running");
        assert_eq!(InstanceState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn missing_artifact_names_the_file() {
        let err = require_file(150, "disk", Path::new("/nonexistent/150-0.qcow2")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/150-0.qcow2"));
    }
}
