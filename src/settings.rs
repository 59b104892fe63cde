//! Manager-wide settings.
//!
//! Read from `<root>/settings.toml` when present, then overridden by
//! `QVM_*` environment variables. Every field has a default, so an empty or
//! missing file is valid.

use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use facet::Facet;

use crate::config::VNC_PORT_BASE;
use crate::error::QvmError;
use crate::monitor::MonitorOptions;

/// Supported cloud-image versions per OS.
#[derive(Debug, Clone, PartialEq, Facet)]
#[facet(default)]
pub struct ImageVersions {
    pub debian: Vec<String>,
    pub ubuntu: Vec<String>,
    pub centos: Vec<String>,
    pub rockylinux: Vec<String>,
    pub almalinux: Vec<String>,
}

impl Default for ImageVersions {
    fn default() -> Self {
        let list = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        Self {
            debian: list(&["11", "12", "13"]),
            ubuntu: list(&["22.04", "24.04"]),
            centos: list(&["9", "10"]),
            rockylinux: list(&["8", "9"]),
            almalinux: list(&["8", "9"]),
        }
    }
}

impl ImageVersions {
    pub fn for_os(&self, os: &str) -> Option<&[String]> {
        match os {
            "debian" => Some(&self.debian),
            "ubuntu" => Some(&self.ubuntu),
            "centos" => Some(&self.centos),
            "rockylinux" => Some(&self.rockylinux),
            "almalinux" => Some(&self.almalinux),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Facet)]
#[facet(default)]
pub struct Settings {
    /// First assignable VM id.
    #[facet(default = 100)]
    pub id_start: u32,
    /// Last assignable VM id (inclusive).
    #[facet(default = 999)]
    pub id_end: u32,
    /// Hypervisor binary. Empty means `qemu-system-<host arch>`.
    #[facet(default)]
    pub qemu_binary: String,
    /// Refuse to spawn when this many hypervisors are already running.
    #[facet(default = 60)]
    pub max_running: u32,
    /// Bridge used for the synthesized default interface.
    #[facet(default = "br0")]
    pub default_bridge: String,
    #[facet(default = 1000)]
    pub grace_period_ms: u64,
    #[facet(default = 3)]
    pub monitor_attempts: u32,
    #[facet(default = 500)]
    pub monitor_backoff_ms: u64,
    #[facet(default = 5000)]
    pub monitor_timeout_ms: u64,
    #[facet(default = 5000)]
    pub stop_timeout_ms: u64,
    #[facet(default = 500)]
    pub reap_interval_ms: u64,
    #[facet(default)]
    pub images: ImageVersions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            id_start: 100,
            id_end: 999,
            qemu_binary: String::new(),
            max_running: 60,
            default_bridge: "br0".into(),
            grace_period_ms: 1000,
            monitor_attempts: 3,
            monitor_backoff_ms: 500,
            monitor_timeout_ms: 5000,
            stop_timeout_ms: 5000,
            reap_interval_ms: 500,
            images: ImageVersions::default(),
        }
    }
}

impl Settings {
    /// Load `settings.toml` (if any) and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, QvmError> {
        let mut settings = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| QvmError::ConfigLoad {
                path: path.display().to_string(),
                source,
            })?;
            facet_toml::from_str::<Settings>(&contents).map_err(|e| QvmError::ConfigParse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
        } else {
            Settings::default()
        };

        settings.apply_env(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `QVM_*` overrides. Unparsable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparsable setting");
                    None
                }
            }
        }

        if let Some(v) = parsed("QVM_ID_START", lookup("QVM_ID_START")) {
            self.id_start = v;
        }
        if let Some(v) = parsed("QVM_ID_END", lookup("QVM_ID_END")) {
            self.id_end = v;
        }
        if let Some(v) = parsed("QVM_MAX_RUNNING", lookup("QVM_MAX_RUNNING")) {
            self.max_running = v;
        }
        if let Some(v) = lookup("QVM_QEMU_BINARY").filter(|v| !v.is_empty()) {
            self.qemu_binary = v;
        }

        let versions = |key: &str| {
            lookup(key).filter(|v| !v.trim().is_empty()).map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
        };
        if let Some(v) = versions("QVM_DEBIAN_VERSIONS") {
            self.images.debian = v;
        }
        if let Some(v) = versions("QVM_UBUNTU_VERSIONS") {
            self.images.ubuntu = v;
        }
        if let Some(v) = versions("QVM_CENTOS_VERSIONS") {
            self.images.centos = v;
        }
        if let Some(v) = versions("QVM_ROCKYLINUX_VERSIONS") {
            self.images.rockylinux = v;
        }
        if let Some(v) = versions("QVM_ALMALINUX_VERSIONS") {
            self.images.almalinux = v;
        }
    }

    pub fn validate(&self) -> Result<(), QvmError> {
        if self.id_start == 0 {
            return Err(QvmError::Validation {
                message: "id_start must be at least 1".into(),
            });
        }
        if self.id_start > self.id_end {
            return Err(QvmError::Validation {
                message: format!(
                    "id_start ({}) must not exceed id_end ({})",
                    self.id_start, self.id_end
                ),
            });
        }
        // The VNC port is derived from the id and must stay a valid TCP port.
        let max_id = u16::MAX as u32 - VNC_PORT_BASE;
        if self.id_end > max_id {
            return Err(QvmError::Validation {
                message: format!("id_end must be at most {max_id} (got {})", self.id_end),
            });
        }
        if self.monitor_attempts == 0 {
            return Err(QvmError::Validation {
                message: "monitor_attempts must be at least 1".into(),
            });
        }
        if self.default_bridge.is_empty() {
            return Err(QvmError::Validation {
                message: "default_bridge must not be empty".into(),
            });
        }
        Ok(())
    }

    pub fn id_range(&self) -> RangeInclusive<u32> {
        self.id_start..=self.id_end
    }

    /// Resolved hypervisor binary for this host.
    pub fn hypervisor_binary(&self) -> String {
        if !self.qemu_binary.is_empty() {
            return self.qemu_binary.clone();
        }
        match std::env::consts::ARCH {
            "aarch64" | "arm" => "qemu-system-aarch64".into(),
            _ => "qemu-system-x86_64".into(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(10))
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            attempts: self.monitor_attempts,
            backoff: Duration::from_millis(self.monitor_backoff_ms),
            read_timeout: Duration::from_millis(self.monitor_timeout_ms),
        }
    }
}
