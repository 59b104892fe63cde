//! Launching, tracking and stopping hypervisor processes.

use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::process::Child;
use tokio::task::JoinHandle;

use crate::config::InstanceConfig;
use crate::error::QvmError;
use crate::invocation::Invocation;
use crate::logging;
use crate::monitor;
use crate::paths::Layout;
use crate::process::{self, ProcessTable};
use crate::settings::Settings;
use crate::util;

pub struct Supervisor {
    layout: Layout,
    table: ProcessTable,
    settings: Settings,
    reaper: Reaper,
}

impl Supervisor {
    pub fn new(layout: Layout, settings: Settings) -> Self {
        let table = ProcessTable::new(layout.pids_dir());
        let reaper = Reaper::new(settings.reap_interval());
        Self {
            layout,
            table,
            settings,
            reaper,
        }
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    /// Launch the hypervisor for `cfg` and return its pid.
    ///
    /// The process leads its own group so it outlives this manager. The pid
    /// marker is written before anything else can fail; if that write fails
    /// the child is killed so no untracked hypervisor is left behind.
    pub async fn spawn(&self, cfg: &InstanceConfig) -> Result<u32, QvmError> {
        let id = cfg.id;
        self.check_capacity().await?;
        let program = self.settings.hypervisor_binary();

        let socket = self.layout.monitor_socket(id);
        let invocation = Invocation::for_instance(cfg, program, &socket)?;

        let log_path = self.layout.log_file(id);
        let mut log = open_log(&log_path)?;
        let _ = writeln!(
            log,
            "=== {} starting VM {id}: {} {}",
            logging::utc_timestamp(),
            invocation.program(),
            invocation.args().join(" ")
        );
        let stderr = log.try_clone().map_err(|e| QvmError::Io {
            context: format!("duplicating {}", log_path.display()),
            source: e,
        })?;

        // QEMU refuses to bind over a leftover socket from a crashed run.
        util::remove_if_exists(&socket)?;

        let mut child = invocation
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .current_dir(self.layout.vms_dir())
            .process_group(0)
            .kill_on_drop(false)
            .spawn()
            .map_err(|source| QvmError::SpawnFailed { id, source })?;

        let Some(pid) = child.id() else {
            return Err(QvmError::SpawnFailed {
                id,
                source: std::io::Error::other("process exited before its pid was read"),
            });
        };

        if let Err(e) = self.table.write(id, pid) {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }
        tracing::info!(id, pid, program = invocation.program(), "hypervisor started");
        self.reaper.track(id, child);

        tokio::time::sleep(self.settings.grace_period()).await;
        self.reaper.reap(id);
        if !process::is_alive(pid) {
            tracing::warn!(
                id,
                pid,
                log = %log_path.display(),
                "hypervisor exited during startup"
            );
            return Ok(pid);
        }

        if !cfg.vnc_password.is_empty() {
            let opts = self.settings.monitor_options();
            if let Err(e) = monitor::set_display_password(&socket, &cfg.vnc_password, &opts).await {
                tracing::warn!(id, error = %e, "could not set VNC password");
            }
        }

        Ok(pid)
    }

    /// Refuse to launch past `max_running` hypervisors of this binary.
    ///
    /// When the running count cannot be determined the check is skipped
    /// with a warning, except for a zero limit which refuses outright.
    pub async fn check_capacity(&self) -> Result<(), QvmError> {
        let limit = self.settings.max_running as usize;
        if limit == 0 {
            return Err(QvmError::ResourceExhausted { running: 0, limit });
        }
        let program = self.settings.hypervisor_binary();
        let name = std::path::Path::new(&program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program.as_str());

        let output = match tokio::process::Command::new("pgrep")
            .args(["-f", name])
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(error = %e, "pgrep unavailable, skipping capacity check");
                return Ok(());
            }
        };
        let Some(running) = count_matches(output.status.code(), &output.stdout) else {
            tracing::warn!(
                name,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "unexpected pgrep result, skipping capacity check"
            );
            return Ok(());
        };
        tracing::debug!(name, running, limit, "hypervisor capacity");
        if running >= limit {
            return Err(QvmError::ResourceExhausted { running, limit });
        }
        Ok(())
    }

    /// Send SIGTERM to the recorded process.
    pub fn terminate(&self, id: u32) -> Result<u32, QvmError> {
        let pid = self
            .table
            .live_pid(id)
            .ok_or(QvmError::NotRunning { id })?;
        process::terminate(pid).map_err(|source| QvmError::SignalFailed { id, pid, source })?;
        tracing::info!(id, pid, "sent SIGTERM");
        Ok(pid)
    }

    /// Poll until `pid` is gone or `timeout` passes. Returns whether it
    /// exited.
    pub async fn wait_for_exit(&self, id: u32, pid: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.reaper.reap(id);
            if !process::is_alive(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Collect the exit status of a child this supervisor spawned, if it has
    /// exited. Safe to call repeatedly.
    pub fn reap(&self, id: u32) -> bool {
        self.reaper.reap(id)
    }
}

/// Number of pids listed by `pgrep`, one per line. Exit status 1 means no
/// match; anything else is a failure of pgrep itself.
fn count_matches(status: Option<i32>, stdout: &[u8]) -> Option<usize> {
    match status {
        Some(0) => {
            let text = std::str::from_utf8(stdout).ok()?;
            let mut count = 0;
            for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                line.parse::<u32>().ok()?;
                count += 1;
            }
            Some(count)
        }
        Some(1) => Some(0),
        _ => None,
    }
}

fn open_log(path: &std::path::Path) -> Result<std::fs::File, QvmError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| QvmError::Io {
            context: format!("creating {}", parent.display()),
            source: e,
        })?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| QvmError::Io {
            context: format!("opening {}", path.display()),
            source: e,
        })
}

// ── Reaper ───────────────────────────────────────────────

type Children = Arc<Mutex<HashMap<u32, Child>>>;

/// Owns every spawned child. A single background task polls them so exited
/// hypervisors never linger as zombies while this process is alive.
struct Reaper {
    children: Children,
    interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    fn new(interval: Duration) -> Self {
        Self {
            children: Arc::new(Mutex::new(HashMap::new())),
            interval,
            sweeper: Mutex::new(None),
        }
    }

    fn track(&self, id: u32, child: Child) {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, child);
        self.ensure_sweeper();
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(&self.children);
        let interval = self.interval;
        *sweeper = Some(tokio::spawn(sweep_loop(weak, interval)));
    }

    fn reap(&self, id: u32) -> bool {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(child) = children.get_mut(&id) else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(id, %status, "reaped hypervisor");
                children.remove(&id);
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::debug!(id, error = %e, "try_wait failed, dropping child");
                children.remove(&id);
                false
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn sweep_loop(children: Weak<Mutex<HashMap<u32, Child>>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(children) = children.upgrade() else {
            return;
        };
        let mut guard = children.lock().unwrap_or_else(PoisonError::into_inner);
        guard.retain(|id, child| match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(id, %status, "reaped hypervisor");
                false
            }
            Ok(None) => true,
            Err(_) => false,
        });
    }
}
