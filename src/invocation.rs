//! Hypervisor command line, built from a validated instance config.

use std::path::{Path, PathBuf};

use crate::config::{InstanceConfig, NetworkInterface};
use crate::error::QvmError;

/// VNC displays are numbered from this port.
const VNC_DISPLAY_BASE: u32 = 5900;

/// One hypervisor option. Each variant renders its own argv fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum QemuOption {
    Accel(String),
    Memory(u64),
    Smp(u32),
    Cpu(&'static str),
    Machine(&'static str),
    Bios(String),
    Device(String),
    AudioDev(String),
    Disk(String),
    Seed(String),
    Rtc,
    Vnc(u32),
    Monitor(PathBuf),
    Smbios(String),
    NetDev { index: usize, bridge: String },
    Nic { index: usize, nic: NetworkInterface },
}

impl QemuOption {
    pub fn render(&self) -> Vec<String> {
        let pair = |flag: &str, value: String| vec![flag.to_string(), value];
        match self {
            QemuOption::Accel(a) => pair("-accel", a.clone()),
            QemuOption::Memory(mib) => pair("-m", mib.to_string()),
            QemuOption::Smp(n) => pair("-smp", format!("{n},sockets=1,cores={n},threads=1")),
            QemuOption::Cpu(model) => pair("-cpu", model.to_string()),
            QemuOption::Machine(m) => pair("-M", m.to_string()),
            QemuOption::Bios(path) => pair("-bios", path.clone()),
            QemuOption::Device(spec) => pair("-device", spec.clone()),
            QemuOption::AudioDev(spec) => pair("-audiodev", spec.clone()),
            QemuOption::Disk(path) => pair("-drive", format!("file={path},format=qcow2,if=virtio")),
            QemuOption::Seed(path) => pair(
                "-drive",
                format!("file={path},format=raw,media=cdrom,readonly=on"),
            ),
            QemuOption::Rtc => pair("-rtc", "base=utc,clock=host".into()),
            QemuOption::Vnc(port) => pair(
                "-vnc",
                format!("0.0.0.0:{},password=on", port.saturating_sub(VNC_DISPLAY_BASE)),
            ),
            QemuOption::Monitor(sock) => {
                pair("-monitor", format!("unix:{},server,nowait", sock.display()))
            }
            QemuOption::Smbios(uuid) => pair("-smbios", format!("type=1,uuid={uuid}")),
            QemuOption::NetDev { index, bridge } => {
                pair("-netdev", format!("bridge,id=net{index},br={bridge}"))
            }
            QemuOption::Nic { index, nic } => {
                let mut spec = format!("{},netdev=net{index}", nic.model);
                if !nic.mac_address.is_empty() {
                    spec.push_str(&format!(",mac={}", nic.mac_address));
                }
                if nic.multiqueue > 0 {
                    spec.push_str(&format!(",mq=on,vectors={}", nic.multiqueue * 2 + 2));
                }
                pair("-device", spec)
            }
        }
    }
}

fn machine_type() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" | "arm" => "virt",
        _ => "pc",
    }
}

#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    options: Vec<QemuOption>,
}

impl Invocation {
    /// Build the full option list for `cfg`. The config must already be
    /// validated (firmware path and interfaces resolved).
    pub fn for_instance(
        cfg: &InstanceConfig,
        program: impl Into<String>,
        monitor: &Path,
    ) -> Result<Self, QvmError> {
        if cfg.firmware_path.is_empty() {
            return Err(QvmError::Validation {
                message: format!("VM {} has no resolved firmware path", cfg.id),
            });
        }

        let cpu = if cfg.accelerator == "tcg" { "max" } else { "host" };
        let mut options = vec![
            QemuOption::Accel(cfg.accelerator.clone()),
            QemuOption::Memory(cfg.memory),
            QemuOption::Smp(cfg.cpus),
            QemuOption::Cpu(cpu),
            QemuOption::Machine(machine_type()),
            QemuOption::Bios(cfg.firmware_path.clone()),
            QemuOption::Device("qemu-xhci".into()),
            QemuOption::Device("usb-kbd".into()),
            QemuOption::Device("usb-tablet".into()),
            QemuOption::AudioDev("none,id=audio0".into()),
            QemuOption::Device("intel-hda".into()),
            QemuOption::Device("hda-duplex,audiodev=audio0".into()),
            QemuOption::Disk(cfg.disk_path.clone()),
            QemuOption::Seed(cfg.cloud_init_path.clone()),
            QemuOption::Rtc,
            QemuOption::Vnc(cfg.vnc_port),
            QemuOption::Monitor(monitor.to_path_buf()),
            QemuOption::Smbios(cfg.uuid.clone()),
            QemuOption::Device("virtio-gpu-pci".into()),
        ];

        for (index, nic) in cfg.network.iter().enumerate() {
            if nic.disconnect {
                continue;
            }
            options.push(QemuOption::NetDev {
                index,
                bridge: nic.bridge.clone(),
            });
            options.push(QemuOption::Nic {
                index,
                nic: nic.clone(),
            });
        }

        Ok(Self {
            program: program.into(),
            options,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn options(&self) -> &[QemuOption] {
        &self.options
    }

    pub fn args(&self) -> Vec<String> {
        self.options.iter().flat_map(QemuOption::render).collect()
    }

    /// A `tokio` command with program and arguments set. Stdio, process
    /// group and working directory are the caller's concern.
    pub fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.args());
        cmd
    }
}
