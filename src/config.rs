//! Instance configuration records and their validation.
//!
//! A record is written once at creation (`configs/<id>.json`) and re-validated
//! every time it is read back.

use std::fmt;
use std::str::FromStr;

use facet::Facet;

use crate::error::QvmError;
use crate::settings::Settings;
use crate::util;

/// VNC listens on `VNC_PORT_BASE + id`.
pub const VNC_PORT_BASE: u32 = 59000;
pub const MIN_MEMORY_MIB: u64 = 256;
pub const DEFAULT_MTU: u32 = 1500;
pub const DEFAULT_NIC_MODEL: &str = "virtio-net-pci";
pub const MAX_VNC_PASSWORD: usize = 8;
const MAX_MULTIQUEUE: u32 = 64;

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct InstanceConfig {
    pub id: u32,
    pub hostname: String,
    #[facet(default)]
    pub os: String,
    #[facet(default)]
    pub version: String,
    #[facet(default)]
    pub accelerator: String,
    pub memory: u64,
    pub cpus: u32,
    #[facet(default)]
    pub firmware: String,
    #[facet(default)]
    pub firmware_path: String,
    pub disk_path: String,
    #[facet(default)]
    pub disk_size: String,
    pub cloud_init_path: String,
    #[facet(default)]
    pub vnc_port: u32,
    #[facet(default)]
    pub vnc_password: String,
    pub uuid: String,
    #[facet(default)]
    pub network: Vec<NetworkInterface>,
    #[facet(default)]
    pub cloud_init: CloudInitConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct NetworkInterface {
    pub bridge: String,
    pub model: String,
    #[facet(default)]
    pub vlan: u32,
    #[facet(default)]
    pub mac_address: String,
    #[facet(default)]
    pub firewall: bool,
    #[facet(default)]
    pub disconnect: bool,
    #[facet(default)]
    pub mtu: u32,
    #[facet(default)]
    pub rate_limit: u32,
    #[facet(default)]
    pub multiqueue: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct CloudInitConfig {
    #[facet(default)]
    pub hostname: String,
    #[facet(default)]
    pub username: String,
    #[facet(default)]
    pub password: String,
    #[facet(default)]
    pub authorized_key: String,
    #[facet(default)]
    pub upgrade_packages: bool,
    #[facet(default)]
    pub dns_domain: String,
    #[facet(default)]
    pub dns_servers: Vec<String>,
    pub ipv4: Option<IpConfig>,
    pub ipv6: Option<IpConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct IpConfig {
    #[facet(default)]
    pub mode: String,
    #[facet(default)]
    pub address: String,
    #[facet(default)]
    pub gateway: String,
}

impl IpConfig {
    pub fn is_static(&self) -> bool {
        self.mode == "static"
    }
}

impl FromStr for IpConfig {
    type Err = QvmError;

    /// `mode=static,address=10.0.0.5/24,gateway=10.0.0.1`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ip = IpConfig::default();
        for (key, value) in pairs(s) {
            match key {
                "mode" => ip.mode = value.to_ascii_lowercase(),
                "address" => ip.address = value.to_string(),
                "gateway" => ip.gateway = value.to_string(),
                _ => {}
            }
        }
        match ip.mode.as_str() {
            "" if !ip.address.is_empty() => ip.mode = "static".into(),
            "" => ip.mode = "dhcp".into(),
            "dhcp" | "static" | "slaac" => {}
            other => {
                return Err(QvmError::Validation {
                    message: format!("unknown IP mode '{other}' (use dhcp, static or slaac)"),
                });
            }
        }
        if ip.is_static() && ip.address.is_empty() {
            return Err(QvmError::Validation {
                message: "static IP configuration requires an address".into(),
            });
        }
        Ok(ip)
    }
}

impl FromStr for NetworkInterface {
    type Err = QvmError;

    /// `bridge=br0,model=e1000,vlan=10,mac_address=..,firewall=1,disconnect=0,mtu=9000,rate_limit=0,multiqueue=4`
    ///
    /// Unknown keys are ignored; numbers that do not parse fall back to zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut nic = NetworkInterface::default();
        for (key, value) in pairs(s) {
            match key {
                "bridge" => nic.bridge = value.to_string(),
                "model" => nic.model = value.to_string(),
                "vlan" => nic.vlan = value.parse().unwrap_or(0),
                "mac_address" | "mac" => nic.mac_address = value.to_string(),
                "firewall" => nic.firewall = flag(value),
                "disconnect" => nic.disconnect = flag(value),
                "mtu" => nic.mtu = value.parse().unwrap_or(0),
                "rate_limit" => nic.rate_limit = value.parse().unwrap_or(0),
                "multiqueue" => nic.multiqueue = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        if nic.mtu == 0 {
            nic.mtu = DEFAULT_MTU;
        }
        Ok(nic)
    }
}

fn pairs(s: &str) -> impl Iterator<Item = (&str, &str)> {
    s.split(',').filter_map(|part| {
        let (k, v) = part.split_once('=')?;
        Some((k.trim(), v.trim()))
    })
}

fn flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on")
}

/// Host virtualization backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accelerator {
    Kvm,
    Hvf,
    Tcg,
}

impl Accelerator {
    pub fn host_default() -> Self {
        match std::env::consts::OS {
            "linux" => Accelerator::Kvm,
            "macos" => Accelerator::Hvf,
            _ => Accelerator::Tcg,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Accelerator::Kvm => "kvm",
            Accelerator::Hvf => "hvf",
            Accelerator::Tcg => "tcg",
        }
    }
}

impl FromStr for Accelerator {
    type Err = QvmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kvm" => Ok(Accelerator::Kvm),
            "hvf" => Ok(Accelerator::Hvf),
            "tcg" => Ok(Accelerator::Tcg),
            other => Err(QvmError::Validation {
                message: format!("unknown accelerator '{other}' (use kvm, hvf or tcg)"),
            }),
        }
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Firmware {
    #[default]
    SeaBios,
    Ovmf,
}

const SEABIOS_PATH: &str = "/usr/share/seabios/bios.bin";
const OVMF_CANDIDATES: &[&str] = &[
    "/usr/share/OVMF/OVMF_CODE.fd",
    "/usr/share/OVMF/OVMF.fd",
    "/usr/share/ovmf/OVMF_CODE.fd",
    "/usr/share/ovmf/OVMF.fd",
];
const HOMEBREW_EDK2: &str = "/opt/homebrew/share/qemu/edk2-aarch64-code.fd";

impl Firmware {
    pub fn as_str(self) -> &'static str {
        match self {
            Firmware::SeaBios => "seabios",
            Firmware::Ovmf => "ovmf",
        }
    }

    /// Firmware image for this host. Apple silicon always boots edk2 from
    /// Homebrew's qemu; OVMF takes the first candidate that exists.
    pub fn resolve_path(self) -> String {
        if std::env::consts::OS == "macos" && std::env::consts::ARCH == "aarch64" {
            return HOMEBREW_EDK2.into();
        }
        match self {
            Firmware::SeaBios => SEABIOS_PATH.into(),
            Firmware::Ovmf => OVMF_CANDIDATES
                .iter()
                .find(|p| std::path::Path::new(p).exists())
                .copied()
                .unwrap_or(SEABIOS_PATH)
                .into(),
        }
    }
}

impl FromStr for Firmware {
    type Err = QvmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "seabios" | "bios" => Ok(Firmware::SeaBios),
            "ovmf" | "uefi" => Ok(Firmware::Ovmf),
            other => Err(QvmError::Validation {
                message: format!("unknown firmware '{other}' (use seabios or ovmf)"),
            }),
        }
    }
}

pub fn vnc_port(id: u32) -> u32 {
    VNC_PORT_BASE + id
}

/// Locally administered MAC derived from the id and interface index.
pub fn default_mac(id: u32, index: usize) -> String {
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        index & 0xff,
        (id >> 8) & 0xff,
        id & 0xff
    )
}

fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn is_valid_uuid(s: &str) -> bool {
    uuid::Uuid::parse_str(s).is_ok()
}

fn invalid(message: impl Into<String>) -> QvmError {
    QvmError::Validation {
        message: message.into(),
    }
}

/// Check a record and return its normalized form. The first failing rule
/// wins.
pub fn validate(cfg: &InstanceConfig, settings: &Settings) -> Result<InstanceConfig, QvmError> {
    let mut cfg = cfg.clone();

    if cfg.id == 0 || !settings.id_range().contains(&cfg.id) {
        return Err(invalid(format!(
            "id {} outside allowed range {}..={}",
            cfg.id, settings.id_start, settings.id_end
        )));
    }

    if cfg.hostname.trim().is_empty() {
        return Err(invalid("hostname must not be empty"));
    }

    if !is_valid_uuid(&cfg.uuid) {
        return Err(invalid(format!("invalid uuid '{}'", cfg.uuid)));
    }

    if cfg.disk_path.trim().is_empty() {
        return Err(invalid("disk_path must not be empty"));
    }
    if cfg.cloud_init_path.trim().is_empty() {
        return Err(invalid("cloud_init_path must not be empty"));
    }

    if cfg.cpus == 0 {
        return Err(invalid("cpus must be at least 1"));
    }
    if cfg.memory < MIN_MEMORY_MIB {
        return Err(invalid(format!(
            "memory must be at least {MIN_MEMORY_MIB} MiB (got {})",
            cfg.memory
        )));
    }
    if !cfg.disk_size.is_empty() {
        util::parse_size(&cfg.disk_size)?;
    }

    let accelerator = if cfg.accelerator.is_empty() {
        Accelerator::host_default()
    } else {
        cfg.accelerator.parse::<Accelerator>()?
    };
    cfg.accelerator = accelerator.as_str().into();

    let firmware = if cfg.firmware.is_empty() {
        Firmware::default()
    } else {
        cfg.firmware.parse::<Firmware>()?
    };
    cfg.firmware = firmware.as_str().into();
    if cfg.firmware_path.is_empty() {
        cfg.firmware_path = firmware.resolve_path();
    }

    if cfg.vnc_password.chars().count() > MAX_VNC_PASSWORD {
        return Err(invalid(format!(
            "vnc_password must be at most {MAX_VNC_PASSWORD} characters"
        )));
    }
    if !cfg.vnc_password.chars().all(|c| c.is_ascii_graphic()) {
        return Err(invalid(
            "vnc_password must contain only printable ASCII without whitespace",
        ));
    }

    if cfg.network.is_empty() {
        cfg.network.push(NetworkInterface {
            bridge: settings.default_bridge.clone(),
            model: DEFAULT_NIC_MODEL.into(),
            ..NetworkInterface::default()
        });
    }
    for (index, nic) in cfg.network.iter_mut().enumerate() {
        if nic.bridge.is_empty() {
            return Err(invalid(format!("interface {index}: bridge must not be empty")));
        }
        if nic.model.is_empty() {
            return Err(invalid(format!("interface {index}: model must not be empty")));
        }
        if nic.mac_address.is_empty() {
            nic.mac_address = default_mac(cfg.id, index);
        } else if !is_valid_mac(&nic.mac_address) {
            return Err(invalid(format!(
                "interface {index}: invalid MAC address '{}'",
                nic.mac_address
            )));
        }
        if nic.mtu == 0 {
            nic.mtu = DEFAULT_MTU;
        }
        if !(68..=65535).contains(&nic.mtu) {
            return Err(invalid(format!(
                "interface {index}: mtu {} outside 68..=65535",
                nic.mtu
            )));
        }
        if nic.multiqueue > MAX_MULTIQUEUE {
            return Err(invalid(format!(
                "interface {index}: multiqueue {} exceeds {MAX_MULTIQUEUE}",
                nic.multiqueue
            )));
        }
    }

    cfg.vnc_port = vnc_port(cfg.id);
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "123e4567-e89b-12d3-a456-426614174000";

    fn sample(id: u32) -> InstanceConfig {
        InstanceConfig {
            id,
            hostname: format!("ubuntu-{id}.vm"),
            os: "ubuntu".into(),
            version: "24.04".into(),
            accelerator: "kvm".into(),
            memory: 2048,
            cpus: 2,
            firmware: "seabios".into(),
            disk_path: format!("/state/vms/{id}-0.img"),
            disk_size: "16G".into(),
            cloud_init_path: format!("/state/vms/{id}-cloud-init.iso"),
            vnc_password: "s3cret".into(),
            uuid: UUID.into(),
            ..InstanceConfig::default()
        }
    }

    fn rejects(cfg: InstanceConfig, fragment: &str) {
        match validate(&cfg, &Settings::default()) {
            Err(QvmError::Validation { message }) => {
                assert!(message.contains(fragment), "{message:?} lacks {fragment:?}")
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn derives_port_and_default_interface() {
        let cfg = validate(&sample(150), &Settings::default()).unwrap();
        assert_eq!(cfg.vnc_port, 59150);
        assert_eq!(cfg.network.len(), 1);
        let nic = &cfg.network[0];
        assert_eq!(nic.bridge, "br0");
        assert_eq!(nic.model, "virtio-net-pci");
        assert_eq!(nic.mtu, 1500);
        assert_eq!(nic.multiqueue, 0);
        assert_eq!(nic.mac_address, "52:54:00:00:00:96");
        assert_eq!(cfg.firmware_path, Firmware::SeaBios.resolve_path());
    }

    #[test]
    fn validation_is_idempotent() {
        let once = validate(&sample(321), &Settings::default()).unwrap();
        let twice = validate(&once, &Settings::default()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn default_mac_is_deterministic() {
        assert_eq!(default_mac(513, 2), "52:54:00:02:02:01");
        assert_eq!(default_mac(513, 2), default_mac(513, 2));
        assert_ne!(default_mac(513, 0), default_mac(514, 0));
    }

    #[test]
    fn first_failing_rule_wins() {
        let mut cfg = sample(50);
        cfg.hostname.clear();
        rejects(cfg, "outside allowed range");

        let mut cfg = sample(150);
        cfg.hostname.clear();
        cfg.cpus = 0;
        rejects(cfg, "hostname");
    }

    #[test]
    fn rejects_bad_fields() {
        let mut cfg = sample(150);
        cfg.uuid = "nope".into();
        rejects(cfg, "uuid");

        let mut cfg = sample(150);
        cfg.cloud_init_path.clear();
        rejects(cfg, "cloud_init_path");

        let mut cfg = sample(150);
        cfg.memory = 128;
        rejects(cfg, "memory");

        let mut cfg = sample(150);
        cfg.disk_size = "lots".into();
        assert!(validate(&cfg, &Settings::default()).is_err());

        let mut cfg = sample(150);
        cfg.accelerator = "xen".into();
        rejects(cfg, "accelerator");
    }

    #[test]
    fn vnc_password_limits() {
        let mut cfg = sample(150);
        cfg.vnc_password = "123456789".into();
        rejects(cfg, "at most 8");

        let mut cfg = sample(150);
        cfg.vnc_password = "a b".into();
        rejects(cfg, "printable");

        let mut cfg = sample(150);
        cfg.vnc_password = "pa\nss".into();
        rejects(cfg, "printable");
    }

    #[test]
    fn interface_rules() {
        let mut cfg = sample(150);
        cfg.network = vec!["bridge=br1,model=e1000,mac_address=zz:zz".parse().unwrap()];
        rejects(cfg, "invalid MAC");

        let mut cfg = sample(150);
        cfg.network = vec!["bridge=br1,model=e1000,mtu=40".parse().unwrap()];
        rejects(cfg, "mtu");

        let mut cfg = sample(150);
        cfg.network = vec!["model=e1000".parse().unwrap()];
        rejects(cfg, "bridge");
    }

    #[test]
    fn parses_interface_descriptor() {
        let nic: NetworkInterface =
            "bridge=br0,model=e1000,vlan=10,mac_address=52:54:00:aa:bb:cc,firewall=1,disconnect=0,mtu=9000,rate_limit=0,multiqueue=4,colour=blue"
                .parse()
                .unwrap();
        assert_eq!(nic.bridge, "br0");
        assert_eq!(nic.model, "e1000");
        assert_eq!(nic.vlan, 10);
        assert_eq!(nic.mac_address, "52:54:00:aa:bb:cc");
        assert!(nic.firewall);
        assert!(!nic.disconnect);
        assert_eq!(nic.mtu, 9000);
        assert_eq!(nic.multiqueue, 4);

        let nic: NetworkInterface = "bridge=br1,model=virtio-net-pci".parse().unwrap();
        assert_eq!(nic.mtu, 1500);
    }

    #[test]
    fn parses_ip_config() {
        let ip: IpConfig = "mode=static,address=10.0.0.5/24,gateway=10.0.0.1"
            .parse()
            .unwrap();
        assert!(ip.is_static());
        assert_eq!(ip.gateway, "10.0.0.1");

        let ip: IpConfig = "address=10.0.0.9/24".parse().unwrap();
        assert!(ip.is_static());

        assert!("mode=static".parse::<IpConfig>().is_err());
        assert!("mode=bogus".parse::<IpConfig>().is_err());
    }

    #[test]
    fn json_round_trip_preserves_record() {
        let cfg = validate(&sample(200), &Settings::default()).unwrap();
        let json = facet_json::to_string(&cfg).expect("JSON serialization");
        let back: InstanceConfig = facet_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
