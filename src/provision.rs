//! cloud-init NoCloud seed media.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use facet_value::{VArray, Value, value};

use crate::config::{CloudInitConfig, IpConfig};
use crate::error::QvmError;
use crate::paths::Layout;
use crate::util;

pub const SUPPORTED_OS: &[&str] = &["ubuntu", "debian", "centos", "rockylinux", "almalinux"];
const DEFAULT_PASSWORD: &str = "passwd";
const SSH_KEY_CANDIDATES: &[&str] = &["id_ed25519.pub", "id_rsa.pub", "id_ecdsa.pub"];

pub struct ProvisionRequest<'a> {
    pub id: u32,
    pub uuid: &'a str,
    pub os: &'a str,
    pub hostname: &'a str,
    pub cloud_init: &'a CloudInitConfig,
}

/// Produces the provisioning medium attached to a new instance.
#[allow(async_fn_in_trait)]
pub trait Provisioner {
    /// Build the seed for `req` and return its path.
    async fn provision(&self, req: &ProvisionRequest<'_>) -> Result<PathBuf, QvmError>;
}

/// Contents of a NoCloud seed.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedFiles {
    pub meta_data: String,
    pub user_data: String,
    pub network_config: Option<String>,
}

/// Writes `meta-data`, `user-data` and (for static addressing)
/// `network-config`, then packs them with `genisoimage` or `mkisofs`.
#[derive(Debug, Clone)]
pub struct CloudInit {
    layout: Layout,
}

impl CloudInit {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }
}

impl Provisioner for CloudInit {
    async fn provision(&self, req: &ProvisionRequest<'_>) -> Result<PathBuf, QvmError> {
        let authorized_key = if req.cloud_init.authorized_key.is_empty() {
            let key = discover_ssh_key(dirs::home_dir().as_deref());
            if key.is_none() {
                tracing::warn!(id = req.id, "no SSH public key found in ~/.ssh; only password login will work");
            }
            key
        } else {
            Some(req.cloud_init.authorized_key.clone())
        };

        let seed = seed_files(req, authorized_key.as_deref())?;

        let staging = self.layout.vms_dir().join(format!(".cloudinit-{}", req.id));
        let iso = self.layout.seed_iso(req.id);
        let result = pack(&staging, &iso, &seed).await;
        let _ = tokio::fs::remove_dir_all(&staging).await;
        result?;

        tracing::info!(id = req.id, path = %iso.display(), "generated cloud-init seed ISO");
        Ok(iso)
    }
}

async fn pack(staging: &Path, iso: &Path, seed: &SeedFiles) -> Result<(), QvmError> {
    let io = |what: &str, path: &Path, e: std::io::Error| QvmError::Io {
        context: format!("{what} {}", path.display()),
        source: e,
    };

    tokio::fs::create_dir_all(staging)
        .await
        .map_err(|e| io("creating", staging, e))?;

    let mut files = vec![
        (staging.join("meta-data"), seed.meta_data.as_str()),
        (staging.join("user-data"), seed.user_data.as_str()),
    ];
    if let Some(net) = &seed.network_config {
        files.push((staging.join("network-config"), net.as_str()));
    }
    for (path, contents) in &files {
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| io("writing", path, e))?;
    }

    let tool = ["genisoimage", "mkisofs"]
        .into_iter()
        .find_map(util::which)
        .ok_or_else(|| QvmError::ExternalCommand {
            command: "genisoimage".into(),
            message: "neither genisoimage nor mkisofs found in PATH".into(),
        })?;

    let output = tokio::process::Command::new(&tool)
        .arg("-output")
        .arg(iso)
        .args(["-volid", "cidata", "-joliet", "-rock"])
        .args(files.iter().map(|(p, _)| p))
        .output()
        .await
        .map_err(|e| QvmError::ExternalCommand {
            command: tool.display().to_string(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(QvmError::ExternalCommand {
            command: tool.display().to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// First public key found in `<home>/.ssh`.
pub fn discover_ssh_key(home: Option<&Path>) -> Option<String> {
    let ssh = home?.join(".ssh");
    SSH_KEY_CANDIDATES.iter().find_map(|name| {
        let key = std::fs::read_to_string(ssh.join(name)).ok()?;
        let key = key.trim();
        (!key.is_empty()).then(|| key.to_string())
    })
}

/// Login name used when none is configured.
pub fn default_username(os: &str) -> &str {
    match os {
        "rockylinux" => "rocky",
        "almalinux" => "alma",
        other => other,
    }
}

pub fn seed_files(
    req: &ProvisionRequest<'_>,
    authorized_key: Option<&str>,
) -> Result<SeedFiles, QvmError> {
    let os = req.os.to_ascii_lowercase();
    if !SUPPORTED_OS.contains(&os.as_str()) {
        return Err(QvmError::UnsupportedOs { os: req.os.into() });
    }
    if req.uuid.is_empty() {
        return Err(QvmError::Validation {
            message: "cloud-init seed requires an instance uuid".into(),
        });
    }

    let ci = req.cloud_init;
    let hostname = [ci.hostname.as_str(), req.hostname]
        .into_iter()
        .find(|h| !h.is_empty())
        .unwrap_or(os.as_str());

    Ok(SeedFiles {
        meta_data: format!("instance-id: {}\nlocal-hostname: {hostname}\n", req.uuid),
        user_data: build_user_data(&os, ci, authorized_key),
        network_config: build_network_config(ci),
    })
}

fn build_user_data(os: &str, ci: &CloudInitConfig, authorized_key: Option<&str>) -> String {
    let username = if ci.username.is_empty() {
        default_username(os)
    } else {
        ci.username.as_str()
    };
    let password = if ci.password.is_empty() {
        DEFAULT_PASSWORD
    } else {
        ci.password.as_str()
    };

    let mut user = value!({
        "name": (username),
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
        "shell": "/bin/bash",
    });
    if let Some(key) = authorized_key
        && let Some(obj) = user.as_object_mut()
    {
        obj.insert(
            "ssh_authorized_keys",
            Value::from(VArray::from_iter([Value::from(key)])),
        );
    }

    let chpasswd_list = format!("{username}:{password}\n");
    let mut config = value!({
        "users": [(user)],
        "ssh_pwauth": true,
        "chpasswd": {
            "list": (chpasswd_list.as_str()),
            "expire": false,
        },
        "package_upgrade": (ci.upgrade_packages),
        "packages": ["qemu-guest-agent"],
        "runcmd": [
            ["systemctl", "enable", "qemu-guest-agent"],
            ["systemctl", "start", "qemu-guest-agent"],
        ],
    });

    if (!ci.dns_servers.is_empty() || !ci.dns_domain.is_empty())
        && let Some(obj) = config.as_object_mut()
    {
        let mut resolv = value!({});
        if let Some(r) = resolv.as_object_mut() {
            if !ci.dns_servers.is_empty() {
                r.insert(
                    "nameservers",
                    Value::from(VArray::from_iter(
                        ci.dns_servers.iter().map(|s| Value::from(s.as_str())),
                    )),
                );
            }
            if !ci.dns_domain.is_empty() {
                r.insert(
                    "searchdomains",
                    Value::from(VArray::from_iter([Value::from(ci.dns_domain.as_str())])),
                );
            }
        }
        obj.insert("manage_resolv_conf", Value::from(true));
        obj.insert("resolv_conf", resolv);
    }

    let yaml = facet_yaml::to_string(&config).expect("valid YAML serialization");
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    format!("#cloud-config\n{yaml}")
}

fn static_address(ip: &Option<IpConfig>) -> Option<&IpConfig> {
    ip.as_ref().filter(|ip| ip.is_static() && !ip.address.is_empty())
}

/// Netplan v2 document, only emitted when a static address is configured.
pub fn build_network_config(ci: &CloudInitConfig) -> Option<String> {
    let v4 = static_address(&ci.ipv4);
    let v6 = static_address(&ci.ipv6);
    if v4.is_none() && v6.is_none() {
        return None;
    }

    let mut out = String::from(
        "version: 2\nethernets:\n  id0:\n    match:\n      name: \"en*\"\n    addresses:\n",
    );
    for ip in [v4, v6].into_iter().flatten() {
        let _ = writeln!(out, "      - {}", ip.address);
    }
    if let Some(gw) = v4.map(|ip| &ip.gateway).filter(|g| !g.is_empty()) {
        let _ = writeln!(out, "    gateway4: {gw}");
    }
    if let Some(gw) = v6.map(|ip| &ip.gateway).filter(|g| !g.is_empty()) {
        let _ = writeln!(out, "    gateway6: {gw}");
    }

    let dhcp4 = v4.is_none() && ci.ipv4.as_ref().is_none_or(|ip| ip.mode == "dhcp");
    let v6_mode = ci.ipv6.as_ref().map(|ip| ip.mode.as_str());
    if v6_mode == Some("slaac") {
        out.push_str("    accept-ra: true\n");
    }
    let yes_no = |b: bool| if b { "true" } else { "false" };
    let _ = writeln!(out, "    dhcp4: {}", yes_no(dhcp4));
    let _ = writeln!(out, "    dhcp6: {}", yes_no(v6_mode == Some("dhcp")));

    if !ci.dns_servers.is_empty() {
        out.push_str("    nameservers:\n      addresses:\n");
        for dns in &ci.dns_servers {
            let _ = writeln!(out, "        - {dns}");
        }
        if !ci.dns_domain.is_empty() {
            let _ = writeln!(out, "      search:\n        - {}", ci.dns_domain);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "123e4567-e89b-12d3-a456-426614174000";

    fn request<'a>(os: &'a str, ci: &'a CloudInitConfig) -> ProvisionRequest<'a> {
        ProvisionRequest {
            id: 150,
            uuid: UUID,
            os,
            hostname: "ubuntu-150.vm",
            cloud_init: ci,
        }
    }

    #[test]
    fn meta_data_uses_uuid_and_hostname() {
        let ci = CloudInitConfig::default();
        let seed = seed_files(&request("ubuntu", &ci), None).unwrap();
        assert_eq!(
            seed.meta_data,
            format!("instance-id: {UUID}\nlocal-hostname: ubuntu-150.vm\n")
        );
        assert!(seed.network_config.is_none());
    }

    #[test]
    fn user_data_is_cloud_config() {
        let ci = CloudInitConfig {
            upgrade_packages: true,
            ..CloudInitConfig::default()
        };
        let seed = seed_files(&request("ubuntu", &ci), Some("ssh-ed25519 AAAA test@host")).unwrap();
        let ud = &seed.user_data;
        assert!(ud.starts_with("#cloud-config\n"), "{ud}");
        assert!(!ud.contains("---"));
        assert!(ud.contains("ubuntu:passwd"));
        assert!(ud.contains("ssh-ed25519 AAAA test@host"));
        assert!(ud.contains("qemu-guest-agent"));
        assert!(ud.contains("ssh_pwauth"));
        assert!(ud.contains("package_upgrade: true"));
        assert!(!ud.contains("resolv_conf"));
    }

    #[test]
    fn default_usernames_follow_distribution() {
        assert_eq!(default_username("rockylinux"), "rocky");
        assert_eq!(default_username("almalinux"), "alma");
        assert_eq!(default_username("debian"), "debian");

        let ci = CloudInitConfig::default();
        let seed = seed_files(&request("rockylinux", &ci), None).unwrap();
        assert!(seed.user_data.contains("rocky:passwd"));
        assert!(!seed.user_data.contains("ssh_authorized_keys"));
    }

    #[test]
    fn dns_settings_land_in_resolv_conf() {
        let ci = CloudInitConfig {
            dns_servers: vec!["1.1.1.1".into(), "9.9.9.9".into()],
            dns_domain: "lab.internal".into(),
            ..CloudInitConfig::default()
        };
        let seed = seed_files(&request("debian", &ci), None).unwrap();
        assert!(seed.user_data.contains("manage_resolv_conf"));
        assert!(seed.user_data.contains("9.9.9.9"));
        assert!(seed.user_data.contains("lab.internal"));
    }

    #[test]
    fn static_ipv4_emits_netplan() {
        let ci = CloudInitConfig {
            ipv4: Some("mode=static,address=10.0.0.5/24,gateway=10.0.0.1".parse().unwrap()),
            dns_servers: vec!["10.0.0.1".into()],
            ..CloudInitConfig::default()
        };
        let net = build_network_config(&ci).unwrap();
        assert!(net.starts_with("version: 2\n"));
        assert!(net.contains("      - 10.0.0.5/24\n"));
        assert!(net.contains("    gateway4: 10.0.0.1\n"));
        assert!(net.contains("    dhcp4: false\n"));
        assert!(net.contains("        - 10.0.0.1\n"));
    }

    #[test]
    fn dhcp_only_has_no_network_config() {
        let ci = CloudInitConfig {
            ipv4: Some("mode=dhcp".parse().unwrap()),
            ..CloudInitConfig::default()
        };
        assert!(build_network_config(&ci).is_none());
    }

    #[test]
    fn unsupported_os_is_rejected() {
        let ci = CloudInitConfig::default();
        assert!(matches!(
            seed_files(&request("windows", &ci), None),
            Err(QvmError::UnsupportedOs { .. })
        ));
    }

    #[test]
    fn ssh_key_discovery_prefers_ed25519() {
        let home = tempfile::tempdir().unwrap();
        let ssh = home.path().join(".ssh");
        std::fs::create_dir_all(&ssh).unwrap();
        assert_eq!(discover_ssh_key(Some(home.path())), None);

        std::fs::write(ssh.join("id_rsa.pub"), "ssh-rsa BBBB\n").unwrap();
        assert_eq!(discover_ssh_key(Some(home.path())).as_deref(), Some("ssh-rsa BBBB"));

        std::fs::write(ssh.join("id_ed25519.pub"), "ssh-ed25519 AAAA\n").unwrap();
        assert_eq!(
            discover_ssh_key(Some(home.path())).as_deref(),
            Some("ssh-ed25519 AAAA")
        );
    }
}
