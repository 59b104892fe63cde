use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{CloudInitConfig, IpConfig, NetworkInterface};
use crate::manager::CreateRequest;

#[derive(Parser, Debug)]
#[command(name = "qvm", version, about = "Local QEMU virtual machine manager")]
pub struct Cli {
    /// State directory (configs, pids, logs, disks)
    #[arg(long, env = "QVM_HOME", global = true)]
    pub root: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a VM and boot it
    Create(Box<CreateArgs>),

    /// Boot a stopped VM
    Start { id: u32 },

    /// Stop a running VM
    Stop { id: u32 },

    /// Stop (if running) and remove a VM with all its files
    Delete { id: u32 },

    /// List VMs
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Remove stale pid markers left by crashed VMs
    Cleanup,

    /// Show the VNC endpoint of a running VM and open a viewer
    Vnc {
        id: u32,

        /// Only print the endpoint
        #[arg(long)]
        no_open: bool,
    },
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Explicit VM id (default: lowest free id)
    #[arg(long)]
    pub id: Option<u32>,

    /// Guest hostname (default: <os>-<id>.vm)
    #[arg(long)]
    pub hostname: Option<String>,

    /// Cloud image OS: ubuntu, debian, centos, rockylinux, almalinux
    #[arg(long)]
    pub os: Option<String>,

    /// Cloud image version, e.g. 24.04 or 12
    #[arg(long)]
    pub version: Option<String>,

    /// Boot an existing disk instead of downloading an image
    #[arg(long)]
    pub disk: Option<PathBuf>,

    /// Working disk size
    #[arg(long, default_value = "16G")]
    pub disk_size: String,

    /// Attach an existing cloud-init seed ISO instead of generating one
    #[arg(long)]
    pub seed: Option<PathBuf>,

    /// Memory in MiB
    #[arg(short, long, default_value_t = 2048)]
    pub memory: u64,

    /// Virtual CPUs
    #[arg(short, long, default_value_t = 2)]
    pub cpus: u32,

    /// kvm, hvf or tcg (default: host accelerator)
    #[arg(long)]
    pub accelerator: Option<String>,

    /// seabios or ovmf
    #[arg(long)]
    pub firmware: Option<String>,

    /// Explicit firmware image
    #[arg(long)]
    pub firmware_path: Option<String>,

    /// VNC password, at most 8 characters (default: random)
    #[arg(long)]
    pub vnc_password: Option<String>,

    /// Network interface, repeatable: bridge=br0,model=virtio-net-pci,mac_address=..
    #[arg(long = "net")]
    pub network: Vec<NetworkInterface>,

    /// Guest login name
    #[arg(long)]
    pub username: Option<String>,

    /// Guest login password
    #[arg(long)]
    pub password: Option<String>,

    /// SSH public key (default: first key in ~/.ssh)
    #[arg(long)]
    pub ssh_key: Option<String>,

    /// Upgrade guest packages on first boot
    #[arg(long)]
    pub upgrade: bool,

    /// DNS server, repeatable
    #[arg(long = "dns")]
    pub dns_servers: Vec<String>,

    /// DNS search domain
    #[arg(long)]
    pub dns_domain: Option<String>,

    /// IPv4 setup: mode=static,address=10.0.0.5/24,gateway=10.0.0.1
    #[arg(long)]
    pub ipv4: Option<IpConfig>,

    /// IPv6 setup: mode=static|dhcp|slaac,address=..,gateway=..
    #[arg(long)]
    pub ipv6: Option<IpConfig>,
}

impl From<CreateArgs> for CreateRequest {
    fn from(args: CreateArgs) -> Self {
        CreateRequest {
            id: args.id,
            hostname: args.hostname,
            os: args.os,
            version: args.version,
            disk: args.disk,
            disk_size: Some(args.disk_size),
            seed: args.seed,
            accelerator: args.accelerator,
            firmware: args.firmware,
            firmware_path: args.firmware_path,
            memory: args.memory,
            cpus: args.cpus,
            vnc_password: args.vnc_password,
            network: args.network,
            cloud_init: CloudInitConfig {
                hostname: String::new(),
                username: args.username.unwrap_or_default(),
                password: args.password.unwrap_or_default(),
                authorized_key: args.ssh_key.unwrap_or_default(),
                upgrade_packages: args.upgrade,
                dns_domain: args.dns_domain.unwrap_or_default(),
                dns_servers: args.dns_servers,
                ipv4: args.ipv4,
                ipv6: args.ipv6,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_args_map_to_request() {
        let cli = Cli::try_parse_from([
            "qvm",
            "create",
            "--os",
            "ubuntu",
            "--version",
            "24.04",
            "--net",
            "bridge=br1,model=e1000",
            "--net",
            "bridge=br2,model=virtio-net-pci,multiqueue=2",
            "--dns",
            "1.1.1.1",
            "--ipv4",
            "address=10.0.0.5/24,gateway=10.0.0.1",
            "-m",
            "4096",
        ])
        .unwrap();

        let Command::Create(args) = cli.command else {
            panic!("expected create");
        };
        let req = CreateRequest::from(*args);
        assert_eq!(req.os.as_deref(), Some("ubuntu"));
        assert_eq!(req.memory, 4096);
        assert_eq!(req.cpus, 2);
        assert_eq!(req.disk_size.as_deref(), Some("16G"));
        assert_eq!(req.network.len(), 2);
        assert_eq!(req.network[1].multiqueue, 2);
        assert_eq!(req.cloud_init.dns_servers, vec!["1.1.1.1"]);
        assert!(req.cloud_init.ipv4.as_ref().unwrap().is_static());
    }

    #[test]
    fn bad_ip_mode_is_a_parse_error() {
        assert!(Cli::try_parse_from(["qvm", "create", "--ipv4", "mode=weird"]).is_err());
    }

    #[test]
    fn root_is_global() {
        let cli = Cli::try_parse_from(["qvm", "list", "--root", "/tmp/qvm-state", "--json"]).unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/qvm-state")));
        assert!(matches!(cli.command, Command::List { json: true }));
    }
}
