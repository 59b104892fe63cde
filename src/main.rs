use clap::Parser;
use console::style;
use facet::Facet;

use qvm::cli::{Cli, Command};
use qvm::logging;
use qvm::manager::{Instance, InstanceState, Manager};
use qvm::paths;

#[derive(Facet)]
struct InstanceJson {
    id: u32,
    hostname: String,
    os: String,
    version: String,
    state: String,
    pid: Option<u32>,
    memory: u64,
    cpus: u32,
    vnc_port: u32,
}

impl From<&Instance> for InstanceJson {
    fn from(i: &Instance) -> Self {
        Self {
            id: i.config.id,
            hostname: i.config.hostname.clone(),
            os: i.config.os.clone(),
            version: i.config.version.clone(),
            state: i.state.to_string(),
            pid: i.pid,
            memory: i.config.memory,
            cpus: i.config.cpus,
            vnc_port: i.config.vnc_port,
        }
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let file_handle = logging::init(cli.verbose);

    let root = cli.root.clone().unwrap_or_else(paths::default_root);
    let manager = Manager::open(&root)?;
    if let Err(e) = file_handle.set_file(&manager.layout().manager_log()) {
        tracing::debug!(error = %e, "file logging unavailable");
    }
    tracing::debug!(root = %root.display(), command = ?cli.command, "qvm invoked");

    match cli.command {
        Command::Create(args) => {
            let instance = manager.create((*args).into()).await?;
            let id = instance.config.id;
            let pid = instance.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
            if instance.state == InstanceState::Stopped {
                println!(
                    "{} VM {id} ({}) created, but the hypervisor (pid {pid}) exited during startup",
                    style("!").yellow(),
                    instance.config.hostname,
                );
                println!("  see {}", manager.layout().log_file(id).display());
            } else {
                println!(
                    "{} VM {id} ({}) created, pid {pid}",
                    style("✓").green(),
                    instance.config.hostname,
                );
                println!(
                    "  VNC: vnc://localhost:{}  password: {}",
                    instance.config.vnc_port, instance.config.vnc_password
                );
            }
        }
        Command::Start { id } => {
            let pid = manager.start(id).await?;
            println!("{} VM {id} started, pid {pid}", style("✓").green());
        }
        Command::Stop { id } => {
            manager.stop(id).await?;
            println!("{} VM {id} stopped", style("✓").green());
        }
        Command::Delete { id } => {
            manager.delete(id).await?;
            println!("{} VM {id} deleted", style("✓").green());
        }
        Command::List { json } => {
            let instances = manager.list()?;
            if json {
                let rows: Vec<InstanceJson> = instances.iter().map(InstanceJson::from).collect();
                println!(
                    "{}",
                    facet_json::to_string(&rows).expect("JSON serialization")
                );
            } else {
                print_table(&instances);
            }
        }
        Command::Cleanup => {
            let removed = manager.cleanup();
            println!("Removed {removed} stale pid marker(s)");
        }
        Command::Vnc { id, no_open } => {
            let endpoint = manager.display(id)?;
            println!("{}", endpoint.url);
            println!("password: {}", endpoint.password);
            if !no_open {
                open_viewer(&endpoint.url).await;
            }
        }
    }

    Ok(())
}

fn print_table(instances: &[Instance]) {
    if instances.is_empty() {
        println!("No VMs.");
        return;
    }
    println!(
        "{:<5} {:<28} {:<16} {:<8} {:>8} {:>6} {:>5} {:>6}",
        "ID", "HOSTNAME", "OS", "STATE", "PID", "MEM", "CPUS", "VNC"
    );
    for i in instances {
        let os = match (i.config.os.as_str(), i.config.version.as_str()) {
            ("", _) => "-".to_string(),
            (os, "") => os.to_string(),
            (os, v) => format!("{os} {v}"),
        };
        let state = match i.state {
            InstanceState::Running => style(format!("{:<8}", i.state)).green(),
            InstanceState::Stopped => style(format!("{:<8}", i.state)).dim(),
        };
        println!(
            "{:<5} {:<28} {:<16} {} {:>8} {:>6} {:>5} {:>6}",
            i.config.id,
            i.config.hostname,
            os,
            state,
            i.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            i.config.memory,
            i.config.cpus,
            i.config.vnc_port,
        );
    }
}

/// Hand the URL to the desktop's default VNC handler. Failure only warns.
async fn open_viewer(url: &str) {
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    match tokio::process::Command::new(opener).arg(url).status().await {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(opener, %status, "could not open VNC viewer"),
        Err(e) => tracing::warn!(opener, error = %e, "could not open VNC viewer"),
    }
}
