use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum QvmError {
    #[error("failed to load {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("VM {id} not found")]
    #[diagnostic(help("run `qvm list` to see known instances"))]
    NotFound { id: u32 },

    #[error("VM {id} already exists")]
    AlreadyExists { id: u32 },

    #[error("VM {id} is already running (pid {pid})")]
    AlreadyRunning { id: u32, pid: u32 },

    #[error("VM {id} is not running")]
    NotRunning { id: u32 },

    #[error("no free VM id left in {start}..={end}")]
    #[diagnostic(help("delete unused instances or widen QVM_ID_START / QVM_ID_END"))]
    NoCapacity { start: u32, end: u32 },

    #[error("too many hypervisor processes running ({running}, limit {limit})")]
    #[diagnostic(help("stop unused instances, then run `qvm cleanup`"))]
    ResourceExhausted { running: usize, limit: usize },

    #[error("failed to launch hypervisor for VM {id}")]
    #[diagnostic(help("check that the hypervisor binary exists (QVM_QEMU_BINARY)"))]
    SpawnFailed {
        id: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal VM {id} (pid {pid})")]
    SignalFailed {
        id: u32,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("{what} for VM {id} not found: {path}")]
    MissingArtifact {
        id: u32,
        what: &'static str,
        path: String,
    },

    #[error("failed to connect to monitor {path} after {attempts} attempt(s)")]
    ConnectFailed {
        path: String,
        attempts: u32,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("monitor {path} did not answer within {timeout_ms}ms")]
    MonitorTimeout { path: String, timeout_ms: u64 },

    #[error("monitor rejected command: {message}")]
    MonitorRemote { message: String },

    #[error("unsupported OS: {os}")]
    #[diagnostic(help("supported: ubuntu, debian, centos, rockylinux, almalinux"))]
    UnsupportedOs { os: String },

    #[error("unsupported version: {os} {version}")]
    #[diagnostic(help("supported versions are configured via QVM_<OS>_VERSIONS or settings.toml"))]
    UnsupportedVersion { os: String, version: String },

    #[error("image download failed: {message}")]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}
