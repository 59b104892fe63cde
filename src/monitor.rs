//! Client for the hypervisor's human monitor on a Unix socket.
//!
//! One command per connection: connect, discard the banner up to the prompt,
//! write the command line, read until the next prompt, classify.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::QvmError;

const PROMPT: &str = "(qemu)";
const FAILURE_MARKERS: &[&str] = &["error", "failed", "could not"];

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Connection probes before giving up.
    pub attempts: u32,
    /// Fixed wait between probes.
    pub backoff: Duration,
    /// Bound on every individual read.
    pub read_timeout: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// Set the VNC password of a running instance.
pub async fn set_display_password(
    socket: &Path,
    secret: &str,
    opts: &MonitorOptions,
) -> Result<(), QvmError> {
    if secret.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(QvmError::Validation {
            message: "display password must not contain whitespace".into(),
        });
    }
    let response = execute(socket, &format!("change vnc password {secret}"), opts).await?;
    classify(&response, secret)
}

/// Send one command line and return everything printed before the next
/// prompt.
pub async fn execute(
    socket: &Path,
    command: &str,
    opts: &MonitorOptions,
) -> Result<String, QvmError> {
    let mut stream = connect(socket, opts).await?;

    let banner = read_until_prompt(&mut stream, socket, opts).await?;
    if !banner.contains(PROMPT) {
        return Err(QvmError::MonitorRemote {
            message: "connection closed before prompt".into(),
        });
    }

    let line = format!("{command}\n");
    let write = async {
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await
    };
    match tokio::time::timeout(opts.read_timeout, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            return Err(QvmError::Io {
                context: format!("writing to monitor {}", socket.display()),
                source: e,
            });
        }
        Err(_) => {
            return Err(QvmError::MonitorTimeout {
                path: socket.display().to_string(),
                timeout_ms: opts.read_timeout.as_millis() as u64,
            });
        }
    }

    let response = read_until_prompt(&mut stream, socket, opts).await?;
    Ok(response.replace(PROMPT, "").trim().to_string())
}

async fn connect(socket: &Path, opts: &MonitorOptions) -> Result<UnixStream, QvmError> {
    let attempts = opts.attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        if socket.exists() {
            match UnixStream::connect(socket).await {
                Ok(stream) => {
                    tracing::debug!(path = %socket.display(), attempt, "monitor connected");
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(path = %socket.display(), attempt, error = %e, "monitor connect failed");
                    last_err = Some(e);
                }
            }
        } else {
            tracing::debug!(path = %socket.display(), attempt, "monitor socket not present yet");
        }
        if attempt < attempts {
            tokio::time::sleep(opts.backoff).await;
        }
    }

    Err(QvmError::ConnectFailed {
        path: socket.display().to_string(),
        attempts,
        source: last_err,
    })
}

/// Accumulate output until the prompt shows up or the peer closes.
async fn read_until_prompt(
    stream: &mut UnixStream,
    socket: &Path,
    opts: &MonitorOptions,
) -> Result<String, QvmError> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match tokio::time::timeout(opts.read_timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                return Err(QvmError::Io {
                    context: format!("reading from monitor {}", socket.display()),
                    source: e,
                });
            }
            Err(_) => {
                return Err(QvmError::MonitorTimeout {
                    path: socket.display().to_string(),
                    timeout_ms: opts.read_timeout.as_millis() as u64,
                });
            }
        };
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
        if String::from_utf8_lossy(&collected).contains(PROMPT) {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&collected).into_owned())
}

/// A response is a failure when it mentions an error. The secret is cut out
/// first so a password like `noerror` cannot trip the check.
pub fn classify(response: &str, secret: &str) -> Result<(), QvmError> {
    let scrubbed = if secret.is_empty() {
        response.to_string()
    } else {
        response.replace(secret, "")
    };
    let lower = scrubbed.to_ascii_lowercase();
    if FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
        return Err(QvmError::MonitorRemote {
            message: scrubbed.trim().to_string(),
        });
    }
    Ok(())
}
