//! WireGuard tool operations.
//!
//! The supervisor and sampler only see the [`WgTool`] trait; [`WgCli`] backs
//! it with `wg` and `wg-quick`. Every invocation is bounded by a timeout and
//! a timed-out child is killed.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// External tool errors.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {diagnostic}")]
    Failed {
        command: String,
        status: String,
        diagnostic: String,
    },

    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Unexpected output from {command}: {detail}")]
    Parse { command: String, detail: String },
}

impl ToolError {
    /// Captured stderr/stdout of a failed command.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            ToolError::Failed { diagnostic, .. } => Some(diagnostic),
            _ => None,
        }
    }
}

pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// A base64 Curve25519 keypair as produced by `wg genkey | wg pubkey`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Live counters for one peer of an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub latest_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Capability interface to the native WireGuard stack.
#[async_trait]
pub trait WgTool: Send + Sync {
    /// Bring the interface up from the config file. The file name (minus
    /// `.conf`) must equal `interface`.
    async fn up(&self, interface: &str, config_path: &Path) -> ToolResult<()>;

    /// Tear the interface down. `config_path` is the file it was brought up
    /// from; it may no longer exist.
    async fn down(&self, interface: &str, config_path: &Path) -> ToolResult<()>;

    /// Whether the interface currently exists.
    async fn is_up(&self, interface: &str) -> ToolResult<bool>;

    /// Per-peer counters of a running interface.
    async fn show(&self, interface: &str) -> ToolResult<Vec<PeerStats>>;

    async fn generate_keypair(&self) -> ToolResult<KeyPair>;

    async fn generate_preshared_key(&self) -> ToolResult<String>;
}

/// [`WgTool`] implementation shelling out to `wg` and `wg-quick`.
pub struct WgCli {
    wg_bin: String,
    wg_quick_bin: String,
    timeout: Duration,
}

impl WgCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            wg_bin: "wg".to_string(),
            wg_quick_bin: "wg-quick".to_string(),
            timeout,
        }
    }

    /// Use custom binaries (e.g. a wrapper script).
    pub fn with_binaries(mut self, wg_bin: &str, wg_quick_bin: &str) -> Self {
        self.wg_bin = wg_bin.to_string();
        self.wg_quick_bin = wg_quick_bin.to_string();
        self
    }

    async fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> ToolResult<String> {
        let command = format!("{} {}", program, args.join(" "));
        debug!(command = %command, "Running tool command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                command: command.clone(),
                source,
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|source| ToolError::Spawn {
                    command: command.clone(),
                    source,
                })?;
        }

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ToolError::Spawn {
                command: command.clone(),
                source,
            })?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    command,
                    after: self.timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let diagnostic = if stderr.is_empty() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr
            };
            return Err(ToolError::Failed {
                command,
                status: output.status.to_string(),
                diagnostic,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl WgTool for WgCli {
    async fn up(&self, interface: &str, config_path: &Path) -> ToolResult<()> {
        let path = config_path.to_string_lossy();
        info!(interface = %interface, config = %path, "Bringing interface up");
        self.run(&self.wg_quick_bin, &["up", &path], None).await?;
        Ok(())
    }

    async fn down(&self, interface: &str, config_path: &Path) -> ToolResult<()> {
        info!(interface = %interface, "Bringing interface down");
        // wg-quick resolves a bare name against its own config directory
        let target = if tokio::fs::try_exists(config_path).await.unwrap_or(false) {
            config_path.to_string_lossy().into_owned()
        } else {
            interface.to_string()
        };
        self.run(&self.wg_quick_bin, &["down", &target], None).await?;
        Ok(())
    }

    async fn is_up(&self, interface: &str) -> ToolResult<bool> {
        let stdout = self.run(&self.wg_bin, &["show", "interfaces"], None).await?;
        Ok(stdout.split_whitespace().any(|name| name == interface))
    }

    async fn show(&self, interface: &str) -> ToolResult<Vec<PeerStats>> {
        let stdout = self.run(&self.wg_bin, &["show", interface, "dump"], None).await?;
        parse_dump(&stdout).map_err(|detail| ToolError::Parse {
            command: format!("{} show {} dump", self.wg_bin, interface),
            detail,
        })
    }

    async fn generate_keypair(&self) -> ToolResult<KeyPair> {
        let private_key = self.run(&self.wg_bin, &["genkey"], None).await?;
        let private_key = private_key.trim().to_string();
        let public_key = self
            .run(&self.wg_bin, &["pubkey"], Some(&format!("{}\n", private_key)))
            .await?;

        Ok(KeyPair {
            private_key,
            public_key: public_key.trim().to_string(),
        })
    }

    async fn generate_preshared_key(&self) -> ToolResult<String> {
        let psk = self.run(&self.wg_bin, &["genpsk"], None).await?;
        Ok(psk.trim().to_string())
    }
}

/// Parse `wg show <iface> dump`.
///
/// The first line describes the interface (4 fields); each following line is
/// a peer: public-key, preshared-key, endpoint, allowed-ips,
/// latest-handshake, transfer-rx, transfer-tx, persistent-keepalive.
pub fn parse_dump(output: &str) -> Result<Vec<PeerStats>, String> {
    let mut peers = Vec::new();

    for (index, line) in output.lines().enumerate() {
        if index == 0 || line.trim().is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 8 {
            return Err(format!("peer line {} has {} fields", index, parts.len()));
        }

        let handshake: i64 = parts[4]
            .parse()
            .map_err(|_| format!("bad handshake timestamp {:?}", parts[4]))?;
        let rx_bytes: u64 = parts[5]
            .parse()
            .map_err(|_| format!("bad rx counter {:?}", parts[5]))?;
        let tx_bytes: u64 = parts[6]
            .parse()
            .map_err(|_| format!("bad tx counter {:?}", parts[6]))?;

        peers.push(PeerStats {
            public_key: parts[0].to_string(),
            endpoint: (parts[2] != "(none)").then(|| parts[2].to_string()),
            latest_handshake: if handshake > 0 {
                Utc.timestamp_opt(handshake, 0).single()
            } else {
                None
            },
            rx_bytes,
            tx_bytes,
        });
    }

    Ok(peers)
}
