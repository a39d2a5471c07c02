use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use super::session::SessionOptions;
use crate::protocol::{DEFAULT_MAX_FRAME_LEN, FrameCodec};

/// Default relay port
pub const DEFAULT_PORT: u16 = 8888;

/// Relay and client configuration, stored as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Where the relay keeps files it receives
    pub received_dir: PathBuf,
    /// Where the client keeps files it receives
    pub downloads_dir: PathBuf,
    pub log_dir: PathBuf,
    pub max_frame_len: usize,
    pub outbound_queue_depth: usize,
    pub send_timeout_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            received_dir: PathBuf::from("files/received"),
            downloads_dir: PathBuf::from("files/downloads"),
            log_dir: PathBuf::from("logs"),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            outbound_queue_depth: 256,
            send_timeout_ms: 5_000,
            connect_timeout_secs: 10,
        }
    }
}

impl RelayConfig {
    /// Load configuration from file, or defaults when absent or unreadable
    pub fn load_or_default(config_path: Option<&Path>) -> Self {
        match config_path {
            Some(path) => Self::load(path).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "using default configuration");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Port 0 is allowed and binds an ephemeral port
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            bail!("host must not be empty");
        }
        if self.max_frame_len == 0 {
            bail!("max_frame_len must be greater than 0");
        }
        if self.outbound_queue_depth == 0 {
            bail!("outbound_queue_depth must be greater than 0");
        }
        if self.send_timeout_ms == 0 {
            bail!("send_timeout_ms must be greater than 0");
        }
        if self.connect_timeout_secs == 0 {
            bail!("connect_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.received_dir)?;
        std::fs::create_dir_all(&self.downloads_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }

    /// `host:port`, resolved through DNS when `host` is a name
    pub async fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .with_context(|| format!("no address for {}:{}", self.host, self.port))
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.max_frame_len)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            codec: self.codec(),
            queue_depth: self.outbound_queue_depth,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
