use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use crate::{DocumentKind, PairingMode};

pub const DEFAULT_PREFETCH_RADIUS: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub engine: EngineConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Overrides the per-kind default pairing mode.
    pub pairing: Option<PairingMode>,
    /// Pages prefetched on each side of the visible spread; 0 disables.
    pub prefetch_radius: u32,
    /// Optional cap on cached pages per document.
    pub cache_limit: Option<usize>,
    /// Treat an HTTP 500 for a comic page as the end of the archive.
    pub server_error_ends_comic: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pairing: None,
            prefetch_radius: DEFAULT_PREFETCH_RADIUS,
            cache_limit: None,
            server_error_ends_comic: true,
        }
    }
}

impl EngineConfig {
    pub fn pairing_for(&self, kind: DocumentKind) -> PairingMode {
        self.pairing.unwrap_or_else(|| kind.default_pairing())
    }

    pub fn server_error_ends(&self, kind: DocumentKind) -> bool {
        kind.server_error_may_end() && self.server_error_ends_comic
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub server: String,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(rename = "timeout_secs")]
    pub timeout: Option<Duration>,
    pub max_page_bytes: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:3000".to_string(),
            timeout: Some(Duration::from_secs(30)),
            max_page_bytes: 64 * 1024 * 1024,
        }
    }
}

impl ViewerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_toml_str(&source).with_context(|| format!("invalid config file {:?}", path))
    }

    /// Loads `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.transport.server.trim().is_empty() {
            bail!("transport.server must not be empty");
        }
        if let Some(limit) = self.engine.cache_limit {
            if limit < 2 {
                bail!("engine.cache_limit must hold at least one spread (2 pages), got {limit}");
            }
        }
        if self.transport.max_page_bytes == 0 {
            bail!("transport.max_page_bytes must be positive");
        }
        Ok(())
    }
}
