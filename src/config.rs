// Configuration constants and user settings for cati

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Kitty graphics protocol framing
pub mod protocol {
    /// 1x1 direct RGBA placeholder under image id 31, action "query"
    pub const QUERY: &[u8] = b"\x1b_Gi=31,s=1,v=1,a=q,t=d,f=24;AAAA\x1b\\";
    /// Start of every graphics reply body
    pub const REPLY_MARKER: &[u8] = b"_Gi";
    /// Reply marker with its escape introducer
    pub const STRICT_REPLY_MARKER: &[u8] = b"\x1b_Gi";
    /// Application Program Command introducer for graphics frames
    pub const FRAME_START: &[u8] = b"\x1b_G";
    /// String Terminator
    pub const FRAME_END: &[u8] = b"\x1b\\";
    /// Transmit and display, PNG payload
    pub const DEFAULT_PARAMS: &str = "a=T,f=100";
    pub const CHUNK_SIZE: usize = 4096;
}

/// Probe timing
pub mod timing {
    pub const INITIAL_WAIT_MS: u64 = 500; // slow terminals and multiplexers
    pub const FOLLOWUP_WAIT_MS: u64 = 50; // trailing bytes of a reply already under way
    pub const WOULD_BLOCK_SLEEP_MS: u64 = 10;
}

/// Buffer and loop bounds
pub mod limits {
    pub const REPLY_BUFFER: usize = 256;
    pub const MAX_WOULD_BLOCK_RETRIES: u32 = 50;
    pub const DRAIN_READS: usize = 64;
}

/// Settings loaded from `config.json`, every field optional in the file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub chunk_size: usize,
    pub params: String,
    pub initial_wait_ms: u64,
    pub followup_wait_ms: u64,
    pub would_block_sleep_ms: u64,
    pub max_would_block_retries: u32,
    /// Only accept `ESC _ G i` as a reply, not a bare `_Gi`
    pub require_escape_prefix: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: protocol::CHUNK_SIZE,
            params: protocol::DEFAULT_PARAMS.to_string(),
            initial_wait_ms: timing::INITIAL_WAIT_MS,
            followup_wait_ms: timing::FOLLOWUP_WAIT_MS,
            would_block_sleep_ms: timing::WOULD_BLOCK_SLEEP_MS,
            max_would_block_retries: limits::MAX_WOULD_BLOCK_RETRIES,
            require_escape_prefix: false,
        }
    }
}

impl Settings {
    /// Load from an explicit path, or from the user config dir when present
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let settings = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be at least 1");
        }
        Ok(())
    }

    pub fn initial_wait(&self) -> Duration {
        Duration::from_millis(self.initial_wait_ms)
    }

    pub fn followup_wait(&self) -> Duration {
        Duration::from_millis(self.followup_wait_ms)
    }

    pub fn would_block_sleep(&self) -> Duration {
        Duration::from_millis(self.would_block_sleep_ms)
    }
}

/// `~/.config/cati/config.json` (platform equivalent elsewhere)
pub fn default_path() -> Option<PathBuf> {
    let mut path = dirs::config_dir()?;
    path.push("cati");
    path.push("config.json");
    Some(path)
}
