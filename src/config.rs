//! Server settings.
//!
//! Built once at startup (defaults, then an optional TOML file, then command
//! line overrides) and shared read-only by the server and every session.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 6543;

/// Socket reads are capped at this many bytes per chunk.
pub const DEFAULT_MAX_CHUNK: usize = 4 * 1024 * 1024;

/// How far the `-1` shutdown header reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentinelScope {
    /// End only the connection that sent it.
    #[default]
    Connection,
    /// Stop accepting new connections on the whole server.
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisplaySettings {
    /// Run the viewer when a client asks for display.
    pub enabled: bool,
    /// XPA client program used to push images to the viewer.
    pub xpaset: String,
    /// XPA access point of the viewer.
    pub target: String,
    /// Staging copy name without extension, resolved against `root`.
    pub staging_stem: String,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        let xpaset = if cfg!(windows) {
            "\\ds9\\xpaset.exe"
        } else {
            "xpaset"
        };
        Self {
            enabled: true,
            xpaset: xpaset.to_string(),
            target: "ds9".to_string(),
            staging_stem: "temp_display_file".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Ring the terminal bell for every received image.
    pub beep: bool,
    /// Speak the line-terminated guide protocol instead of the framed one.
    pub guide_mode: bool,
    pub verbose: bool,
    /// Relative filenames from clients resolve against this directory.
    pub root: PathBuf,
    pub accept_poll_ms: u64,
    pub line_timeout_secs: u64,
    pub max_chunk_bytes: usize,
    pub sentinel_scope: SentinelScope,
    /// Serialize sessions writing the same destination path.
    pub lock_destinations: bool,
    pub display: DisplaySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            beep: false,
            guide_mode: false,
            verbose: false,
            root: PathBuf::from("."),
            accept_poll_ms: 100,
            line_timeout_secs: 10,
            max_chunk_bytes: DEFAULT_MAX_CHUNK,
            sentinel_scope: SentinelScope::Connection,
            lock_destinations: false,
            display: DisplaySettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_chunk_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.accept_poll_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "accept_poll_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.line_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "line_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn line_timeout(&self) -> Duration {
        Duration::from_secs(self.line_timeout_secs)
    }

    /// Where a client-supplied filename lands on disk.
    pub fn resolve(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    pub fn staging_path(&self, extension: &str) -> PathBuf {
        self.root
            .join(&self.display.staging_stem)
            .with_extension(extension)
    }
}
