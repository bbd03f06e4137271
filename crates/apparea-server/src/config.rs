//! Server configuration: TOML file with defaults for every field.

use crate::forward::router::HttpSurfaceConfig;
use apparea_core::{TunnelError, TunnelResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub http: HttpSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Base domain for virtual hosts and raw listener addresses.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Listen address for the peer transport.
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_authorized_keys")]
    pub authorized_keys: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            listen: default_listen(),
            authorized_keys: default_authorized_keys(),
        }
    }
}

/// `[http]` section: the shared virtual-host surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_http_listen")]
    pub listen: String,
    /// Seconds allowed for reading request headers.
    #[serde(default = "default_timeout")]
    pub read_timeout: u64,
    /// Seconds allowed for producing a response.
    #[serde(default = "default_timeout")]
    pub write_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            read_timeout: default_timeout(),
            write_timeout: default_timeout(),
            max_header_size: default_max_header_size(),
        }
    }
}

fn default_hostname() -> String {
    "apparea.dev".to_string()
}
fn default_listen() -> String {
    "0.0.0.0:2200".to_string()
}
fn default_authorized_keys() -> String {
    "~/.apparea/authorized_keys".to_string()
}
fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_timeout() -> u64 {
    10
}
fn default_max_header_size() -> usize {
    1 << 20
}

/// Resolved server configuration (paths expanded).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub listen: String,
    pub authorized_keys: PathBuf,
    pub http: HttpSurfaceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl ServerConfig {
    /// Load config from a TOML file. A missing file yields the defaults.
    pub fn load(config_path: &Path) -> TunnelResult<Self> {
        let expanded = expand_tilde(config_path);
        if !expanded.exists() {
            info!(path = %expanded.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        info!(path = %expanded.display(), "loading config file");
        let content = std::fs::read_to_string(&expanded)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> TunnelResult<Self> {
        let file = toml::from_str::<ConfigFile>(content)
            .map_err(|e| TunnelError::Config(format!("config parse error: {e}")))?;
        Ok(Self::from_file(file))
    }

    pub fn from_file(file: ConfigFile) -> Self {
        Self {
            hostname: file.server.hostname,
            listen: file.server.listen,
            authorized_keys: expand_tilde_str(&file.server.authorized_keys),
            http: HttpSurfaceConfig {
                listen: file.http.listen,
                read_timeout: Duration::from_secs(file.http.read_timeout),
                write_timeout: Duration::from_secs(file.http.write_timeout),
                max_header_size: file.http.max_header_size,
            },
        }
    }
}

/// `~/.apparea`, or `/tmp/.apparea` when there is no home directory.
pub fn default_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".apparea")
}

/// Write a default `config.toml` and an empty `authorized_keys` into `dir`.
///
/// An existing config is only replaced with `force`; an existing
/// `authorized_keys` is never truncated. Returns the files written.
pub fn write_default(dir: &Path, force: bool) -> TunnelResult<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::new();

    let config_path = dir.join("config.toml");
    if config_path.exists() && !force {
        return Err(TunnelError::Config(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        )));
    }
    let content = toml::to_string_pretty(&ConfigFile::default())
        .map_err(|e| TunnelError::Config(format!("config encode error: {e}")))?;
    std::fs::write(&config_path, content)?;
    written.push(config_path);

    let keys_path = dir.join("authorized_keys");
    if !keys_path.exists() {
        std::fs::write(&keys_path, "")?;
        written.push(keys_path);
    }
    Ok(written)
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

fn expand_tilde_str(s: &str) -> PathBuf {
    match (s.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(s),
    }
}
