//! Daemon configuration: a TOML file with a single `[server]` section.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use sphinx_core::consts;

#[derive(Debug, Deserialize)]
struct ConfigFile {
    server: Config,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-I/O deadline in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Maximum concurrent connection workers.
    #[serde(default = "default_max_kids")]
    pub max_kids: usize,
    #[serde(default = "default_datadir")]
    pub datadir: PathBuf,
    /// 32-byte Noise static private key, raw.
    pub noisekey: PathBuf,
    /// Authorized peer static keys: one `<base64 pub> <name>` per line.
    pub authorized_keys: PathBuf,
    pub ssl_key: PathBuf,
    pub ssl_cert: PathBuf,
    /// Seconds of silence per rate-limit level of decay.
    #[serde(default = "default_rl_decay")]
    pub rl_decay: u64,
    /// Challenges per level before escalating.
    #[serde(default = "default_rl_threshold")]
    pub rl_threshold: u32,
    /// Slack added to each rung's solution timeout.
    #[serde(default = "default_rl_gracetime")]
    pub rl_gracetime: u64,
    #[serde(default)]
    pub verbose: bool,
}

fn default_address() -> IpAddr {
    consts::DEFAULT_ADDRESS.parse().expect("default address is valid")
}
fn default_port() -> u16 {
    consts::DEFAULT_PORT
}
fn default_timeout() -> u64 {
    consts::DEFAULT_TIMEOUT_SECS
}
fn default_max_kids() -> usize {
    consts::DEFAULT_MAX_KIDS
}
fn default_datadir() -> PathBuf {
    PathBuf::from(consts::DEFAULT_DATADIR)
}
fn default_rl_decay() -> u64 {
    consts::DEFAULT_RL_DECAY_SECS
}
fn default_rl_threshold() -> u32 {
    consts::DEFAULT_RL_THRESHOLD
}
fn default_rl_gracetime() -> u64 {
    consts::DEFAULT_RL_GRACETIME_SECS
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&text).context("parsing config TOML")?;
        let mut config = file.server;
        config.datadir = expand_tilde(&config.datadir);
        config.noisekey = expand_tilde(&config.noisekey);
        config.authorized_keys = expand_tilde(&config.authorized_keys);
        config.ssl_key = expand_tilde(&config.ssl_key);
        config.ssl_cert = expand_tilde(&config.ssl_cert);
        Ok(config)
    }

    /// Echo the effective settings, the way operators expect to see them
    /// when `verbose` is on.
    pub fn log_settings(&self) {
        info!("address:      {}:{}", self.address, self.port);
        info!("timeout:      {}s", self.timeout);
        info!("max kids:     {}", self.max_kids);
        info!("datadir:      {}", self.datadir.display());
        info!("noisekey:     {}", self.noisekey.display());
        info!("ssl_key:      {}", self.ssl_key.display());
        info!("ssl_cert:     {}", self.ssl_cert.display());
        info!("rl decay:     {}", self.rl_decay);
        info!("rl threshold: {}", self.rl_threshold);
        info!("rl gracetime: {}", self.rl_gracetime);
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
