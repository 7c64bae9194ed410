//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/strand/config.toml or /etc/strand/config.toml.
/// Env overrides: STRAND_LISTEN_PORT, STRAND_MAX_MESSAGE_SIZE, STRAND_HTTP_TIMEOUT_SECS,
/// STRAND_POOL_URL, STRAND_POOL_USER, STRAND_POOL_PASS.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Node listen port (default 45680).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Peers to dial at startup, as `host:port`.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Largest accepted frame payload.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u32,
    /// Timeout for `fetch` requests.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub pool: Option<PoolConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// `stratum+tcp://host:port` or plain `host:port`.
    pub url: String,
    pub user: String,
    #[serde(default = "default_pool_password")]
    pub password: String,
}

fn default_listen_port() -> u16 {
    45680
}
fn default_max_message_size() -> u32 {
    strand_core::DEFAULT_MAX_MESSAGE_SIZE
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_pool_password() -> String {
    "x".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            peers: Vec::new(),
            max_message_size: default_max_message_size(),
            http_timeout_secs: default_http_timeout_secs(),
            pool: None,
        }
    }
}

/// Load config: default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = var("STRAND_LISTEN_PORT").and_then(|s| s.parse().ok()) {
        c.listen_port = p;
    }
    if let Some(n) = var("STRAND_MAX_MESSAGE_SIZE").and_then(|s| s.parse().ok()) {
        c.max_message_size = n;
    }
    if let Some(n) = var("STRAND_HTTP_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
        c.http_timeout_secs = n;
    }
    if let Some(url) = var("STRAND_POOL_URL") {
        let pool = c.pool.get_or_insert_with(|| PoolConfig {
            url: String::new(),
            user: String::new(),
            password: default_pool_password(),
        });
        pool.url = url;
    }
    if let Some(pool) = c.pool.as_mut() {
        if let Some(user) = var("STRAND_POOL_USER") {
            pool.user = user;
        }
        if let Some(pass) = var("STRAND_POOL_PASS") {
            pool.password = pass;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/strand/config.toml"));
    }
    out.push(PathBuf::from("/etc/strand/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "bad config file ignored"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "config file unreadable"),
            }
            break;
        }
    }
    None
}
