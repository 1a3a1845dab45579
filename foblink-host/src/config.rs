//! Load host config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use foblink_core::channel::ProtocolConfig;
use foblink_core::crypto::CipherMode;
use foblink_core::frame::FlowControl;
use foblink_core::pairing::ThrottlePolicy;
use serde::Deserialize;

/// Host configuration. File: ~/.config/foblink/config.toml or
/// /etc/foblink/config.toml, overridable with FOBLINK_CONFIG.
/// Env overrides: FOBLINK_LISTEN_PORT, FOBLINK_SECRETS_PATH.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port for the device serve loops (default 45700).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Wire cipher discipline (default chacha20-poly1305).
    #[serde(default = "default_cipher_mode")]
    pub cipher_mode: CipherMode,
    /// Path to the provisioned secrets file (default ./secrets.json).
    #[serde(default = "default_secrets_path")]
    pub secrets_path: PathBuf,
    /// Frame read deadline in milliseconds (default 1000).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Response deadline in milliseconds (default 3000).
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Pairing attempt window in seconds (default 60).
    #[serde(default = "default_pairing_timeout_secs")]
    pub pairing_timeout_secs: u64,
    /// Flow-control ack interval in bytes; absent disables it.
    #[serde(default)]
    pub ack_every: Option<usize>,
    /// PIN throttle: delay after the first failure, in milliseconds.
    #[serde(default = "default_throttle_base_ms")]
    pub throttle_base_ms: u64,
    /// PIN throttle: backoff ceiling in milliseconds.
    #[serde(default = "default_throttle_max_ms")]
    pub throttle_max_ms: u64,
    /// PIN throttle: permanent lockout threshold, if set.
    #[serde(default)]
    pub throttle_max_failures: Option<u32>,
}

fn default_listen_port() -> u16 {
    45700
}
fn default_cipher_mode() -> CipherMode {
    CipherMode::ChaCha20Poly1305
}
fn default_secrets_path() -> PathBuf {
    PathBuf::from("secrets.json")
}
fn default_read_timeout_ms() -> u64 {
    1000
}
fn default_response_timeout_ms() -> u64 {
    3000
}
fn default_pairing_timeout_secs() -> u64 {
    60
}
fn default_throttle_base_ms() -> u64 {
    500
}
fn default_throttle_max_ms() -> u64 {
    8000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            cipher_mode: default_cipher_mode(),
            secrets_path: default_secrets_path(),
            read_timeout_ms: default_read_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            pairing_timeout_secs: default_pairing_timeout_secs(),
            ack_every: None,
            throttle_base_ms: default_throttle_base_ms(),
            throttle_max_ms: default_throttle_max_ms(),
            throttle_max_failures: None,
        }
    }
}

impl Config {
    /// Protocol parameters for new channels.
    pub fn protocol(&self) -> ProtocolConfig {
        ProtocolConfig {
            cipher_mode: self.cipher_mode,
            flow: match self.ack_every {
                Some(n) => FlowControl::every(n),
                None => FlowControl::default(),
            },
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            ..ProtocolConfig::default()
        }
    }

    pub fn throttle(&self) -> ThrottlePolicy {
        ThrottlePolicy {
            base_delay: Duration::from_millis(self.throttle_base_ms),
            max_delay: Duration::from_millis(self.throttle_max_ms),
            max_failures: self.throttle_max_failures,
        }
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs)
    }
}

/// Merge defaults, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("FOBLINK_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Ok(s) = std::env::var("FOBLINK_SECRETS_PATH") {
        c.secrets_path = PathBuf::from(s);
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("FOBLINK_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/foblink/config.toml"));
    }
    out.push(PathBuf::from("/etc/foblink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "bad config file"),
                }
            }
            break;
        }
    }
    None
}
