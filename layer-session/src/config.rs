//! Process configuration, read from the environment (and `.env` if present).

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// ─── DeviceConfig ─────────────────────────────────────────────────────────────

/// How this client introduces itself to Telegram. Also recorded in every
/// backup's metadata document.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub system_version:   String,
    pub app_version:      String,
    pub device_model:     String,
    pub system_lang_code: String,
    pub lang_code:        String,
    pub lang_pack:        String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            system_version:   "Windows 10".into(),
            app_version:      "5.2.3 x64".into(),
            device_model:     "Desktop".into(),
            system_lang_code: "en-US".into(),
            lang_code:        "en".into(),
            lang_pack:        "tdesktop".into(),
        }
    }
}

// ─── ConfigError ──────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    Missing(&'static str),
    /// A variable is set but cannot be parsed.
    Invalid { var: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(v)             => write!(f, "environment variable {v} not set"),
            Self::Invalid { var, reason } => write!(f, "environment variable {var} is invalid: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct Config {
    pub api_id:         i32,
    pub api_hash:       String,
    pub session_dir:    PathBuf,
    pub listen_addr:    SocketAddr,
    /// Lifetime of a login flow that is waiting for its code.
    pub login_timeout:  Duration,
    /// Upper bound on how long a `/verify` request waits for the outcome.
    pub verify_timeout: Duration,
    /// Fixed login code for the loopback transport.
    pub login_code:     Option<String>,
    pub device:         DeviceConfig,
}

impl Config {
    pub const DEFAULT_LISTEN_ADDR:    &'static str = "0.0.0.0:8080";
    pub const DEFAULT_LOGIN_TIMEOUT:  Duration     = Duration::from_secs(300);
    pub const DEFAULT_VERIFY_TIMEOUT: Duration     = Duration::from_secs(60);

    /// Config with the given credentials and defaults for everything else.
    pub fn new(api_id: i32, api_hash: impl Into<String>, session_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_id,
            api_hash:       api_hash.into(),
            session_dir:    session_dir.into(),
            listen_addr:    SocketAddr::from(([0, 0, 0, 0], 8080)),
            login_timeout:  Self::DEFAULT_LOGIN_TIMEOUT,
            verify_timeout: Self::DEFAULT_VERIFY_TIMEOUT,
            login_code:     None,
            device:         DeviceConfig::default(),
        }
    }

    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("[config] Loaded {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!("[config] Ignoring unreadable .env: {e}"),
        }
        Self::from_lookup(|k| env::var(k).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| {
            get(var).filter(|v| !v.trim().is_empty()).ok_or(ConfigError::Missing(var))
        };
        let parsed = |var: &'static str, raw: String| {
            raw.trim().parse::<u64>().map_err(|e| ConfigError::Invalid { var, reason: e.to_string() })
        };

        let api_id = required("APP_ID")?
            .trim()
            .parse::<i32>()
            .map_err(|e| ConfigError::Invalid { var: "APP_ID", reason: e.to_string() })?;
        let mut cfg = Self::new(api_id, required("APP_HASH")?, required("SESSION_DIR")?);

        if let Some(raw) = get("LISTEN_ADDR") {
            cfg.listen_addr = raw.trim().parse().map_err(|e: std::net::AddrParseError| {
                ConfigError::Invalid { var: "LISTEN_ADDR", reason: e.to_string() }
            })?;
        }
        if let Some(raw) = get("LOGIN_TIMEOUT_SECS") {
            cfg.login_timeout = Duration::from_secs(parsed("LOGIN_TIMEOUT_SECS", raw)?);
        }
        if let Some(raw) = get("VERIFY_TIMEOUT_SECS") {
            cfg.verify_timeout = Duration::from_secs(parsed("VERIFY_TIMEOUT_SECS", raw)?);
        }
        cfg.login_code = get("LOGIN_CODE").filter(|c| !c.trim().is_empty());
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn required_variables() {
        let err = Config::from_lookup(lookup(&[("APP_HASH", "h"), ("SESSION_DIR", "/tmp/s")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("APP_ID"));

        let err = Config::from_lookup(lookup(&[("APP_ID", "1"), ("APP_HASH", ""), ("SESSION_DIR", "s")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("APP_HASH"));
    }

    #[test]
    fn app_id_must_be_an_integer() {
        let err = Config::from_lookup(lookup(&[
            ("APP_ID", "abc"), ("APP_HASH", "h"), ("SESSION_DIR", "s"),
        ])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "APP_ID", .. }));
    }

    #[test]
    fn defaults_and_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("APP_ID", "12345"), ("APP_HASH", "abcdef"), ("SESSION_DIR", "sessions"),
        ])).unwrap();
        assert_eq!(cfg.api_id, 12345);
        assert_eq!(cfg.listen_addr.to_string(), Config::DEFAULT_LISTEN_ADDR);
        assert_eq!(cfg.login_timeout, Config::DEFAULT_LOGIN_TIMEOUT);
        assert_eq!(cfg.device.lang_pack, "tdesktop");

        let cfg = Config::from_lookup(lookup(&[
            ("APP_ID", "1"), ("APP_HASH", "h"), ("SESSION_DIR", "s"),
            ("LISTEN_ADDR", "127.0.0.1:9000"), ("LOGIN_TIMEOUT_SECS", "30"), ("LOGIN_CODE", "54321"),
        ])).unwrap();
        assert_eq!(cfg.listen_addr.port(), 9000);
        assert_eq!(cfg.login_timeout, Duration::from_secs(30));
        assert_eq!(cfg.login_code.as_deref(), Some("54321"));
    }
}
