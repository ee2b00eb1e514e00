//! Configuration system for Warden.
//!
//! Configuration is loaded from multiple sources with the following precedence:
//! 1. Environment variables (highest priority)
//! 2. `warden.toml` file (or an explicit path)
//! 3. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `WARDEN_MODE` - `offline` (checks bypassed) or `cloud`
//! - `WARDEN_TOKEN_URL` - HTTPS URL of the signed credential
//! - `WARDEN_GRACE_DAYS` - Offline grace window in days
//! - `WARDEN_PUBLIC_KEY` - Verifying key (PEM or base64)
//! - `WARDEN_KEY_ALGORITHM` - `EdDSA`, `ES256` or `RS256`
//! - `WARDEN_FETCH_TIMEOUT_SECS` - Credential fetch timeout
//! - `WARDEN_CLOCK_SKEW_SECS` - Tolerated clock drift
//! - `WARDEN_BIND_EXECUTABLE` - Bind state to the executable's hash
//! - `WARDEN_STATE_DIR` - Directory for local artifacts
//! - `WARDEN_LOGGING_ENABLED` - Enable logging
//! - `WARDEN_LOG_LEVEL` - Log level (trace, debug, info, warn, error)
//! - `WARDEN_LOG_FILE` - Also append plain-text log lines to this file
//!
//! # Example
//!
//! ```toml
//! [license]
//! mode = "cloud"
//! token_url = "https://licenses.example.com/acme/token.jws"
//! grace_days = 7
//! key_algorithm = "EdDSA"
//! public_key = "MCowBQYDK2VwAyEA..."
//! ```

use config::builder::DefaultState;
use config::{Config, ConfigBuilder};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::client::fetcher::DEFAULT_FETCH_TIMEOUT_SECS;
use crate::client::grace::{GracePolicy, DEFAULT_CLOCK_SKEW_SECS, DEFAULT_GRACE_DAYS};
use crate::client::storage::StorageDir;
use crate::errors::{LicenseError, LicenseResult};
use crate::fingerprint::FingerprintSource;
use crate::signature::{SignatureAlgorithm, VerifyingKey};

/// Global configuration singleton.
static CONFIG: OnceLock<WardenConfig> = OnceLock::new();

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub license: LicenseConfig,
    pub fingerprint: FingerprintConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Whether license checks run at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseMode {
    /// Checks bypassed; every decision is VALIDATED.
    #[default]
    Offline,
    /// Fetch and verify the remote credential.
    Cloud,
}

/// Remote credential configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    pub mode: LicenseMode,
    /// HTTPS URL serving the signed credential
    pub token_url: String,
    /// Days of offline use after the last successful validation
    pub grace_days: u32,
    /// Algorithm the verifying key is pinned to
    pub key_algorithm: String,
    /// PEM `PUBLIC KEY` block or base64 of the raw key
    pub public_key: String,
    pub fetch_timeout_secs: u64,
    pub clock_skew_secs: i64,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            mode: LicenseMode::Offline,
            token_url: String::new(),
            grace_days: DEFAULT_GRACE_DAYS,
            key_algorithm: SignatureAlgorithm::EdDsa.tag().to_string(),
            public_key: String::new(),
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            clock_skew_secs: DEFAULT_CLOCK_SKEW_SECS,
        }
    }
}

/// Executable binding configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Bind local state to a hash of the executable
    pub bind_executable: bool,
    /// Hash this file instead of the running executable
    pub path: Option<PathBuf>,
    /// Use this literal fingerprint instead of hashing
    pub fixed: Option<String>,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            bind_executable: true,
            path: None,
            fixed: None,
        }
    }
}

/// Local storage configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for local artifacts (default: platform data dir + `warden`)
    pub dir: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// License log file, appended to alongside stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "info".to_string(),
            file: None,
        }
    }
}

fn config_err(e: config::ConfigError) -> LicenseError {
    LicenseError::ConfigError(e.to_string())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn with_env_overrides(
    builder: ConfigBuilder<DefaultState>,
) -> LicenseResult<ConfigBuilder<DefaultState>> {
    builder
        .set_override_option("license.mode", env::var("WARDEN_MODE").ok())
        .map_err(config_err)?
        .set_override_option("license.token_url", env::var("WARDEN_TOKEN_URL").ok())
        .map_err(config_err)?
        .set_override_option("license.grace_days", env_parsed::<i64>("WARDEN_GRACE_DAYS"))
        .map_err(config_err)?
        .set_override_option("license.public_key", env::var("WARDEN_PUBLIC_KEY").ok())
        .map_err(config_err)?
        .set_override_option("license.key_algorithm", env::var("WARDEN_KEY_ALGORITHM").ok())
        .map_err(config_err)?
        .set_override_option(
            "license.fetch_timeout_secs",
            env_parsed::<i64>("WARDEN_FETCH_TIMEOUT_SECS"),
        )
        .map_err(config_err)?
        .set_override_option(
            "license.clock_skew_secs",
            env_parsed::<i64>("WARDEN_CLOCK_SKEW_SECS"),
        )
        .map_err(config_err)?
        .set_override_option(
            "fingerprint.bind_executable",
            env_parsed::<bool>("WARDEN_BIND_EXECUTABLE"),
        )
        .map_err(config_err)?
        .set_override_option("storage.dir", env::var("WARDEN_STATE_DIR").ok())
        .map_err(config_err)?
        .set_override_option(
            "logging.enabled",
            env_parsed::<bool>("WARDEN_LOGGING_ENABLED"),
        )
        .map_err(config_err)?
        .set_override_option("logging.level", env::var("WARDEN_LOG_LEVEL").ok())
        .map_err(config_err)?
        .set_override_option("logging.file", env::var("WARDEN_LOG_FILE").ok())
        .map_err(config_err)
}

impl WardenConfig {
    /// Load from `warden.toml` in the working directory (optional) and the environment.
    pub fn load() -> LicenseResult<Self> {
        Self::load_from(None)
    }

    /// Load with an explicit config file, which then must exist.
    pub fn load_from(path: Option<&Path>) -> LicenseResult<Self> {
        let defaults = LicenseConfig::default();
        let builder = Config::builder()
            .set_default("license.mode", "offline")
            .map_err(config_err)?
            .set_default("license.grace_days", i64::from(defaults.grace_days))
            .map_err(config_err)?
            .set_default("license.key_algorithm", defaults.key_algorithm)
            .map_err(config_err)?
            .set_default(
                "license.fetch_timeout_secs",
                defaults.fetch_timeout_secs as i64,
            )
            .map_err(config_err)?
            .set_default("license.clock_skew_secs", defaults.clock_skew_secs)
            .map_err(config_err)?
            .set_default("fingerprint.bind_executable", true)
            .map_err(config_err)?
            .set_default("logging.enabled", false)
            .map_err(config_err)?
            .set_default("logging.level", "info")
            .map_err(config_err)?;

        let builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("warden").required(false)),
        };

        let settings = with_env_overrides(builder)?
            .build()
            .map_err(|e| LicenseError::ConfigError(format!("failed to build config: {e}")))?;

        settings
            .try_deserialize()
            .map_err(|e| LicenseError::ConfigError(format!("failed to deserialize config: {e}")))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> LicenseResult<()> {
        if self.license.mode == LicenseMode::Cloud {
            let url = self.license.token_url.trim();
            if !url.to_ascii_lowercase().starts_with("https://") {
                return Err(LicenseError::ConfigError(format!(
                    "license.token_url must be an https:// URL in cloud mode, got '{url}'"
                )));
            }
            self.verifying_key()?;
        }

        if self.license.fetch_timeout_secs == 0 {
            return Err(LicenseError::ConfigError(
                "license.fetch_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.license.clock_skew_secs < 0 {
            return Err(LicenseError::ConfigError(
                "license.clock_skew_secs cannot be negative".to_string(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(LicenseError::ConfigError(format!(
                    "logging.level must be one of: trace, debug, info, warn, error. Got '{other}'"
                )));
            }
        }

        Ok(())
    }

    pub fn verifying_key(&self) -> LicenseResult<VerifyingKey> {
        let algorithm: SignatureAlgorithm = self.license.key_algorithm.parse()?;
        VerifyingKey::parse(algorithm, &self.license.public_key)
    }

    pub fn grace_policy(&self) -> GracePolicy {
        GracePolicy::new(self.license.grace_days, self.license.clock_skew_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.license.fetch_timeout_secs)
    }

    pub fn storage_dir(&self) -> LicenseResult<StorageDir> {
        match &self.storage.dir {
            Some(dir) => Ok(StorageDir::new(dir)),
            None => StorageDir::default_location(),
        }
    }

    /// `fixed` wins over `path`; neither matters when binding is off.
    pub fn fingerprint_source(&self) -> FingerprintSource {
        let fp = &self.fingerprint;
        if !fp.bind_executable {
            return FingerprintSource::Unbound;
        }
        match (&fp.fixed, &fp.path) {
            (Some(fixed), _) => FingerprintSource::Fixed(fixed.clone()),
            (None, Some(path)) => FingerprintSource::File(path.clone()),
            (None, None) => FingerprintSource::Executable,
        }
    }
}

/// Get the global configuration.
///
/// This loads the configuration on first access and caches it.
/// Returns an error if configuration loading or validation fails.
pub fn get_config() -> LicenseResult<&'static WardenConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }

    let config = WardenConfig::load()?;
    config.validate()?;

    // Another thread may have won the race; either value is equivalent.
    let _ = CONFIG.set(config);
    CONFIG
        .get()
        .ok_or_else(|| LicenseError::ConfigError("configuration not initialized".to_string()))
}
