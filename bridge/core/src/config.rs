//! Bridge Configuration
//!
//! Layers, lowest to highest precedence:
//!
//! 1. [`BridgeConfig::default`]
//! 2. TOML file ([`default_config_path`] or an explicit path)
//! 3. Environment variables ([`BridgeConfig::apply_env`])
//! 4. Whatever the caller sets afterwards (CLI flags)
//!
//! # Example
//!
//! ```toml
//! strategy = "auto"
//! retry_attempts = 2
//! retry_delay_ms = 250
//! inbox_dir = "/shared/inbox"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::Strategy;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for [`BridgeConfig`]
    #[error("failed to parse config {path}: {message}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// A value is out of range or malformed
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the Bridge picks a strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StrategyMode {
    /// Try every strategy in priority order until one succeeds
    #[default]
    Auto,
    /// Use exactly this strategy, never fall back
    Fixed(Strategy),
}

impl FromStr for StrategyMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        s.parse::<Strategy>()
            .map(Self::Fixed)
            .map_err(|_| ConfigError::Invalid(format!("unknown strategy: {s}")))
    }
}

impl TryFrom<String> for StrategyMode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StrategyMode> for String {
    fn from(mode: StrategyMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Fixed(strategy) => write!(f, "{strategy}"),
        }
    }
}

/// Bridge configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Strategy selection (`auto` or a strategy name)
    pub strategy: StrategyMode,

    /// Attempts per strategy before moving on (minimum 1)
    pub retry_attempts: u32,

    /// Fixed delay between attempts of the same strategy, in milliseconds
    pub retry_delay_ms: u64,

    /// Directory holding one FIFO per recipient
    pub pipe_dir: PathBuf,

    /// Directory holding one inbox subdirectory per recipient
    pub inbox_dir: PathBuf,

    /// Directory holding signal drop files, one subdirectory per recipient
    pub signal_dir: PathBuf,

    /// Terminal device written by terminal injection
    pub tty_path: PathBuf,

    /// Signal raised by the signal transport (e.g. `SIGUSR1`)
    pub signal: String,

    /// Shared-volume listener poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Seconds a pipe write may block waiting for a reader
    pub write_timeout_secs: u64,

    /// File the default exec handler appends envelopes to
    pub exec_log: PathBuf,

    /// Shell snippet run by the exec transport; sees `$BRIDGE_MESSAGE`
    pub exec_handler: Option<String>,

    /// Identity `listen` uses when none is passed
    pub self_identity: Option<String>,

    /// Container runtime binary (`docker` or `podman`)
    pub runtime: String,

    /// Promote per-attempt failure diagnostics from debug to warn
    pub verbose: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyMode::Auto,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            pipe_dir: PathBuf::from("/tmp/sandbox-bridge/pipes"),
            inbox_dir: PathBuf::from("/tmp/sandbox-bridge/inbox"),
            signal_dir: PathBuf::from("/tmp/sandbox-bridge/signals"),
            tty_path: PathBuf::from("/dev/pts/0"),
            signal: "SIGUSR1".to_string(),
            poll_interval_ms: 500,
            write_timeout_secs: 5,
            exec_log: PathBuf::from("/tmp/sandbox-bridge/exec.log"),
            exec_handler: None,
            self_identity: None,
            runtime: "docker".to_string(),
            verbose: false,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load from a TOML file, then apply the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path().filter(|p| p.exists()),
        };

        let mut config = match path {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without consulting the environment
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Override fields from the environment
    ///
    /// Environment variables:
    /// - `BRIDGE_STRATEGY`: "auto" or a strategy name
    /// - `BRIDGE_RETRY_ATTEMPTS`: attempts per strategy
    /// - `BRIDGE_RETRY_DELAY_MS`: delay between attempts
    /// - `BRIDGE_PIPE_DIR`, `BRIDGE_INBOX_DIR`, `BRIDGE_SIGNAL_DIR`: directories
    /// - `BRIDGE_TTY`: terminal device path
    /// - `BRIDGE_POLL_INTERVAL_MS`: shared-volume poll interval
    /// - `BRIDGE_SELF`: default listen identity
    /// - `BRIDGE_RUNTIME`: "docker" or "podman"
    /// - `BRIDGE_VERBOSE`: "1" or "true"
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("BRIDGE_STRATEGY") {
            match value.parse() {
                Ok(mode) => self.strategy = mode,
                Err(e) => tracing::warn!(error = %e, "Ignoring BRIDGE_STRATEGY"),
            }
        }
        if let Some(n) = env_parse("BRIDGE_RETRY_ATTEMPTS") {
            self.retry_attempts = n;
        }
        if let Some(n) = env_parse("BRIDGE_RETRY_DELAY_MS") {
            self.retry_delay_ms = n;
        }
        if let Some(n) = env_parse("BRIDGE_POLL_INTERVAL_MS") {
            self.poll_interval_ms = n;
        }
        if let Ok(dir) = std::env::var("BRIDGE_PIPE_DIR") {
            self.pipe_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("BRIDGE_INBOX_DIR") {
            self.inbox_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("BRIDGE_SIGNAL_DIR") {
            self.signal_dir = PathBuf::from(dir);
        }
        if let Ok(tty) = std::env::var("BRIDGE_TTY") {
            self.tty_path = PathBuf::from(tty);
        }
        if let Ok(identity) = std::env::var("BRIDGE_SELF") {
            self.self_identity = Some(identity);
        }
        if let Ok(runtime) = std::env::var("BRIDGE_RUNTIME") {
            self.runtime = runtime;
        }
        if let Ok(v) = std::env::var("BRIDGE_VERBOSE") {
            self.verbose = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    /// Reject values no transport can work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid("retry_attempts must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        for (name, dir) in [
            ("pipe_dir", &self.pipe_dir),
            ("inbox_dir", &self.inbox_dir),
            ("signal_dir", &self.signal_dir),
            ("tty_path", &self.tty_path),
            ("exec_log", &self.exec_log),
        ] {
            if !dir.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be absolute: {}",
                    dir.display()
                )));
            }
        }
        self.signal_name()?;
        Ok(())
    }

    /// The configured signal, normalised to its `kill -s` name (`USR1`)
    pub fn signal_name(&self) -> Result<String, ConfigError> {
        let upper = self.signal.trim().to_ascii_uppercase();
        let full = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        let signal = nix::sys::signal::Signal::from_str(&full)
            .map_err(|_| ConfigError::Invalid(format!("unknown signal: {}", self.signal)))?;
        Ok(signal.as_str().trim_start_matches("SIG").to_string())
    }

    /// Delay between attempts
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Shared-volume poll interval
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %value, "Ignoring unparseable environment value");
            None
        }
    }
}

/// Default config file location
///
/// `$XDG_CONFIG_HOME/sandbox-bridge/bridge.toml` (or the platform equivalent).
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sandbox-bridge").join("bridge.toml"))
}
