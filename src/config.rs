use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::SessionConfig;
use crate::transport::{ConnectionConfig, DEFAULT_SCPI_PORT};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub instrument: InstrumentConfig,
    pub session: SessionSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InstrumentConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionSettings {
    pub timeout_ms: u64,
    pub line_delimiter: String,
    pub max_error_polls: usize,
    pub clear_status_on_connect: bool,
    pub warning_codes: Vec<i32>,
    pub max_block_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
    /// JSONL transcript of every dispatched command
    pub transcript_path: Option<PathBuf>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_SCPI_PORT,
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            timeout_ms: defaults.timeout.as_millis() as u64,
            line_delimiter: defaults.line_delimiter,
            max_error_polls: defaults.max_error_polls,
            clear_status_on_connect: defaults.clear_status_on_connect,
            warning_codes: defaults.warning_codes,
            max_block_size: defaults.max_block_size,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            transcript_path: None,
        }
    }
}

impl AppConfig {
    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            timeout: Duration::from_millis(s.timeout_ms),
            line_delimiter: unescape_delimiter(&s.line_delimiter),
            max_error_polls: s.max_error_polls,
            clear_status_on_connect: s.clear_status_on_connect,
            warning_codes: s.warning_codes.clone(),
            max_block_size: s.max_block_size,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(self.instrument.connect_timeout_ms),
            ..ConnectionConfig::default()
        }
    }
}

// Environment variables cannot easily carry control characters
fn unescape_delimiter(raw: &str) -> String {
    raw.replace("\\r", "\r").replace("\\n", "\n")
}

/// Load configuration from file with layered fallbacks:
/// defaults, then the TOML file, then `VNA_LINK__SECTION__KEY` variables
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        for path in ["vna-link.toml", "config.toml"] {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("VNA_LINK")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<AppConfig>()
}

/// Load configuration, falling back to defaults on any error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}
