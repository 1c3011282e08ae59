//! Configuration management for the conversion gateway

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::convert::{BackendClass, CommandTemplate, Invocation};

/// Default upload ceiling (50 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Default cap on captured backend stderr
pub const DEFAULT_MAX_DIAGNOSTIC_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("{var} must not be empty")]
    EmptyCommand { var: &'static str },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Root under which every job's work area is created
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub max_upload_bytes: u64,
    pub max_concurrent_conversions: usize,
    pub max_diagnostic_bytes: usize,
}

/// Per-class backend settings, turned into a `BackendDescriptor` at start-up
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub class: BackendClass,
    pub enabled: bool,
    pub invocation: Invocation,
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                work_dir: env::temp_dir().join("doc-convert-work"),
            },
            limits: LimitsConfig {
                max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
                max_concurrent_conversions: default_concurrency(),
                max_diagnostic_bytes: DEFAULT_MAX_DIAGNOSTIC_BYTES,
            },
            backends: BackendClass::ALL
                .iter()
                .map(|class| BackendConfig::default_for(*class))
                .collect(),
        }
    }
}

impl BackendConfig {
    /// Built-in renderer for each class
    pub fn default_for(class: BackendClass) -> Self {
        let (invocation, secs) = match class {
            BackendClass::NativeBinary => (Invocation::Command(soffice_template()), 120),
            BackendClass::XmlFormat => (
                Invocation::Command(
                    CommandTemplate::parse("java -jar /app/hwpx-converter-1.0.0.jar {input} {output}")
                        .with_env("HOME", "{outdir}"),
                ),
                180,
            ),
            BackendClass::GenericOffice => (Invocation::Command(soffice_template()), 120),
        };

        BackendConfig {
            class,
            enabled: true,
            invocation,
            timeout: Duration::from_secs(secs),
        }
    }

    fn from_env(class: BackendClass) -> Result<Self, ConfigError> {
        let defaults = Self::default_for(class);
        let (enabled_var, command_var, timeout_var) = match class {
            BackendClass::NativeBinary => ("HWP_ENABLED", "HWP_COMMAND", "HWP_TIMEOUT_SECS"),
            BackendClass::XmlFormat => ("HWPX_ENABLED", "HWPX_COMMAND", "HWPX_TIMEOUT_SECS"),
            BackendClass::GenericOffice => ("OFFICE_ENABLED", "OFFICE_COMMAND", "OFFICE_TIMEOUT_SECS"),
        };

        let enabled = match env::var(enabled_var) {
            Ok(value) => parse_bool(enabled_var, &value)?,
            Err(_) => defaults.enabled,
        };

        let mut invocation = match env::var(command_var) {
            Ok(value) if value.trim().is_empty() => {
                return Err(ConfigError::EmptyCommand { var: command_var })
            }
            Ok(value) => {
                // Overrides keep the class's default environment (e.g. HOME isolation)
                let mut template = CommandTemplate::parse(&value);
                if let Invocation::Command(default) = &defaults.invocation {
                    template.env = default.env.clone();
                }
                Invocation::Command(template)
            }
            Err(_) => defaults.invocation,
        };

        if class == BackendClass::GenericOffice {
            if let Ok(url) = env::var("OFFICE_GATEWAY_URL") {
                if !url.trim().is_empty() {
                    invocation = Invocation::Gateway {
                        url: url.trim().trim_end_matches('/').to_string(),
                    };
                }
            }
        }

        let timeout = match env::var(timeout_var) {
            Ok(value) => Duration::from_secs(parse_number(timeout_var, &value)?),
            Err(_) => defaults.timeout,
        };

        Ok(BackendConfig {
            class,
            enabled,
            invocation,
            timeout,
        })
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let port = match env::var("SERVER_PORT") {
            Ok(value) => parse_number("SERVER_PORT", &value)?,
            Err(_) => defaults.server.port,
        };

        let max_upload_bytes = match env::var("MAX_UPLOAD_BYTES") {
            Ok(value) => parse_number("MAX_UPLOAD_BYTES", &value)?,
            Err(_) => defaults.limits.max_upload_bytes,
        };

        let max_concurrent_conversions = match env::var("MAX_CONCURRENT_CONVERSIONS") {
            Ok(value) => match parse_number("MAX_CONCURRENT_CONVERSIONS", &value)? {
                0 => {
                    return Err(ConfigError::InvalidValue {
                        var: "MAX_CONCURRENT_CONVERSIONS",
                        value,
                    })
                }
                n => n,
            },
            Err(_) => defaults.limits.max_concurrent_conversions,
        };

        let max_diagnostic_bytes = match env::var("MAX_DIAGNOSTIC_BYTES") {
            Ok(value) => parse_number("MAX_DIAGNOSTIC_BYTES", &value)?,
            Err(_) => defaults.limits.max_diagnostic_bytes,
        };

        let backends = BackendClass::ALL
            .iter()
            .map(|class| BackendConfig::from_env(*class))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port,
                work_dir: env::var("WORK_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.server.work_dir),
            },
            limits: LimitsConfig {
                max_upload_bytes,
                max_concurrent_conversions,
                max_diagnostic_bytes,
            },
            backends,
        })
    }

    /// Replace the settings for one backend class
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backends.retain(|b| b.class != backend.class);
        self.backends.push(backend);
        self
    }
}

/// soffice keeps its user profile under `$HOME`; one profile per work area
/// stops concurrent jobs from handing off to each other's instance
fn soffice_template() -> CommandTemplate {
    CommandTemplate::parse("soffice --headless --convert-to pdf {input} --outdir {outdir}")
        .with_env("HOME", "{outdir}")
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
        }),
    }
}
