use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use toml::Value;

use crate::activation::LongPollingPolicy;

pub const CONFIG_ENV_VAR: &str = "JOBGATE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_ARG: &str = "--config";
const BUILTIN_CONFIG: &str = include_str!("../../config.toml");

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub activation: ActivationConfig,
    pub multi_tenancy: MultiTenancyConfig,
    pub broker: BrokerConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct ActivationConfig {
    pub long_polling_enabled: bool,
    pub default_request_timeout_ms: u64,
    pub response_grace_ms: u64,
    pub max_response_size_bytes: usize,
}

impl ActivationConfig {
    pub fn long_polling(&self) -> LongPollingPolicy {
        LongPollingPolicy {
            enabled: self.long_polling_enabled,
            default_timeout: Duration::from_millis(self.default_request_timeout_ms),
        }
    }

    pub fn response_grace(&self) -> Duration {
        Duration::from_millis(self.response_grace_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct MultiTenancyConfig {
    pub checks_enabled: bool,
    pub authorized_tenants: Vec<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct BrokerConfig {
    pub partitions: u32,
}

impl AppConfig {
    /// Resolves the config file (`--config`, then `JOBGATE_CONFIG`, then
    /// `./config.toml`, then built-in defaults) and applies the remaining
    /// `--section.key value` arguments on top of it.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let (explicit_path, rest) = split_config_arg(args)?;
        match discover_path(explicit_path, std::env::var(CONFIG_ENV_VAR).ok()) {
            Some(path) => Self::load_from_toml_with_args(path, rest),
            None => Self::load_from_str_with_args(BUILTIN_CONFIG, "<built-in>", rest),
        }
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let display_path = path.as_ref().to_string_lossy().to_string();
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: display_path.clone(),
            source,
        })?;
        Self::load_from_str_with_args(&toml_content, &display_path, args)
    }

    fn load_from_str_with_args(
        toml_content: &str,
        origin: &str,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: origin.to_owned(),
                    source,
                })?;

        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.partitions == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "broker.partitions",
                reason: "at least one partition is required".to_owned(),
            });
        }
        if self.activation.max_response_size_bytes == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "activation.max_response_size_bytes",
                reason: "must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse TOML config '{path}': {source}")]
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    #[error("failed to deserialize config: {0}")]
    Deserialize(toml::de::Error),
    #[error("missing value for CLI override '--{key}'")]
    MissingValueForArg { key: String },
    #[error("invalid CLI argument format '{arg}', expected '--section.key value'")]
    InvalidArgFormat { arg: String },
    #[error("invalid override key path '{key}'")]
    InvalidPath { key: String },
    #[error("unknown override key path '{key}'")]
    UnknownPath { key: String },
    #[error("override not supported for complex TOML type at '{key}'")]
    UnsupportedOverrideType { key: String },
    #[error("invalid value '{value}' for '{key}', expected type {expected}")]
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    #[error("invalid setting '{key}': {reason}")]
    InvalidSetting { key: &'static str, reason: String },
}

fn split_config_arg(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut explicit = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == CONFIG_ARG {
            let path = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            explicit = Some(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }

    Ok((explicit, rest))
}

fn discover_path(explicit: Option<PathBuf>, from_env: Option<String>) -> Option<PathBuf> {
    explicit
        .or_else(|| from_env.filter(|value| !value.is_empty()).map(PathBuf::from))
        .or_else(|| {
            let local = PathBuf::from(DEFAULT_CONFIG_PATH);
            local.is_file().then_some(local)
        })
}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }
    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let (final_key, sections) = parts.split_last().ok_or_else(unknown)?;
    let mut current = root;
    for section in sections {
        current = current
            .as_table_mut()
            .and_then(|table| table.get_mut(*section))
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .and_then(|table| table.get_mut(*final_key))
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::{discover_path, split_config_arg, AppConfig, ConfigError, BUILTIN_CONFIG};

    const SAMPLE: &str = r#"
[logging]
level = "debug"
human_friendly = false

[server]
host = "127.0.0.1"
port = 9000

[activation]
long_polling_enabled = true
default_request_timeout_ms = 2000
response_grace_ms = 500
max_response_size_bytes = 1024

[multi_tenancy]
checks_enabled = true
authorized_tenants = ["acme"]

[broker]
partitions = 2
"#;

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "jobgate-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    #[test]
    fn loads_config_from_toml_without_overrides() {
        let path = write_temp_config(SAMPLE, "default");

        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.server.bind_address(), "127.0.0.1:9000");
        assert_eq!(config.multi_tenancy.authorized_tenants, vec!["acme".to_owned()]);
        assert_eq!(config.broker.partitions, 2);
        let policy = config.activation.long_polling();
        assert!(policy.enabled);
        assert_eq!(policy.default_timeout, Duration::from_secs(2));
        assert_eq!(config.activation.response_grace(), Duration::from_millis(500));
    }

    #[test]
    fn argv_overrides_matching_toml_paths() {
        let path = write_temp_config(SAMPLE, "override");

        let config = AppConfig::load_from_toml_with_args(
            &path,
            args(&[
                "--logging.level",
                "verbose",
                "--server.port",
                "9100",
                "--activation.long_polling_enabled",
                "false",
            ]),
        )
        .expect("config with overrides should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "verbose");
        assert_eq!(config.server.port, 9100);
        assert!(!config.activation.long_polling_enabled);
    }

    #[test]
    fn rejects_unknown_path_and_mistyped_value() {
        let path = write_temp_config(SAMPLE, "bad-override");

        let unknown = AppConfig::load_from_toml_with_args(
            &path,
            args(&["--logging.nonexistent", "x"]),
        )
        .expect_err("unknown override key should fail");
        let mistyped =
            AppConfig::load_from_toml_with_args(&path, args(&["--broker.partitions", "many"]))
                .expect_err("non-integer partitions should fail");
        let complex = AppConfig::load_from_toml_with_args(
            &path,
            args(&["--multi_tenancy.authorized_tenants", "acme"]),
        )
        .expect_err("array override should fail");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert!(matches!(unknown, ConfigError::UnknownPath { .. }));
        assert!(matches!(
            mistyped,
            ConfigError::InvalidValueForType {
                expected: "integer",
                ..
            }
        ));
        assert!(matches!(complex, ConfigError::UnsupportedOverrideType { .. }));
    }

    #[test]
    fn semantic_validation_rejects_out_of_range_settings() {
        let path = write_temp_config(SAMPLE, "invalid");

        let zero_partitions =
            AppConfig::load_from_toml_with_args(&path, args(&["--broker.partitions", "0"]))
                .expect_err("zero partitions should fail");
        let empty_responses = AppConfig::load_from_toml_with_args(
            &path,
            args(&["--activation.max_response_size_bytes", "0"]),
        )
        .expect_err("zero response size should fail");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert!(matches!(
            zero_partitions,
            ConfigError::InvalidSetting {
                key: "broker.partitions",
                ..
            }
        ));
        assert!(matches!(
            empty_responses,
            ConfigError::InvalidSetting {
                key: "activation.max_response_size_bytes",
                ..
            }
        ));
    }

    #[test]
    fn config_argument_is_separated_from_overrides() {
        let (path, rest) = split_config_arg(args(&[
            "--server.port",
            "1",
            "--config",
            "/etc/jobgate.toml",
        ]))
        .expect("arguments should split");

        assert_eq!(path, Some(PathBuf::from("/etc/jobgate.toml")));
        assert_eq!(rest, args(&["--server.port", "1"]));

        assert!(matches!(
            split_config_arg(args(&["--config"])),
            Err(ConfigError::MissingValueForArg { .. })
        ));
    }

    #[test]
    fn explicit_path_wins_over_environment() {
        assert_eq!(
            discover_path(Some(PathBuf::from("a.toml")), Some("b.toml".to_owned())),
            Some(PathBuf::from("a.toml"))
        );
        assert_eq!(
            discover_path(None, Some("b.toml".to_owned())),
            Some(PathBuf::from("b.toml"))
        );
    }

    #[test]
    fn discovery_reads_explicit_config_file() {
        let path = write_temp_config(SAMPLE, "discovery");
        let path_arg = path.to_string_lossy().to_string();

        let config = AppConfig::load_with_discovery(args(&[
            "--config",
            path_arg.as_str(),
            "--logging.level",
            "warn",
        ]))
        .expect("discovered config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn built_in_defaults_are_valid() {
        let config = AppConfig::load_from_str_with_args(BUILTIN_CONFIG, "<built-in>", Vec::new())
            .expect("built-in config should load");
        assert!(config.broker.partitions >= 1);
        assert!(config.activation.max_response_size_bytes > 0);
    }
}
