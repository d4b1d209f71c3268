use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{StepCatalog, StepTemplate};
use crate::domain::step::Assignee;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub catalog: CatalogConfig,
    pub notifier: NotifierConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// The injected static step catalog. Loaded once at startup; the resulting
/// `StepCatalog` is immutable for the life of the process.
#[derive(Clone, Debug)]
pub struct CatalogConfig {
    pub version: u32,
    pub chains: HashMap<String, Vec<StepTemplateConfig>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepTemplateConfig {
    pub sequence: u32,
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

#[derive(Clone, Debug)]
pub struct NotifierConfig {
    pub email_enabled: bool,
    pub from_address: String,
    pub smtp_password: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub email_enabled: Option<bool>,
    pub from_address: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://flowgate.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            catalog: CatalogConfig { version: 1, chains: HashMap::new() },
            notifier: NotifierConfig {
                email_enabled: false,
                from_address: "approvals@flowgate.local".to_string(),
                smtp_password: None,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl AppConfig {
    /// Precedence: defaults < config file < environment < programmatic
    /// overrides. Validation is fail-fast with actionable messages.
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("flowgate.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Materialize the immutable step catalog. Chains configured in the file
    /// replace the built-in defaults for their request type; absent types keep
    /// the defaults.
    pub fn step_catalog(&self) -> StepCatalog {
        if self.catalog.chains.is_empty() {
            return StepCatalog::default();
        }

        let chains = self
            .catalog
            .chains
            .iter()
            .map(|(request_type, entries)| {
                let templates = entries
                    .iter()
                    .map(|entry| StepTemplate {
                        sequence: entry.sequence,
                        name: entry.name.clone(),
                        assignee: Assignee {
                            role: entry.role.clone(),
                            user: entry.user.clone(),
                        },
                        is_required: entry.required,
                    })
                    .collect();
                (request_type.clone(), templates)
            })
            .collect();
        StepCatalog::new(self.catalog.version, chains)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(catalog) = patch.catalog {
            if let Some(version) = catalog.version {
                self.catalog.version = version;
            }
            if let Some(chains) = catalog.chains {
                self.catalog.chains = chains;
            }
        }

        if let Some(notifier) = patch.notifier {
            if let Some(email_enabled) = notifier.email_enabled {
                self.notifier.email_enabled = email_enabled;
            }
            if let Some(from_address) = notifier.from_address {
                self.notifier.from_address = from_address;
            }
            if let Some(smtp_password_value) = notifier.smtp_password {
                self.notifier.smtp_password = Some(smtp_password_value.into());
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("FLOWGATE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("FLOWGATE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("FLOWGATE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("FLOWGATE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("FLOWGATE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FLOWGATE_NOTIFIER_EMAIL_ENABLED") {
            self.notifier.email_enabled = parse_bool("FLOWGATE_NOTIFIER_EMAIL_ENABLED", &value)?;
        }
        if let Some(value) = read_env("FLOWGATE_NOTIFIER_FROM_ADDRESS") {
            self.notifier.from_address = value;
        }
        if let Some(value) = read_env("FLOWGATE_NOTIFIER_SMTP_PASSWORD") {
            self.notifier.smtp_password = Some(value.into());
        }

        let log_level =
            read_env("FLOWGATE_LOGGING_LEVEL").or_else(|| read_env("FLOWGATE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("FLOWGATE_LOGGING_FORMAT").or_else(|| read_env("FLOWGATE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(email_enabled) = overrides.email_enabled {
            self.notifier.email_enabled = email_enabled;
        }
        if let Some(from_address) = overrides.from_address {
            self.notifier.from_address = from_address;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_catalog(&self.catalog)?;
        validate_notifier(&self.notifier)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("flowgate.toml"), PathBuf::from("config/flowgate.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_catalog(catalog: &CatalogConfig) -> Result<(), ConfigError> {
    for (request_type, chain) in &catalog.chains {
        if chain.is_empty() {
            return Err(ConfigError::Validation(format!(
                "catalog.chains.{request_type} must contain at least one step"
            )));
        }
        for entry in chain {
            if entry.role.is_none() && entry.user.is_none() {
                return Err(ConfigError::Validation(format!(
                    "catalog.chains.{request_type} step `{}` needs a role or a user",
                    entry.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_notifier(notifier: &NotifierConfig) -> Result<(), ConfigError> {
    if notifier.email_enabled {
        let from = notifier.from_address.trim();
        if from.is_empty() || !from.contains('@') {
            return Err(ConfigError::Validation(
                "notifier.from_address must be a valid sender address when email is enabled"
                    .to_string(),
            ));
        }
        let missing = notifier
            .smtp_password
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing {
            return Err(ConfigError::Validation(
                "notifier.smtp_password is required when email is enabled".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    catalog: Option<CatalogPatch>,
    notifier: Option<NotifierPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogPatch {
    version: Option<u32>,
    chains: Option<HashMap<String, Vec<StepTemplateConfig>>>,
}

#[derive(Debug, Default, Deserialize)]
struct NotifierPatch {
    email_enabled: Option<bool>,
    from_address: Option<String>,
    smtp_password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
