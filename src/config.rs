//! Configuration management for the oauthkit CLI
//!
//! Configuration is loaded from a YAML file, then overridden by `OAUTHKIT_*`
//! environment variables, then by command-line flags, and finally checked
//! by [`Config::validate`].
//!
//! # Examples
//!
//! ```yaml
//! provider:
//!   issuer: https://accounts.example.com
//! client:
//!   client_id: my-native-app
//!   scopes: [openid, profile, offline_access]
//! refresh:
//!   min_validity_seconds: 120
//! logging:
//!   level: debug
//! storage:
//!   account: example
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::discovery::ServiceConfiguration;
use crate::error::{OAuthError, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where the provider's endpoints come from
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Client identity and authorization request defaults
    #[serde(default)]
    pub client: ClientConfig,
    /// Token refresh policy
    #[serde(default)]
    pub refresh: RefreshConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Auth state persistence
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Provider endpoints.
///
/// Either `issuer` is set and the endpoints are discovered, or both
/// `authorization_endpoint` and `token_endpoint` are given explicitly.
/// Explicit endpoints win over discovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Issuer identifier; used for discovery and ID token validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<Url>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<Url>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<Url>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<Url>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<Url>,
}

impl ProviderConfig {
    /// Builds a configuration from the explicit endpoints, if both required
    /// ones are present.
    pub fn manual_configuration(&self) -> Option<ServiceConfiguration> {
        let authorization = self.authorization_endpoint.clone()?;
        let token = self.token_endpoint.clone()?;

        let mut configuration = ServiceConfiguration::new(authorization, token);
        if let Some(issuer) = &self.issuer {
            configuration = configuration.with_issuer(issuer.clone());
        }
        if let Some(endpoint) = &self.registration_endpoint {
            configuration = configuration.with_registration_endpoint(endpoint.clone());
        }
        if let Some(endpoint) = &self.end_session_endpoint {
            configuration = configuration.with_end_session_endpoint(endpoint.clone());
        }
        Some(configuration)
    }
}

/// Client identity and authorization request defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Client identifier; may be omitted when a registered client is stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Client secret for confidential clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Loopback redirect port; `0` picks a free port
    #[serde(default)]
    pub redirect_port: u16,

    /// Loopback redirect path
    #[serde(default = "default_redirect_path")]
    pub redirect_path: String,

    /// Requested scopes
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    /// Extra authorization request parameters, such as `prompt`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_parameters: BTreeMap<String, String>,
}

fn default_redirect_path() -> String {
    "/callback".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_string(), "profile".to_string()]
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_port: 0,
            redirect_path: default_redirect_path(),
            scopes: default_scopes(),
            additional_parameters: BTreeMap::new(),
        }
    }
}

/// Token refresh policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Tokens expiring within this many seconds are refreshed before use
    #[serde(default = "default_min_validity_seconds")]
    pub min_validity_seconds: u64,
}

fn default_min_validity_seconds() -> u64 {
    60
}

/// Largest accepted `refresh.min_validity_seconds` (one year).
pub const MAX_MIN_VALIDITY_SECONDS: u64 = 365 * 24 * 60 * 60;

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            min_validity_seconds: default_min_validity_seconds(),
        }
    }
}

impl RefreshConfig {
    /// The minimum validity as a duration, capped at
    /// [`MAX_MIN_VALIDITY_SECONDS`].
    pub fn min_validity(&self) -> chrono::Duration {
        let seconds = self.min_validity_seconds.min(MAX_MIN_VALIDITY_SECONDS);
        i64::try_from(seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level for `oauthkit` targets; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Auth state persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Keyring service name
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Keyring account the state is stored under
    #[serde(default = "default_account")]
    pub account: String,
}

fn default_service_name() -> String {
    crate::store::DEFAULT_SERVICE_NAME.to_string()
}

fn default_account() -> String {
    "default".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            account: default_account(),
        }
    }
}

/// Default value of the `--config` flag.
pub const DEFAULT_CONFIG_PATH: &str = "config/oauthkit.yaml";

/// Per-user configuration file, used when the default path does not exist.
///
/// Resolves to `config.yaml` under the platform config directory
/// (for example `~/.config/oauthkit/config.yaml` on Linux).
pub fn user_config_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "oauthkit", "oauthkit")
        .map(|dirs| dirs.config_dir().join("config.yaml"))
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// A missing file is not an error; defaults are used instead.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Configuration`] if the file cannot be read or
    /// parsed.
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let user_path = if path == DEFAULT_CONFIG_PATH && !Path::new(path).exists() {
            user_config_path().filter(|p| p.exists())
        } else {
            None
        };

        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else if let Some(user_path) = user_path {
            tracing::debug!("Using user config file {}", user_path.display());
            Self::from_file(&user_path.to_string_lossy())?
        } else {
            tracing::debug!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| OAuthError::Configuration(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&contents)
    }

    /// Parses a YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Configuration`] on malformed YAML or an
    /// invalid URL.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| OAuthError::Configuration(format!("Failed to parse config: {}", e)))
    }

    fn apply_env_vars(&mut self) {
        if let Ok(issuer) = std::env::var("OAUTHKIT_ISSUER") {
            match Url::parse(&issuer) {
                Ok(url) => self.provider.issuer = Some(url),
                Err(_) => tracing::warn!("Invalid OAUTHKIT_ISSUER: {}", issuer),
            }
        }

        if let Ok(client_id) = std::env::var("OAUTHKIT_CLIENT_ID") {
            self.client.client_id = Some(client_id);
        }

        if let Ok(client_secret) = std::env::var("OAUTHKIT_CLIENT_SECRET") {
            self.client.client_secret = Some(client_secret);
        }

        if let Ok(port) = std::env::var("OAUTHKIT_REDIRECT_PORT") {
            if let Ok(value) = port.parse() {
                self.client.redirect_port = value;
            } else {
                tracing::warn!("Invalid OAUTHKIT_REDIRECT_PORT: {}", port);
            }
        }

        if let Ok(scopes) = std::env::var("OAUTHKIT_SCOPES") {
            self.client.scopes = scopes.split_whitespace().map(str::to_string).collect();
        }

        if let Ok(seconds) = std::env::var("OAUTHKIT_MIN_VALIDITY_SECONDS") {
            if let Ok(value) = seconds.parse() {
                self.refresh.min_validity_seconds = value;
            } else {
                tracing::warn!("Invalid OAUTHKIT_MIN_VALIDITY_SECONDS: {}", seconds);
            }
        }

        if let Ok(level) = std::env::var("OAUTHKIT_LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }

        if let Ok(json) = std::env::var("OAUTHKIT_LOG_JSON") {
            match json.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.logging.json = true,
                "0" | "false" | "no" => self.logging.json = false,
                _ => tracing::warn!("Invalid OAUTHKIT_LOG_JSON: {}", json),
            }
        }

        if let Ok(service_name) = std::env::var("OAUTHKIT_KEYRING_SERVICE") {
            self.storage.service_name = service_name;
        }

        if let Ok(account) = std::env::var("OAUTHKIT_ACCOUNT") {
            self.storage.account = account;
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(issuer) = &cli.issuer {
            self.provider.issuer = Some(issuer.clone());
        }
        if let Some(client_id) = &cli.client_id {
            self.client.client_id = Some(client_id.clone());
        }
        if let Some(account) = &cli.account {
            self.storage.account = account.clone();
        }
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
        if cli.json_logs {
            self.logging.json = true;
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Configuration`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let provider = &self.provider;
        if provider.issuer.is_none() && provider.manual_configuration().is_none() {
            return Err(OAuthError::Configuration(
                "provider.issuer or both provider.authorization_endpoint and \
                 provider.token_endpoint must be set"
                    .to_string(),
            ));
        }
        if provider.authorization_endpoint.is_some() != provider.token_endpoint.is_some() {
            return Err(OAuthError::Configuration(
                "provider.authorization_endpoint and provider.token_endpoint must be set together"
                    .to_string(),
            ));
        }

        if matches!(&self.client.client_id, Some(id) if id.trim().is_empty()) {
            return Err(OAuthError::Configuration(
                "client.client_id cannot be empty".to_string(),
            ));
        }

        if self.client.scopes.iter().any(|s| s.trim().is_empty()) {
            return Err(OAuthError::Configuration(
                "client.scopes cannot contain empty entries".to_string(),
            ));
        }

        if !self.client.redirect_path.starts_with('/') {
            return Err(OAuthError::Configuration(format!(
                "client.redirect_path must start with '/': {}",
                self.client.redirect_path
            )));
        }

        if self.refresh.min_validity_seconds > MAX_MIN_VALIDITY_SECONDS {
            return Err(OAuthError::Configuration(format!(
                "refresh.min_validity_seconds must be at most {}: {}",
                MAX_MIN_VALIDITY_SECONDS, self.refresh.min_validity_seconds
            )));
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(OAuthError::Configuration(format!(
                "Invalid logging.level: {}. Must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }

        if self.storage.service_name.is_empty() {
            return Err(OAuthError::Configuration(
                "storage.service_name cannot be empty".to_string(),
            ));
        }

        if self.storage.account.is_empty() {
            return Err(OAuthError::Configuration(
                "storage.account cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
