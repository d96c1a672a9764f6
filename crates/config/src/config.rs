//! Configuration structures and parsing for certrelay

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// ACME account and order settings
    #[serde(default)]
    pub acme: AcmeConfig,

    /// Challenge provider used to prove domain control
    #[serde(default)]
    pub challenge: Option<ChallengeConfig>,

    /// Where issued certificates are deployed
    #[serde(default)]
    pub deployers: Vec<DeployerConfig>,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), deployers = config.deployers.len(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(challenge) = &self.challenge {
            if self.acme.email.is_empty() {
                return Err(ConfigError::Validation(
                    "A challenge provider is configured but no ACME email is set".to_string(),
                ));
            }
            if self.acme.domains.is_empty() {
                return Err(ConfigError::Validation(
                    "A challenge provider is configured but no ACME domains are listed".to_string(),
                ));
            }
            challenge.validate()?;
        }

        for (index, deployer) in self.deployers.iter().enumerate() {
            deployer
                .validate()
                .map_err(|reason| ConfigError::Validation(format!("deployers[{}]: {}", index, reason)))?;
        }

        Ok(())
    }
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// ACME configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// ACME account email
    #[serde(default)]
    pub email: String,

    /// CA name (`letsencrypt`, `letsencrypt-staging`, `zerossl`, ...) or directory URL
    #[serde(default = "default_acme_ca")]
    pub ca: String,

    /// Names to put on the certificate
    #[serde(default)]
    pub domains: Vec<String>,

    /// Nameservers for DNS propagation checks (empty = system resolver)
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,
}

fn default_acme_ca() -> String {
    "letsencrypt".to_string()
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            ca: default_acme_ca(),
            domains: Vec::new(),
            nameservers: Vec::new(),
        }
    }
}

/// Challenge provider configuration (tagged by `provider`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "kebab-case")]
pub enum ChallengeConfig {
    /// DNS-01 through the Cloudflare API
    Cloudflare(CloudflareChallengeConfig),

    /// HTTP-01 answered by an external HTTP server
    Http01(Http01ChallengeConfig),
}

impl ChallengeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let (timeout, interval) = match self {
            Self::Cloudflare(cf) => {
                if cf.api_token.is_empty() {
                    return Err(ConfigError::Validation("Cloudflare challenge has no api_token".to_string()));
                }
                (cf.propagation_timeout_secs, cf.polling_interval_secs)
            }
            Self::Http01(http) => (http.propagation_timeout_secs, http.polling_interval_secs),
        };

        if interval == 0 {
            return Err(ConfigError::Validation(
                "Challenge polling_interval_secs must be greater than zero".to_string(),
            ));
        }
        if timeout < interval {
            return Err(ConfigError::Validation(
                "Challenge propagation_timeout_secs is shorter than its polling interval".to_string(),
            ));
        }
        Ok(())
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Cloudflare(_) => "cloudflare",
            Self::Http01(_) => "http01",
        }
    }
}

/// Cloudflare DNS-01 settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudflareChallengeConfig {
    /// API token with Zone:Read and DNS:Edit permissions
    pub api_token: String,

    /// TTL of challenge TXT records, in seconds
    #[serde(default = "default_txt_ttl")]
    pub ttl: u32,

    #[serde(default = "default_propagation_timeout")]
    pub propagation_timeout_secs: u64,

    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,

    /// Timeout of each API request
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,
}

impl CloudflareChallengeConfig {
    pub fn propagation_timeout(&self) -> Duration {
        Duration::from_secs(self.propagation_timeout_secs)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }
}

/// HTTP-01 settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Http01ChallengeConfig {
    /// Directory served by the web server; challenge files go below
    /// `.well-known/acme-challenge/`
    #[serde(default)]
    pub webroot: Option<PathBuf>,

    #[serde(default = "default_propagation_timeout")]
    pub propagation_timeout_secs: u64,

    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
}

fn default_txt_ttl() -> u32 {
    60
}

fn default_propagation_timeout() -> u64 {
    300
}

fn default_polling_interval() -> u64 {
    5
}

fn default_api_timeout() -> u64 {
    30
}

/// Deployer configuration (tagged by `provider`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "kebab-case")]
pub enum DeployerConfig {
    /// Gcore CDN resources
    GcoreCdn(GcoreCdnDeployerConfig),

    /// Certificate and key files on the local filesystem
    Local(LocalDeployerConfig),
}

impl DeployerConfig {
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::GcoreCdn(_) => "gcore-cdn",
            Self::Local(_) => "local",
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::GcoreCdn(gcore) => {
                if gcore.api_token.is_empty() {
                    return Err("gcore-cdn deployer has no api_token".to_string());
                }
                if gcore.domain.is_empty() && !gcore.domain_match.eq_ignore_ascii_case("certsan") {
                    return Err(format!(
                        "gcore-cdn deployer with domain_match '{}' needs a domain",
                        gcore.domain_match
                    ));
                }
                Ok(())
            }
            Self::Local(local) => {
                if local.cert_path.as_os_str().is_empty() {
                    return Err("local deployer has no cert_path".to_string());
                }
                if local.format.eq_ignore_ascii_case("pem") && local.key_path.is_none() {
                    return Err("local deployer with pem format needs a key_path".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Gcore CDN deployer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcoreCdnDeployerConfig {
    /// Permanent API token
    pub api_token: String,

    /// How `domain` selects CDN resources: `exact`, `wildcard` or `certsan`
    #[serde(default = "default_domain_match")]
    pub domain_match: String,

    /// Resource CNAME, or `*.suffix` for wildcard matching
    #[serde(default)]
    pub domain: String,

    /// Update this stored certificate in place instead of uploading a new one
    #[serde(default)]
    pub certificate_id: Option<String>,

    /// Succeed without doing anything when no resource matches
    #[serde(default)]
    pub allow_empty: bool,

    /// Prefix of uploaded certificate names
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,
}

fn default_domain_match() -> String {
    "exact".to_string()
}

fn default_name_prefix() -> String {
    "certrelay".to_string()
}

/// Local file deployer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDeployerConfig {
    /// Certificate output path (the PFX archive for `pfx` format)
    pub cert_path: PathBuf,

    /// Private key output path, required for `pem` format
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Output format: `pem` or `pfx`
    #[serde(default = "default_output_format")]
    pub format: String,

    /// Password for `pfx` output
    #[serde(default)]
    pub pfx_password: Option<String>,
}

fn default_output_format() -> String {
    "pem".to_string()
}
