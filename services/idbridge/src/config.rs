//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` env var > default file.
//! Client secrets are read from an env var or a file named in the config,
//! never stored in the TOML directly.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use keys::RotationPolicy;
use oidc::{DEFAULT_RETIRED_RETENTION, RefreshPolicy, ReusePolicy, ServerConfig};
use serde::Deserialize;
use url::Url;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Issuer URL; its path prefixes every route
    pub issuer: String,
    pub web: WebConfig,
    #[serde(default)]
    pub expiry: ExpiryConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub oauth2: OAuth2Config,
    #[serde(default)]
    pub static_clients: Vec<StaticClient>,
    #[serde(default)]
    pub connectors: Vec<StaticConnector>,
    #[serde(default)]
    pub static_passwords: Vec<StaticPassword>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct WebConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Deadline applied to every request's store and connector calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    pub id_tokens_secs: u64,
    pub auth_requests_secs: u64,
    pub auth_codes_secs: u64,
    /// How often the signing key rotates
    pub signing_keys_secs: u64,
    pub rotation_check_secs: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            id_tokens_secs: 24 * 60 * 60,
            auth_requests_secs: 24 * 60 * 60,
            auth_codes_secs: 10 * 60,
            signing_keys_secs: 6 * 60 * 60,
            rotation_check_secs: 60,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub absolute_lifetime_secs: Option<u64>,
    pub valid_if_not_used_for_secs: Option<u64>,
    pub reuse_policy: ReusePolicy,
    /// How long a used token is kept to recognize a replay
    pub reuse_detection_window_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OAuth2Config {
    pub skip_approval: bool,
    pub gc_interval_secs: u64,
}

impl Default for OAuth2Config {
    fn default() -> Self {
        Self {
            skip_approval: false,
            gc_interval_secs: 5 * 60,
        }
    }
}

/// Client registered at startup
#[derive(Debug, Deserialize)]
pub struct StaticClient {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub trusted_peers: Vec<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub grant_types: Vec<String>,
    /// Env var holding the client secret
    #[serde(default)]
    pub secret_env: Option<String>,
    /// File holding the client secret (alternative to `secret_env`)
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub secret: Option<Secret<String>>,
}

/// Connector registered at startup
#[derive(Debug, Deserialize)]
pub struct StaticConnector {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Local password database entry registered at startup
#[derive(Debug, Deserialize)]
pub struct StaticPassword {
    pub email: String,
    /// bcrypt hash of the password
    pub hash: String,
    pub username: String,
    pub user_id: String,
}

fn default_max_connections() -> usize {
    1000
}

fn default_request_timeout() -> u64 {
    30
}

fn config_error(message: impl Into<String>) -> common::Error {
    common::Error::Config(message.into())
}

fn ensure_unique<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> common::Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(config_error(format!("duplicate {kind} {id:?}")));
        }
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file and resolve client secrets.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| common::Error::read(path, e))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.validate()?;
        for client in &mut config.static_clients {
            client.secret = resolve_secret(client)?;
            if !client.public && client.secret.is_none() {
                return Err(config_error(format!(
                    "client {:?} is confidential but has no secret_env or secret_file",
                    client.id
                )));
            }
        }
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let issuer = Url::parse(&self.issuer)
            .map_err(|e| config_error(format!("issuer {:?} is not a URL: {e}", self.issuer)))?;
        if !matches!(issuer.scheme(), "http" | "https") {
            return Err(config_error(format!(
                "issuer must use http or https, got: {}",
                self.issuer
            )));
        }
        if issuer.query().is_some() || issuer.fragment().is_some() {
            return Err(config_error("issuer must not carry a query or fragment"));
        }

        if self.web.max_connections == 0 {
            return Err(config_error("max_connections must be greater than 0"));
        }
        let durations = [
            ("web.request_timeout_secs", self.web.request_timeout_secs),
            ("expiry.id_tokens_secs", self.expiry.id_tokens_secs),
            ("expiry.auth_requests_secs", self.expiry.auth_requests_secs),
            ("expiry.auth_codes_secs", self.expiry.auth_codes_secs),
            ("expiry.signing_keys_secs", self.expiry.signing_keys_secs),
            ("expiry.rotation_check_secs", self.expiry.rotation_check_secs),
            ("oauth2.gc_interval_secs", self.oauth2.gc_interval_secs),
        ];
        for (name, secs) in durations {
            if secs == 0 {
                return Err(config_error(format!("{name} must be greater than 0")));
            }
        }
        if self.refresh.absolute_lifetime_secs == Some(0)
            || self.refresh.valid_if_not_used_for_secs == Some(0)
            || self.refresh.reuse_detection_window_secs == Some(0)
        {
            return Err(config_error("refresh lifetimes must be greater than 0"));
        }

        ensure_unique("client", self.static_clients.iter().map(|c| c.id.as_str()))?;
        ensure_unique("connector", self.connectors.iter().map(|c| c.id.as_str()))?;
        ensure_unique(
            "password email",
            self.static_passwords.iter().map(|p| p.email.as_str()),
        )?;
        for password in &self.static_passwords {
            if !password.hash.starts_with("$2") {
                return Err(config_error(format!(
                    "password hash for {:?} is not a bcrypt hash",
                    password.email
                )));
            }
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("idbridge.toml")
    }

    /// Path component of the issuer, without a trailing slash. Empty when
    /// the issuer is served from the root.
    pub fn issuer_path(&self) -> String {
        Url::parse(&self.issuer)
            .map(|url| url.path().trim_end_matches('/').to_string())
            .unwrap_or_default()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.web.request_timeout_secs)
    }

    pub fn server_config(&self) -> ServerConfig {
        let mut server = ServerConfig::new(&self.issuer);
        server.id_tokens_valid_for = Duration::from_secs(self.expiry.id_tokens_secs);
        server.auth_requests_valid_for = Duration::from_secs(self.expiry.auth_requests_secs);
        server.auth_codes_valid_for = Duration::from_secs(self.expiry.auth_codes_secs);
        server.skip_approval = self.oauth2.skip_approval;
        server.refresh = RefreshPolicy {
            reuse: self.refresh.reuse_policy,
            absolute_lifetime: self.refresh.absolute_lifetime_secs.map(Duration::from_secs),
            valid_if_not_used_for: self
                .refresh
                .valid_if_not_used_for_secs
                .map(Duration::from_secs),
            retired_retention: self
                .refresh
                .reuse_detection_window_secs
                .map_or(DEFAULT_RETIRED_RETENTION, Duration::from_secs),
        };
        server
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            rotation_frequency: Duration::from_secs(self.expiry.signing_keys_secs),
            id_token_valid_for: Duration::from_secs(self.expiry.id_tokens_secs),
        }
    }
}

/// Secret resolution order: `secret_env`, then `secret_file`.
fn resolve_secret(client: &StaticClient) -> common::Result<Option<Secret<String>>> {
    if let Some(var) = &client.secret_env {
        let secret = std::env::var(var).map_err(|_| {
            config_error(format!(
                "secret_env {var:?} for client {:?} is not set",
                client.id
            ))
        })?;
        return Ok(Some(Secret::new(secret)));
    }
    if let Some(path) = &client.secret_file {
        let secret =
            std::fs::read_to_string(path).map_err(|e| common::Error::read(path, e))?;
        let secret = secret.trim().to_owned();
        if secret.is_empty() {
            return Err(config_error(format!(
                "secret_file {} is empty",
                path.display()
            )));
        }
        return Ok(Some(Secret::new(secret)));
    }
    Ok(None)
}
