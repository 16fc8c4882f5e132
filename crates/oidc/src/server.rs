//! The engine: shared handles plus client lookup and authentication

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::{Deadline, Secret};
use connector::{ConnectorRegistry, ResolvedConnector};
use keys::KeyManager;
use sha2::{Digest, Sha256};
use storage::{Client, Storage};

use crate::config::ServerConfig;
use crate::discovery::Discovery;
use crate::error::{Error, Result};

pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";

/// Client identification presented at the token endpoint.
#[derive(Debug)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
}

/// Value stored in `Client::secret_hash` for a given secret.
pub fn hash_client_secret(secret: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(secret.as_bytes()))
}

/// Whether `client` may use `grant_type`. An empty list permits the
/// authorization code and refresh token grants.
pub fn allows_grant(client: &Client, grant_type: &str) -> bool {
    if client.grant_types.is_empty() {
        return grant_type == GRANT_AUTHORIZATION_CODE || grant_type == GRANT_REFRESH_TOKEN;
    }
    client.grant_types.iter().any(|g| g == grant_type)
}

pub struct Server {
    storage: Arc<dyn Storage>,
    connectors: Arc<ConnectorRegistry>,
    keys: Arc<KeyManager>,
    config: ServerConfig,
}

impl Server {
    pub fn new(
        storage: Arc<dyn Storage>,
        connectors: Arc<ConnectorRegistry>,
        keys: Arc<KeyManager>,
        config: ServerConfig,
    ) -> Self {
        Self {
            storage,
            connectors,
            keys,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn connectors(&self) -> &Arc<ConnectorRegistry> {
        &self.connectors
    }

    pub fn discovery(&self) -> Discovery {
        Discovery::new(&self.config)
    }

    /// Look up a client; an unknown id is `InvalidClient`.
    pub(crate) async fn client(&self, client_id: &str, deadline: Deadline) -> Result<Client> {
        match deadline.run(self.storage.get_client(client_id)).await? {
            Ok(client) => Ok(client),
            Err(storage::Error::NotFound(_)) => {
                Err(Error::InvalidClient(format!("unknown client {client_id:?}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Authenticate a client at the token endpoint. Public clients present
    /// only their id; confidential clients must present the matching secret.
    pub(crate) async fn authenticate_client(
        &self,
        credentials: &ClientCredentials,
        deadline: Deadline,
    ) -> Result<Client> {
        let client = self.client(&credentials.client_id, deadline).await?;
        if client.public {
            return Ok(client);
        }
        let Some(secret) = &credentials.client_secret else {
            return Err(Error::InvalidClient("client secret required".into()));
        };
        let presented = Secret::new(hash_client_secret(secret.expose()));
        if !presented.ct_eq(client.secret_hash.as_bytes()) {
            return Err(Error::InvalidClient("invalid client credentials".into()));
        }
        Ok(client)
    }

    /// Resolve a connector referenced by a stored request or token.
    pub(crate) async fn connector(
        &self,
        connector_id: &str,
        deadline: Deadline,
    ) -> Result<ResolvedConnector> {
        Ok(deadline.run(self.connectors.get(connector_id)).await??)
    }
}
