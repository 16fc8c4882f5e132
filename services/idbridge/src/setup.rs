//! Startup wiring: seed static configuration and assemble the engine

use std::sync::Arc;

use connector::{BuiltinFactory, ConnectorRegistry};
use keys::KeyManager;
use oidc::{Server, hash_client_secret};
use storage::{Client, ConnectorConfig, Password, Storage};
use tracing::info;

use crate::config::Config;

/// Write the clients, connectors and passwords named in the config.
pub async fn seed(storage: &dyn Storage, config: &Config) -> storage::Result<()> {
    for client in &config.static_clients {
        storage
            .create_client(Client {
                id: client.id.clone(),
                secret_hash: client
                    .secret
                    .as_ref()
                    .map(|secret| hash_client_secret(secret.expose()))
                    .unwrap_or_default(),
                redirect_uris: client.redirect_uris.clone(),
                trusted_peers: client.trusted_peers.clone(),
                public: client.public,
                name: client.name.clone(),
                grant_types: client.grant_types.clone(),
            })
            .await?;
    }
    for connector in &config.connectors {
        storage
            .create_connector(ConnectorConfig {
                id: connector.id.clone(),
                kind: connector.kind.clone(),
                name: connector.name.clone(),
                config: connector.config.clone(),
                resource_version: String::new(),
            })
            .await?;
    }
    for password in &config.static_passwords {
        storage
            .create_password(Password {
                email: password.email.clone(),
                hash: password.hash.clone(),
                username: password.username.clone(),
                user_id: password.user_id.clone(),
            })
            .await?;
    }
    info!(
        clients = config.static_clients.len(),
        connectors = config.connectors.len(),
        passwords = config.static_passwords.len(),
        "seeded static configuration"
    );
    Ok(())
}

/// Assemble the engine over `storage`.
pub fn build_server(storage: Arc<dyn Storage>, config: &Config) -> Server {
    let factory = Arc::new(BuiltinFactory::new(storage.clone()));
    let connectors = Arc::new(ConnectorRegistry::new(storage.clone(), factory));
    let keys = Arc::new(KeyManager::new(storage.clone(), config.rotation_policy()));
    Server::new(storage, connectors, keys, config.server_config())
}

/// Open every configured connector once so that bad connector config fails
/// startup instead of the first login.
pub async fn open_connectors(server: &Server) -> connector::Result<usize> {
    let configs = server.connectors().list().await?;
    for config in &configs {
        server.connectors().get(&config.id).await?;
    }
    Ok(configs.len())
}
