//! Local password database connector
//!
//! Verifies users against `Password` entries in the store. bcrypt runs on the
//! blocking pool so that a slow hash never stalls the async workers.

use std::sync::Arc;

use futures::future::BoxFuture;
use storage::{ConnectorData, Identity, Password, Storage};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::{Authenticated, Connector, PasswordConnector, RefreshConnector, Scopes};

pub struct LocalConnector {
    storage: Arc<dyn Storage>,
}

impl LocalConnector {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

fn identity_for(password: &Password) -> Identity {
    Identity {
        user_id: password.user_id.clone(),
        username: password.username.clone(),
        preferred_username: password.username.clone(),
        email: password.email.clone(),
        email_verified: true,
        groups: vec![],
        extra: Default::default(),
    }
}

async fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let password = password.to_owned();
    let hash = hash.to_owned();
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| Error::Upstream(format!("password verification task failed: {e}")))?
        .map_err(|e| Error::Upstream(format!("malformed password hash: {e}")))
}

impl Connector for LocalConnector {
    fn kind(&self) -> &str {
        "local"
    }

    fn as_password(&self) -> Option<&dyn PasswordConnector> {
        Some(self)
    }

    fn as_refresh(&self) -> Option<&dyn RefreshConnector> {
        Some(self)
    }
}

impl PasswordConnector for LocalConnector {
    fn prompt(&self) -> &str {
        "Email Address"
    }

    fn login<'a>(
        &'a self,
        _scopes: &'a Scopes,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<Authenticated>> {
        Box::pin(async move {
            let entry = match self.storage.get_password(username).await {
                Ok(entry) => entry,
                Err(storage::Error::NotFound(_)) => {
                    debug!("login for unknown email");
                    return Err(Error::InvalidCredentials);
                }
                Err(e) => return Err(e.into()),
            };

            if !verify_password(password, &entry.hash).await? {
                return Err(Error::InvalidCredentials);
            }

            Ok(Authenticated {
                identity: identity_for(&entry),
                data: ConnectorData::default(),
            })
        })
    }
}

impl RefreshConnector for LocalConnector {
    /// Re-reads the password entry so that renames are picked up and deleted
    /// users can no longer refresh.
    fn refresh<'a>(
        &'a self,
        _scopes: &'a Scopes,
        identity: &'a Identity,
        data: &'a ConnectorData,
    ) -> BoxFuture<'a, Result<Authenticated>> {
        Box::pin(async move {
            let entry = match self.storage.get_password(&identity.email).await {
                Ok(entry) => entry,
                Err(storage::Error::NotFound(_)) => {
                    warn!(user_id = %identity.user_id, "refresh for deleted local user");
                    return Err(Error::Upstream("user no longer exists".into()));
                }
                Err(e) => return Err(e.into()),
            };

            let mut refreshed = identity.clone();
            refreshed.username = entry.username.clone();
            refreshed.preferred_username = entry.username;
            Ok(Authenticated {
                identity: refreshed,
                data: data.clone(),
            })
        })
    }
}
