//! Built-in connectors for development and tests
//!
//! None of these talk to a real upstream. They return fixed identities so
//! that the full authorization flow can be exercised end to end.

use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::Deserialize;
use storage::{ConnectorData, Identity};
use tracing::debug;

use crate::error::{Error, Result};
use crate::{
    AssertionConnector, Authenticated, CallbackConnector, Connector, PasswordConnector,
    RefreshConnector, Scopes, with_state,
};

const MOCK_USER_ID: &str = "0-385-28089-0";

fn default_identity() -> Identity {
    Identity {
        user_id: MOCK_USER_ID.into(),
        username: "Kilgore Trout".into(),
        preferred_username: "kilgore".into(),
        email: "kilgore@kilgore.trout".into(),
        email_verified: true,
        groups: vec!["authors".into()],
        extra: Default::default(),
    }
}

/// Apply the group scope: connectors only report groups when asked.
fn scoped(identity: &Identity, scopes: &Scopes) -> Identity {
    let mut identity = identity.clone();
    if !scopes.groups {
        identity.groups.clear();
    }
    identity
}

#[derive(Debug, Default, Deserialize)]
struct MockCallbackConfig {
    #[serde(default)]
    identity: Option<Identity>,
}

/// Redirects straight back to the bridge and logs in a fixed user.
pub struct MockCallback {
    identity: Identity,
}

impl MockCallback {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    /// Optional config: `{"identity": {...}}` overriding the fixed user.
    pub fn from_config(config: &serde_json::Value) -> Result<Self> {
        let parsed: MockCallbackConfig = if config.is_null() {
            MockCallbackConfig::default()
        } else {
            serde_json::from_value(config.clone())
                .map_err(|e| Error::Config(format!("mockCallback: {e}")))?
        };
        Ok(Self::new(parsed.identity.unwrap_or_else(default_identity)))
    }
}

impl Default for MockCallback {
    fn default() -> Self {
        Self::new(default_identity())
    }
}

impl Connector for MockCallback {
    fn kind(&self) -> &str {
        "mockCallback"
    }

    fn as_callback(&self) -> Option<&dyn CallbackConnector> {
        Some(self)
    }

    fn as_refresh(&self) -> Option<&dyn RefreshConnector> {
        Some(self)
    }
}

impl CallbackConnector for MockCallback {
    fn login_url(&self, _scopes: &Scopes, callback_url: &str, state: &str) -> Result<String> {
        with_state(callback_url, state)
    }

    fn handle_callback<'a>(
        &'a self,
        scopes: &'a Scopes,
        params: &'a HashMap<String, String>,
    ) -> BoxFuture<'a, Result<Authenticated>> {
        Box::pin(async move {
            if let Some(error) = params.get("error") {
                return Err(Error::Upstream(error.clone()));
            }
            Ok(Authenticated {
                identity: scoped(&self.identity, scopes),
                data: ConnectorData::new(b"mock-session".to_vec()),
            })
        })
    }
}

impl RefreshConnector for MockCallback {
    fn refresh<'a>(
        &'a self,
        scopes: &'a Scopes,
        _identity: &'a Identity,
        data: &'a ConnectorData,
    ) -> BoxFuture<'a, Result<Authenticated>> {
        Box::pin(async move {
            debug!(kind = "mockCallback", "refreshing identity");
            Ok(Authenticated {
                identity: scoped(&self.identity, scopes),
                data: data.clone(),
            })
        })
    }
}

#[derive(Debug, Deserialize)]
struct MockPasswordConfig {
    username: String,
    password: String,
}

/// Accepts exactly one configured username/password pair.
pub struct MockPassword {
    username: String,
    password: String,
}

impl MockPassword {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Required config: `{"username": "...", "password": "..."}`.
    pub fn from_config(config: &serde_json::Value) -> Result<Self> {
        let parsed: MockPasswordConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::Config(format!("mockPassword: {e}")))?;
        if parsed.username.is_empty() || parsed.password.is_empty() {
            return Err(Error::Config(
                "mockPassword: username and password must be non-empty".into(),
            ));
        }
        Ok(Self::new(parsed.username, parsed.password))
    }

    fn identity(&self) -> Identity {
        Identity {
            user_id: MOCK_USER_ID.into(),
            username: self.username.clone(),
            preferred_username: self.username.clone(),
            email: self.username.clone(),
            email_verified: true,
            groups: vec![],
            extra: Default::default(),
        }
    }
}

impl Connector for MockPassword {
    fn kind(&self) -> &str {
        "mockPassword"
    }

    fn as_password(&self) -> Option<&dyn PasswordConnector> {
        Some(self)
    }

    fn as_refresh(&self) -> Option<&dyn RefreshConnector> {
        Some(self)
    }
}

impl PasswordConnector for MockPassword {
    fn prompt(&self) -> &str {
        "Username"
    }

    fn login<'a>(
        &'a self,
        _scopes: &'a Scopes,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<Authenticated>> {
        Box::pin(async move {
            if username != self.username || password != self.password {
                return Err(Error::InvalidCredentials);
            }
            Ok(Authenticated {
                identity: self.identity(),
                data: ConnectorData::default(),
            })
        })
    }
}

impl RefreshConnector for MockPassword {
    fn refresh<'a>(
        &'a self,
        _scopes: &'a Scopes,
        identity: &'a Identity,
        data: &'a ConnectorData,
    ) -> BoxFuture<'a, Result<Authenticated>> {
        Box::pin(async move {
            Ok(Authenticated {
                identity: identity.clone(),
                data: data.clone(),
            })
        })
    }
}

#[derive(Debug, Deserialize)]
struct MockAssertionConfig {
    assertion: String,
    #[serde(default)]
    identity: Option<Identity>,
}

/// Accepts one configured assertion payload. Has no refresh capability, so
/// refresh tokens issued through it replay the identity captured at login.
pub struct MockAssertion {
    assertion: String,
    identity: Identity,
}

impl MockAssertion {
    pub fn new(assertion: impl Into<String>) -> Self {
        Self {
            assertion: assertion.into(),
            identity: default_identity(),
        }
    }

    /// Required config: `{"assertion": "..."}`, optional `identity`.
    pub fn from_config(config: &serde_json::Value) -> Result<Self> {
        let parsed: MockAssertionConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::Config(format!("mockAssertion: {e}")))?;
        Ok(Self {
            assertion: parsed.assertion,
            identity: parsed.identity.unwrap_or_else(default_identity),
        })
    }
}

impl Connector for MockAssertion {
    fn kind(&self) -> &str {
        "mockAssertion"
    }

    fn as_assertion(&self) -> Option<&dyn AssertionConnector> {
        Some(self)
    }
}

impl AssertionConnector for MockAssertion {
    fn login_url(&self, _scopes: &Scopes, callback_url: &str, state: &str) -> Result<String> {
        with_state(callback_url, state)
    }

    fn handle_assertion<'a>(
        &'a self,
        scopes: &'a Scopes,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<Authenticated>> {
        Box::pin(async move {
            if payload != self.assertion {
                return Err(Error::Upstream("assertion rejected".into()));
            }
            Ok(Authenticated {
                identity: scoped(&self.identity, scopes),
                data: ConnectorData::default(),
            })
        })
    }
}
