//! Upstream authentication connectors
//!
//! A connector verifies a user against some upstream identity source and
//! reports an `Identity` plus opaque `ConnectorData`. Connectors differ in
//! how the user is authenticated, so the `Connector` trait only advertises
//! which capability traits a connector implements:
//!
//! - `CallbackConnector`: redirect to the upstream, exchange the callback
//! - `PasswordConnector`: verify a username/password pair
//! - `AssertionConnector`: accept a signed assertion POSTed back by the upstream
//! - `RefreshConnector`: re-derive the identity without user interaction
//!
//! Callers branch on `as_*` returning `Some`, never on the concrete type.

pub mod error;
pub mod local;
pub mod mock;
pub mod registry;

pub use error::{Error, Result};
pub use local::LocalConnector;
pub use mock::{MockAssertion, MockCallback, MockPassword};
pub use registry::{BuiltinFactory, ConnectorFactory, ConnectorRegistry, ResolvedConnector};

use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::Serialize;
use storage::{ConnectorData, Identity};

/// The subset of requested scopes a connector cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scopes {
    /// The client asked for a refresh token
    pub offline_access: bool,
    /// The client asked for group membership
    pub groups: bool,
}

/// Result of a successful upstream login or refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct Authenticated {
    pub identity: Identity,
    pub data: ConnectorData,
}

/// Capability flags reported by a connector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub callback: bool,
    pub password: bool,
    pub assertion: bool,
    pub refresh: bool,
}

/// An upstream identity source.
///
/// Uses `BoxFuture` in the capability traits for dyn-compatibility
/// (`Arc<dyn Connector>`).
pub trait Connector: Send + Sync {
    /// Connector type name, e.g. "mockCallback" or "local"
    fn kind(&self) -> &str;

    fn as_callback(&self) -> Option<&dyn CallbackConnector> {
        None
    }

    fn as_password(&self) -> Option<&dyn PasswordConnector> {
        None
    }

    fn as_assertion(&self) -> Option<&dyn AssertionConnector> {
        None
    }

    fn as_refresh(&self) -> Option<&dyn RefreshConnector> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            callback: self.as_callback().is_some(),
            password: self.as_password().is_some(),
            assertion: self.as_assertion().is_some(),
            refresh: self.as_refresh().is_some(),
        }
    }
}

/// Redirect-based login (OAuth2/OIDC upstreams).
pub trait CallbackConnector: Send + Sync {
    /// URL the user agent is sent to. The upstream must eventually redirect
    /// to `callback_url` carrying `state` unchanged.
    fn login_url(&self, scopes: &Scopes, callback_url: &str, state: &str) -> Result<String>;

    /// Exchange the query parameters of the upstream's redirect.
    fn handle_callback<'a>(
        &'a self,
        scopes: &'a Scopes,
        params: &'a HashMap<String, String>,
    ) -> BoxFuture<'a, Result<Authenticated>>;
}

/// Username/password verification.
pub trait PasswordConnector: Send + Sync {
    /// Label for the username field, e.g. "Email Address"
    fn prompt(&self) -> &str;

    /// Fails with `Error::InvalidCredentials` on a wrong pair.
    fn login<'a>(
        &'a self,
        scopes: &'a Scopes,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<Authenticated>>;
}

/// Assertion POST login (SAML-style upstreams).
pub trait AssertionConnector: Send + Sync {
    /// URL the user agent is sent to. The upstream POSTs its assertion back
    /// to `callback_url` and relays `state`.
    fn login_url(&self, scopes: &Scopes, callback_url: &str, state: &str) -> Result<String>;

    fn handle_assertion<'a>(
        &'a self,
        scopes: &'a Scopes,
        payload: &'a str,
    ) -> BoxFuture<'a, Result<Authenticated>>;
}

/// Identity refresh without user interaction.
pub trait RefreshConnector: Send + Sync {
    fn refresh<'a>(
        &'a self,
        scopes: &'a Scopes,
        identity: &'a Identity,
        data: &'a ConnectorData,
    ) -> BoxFuture<'a, Result<Authenticated>>;
}

/// Append `state` to `callback_url` as a query parameter.
pub(crate) fn with_state(callback_url: &str, state: &str) -> Result<String> {
    let mut url = url::Url::parse(callback_url)
        .map_err(|e| Error::Config(format!("invalid callback URL {callback_url}: {e}")))?;
    url.query_pairs_mut().append_pair("state", state);
    Ok(url.into())
}
