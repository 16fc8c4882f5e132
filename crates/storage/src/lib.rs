//! Credential store contract for the identity bridge
//!
//! All mutable state of the bridge lives behind the `Storage` trait so that
//! any instance can serve any request. Backends must make every call atomic
//! and must detect conflicting writes in `update_*`: the updater sees the
//! value as it was read, and the result is written only if nothing else
//! wrote the record in between. A lost race surfaces as
//! `Error::UpdateConflict` with nothing written.
//!
//! `MemStorage` is the reference implementation used by tests and by
//! single-instance deployments.

pub mod error;
pub mod memory;
pub mod types;

pub use error::{Error, Result};
pub use memory::MemStorage;
pub use types::{
    AuthCode, AuthRequest, Client, ConnectorConfig, ConnectorData, GcResult, Identity, Keys,
    Password, PkceChallenge, PkceMethod, PublicJwk, RefreshToken, SigningKey, VerificationKey,
};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;

/// Read-modify-write function applied by the `update_*` operations.
///
/// Runs without any store lock held. Returning an error aborts the update
/// and the error is handed back to the caller unchanged.
pub type Updater<T> = Box<dyn FnOnce(T) -> Result<T> + Send>;

/// Persistence contract for every entity the bridge manages.
///
/// Uses `BoxFuture` return types for dyn-compatibility (`Arc<dyn Storage>`).
/// `get_*` treats logically expired records as absent. `list_*` streams are
/// lazy and single-pass, and their order is unspecified.
pub trait Storage: Send + Sync {
    fn create_auth_request(&self, request: AuthRequest) -> BoxFuture<'_, Result<()>>;
    fn get_auth_request<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<AuthRequest>>;
    fn update_auth_request<'a>(
        &'a self,
        id: &'a str,
        updater: Updater<AuthRequest>,
    ) -> BoxFuture<'a, Result<AuthRequest>>;
    fn delete_auth_request<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;

    fn create_auth_code(&self, code: AuthCode) -> BoxFuture<'_, Result<()>>;
    fn get_auth_code<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<AuthCode>>;
    fn delete_auth_code<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;

    fn create_refresh_token(&self, token: RefreshToken) -> BoxFuture<'_, Result<()>>;
    fn get_refresh_token<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<RefreshToken>>;
    fn update_refresh_token<'a>(
        &'a self,
        id: &'a str,
        updater: Updater<RefreshToken>,
    ) -> BoxFuture<'a, Result<RefreshToken>>;
    fn delete_refresh_token<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;
    fn list_refresh_tokens(&self) -> BoxStream<'_, Result<RefreshToken>>;

    /// The signing key set. An empty set is returned before the first rotation.
    fn get_keys(&self) -> BoxFuture<'_, Result<Keys>>;
    fn update_keys(&self, updater: Updater<Keys>) -> BoxFuture<'_, Result<Keys>>;

    fn create_client(&self, client: Client) -> BoxFuture<'_, Result<()>>;
    fn get_client<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Client>>;
    fn update_client<'a>(
        &'a self,
        id: &'a str,
        updater: Updater<Client>,
    ) -> BoxFuture<'a, Result<Client>>;
    fn delete_client<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;
    fn list_clients(&self) -> BoxStream<'_, Result<Client>>;

    fn create_connector(&self, connector: ConnectorConfig) -> BoxFuture<'_, Result<()>>;
    fn get_connector<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<ConnectorConfig>>;
    fn update_connector<'a>(
        &'a self,
        id: &'a str,
        updater: Updater<ConnectorConfig>,
    ) -> BoxFuture<'a, Result<ConnectorConfig>>;
    fn delete_connector<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;
    fn list_connectors(&self) -> BoxStream<'_, Result<ConnectorConfig>>;

    /// Passwords are keyed by email, compared case-insensitively.
    fn create_password(&self, password: Password) -> BoxFuture<'_, Result<()>>;
    fn get_password<'a>(&'a self, email: &'a str) -> BoxFuture<'a, Result<Password>>;
    fn update_password<'a>(
        &'a self,
        email: &'a str,
        updater: Updater<Password>,
    ) -> BoxFuture<'a, Result<Password>>;
    fn delete_password<'a>(&'a self, email: &'a str) -> BoxFuture<'a, Result<()>>;
    fn list_passwords(&self) -> BoxStream<'_, Result<Password>>;

    /// Physically remove expired auth requests, auth codes and refresh token
    /// families. Correctness never depends on this running.
    fn garbage_collect(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<GcResult>>;
}
