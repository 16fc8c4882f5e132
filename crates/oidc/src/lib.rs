//! OpenID Connect engine of the identity bridge
//!
//! `Server` ties the store, the connector registry and the key manager
//! together and implements the protocol operations:
//!
//! - `authorize`: validate a request and start the upstream login
//! - `handle_callback` / `password_login` / `assertion_login`: complete it
//! - `approve`: record the user's consent and issue the code
//! - `token`: exchange a code or rotate a refresh token
//!
//! Every operation takes a `Deadline`. Store and connector calls made on its
//! behalf are abandoned when the deadline passes and reported as `Timeout`.
//! Operations are HTTP-agnostic; the service crate maps them onto routes.

pub mod authorize;
pub mod claims;
pub mod config;
pub mod discovery;
pub mod error;
pub mod exchange;
pub mod gc;
pub mod pkce;
pub mod rotation;
pub mod scopes;
pub mod server;

pub use authorize::{AuthorizeParams, AuthorizeResponse, LoginAction, LoginResult};
pub use claims::{Audience, IdTokenClaims};
pub use config::ServerConfig;
pub use discovery::Discovery;
pub use error::{Error, Result};
pub use exchange::{Grant, TokenForm, TokenResponse};
pub use gc::spawn_gc_task;
pub use rotation::{DEFAULT_RETIRED_RETENTION, RefreshPolicy, ReusePolicy, revoke_family};
pub use server::{ClientCredentials, Server, hash_client_secret};
