//! Entities persisted through the storage contract
//!
//! Every entity is plain data with value semantics. An `Identity` is copied
//! into each code and refresh token that carries it, never shared.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connector-private state attached to requests, codes and refresh tokens.
///
/// Passed through verbatim. The bridge never parses or logs the contents.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorData(Vec<u8>);

impl ConnectorData {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ConnectorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectorData({} bytes)", self.0.len())
    }
}

/// User identity as reported by a connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject id from the upstream provider
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub preferred_username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub groups: Vec<String>,
    /// Additional claims contributed by the connector
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// PKCE code challenge method (RFC 7636 section 4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkceMethod {
    #[serde(rename = "S256")]
    S256,
    #[serde(rename = "plain")]
    Plain,
}

impl PkceMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "S256" => Some(PkceMethod::S256),
            "plain" => Some(PkceMethod::Plain),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PkceMethod::S256 => "S256",
            PkceMethod::Plain => "plain",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceChallenge {
    pub challenge: String,
    pub method: PkceMethod,
}

/// An in-flight authorization request, from `/authorize` until code issuance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub id: String,
    pub client_id: String,
    pub response_types: Vec<String>,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    pub state: String,
    pub nonce: Option<String>,
    pub pkce: Option<PkceChallenge>,
    pub connector_id: String,
    pub login_hint: Option<String>,
    pub expiry: DateTime<Utc>,

    /// Set once the connector reported a successful login. The request is
    /// immutable from then on.
    pub logged_in: bool,
    pub identity: Option<Identity>,
    pub connector_data: Option<ConnectorData>,
}

/// A single-use authorization code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthCode {
    pub id: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub nonce: Option<String>,
    pub identity: Identity,
    pub connector_id: String,
    #[serde(default)]
    pub connector_data: ConnectorData,
    pub pkce: Option<PkceChallenge>,
    pub expiry: DateTime<Utc>,
}

/// A refresh token. The `id` is the bearer value handed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: String,
    pub client_id: String,
    pub connector_id: String,
    pub identity: Identity,
    #[serde(default)]
    pub connector_data: ConnectorData,
    pub scopes: Vec<String>,
    pub nonce: Option<String>,

    /// Shared by every token descended from the same code exchange
    pub family: String,
    /// When the family was born; copied to each successor
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    /// Retired tokens are kept so that replaying them can be detected
    pub retired: bool,
    /// Hard expiry for the whole family, if an absolute lifetime is configured
    pub expiry: Option<DateTime<Utc>>,
}

/// Public half of a signing key in JWK form (RFC 7517).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    pub kid: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub key_use: String,
}

/// The key currently used for signing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKey {
    pub key_id: String,
    pub algorithm: String,
    /// PKCS#8 DER, base64url encoded
    pub private_key: String,
    pub public_key: PublicJwk,
    pub not_before: DateTime<Utc>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("private_key", &"[REDACTED]")
            .field("not_before", &self.not_before)
            .finish()
    }
}

/// A rotated-out key kept for verification until `expiry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationKey {
    pub public_key: PublicJwk,
    pub expiry: DateTime<Utc>,
}

/// The single signing key set record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keys {
    pub signing_key: Option<SigningKey>,
    #[serde(default)]
    pub verification_keys: Vec<VerificationKey>,
    pub next_rotation: Option<DateTime<Utc>>,
}

/// A registered OAuth2 client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    /// base64url SHA-256 of the client secret; empty for public clients
    #[serde(default)]
    pub secret_hash: String,
    pub redirect_uris: Vec<String>,
    /// Clients allowed to request tokens with this client as audience
    #[serde(default)]
    pub trusted_peers: Vec<String>,
    #[serde(default)]
    pub public: bool,
    pub name: String,
    /// Permitted grant types; empty permits authorization_code and refresh_token
    #[serde(default)]
    pub grant_types: Vec<String>,
}

/// A local password database entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Password {
    /// Lowercased email, the lookup key
    pub email: String,
    /// bcrypt hash
    pub hash: String,
    pub username: String,
    pub user_id: String,
}

/// Stored configuration for one connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Assigned by the store; changes on every write
    #[serde(default)]
    pub resource_version: String,
}

/// Records removed by one garbage collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcResult {
    pub auth_requests: usize,
    pub auth_codes: usize,
    pub refresh_tokens: usize,
}

impl GcResult {
    pub fn is_empty(&self) -> bool {
        self.auth_requests == 0 && self.auth_codes == 0 && self.refresh_tokens == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_data_debug_hides_contents() {
        let data = ConnectorData::new(b"upstream-refresh-token".to_vec());
        let debug = format!("{data:?}");
        assert_eq!(debug, "ConnectorData(22 bytes)");
        assert!(!debug.contains("upstream"));
    }

    #[test]
    fn signing_key_debug_redacts_private_material() {
        let key = SigningKey {
            key_id: "k1".into(),
            algorithm: "ES256".into(),
            private_key: "cHJpdmF0ZQ".into(),
            public_key: PublicJwk {
                kty: "EC".into(),
                crv: "P-256".into(),
                x: "x".into(),
                y: "y".into(),
                kid: "k1".into(),
                alg: "ES256".into(),
                key_use: "sig".into(),
            },
            not_before: Utc::now(),
        };
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("cHJpdmF0ZQ"));
    }

    #[test]
    fn pkce_method_parses_known_values() {
        assert_eq!(PkceMethod::parse("S256"), Some(PkceMethod::S256));
        assert_eq!(PkceMethod::parse("plain"), Some(PkceMethod::Plain));
        assert_eq!(PkceMethod::parse("s256"), None);
        assert_eq!(PkceMethod::S256.as_str(), "S256");
    }

    #[test]
    fn jwk_serializes_use_field() {
        let jwk = PublicJwk {
            kty: "EC".into(),
            crv: "P-256".into(),
            x: "x".into(),
            y: "y".into(),
            kid: "k1".into(),
            alg: "ES256".into(),
            key_use: "sig".into(),
        };
        let json = serde_json::to_value(&jwk).unwrap();
        assert_eq!(json["use"], "sig");
        assert!(json.get("key_use").is_none());
    }
}
