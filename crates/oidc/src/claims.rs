//! ID token and access token claims

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use storage::Identity;

use crate::scopes;

/// `aud` is a single string unless the token names several audiences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn contains(&self, client_id: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == client_id,
            Audience::Multiple(auds) => auds.iter().any(|aud| aud == client_id),
        }
    }
}

/// Which upstream the subject came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedClaims {
    pub connector_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Audience,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federated_claims: Option<FederatedClaims>,
    /// Connector-supplied claims that do not collide with the ones above
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

const REGISTERED: &[&str] = &[
    "iss",
    "sub",
    "aud",
    "azp",
    "exp",
    "iat",
    "nonce",
    "at_hash",
    "email",
    "email_verified",
    "groups",
    "name",
    "preferred_username",
    "federated_claims",
];

/// Inputs for one set of claims.
pub(crate) struct ClaimsInput<'a> {
    pub issuer: &'a str,
    pub client_id: &'a str,
    pub identity: &'a Identity,
    pub connector_id: &'a str,
    pub scopes: &'a [String],
    pub nonce: Option<&'a str>,
    pub issued_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

impl IdTokenClaims {
    /// Claims released according to the granted scopes.
    pub(crate) fn build(input: ClaimsInput<'_>) -> Self {
        let ClaimsInput {
            issuer,
            client_id,
            identity,
            connector_id,
            scopes: granted,
            nonce,
            issued_at,
            expiry,
        } = input;

        let peers = scopes::peers(granted);
        let (aud, azp) = if peers.is_empty() {
            (Audience::Single(client_id.to_string()), None)
        } else {
            let mut auds: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
            if !auds.iter().any(|a| a == client_id) {
                auds.push(client_id.to_string());
            }
            (Audience::Multiple(auds), Some(client_id.to_string()))
        };

        let has = |scope| scopes::contains(granted, scope);
        let extra = identity
            .extra
            .iter()
            .filter(|(k, _)| !REGISTERED.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            iss: issuer.to_string(),
            sub: identity.user_id.clone(),
            aud,
            azp,
            exp: expiry.timestamp(),
            iat: issued_at.timestamp(),
            nonce: nonce.map(str::to_string),
            at_hash: None,
            email: has(scopes::EMAIL).then(|| identity.email.clone()),
            email_verified: has(scopes::EMAIL).then_some(identity.email_verified),
            groups: has(scopes::GROUPS).then(|| identity.groups.clone()),
            name: has(scopes::PROFILE).then(|| identity.username.clone()),
            preferred_username: has(scopes::PROFILE)
                .then(|| identity.preferred_username.clone()),
            federated_claims: has(scopes::FEDERATED_ID).then(|| FederatedClaims {
                connector_id: connector_id.to_string(),
                user_id: identity.user_id.clone(),
            }),
            extra,
        }
    }
}

/// Left half of the SHA-256 of the access token, base64url encoded
/// (OIDC Core 3.1.3.6).
pub fn at_hash(access_token: &str) -> String {
    let digest = Sha256::digest(access_token.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..16])
}
