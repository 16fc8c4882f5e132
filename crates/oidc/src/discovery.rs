//! OpenID Provider metadata (`/.well-known/openid-configuration`)

use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::scopes;
use crate::server::{GRANT_AUTHORIZATION_CODE, GRANT_REFRESH_TOKEN};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    pub response_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub claims_supported: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl Discovery {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            issuer: config.issuer.clone(),
            authorization_endpoint: config.endpoint("/authorize"),
            token_endpoint: config.endpoint("/token"),
            jwks_uri: config.endpoint("/keys"),
            response_types_supported: strings(&["code"]),
            subject_types_supported: strings(&["public"]),
            id_token_signing_alg_values_supported: strings(&[keys::ALGORITHM]),
            code_challenge_methods_supported: strings(&["S256", "plain"]),
            scopes_supported: strings(scopes::SUPPORTED),
            token_endpoint_auth_methods_supported: strings(&[
                "client_secret_basic",
                "client_secret_post",
                "none",
            ]),
            grant_types_supported: strings(&[GRANT_AUTHORIZATION_CODE, GRANT_REFRESH_TOKEN]),
            claims_supported: strings(&[
                "iss",
                "sub",
                "aud",
                "iat",
                "exp",
                "nonce",
                "at_hash",
                "email",
                "email_verified",
                "groups",
                "name",
                "preferred_username",
            ]),
        }
    }
}
