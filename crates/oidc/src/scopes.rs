//! Scope parsing
//!
//! Requests must include `openid`. Besides the standard OIDC scopes the
//! bridge understands `offline_access`, `groups`, `federated:id` and
//! cross-client audience scopes of the form
//! `audience:server:client_id:<peer>`.

use crate::error::{Error, Result};

pub const OPENID: &str = "openid";
pub const EMAIL: &str = "email";
pub const PROFILE: &str = "profile";
pub const GROUPS: &str = "groups";
pub const OFFLINE_ACCESS: &str = "offline_access";
pub const FEDERATED_ID: &str = "federated:id";

const AUDIENCE_PREFIX: &str = "audience:server:client_id:";

/// Scopes advertised in the discovery document.
pub const SUPPORTED: &[&str] = &[OPENID, EMAIL, PROFILE, GROUPS, OFFLINE_ACCESS, FEDERATED_ID];

/// Split and validate a space-delimited scope string. Duplicates are
/// dropped, order is kept.
pub fn parse(raw: &str) -> Result<Vec<String>> {
    let mut scopes: Vec<String> = Vec::new();
    for scope in raw.split_whitespace() {
        if scopes.iter().any(|s| s == scope) {
            continue;
        }
        let known = SUPPORTED.contains(&scope)
            || scope
                .strip_prefix(AUDIENCE_PREFIX)
                .is_some_and(|peer| !peer.is_empty());
        if !known {
            return Err(Error::InvalidScope(format!("unrecognized scope {scope:?}")));
        }
        scopes.push(scope.to_string());
    }
    if !contains(&scopes, OPENID) {
        return Err(Error::InvalidScope("missing required scope \"openid\"".into()));
    }
    Ok(scopes)
}

pub fn contains(scopes: &[String], scope: &str) -> bool {
    scopes.iter().any(|s| s == scope)
}

/// Client ids named by cross-client audience scopes.
pub fn peers(scopes: &[String]) -> Vec<&str> {
    scopes
        .iter()
        .filter_map(|s| s.strip_prefix(AUDIENCE_PREFIX))
        .collect()
}

/// The view of the scopes handed to connectors.
pub fn for_connector(scopes: &[String]) -> connector::Scopes {
    connector::Scopes {
        offline_access: contains(scopes, OFFLINE_ACCESS),
        groups: contains(scopes, GROUPS),
    }
}
