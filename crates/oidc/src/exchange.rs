//! Token endpoint: authorization code exchange and refresh
//!
//! Codes are single use: the code record is deleted before any token is
//! signed, and the delete is what decides between two concurrent exchanges.
//! Refresh tokens rotate on every use (see `rotation`).

use chrono::{DateTime, Utc};
use common::{Deadline, Secret, new_token};
use connector::Authenticated;
use serde::{Deserialize, Serialize};
use storage::{Client, Identity, RefreshToken};
use tracing::{debug, info};
use uuid::Uuid;

use crate::claims::{ClaimsInput, IdTokenClaims, at_hash};
use crate::config::expiry_after;
use crate::error::{Error, Result};
use crate::server::{
    ClientCredentials, GRANT_AUTHORIZATION_CODE, GRANT_REFRESH_TOKEN, Server, allows_grant,
};
use crate::{pkce, scopes};

/// Form body of a token request (`application/x-www-form-urlencoded`).
#[derive(Default, Deserialize)]
#[serde(default)]
pub struct TokenForm {
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    AuthorizationCode {
        code: String,
        redirect_uri: Option<String>,
        code_verifier: Option<String>,
    },
    RefreshToken {
        refresh_token: String,
        scope: Option<String>,
    },
}

impl Grant {
    pub fn grant_type(&self) -> &'static str {
        match self {
            Grant::AuthorizationCode { .. } => GRANT_AUTHORIZATION_CODE,
            Grant::RefreshToken { .. } => GRANT_REFRESH_TOKEN,
        }
    }
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::InvalidRequest(format!("missing {name}")))
}

impl TokenForm {
    /// Split the form into the grant and any client credentials carried in
    /// the body (`client_secret_post`).
    pub fn into_parts(self) -> Result<(Grant, Option<ClientCredentials>)> {
        let credentials = self.client_id.map(|client_id| ClientCredentials {
            client_id,
            client_secret: self.client_secret.map(Secret::new),
        });
        let grant = match self.grant_type.as_str() {
            GRANT_AUTHORIZATION_CODE => Grant::AuthorizationCode {
                code: required(self.code, "code")?,
                redirect_uri: self.redirect_uri,
                code_verifier: self.code_verifier,
            },
            GRANT_REFRESH_TOKEN => Grant::RefreshToken {
                refresh_token: required(self.refresh_token, "refresh_token")?,
                scope: self.scope.filter(|s| !s.trim().is_empty()),
            },
            "" => return Err(Error::InvalidRequest("missing grant_type".into())),
            other => return Err(Error::UnsupportedGrantType(other.to_string())),
        };
        Ok((grant, credentials))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub id_token: String,
}

/// What a set of tokens is minted for.
struct Subject<'a> {
    client_id: &'a str,
    identity: &'a Identity,
    connector_id: &'a str,
    scopes: &'a [String],
    nonce: Option<&'a str>,
}

impl Server {
    /// Handle a token request from an authenticated client.
    pub async fn token(
        &self,
        credentials: ClientCredentials,
        grant: Grant,
        deadline: Deadline,
    ) -> Result<TokenResponse> {
        let client = self.authenticate_client(&credentials, deadline).await?;
        let grant_type = grant.grant_type();
        if !allows_grant(&client, grant_type) {
            return Err(Error::UnauthorizedClient(format!(
                "client {:?} may not use the {grant_type} grant",
                client.id
            )));
        }

        let response = match grant {
            Grant::AuthorizationCode {
                code,
                redirect_uri,
                code_verifier,
            } => {
                self.exchange_code(
                    &client,
                    &code,
                    redirect_uri.as_deref(),
                    code_verifier.as_deref(),
                    deadline,
                )
                .await?
            }
            Grant::RefreshToken {
                refresh_token,
                scope,
            } => {
                self.exchange_refresh(&client, &refresh_token, scope.as_deref(), deadline)
                    .await?
            }
        };
        metrics::counter!("idbridge_tokens_issued_total", "grant" => grant_type).increment(1);
        Ok(response)
    }

    async fn exchange_code(
        &self,
        client: &Client,
        code_id: &str,
        redirect_uri: Option<&str>,
        code_verifier: Option<&str>,
        deadline: Deadline,
    ) -> Result<TokenResponse> {
        let code = match deadline.run(self.storage().get_auth_code(code_id)).await? {
            Ok(code) => code,
            Err(storage::Error::NotFound(_)) => {
                return Err(Error::InvalidGrant(
                    "invalid or expired authorization code".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        if code.client_id != client.id {
            return Err(Error::InvalidClient(
                "authorization code was issued to another client".into(),
            ));
        }
        if redirect_uri.is_some_and(|uri| uri != code.redirect_uri) {
            return Err(Error::InvalidGrant("redirect_uri does not match".into()));
        }
        match (&code.pkce, code_verifier) {
            (Some(challenge), Some(verifier)) => {
                if !pkce::verify(challenge, verifier) {
                    return Err(Error::InvalidGrant("PKCE verification failed".into()));
                }
            }
            (Some(_), None) => {
                return Err(Error::InvalidGrant("code_verifier is required".into()));
            }
            (None, Some(_)) => {
                return Err(Error::InvalidRequest(
                    "code_verifier given for a code issued without PKCE".into(),
                ));
            }
            (None, None) => {}
        }

        // Whoever deletes the code owns it.
        match deadline.run(self.storage().delete_auth_code(&code.id)).await? {
            Ok(()) => {}
            Err(storage::Error::NotFound(_)) => {
                return Err(Error::InvalidGrant(
                    "authorization code has already been used".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        let now = Utc::now();
        let subject = Subject {
            client_id: &client.id,
            identity: &code.identity,
            connector_id: &code.connector_id,
            scopes: &code.scopes,
            nonce: code.nonce.as_deref(),
        };
        let mut response = self.mint(&subject, now, deadline).await?;

        if scopes::contains(&code.scopes, scopes::OFFLINE_ACCESS)
            && allows_grant(client, GRANT_REFRESH_TOKEN)
        {
            let token = RefreshToken {
                id: new_token(),
                client_id: client.id.clone(),
                connector_id: code.connector_id.clone(),
                identity: code.identity.clone(),
                connector_data: code.connector_data.clone(),
                scopes: code.scopes.clone(),
                nonce: code.nonce.clone(),
                family: Uuid::new_v4().to_string(),
                created_at: now,
                last_used: now,
                retired: false,
                expiry: self.config().refresh.family_expiry(now),
            };
            deadline
                .run(self.storage().create_refresh_token(token.clone()))
                .await??;
            debug!(family = %token.family, "refresh token family started");
            response.refresh_token = Some(token.id);
        }

        info!(client_id = %client.id, "authorization code exchanged");
        Ok(response)
    }

    async fn exchange_refresh(
        &self,
        client: &Client,
        token_id: &str,
        scope: Option<&str>,
        deadline: Deadline,
    ) -> Result<TokenResponse> {
        let policy = self.config().refresh;
        let token = match deadline.run(self.storage().get_refresh_token(token_id)).await? {
            Ok(token) => token,
            Err(storage::Error::NotFound(_)) => {
                return Err(Error::InvalidGrant("invalid or expired refresh token".into()));
            }
            Err(e) => return Err(e.into()),
        };
        if token.client_id != client.id {
            return Err(Error::InvalidClient(
                "refresh token was issued to another client".into(),
            ));
        }
        if token.retired {
            return Err(policy
                .on_reuse(self.storage(), &token, None, deadline)
                .await);
        }
        let now = Utc::now();
        policy.check_lifetime(&token, now)?;
        let granted = narrow_scopes(&token.scopes, scope)?;

        let connector = self.connector(&token.connector_id, deadline).await?;
        let refreshed = match connector.connector.as_refresh() {
            Some(refresher) => {
                deadline
                    .run(refresher.refresh(
                        &scopes::for_connector(&granted),
                        &token.identity,
                        &token.connector_data,
                    ))
                    .await??
            }
            None => Authenticated {
                identity: token.identity.clone(),
                data: token.connector_data.clone(),
            },
        };

        let successor = RefreshToken {
            id: new_token(),
            identity: refreshed.identity,
            connector_data: refreshed.data,
            last_used: now,
            retired: false,
            ..token.clone()
        };
        deadline
            .run(self.storage().create_refresh_token(successor.clone()))
            .await??;

        // Retiring the presented token decides which of several concurrent
        // refreshes wins.
        match deadline
            .run(self.storage().update_refresh_token(&token.id, policy.retire(now)))
            .await?
        {
            Ok(_) => {}
            Err(storage::Error::Rejected(_)) | Err(storage::Error::UpdateConflict(_)) => {
                return Err(policy
                    .on_reuse(self.storage(), &token, Some(&successor.id), deadline)
                    .await);
            }
            Err(storage::Error::NotFound(_)) => {
                self.discard_refresh_token(&successor.id, deadline).await?;
                return Err(Error::InvalidGrant("refresh token has been revoked".into()));
            }
            Err(e) => return Err(e.into()),
        }

        let subject = Subject {
            client_id: &client.id,
            identity: &successor.identity,
            connector_id: &successor.connector_id,
            scopes: &granted,
            nonce: successor.nonce.as_deref(),
        };
        let mut response = self.mint(&subject, now, deadline).await?;
        info!(client_id = %client.id, family = %successor.family, "refresh token rotated");
        response.refresh_token = Some(successor.id);
        Ok(response)
    }

    async fn discard_refresh_token(&self, id: &str, deadline: Deadline) -> Result<()> {
        match deadline.run(self.storage().delete_refresh_token(id)).await? {
            Ok(()) | Err(storage::Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Sign the access token, then the ID token carrying its `at_hash`.
    async fn mint(
        &self,
        subject: &Subject<'_>,
        now: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<TokenResponse> {
        let valid_for = self.config().id_tokens_valid_for;
        let mut claims = IdTokenClaims::build(ClaimsInput {
            issuer: &self.config().issuer,
            client_id: subject.client_id,
            identity: subject.identity,
            connector_id: subject.connector_id,
            scopes: subject.scopes,
            nonce: subject.nonce,
            issued_at: now,
            expiry: expiry_after(now, valid_for),
        });

        let (access_token, _) = deadline.run(self.keys().sign(&claims)).await??;
        claims.at_hash = Some(at_hash(&access_token));
        let (id_token, key_id) = deadline.run(self.keys().sign(&claims)).await??;
        debug!(key_id = %key_id, client_id = subject.client_id, "signed tokens");

        Ok(TokenResponse {
            access_token,
            token_type: "bearer".into(),
            expires_in: valid_for.as_secs(),
            refresh_token: None,
            id_token,
        })
    }
}

/// Scopes for a refreshed token: the original grant, or a subset of it.
fn narrow_scopes(granted: &[String], requested: Option<&str>) -> Result<Vec<String>> {
    let Some(requested) = requested else {
        return Ok(granted.to_vec());
    };
    let mut narrowed: Vec<String> = Vec::new();
    for scope in requested.split_whitespace() {
        if !scopes::contains(granted, scope) {
            return Err(Error::InvalidScope(format!(
                "scope {scope:?} was not part of the original grant"
            )));
        }
        if !scopes::contains(&narrowed, scope) {
            narrowed.push(scope.to_string());
        }
    }
    Ok(narrowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(grant_type: &str) -> TokenForm {
        TokenForm {
            grant_type: grant_type.into(),
            ..Default::default()
        }
    }

    #[test]
    fn form_requires_grant_parameters() {
        assert!(matches!(
            form("authorization_code").into_parts(),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            form("refresh_token").into_parts(),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(form("").into_parts(), Err(Error::InvalidRequest(_))));
        assert!(matches!(
            form("password").into_parts(),
            Err(Error::UnsupportedGrantType(_))
        ));
    }

    #[test]
    fn form_carries_post_credentials() {
        let (grant, credentials) = TokenForm {
            code: Some("c0de".into()),
            client_id: Some("app".into()),
            client_secret: Some("s3cret".into()),
            ..form("authorization_code")
        }
        .into_parts()
        .unwrap();
        assert_eq!(grant.grant_type(), GRANT_AUTHORIZATION_CODE);
        let credentials = credentials.unwrap();
        assert_eq!(credentials.client_id, "app");
        assert_eq!(credentials.client_secret.unwrap().expose(), "s3cret");
    }

    #[test]
    fn blank_scope_means_original_grant() {
        let (grant, _) = TokenForm {
            refresh_token: Some("rt".into()),
            scope: Some("  ".into()),
            ..form("refresh_token")
        }
        .into_parts()
        .unwrap();
        assert_eq!(
            grant,
            Grant::RefreshToken {
                refresh_token: "rt".into(),
                scope: None
            }
        );
    }

    #[test]
    fn scopes_may_only_narrow() {
        let granted: Vec<String> = ["openid", "email", "offline_access"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(narrow_scopes(&granted, None).unwrap(), granted);
        assert_eq!(
            narrow_scopes(&granted, Some("openid email")).unwrap(),
            vec!["openid", "email"]
        );
        assert!(matches!(
            narrow_scopes(&granted, Some("openid groups")),
            Err(Error::InvalidScope(_))
        ));
    }
}
