//! Authorization state machine
//!
//! An `AuthRequest` moves through three states:
//!
//! 1. pending: created by `authorize`, waiting for the upstream login
//! 2. logged in: a connector reported an identity; the request is frozen
//! 3. consumed: an authorization code was issued and the request deleted
//!
//! The pending to logged-in transition is a conditional update that refuses
//! a request that is already logged in, so two concurrent callbacks for the
//! same request cannot both succeed. Leaving the logged-in state starts with
//! deleting the request; only the caller whose delete succeeds may issue a
//! code or report the denial.

use std::collections::HashMap;

use chrono::Utc;
use common::{Deadline, new_token};
use connector::{Authenticated, ResolvedConnector};
use serde::{Deserialize, Serialize};
use storage::{AuthCode, AuthRequest, Client, PkceChallenge, PkceMethod, Updater};
use tracing::{info, warn};
use url::Url;

use crate::config::expiry_after;
use crate::error::{Error, Result};
use crate::scopes;
use crate::server::Server;

/// Query parameters of the authorization endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthorizeParams {
    pub client_id: String,
    pub redirect_uri: Option<String>,
    pub response_type: String,
    pub scope: String,
    pub state: String,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub connector_id: Option<String>,
    pub login_hint: Option<String>,
}

/// How the user agent continues after `authorize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoginAction {
    /// Send the browser to the upstream
    Redirect { url: String },
    /// Collect credentials and submit them to `password_login`
    PasswordPrompt { prompt: String },
    /// The upstream POSTs an assertion back to `url`
    AssertionPost { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizeResponse {
    pub auth_request_id: String,
    pub connector_id: String,
    pub action: LoginAction,
}

/// Outcome of a completed upstream login or approval decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoginResult {
    /// Redirect to the client, carrying either a code or an error
    Redirect { url: String },
    /// The user must approve the release of `scopes` to the client
    ApprovalRequired {
        auth_request_id: String,
        client_name: String,
        scopes: Vec<String>,
    },
}

impl Server {
    /// Validate an authorization request and start the upstream login.
    pub async fn authorize(
        &self,
        params: AuthorizeParams,
        deadline: Deadline,
    ) -> Result<AuthorizeResponse> {
        let client = self.client(&params.client_id, deadline).await?;
        let redirect_uri = resolve_redirect_uri(&client, params.redirect_uri.as_deref())?;

        if params.response_type != "code" {
            return Err(Error::InvalidRequest(format!(
                "unsupported response_type {:?}",
                params.response_type
            )));
        }

        let scopes = scopes::parse(&params.scope)?;
        for peer in scopes::peers(&scopes) {
            self.check_peer(&client, peer, deadline).await?;
        }

        let pkce = parse_pkce(
            &client,
            params.code_challenge,
            params.code_challenge_method.as_deref(),
        )?;
        let connector = self
            .login_connector(params.connector_id.as_deref(), deadline)
            .await?;

        let request = AuthRequest {
            id: new_token(),
            client_id: client.id.clone(),
            response_types: vec![params.response_type],
            scopes,
            redirect_uri,
            state: params.state,
            nonce: params.nonce,
            pkce,
            connector_id: connector.id.clone(),
            login_hint: params.login_hint,
            expiry: expiry_after(Utc::now(), self.config().auth_requests_valid_for),
            logged_in: false,
            identity: None,
            connector_data: None,
        };
        deadline
            .run(self.storage().create_auth_request(request.clone()))
            .await??;
        info!(
            client_id = %request.client_id,
            connector_id = %request.connector_id,
            "authorization request created"
        );

        let action = self.login_action(&connector, &request)?;
        Ok(AuthorizeResponse {
            auth_request_id: request.id,
            connector_id: connector.id,
            action,
        })
    }

    /// Complete a login through a callback connector. `params` are the
    /// callback's query parameters; `state` carries the request id.
    pub async fn handle_callback(
        &self,
        params: &HashMap<String, String>,
        deadline: Deadline,
    ) -> Result<LoginResult> {
        let Some(state) = params.get("state") else {
            return Err(Error::InvalidRequest("callback is missing state".into()));
        };
        let request = self.pending_request(state, deadline).await?;
        let connector = self.connector(&request.connector_id, deadline).await?;
        let Some(callback) = connector.connector.as_callback() else {
            return Err(Error::InvalidRequest(
                "connector does not support callback login".into(),
            ));
        };
        let login = deadline
            .run(callback.handle_callback(&scopes::for_connector(&request.scopes), params))
            .await??;
        self.finish_login(request, login, deadline).await
    }

    /// Complete a login through a password connector.
    pub async fn password_login(
        &self,
        auth_request_id: &str,
        username: &str,
        password: &str,
        deadline: Deadline,
    ) -> Result<LoginResult> {
        let request = self.pending_request(auth_request_id, deadline).await?;
        let connector = self.connector(&request.connector_id, deadline).await?;
        let Some(password_connector) = connector.connector.as_password() else {
            return Err(Error::InvalidRequest(
                "connector does not support password login".into(),
            ));
        };
        let login = deadline
            .run(password_connector.login(
                &scopes::for_connector(&request.scopes),
                username,
                password,
            ))
            .await??;
        self.finish_login(request, login, deadline).await
    }

    /// Complete a login through an assertion connector.
    pub async fn assertion_login(
        &self,
        auth_request_id: &str,
        payload: &str,
        deadline: Deadline,
    ) -> Result<LoginResult> {
        let request = self.pending_request(auth_request_id, deadline).await?;
        let connector = self.connector(&request.connector_id, deadline).await?;
        let Some(assertion) = connector.connector.as_assertion() else {
            return Err(Error::InvalidRequest(
                "connector does not support assertion login".into(),
            ));
        };
        let login = deadline
            .run(assertion.handle_assertion(&scopes::for_connector(&request.scopes), payload))
            .await??;
        self.finish_login(request, login, deadline).await
    }

    /// Record the user's approval decision for a logged-in request.
    pub async fn approve(
        &self,
        auth_request_id: &str,
        approved: bool,
        deadline: Deadline,
    ) -> Result<LoginResult> {
        let request = self.load_request(auth_request_id, deadline).await?;
        if !request.logged_in {
            return Err(Error::InvalidRequest("login has not completed".into()));
        }

        if !approved {
            self.consume_request(&request, deadline).await?;
            info!(client_id = %request.client_id, "user denied authorization");
            let url = redirect_with(
                &request.redirect_uri,
                &[("error", "access_denied")],
                &request.state,
            )?;
            return Ok(LoginResult::Redirect { url });
        }
        self.issue_code(&request, deadline).await
    }

    async fn load_request(&self, id: &str, deadline: Deadline) -> Result<AuthRequest> {
        match deadline.run(self.storage().get_auth_request(id)).await? {
            Ok(request) => Ok(request),
            Err(storage::Error::NotFound(_)) => Err(Error::InvalidRequest(
                "unknown or expired authorization request".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// A request that has not completed its login yet.
    async fn pending_request(&self, id: &str, deadline: Deadline) -> Result<AuthRequest> {
        let request = self.load_request(id, deadline).await?;
        if request.logged_in {
            return Err(Error::InvalidRequest(
                "authorization request already completed".into(),
            ));
        }
        Ok(request)
    }

    async fn finish_login(
        &self,
        request: AuthRequest,
        login: Authenticated,
        deadline: Deadline,
    ) -> Result<LoginResult> {
        let Authenticated { identity, data } = login;
        let mark_logged_in: Updater<AuthRequest> = Box::new(move |mut req| {
            if req.logged_in {
                return Err(storage::Error::Rejected(
                    "authorization request already completed".into(),
                ));
            }
            req.logged_in = true;
            req.identity = Some(identity);
            req.connector_data = Some(data);
            Ok(req)
        });

        let completed = match deadline
            .run(self.storage().update_auth_request(&request.id, mark_logged_in))
            .await?
        {
            Ok(completed) => completed,
            Err(storage::Error::Rejected(_)) | Err(storage::Error::UpdateConflict(_)) => {
                warn!(client_id = %request.client_id, "duplicate login for authorization request");
                return Err(Error::InvalidRequest(
                    "authorization request already completed".into(),
                ));
            }
            Err(storage::Error::NotFound(_)) => {
                return Err(Error::InvalidRequest(
                    "unknown or expired authorization request".into(),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            client_id = %completed.client_id,
            connector_id = %completed.connector_id,
            "upstream login completed"
        );

        if self.config().skip_approval {
            return self.issue_code(&completed, deadline).await;
        }
        let client = self.client(&completed.client_id, deadline).await?;
        Ok(LoginResult::ApprovalRequired {
            auth_request_id: completed.id,
            client_name: client.name,
            scopes: completed.scopes,
        })
    }

    async fn issue_code(&self, request: &AuthRequest, deadline: Deadline) -> Result<LoginResult> {
        let Some(identity) = request.identity.clone() else {
            return Err(Error::InvalidRequest("login has not completed".into()));
        };
        self.consume_request(request, deadline).await?;
        let code = AuthCode {
            id: new_token(),
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            scopes: request.scopes.clone(),
            nonce: request.nonce.clone(),
            identity,
            connector_id: request.connector_id.clone(),
            connector_data: request.connector_data.clone().unwrap_or_default(),
            pkce: request.pkce.clone(),
            expiry: expiry_after(Utc::now(), self.config().auth_codes_valid_for),
        };
        deadline
            .run(self.storage().create_auth_code(code.clone()))
            .await??;
        info!(client_id = %code.client_id, "authorization code issued");

        let url = redirect_with(
            &code.redirect_uri,
            &[("code", code.id.as_str())],
            &request.state,
        )?;
        Ok(LoginResult::Redirect { url })
    }

    async fn consume_request(&self, request: &AuthRequest, deadline: Deadline) -> Result<()> {
        match deadline
            .run(self.storage().delete_auth_request(&request.id))
            .await?
        {
            Ok(()) => Ok(()),
            Err(storage::Error::NotFound(_)) => {
                warn!(client_id = %request.client_id, "authorization request consumed twice");
                Err(Error::InvalidRequest(
                    "authorization request already completed".into(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A peer named in an audience scope must exist and trust `client`.
    async fn check_peer(&self, client: &Client, peer_id: &str, deadline: Deadline) -> Result<()> {
        if peer_id == client.id {
            return Ok(());
        }
        let peer = match deadline.run(self.storage().get_client(peer_id)).await? {
            Ok(peer) => peer,
            Err(storage::Error::NotFound(_)) => {
                return Err(Error::InvalidScope(format!(
                    "unknown audience client {peer_id:?}"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        if !peer.trusted_peers.iter().any(|p| p == &client.id) {
            return Err(Error::InvalidScope(format!(
                "client {:?} is not a trusted peer of {peer_id:?}",
                client.id
            )));
        }
        Ok(())
    }

    /// The requested connector, or the only one configured.
    async fn login_connector(
        &self,
        requested: Option<&str>,
        deadline: Deadline,
    ) -> Result<ResolvedConnector> {
        let id = match requested {
            Some(id) => id.to_string(),
            None => {
                let configs = deadline.run(self.connectors().list()).await??;
                match configs.as_slice() {
                    [only] => only.id.clone(),
                    [] => return Err(Error::InvalidRequest("no connectors configured".into())),
                    _ => return Err(Error::InvalidRequest("connector_id is required".into())),
                }
            }
        };
        match deadline.run(self.connectors().get(&id)).await? {
            Ok(connector) => Ok(connector),
            Err(connector::Error::UnknownConnector(_)) => {
                Err(Error::InvalidRequest(format!("unknown connector {id:?}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn login_action(
        &self,
        connector: &ResolvedConnector,
        request: &AuthRequest,
    ) -> Result<LoginAction> {
        let scopes = scopes::for_connector(&request.scopes);
        let conn = &connector.connector;
        if let Some(callback) = conn.as_callback() {
            let url = callback.login_url(&scopes, &self.config().callback_url(), &request.id)?;
            return Ok(LoginAction::Redirect { url });
        }
        if let Some(password) = conn.as_password() {
            return Ok(LoginAction::PasswordPrompt {
                prompt: password.prompt().to_string(),
            });
        }
        if let Some(assertion) = conn.as_assertion() {
            let url = assertion.login_url(&scopes, &self.config().assertion_url(), &request.id)?;
            return Ok(LoginAction::AssertionPost { url });
        }
        Err(connector::Error::Unsupported(format!(
            "connector {:?} has no login capability",
            connector.id
        ))
        .into())
    }
}

/// Registered URIs match exactly. Public clients may also use loopback
/// URIs (RFC 8252 section 7.3). An omitted URI is allowed only when the
/// client registered exactly one.
fn resolve_redirect_uri(client: &Client, requested: Option<&str>) -> Result<String> {
    match requested {
        Some(uri) if client.redirect_uris.iter().any(|u| u == uri) => Ok(uri.to_string()),
        Some(uri) if client.public && is_loopback(uri) => Ok(uri.to_string()),
        Some(uri) => Err(Error::InvalidRedirectUri(format!(
            "{uri:?} is not registered for client {:?}",
            client.id
        ))),
        None => match client.redirect_uris.as_slice() {
            [only] => Ok(only.clone()),
            _ => Err(Error::InvalidRedirectUri("redirect_uri is required".into())),
        },
    }
}

fn is_loopback(uri: &str) -> bool {
    Url::parse(uri).is_ok_and(|url| {
        url.scheme() == "http" && matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"))
    })
}

fn parse_pkce(
    client: &Client,
    challenge: Option<String>,
    method: Option<&str>,
) -> Result<Option<PkceChallenge>> {
    let Some(challenge) = challenge.filter(|c| !c.is_empty()) else {
        if method.is_some() {
            return Err(Error::InvalidRequest(
                "code_challenge_method given without code_challenge".into(),
            ));
        }
        if client.public {
            return Err(Error::InvalidRequest(
                "public clients must use PKCE".into(),
            ));
        }
        return Ok(None);
    };
    let method = match method {
        None => PkceMethod::Plain,
        Some(m) => PkceMethod::parse(m).ok_or_else(|| {
            Error::InvalidRequest(format!("unsupported code_challenge_method {m:?}"))
        })?,
    };
    Ok(Some(PkceChallenge { challenge, method }))
}

/// Append `params` and the client's `state` (if any) to `redirect_uri`.
fn redirect_with(redirect_uri: &str, params: &[(&str, &str)], state: &str) -> Result<String> {
    let mut url = Url::parse(redirect_uri)
        .map_err(|e| Error::InvalidRedirectUri(format!("{redirect_uri:?}: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in params {
            query.append_pair(key, value);
        }
        if !state.is_empty() {
            query.append_pair("state", state);
        }
    }
    Ok(url.into())
}
