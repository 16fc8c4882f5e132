//! HTTP routes
//!
//! Thin adapters from axum extractors onto `oidc::Server` operations. Every
//! request gets its own `Deadline` from `web.request_timeout_secs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Form, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::{Deadline, Secret};
use metrics_exporter_prometheus::PrometheusHandle;
use percent_encoding::percent_decode_str;
use oidc::{
    AuthorizeParams, ClientCredentials, LoginAction, LoginResult, Server, TokenForm,
};
use serde::Deserialize;
use tracing::warn;

use crate::error::ApiError;
use crate::metrics;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub server: Arc<Server>,
    pub prometheus: PrometheusHandle,
    pub request_timeout: Duration,
    pub started_at: Instant,
}

impl AppState {
    fn deadline(&self) -> Deadline {
        Deadline::after(self.request_timeout)
    }
}

/// Build the axum router with all routes and shared state.
///
/// Routes live under the issuer's path (`prefix`, empty for a root issuer).
/// A concurrency limit layer caps in-flight requests at `max_connections`.
pub fn build_router(state: AppState, prefix: &str, max_connections: usize) -> Router {
    let routes = Router::new()
        .route("/authorize", get(authorize))
        .route("/callback", get(callback))
        .route("/callback/assertion", post(assertion_callback))
        .route("/callback/{id}/password", post(password_login))
        .route("/approval", post(approval))
        .route("/token", post(token))
        .route("/keys", get(jwks))
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn(metrics::track));

    let router = if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(prefix, routes)
    };
    router
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn login_result(result: LoginResult) -> Response {
    match result {
        LoginResult::Redirect { url } => Redirect::to(&url).into_response(),
        approval @ LoginResult::ApprovalRequired { .. } => Json(approval).into_response(),
    }
}

async fn authorize(
    State(state): State<AppState>,
    Query(params): Query<AuthorizeParams>,
) -> Result<Response, ApiError> {
    let started = state.server.authorize(params, state.deadline()).await?;
    if let LoginAction::Redirect { url } = &started.action {
        return Ok(Redirect::to(url).into_response());
    }
    // Password and assertion logins continue on the client's own page.
    Ok(Json(started).into_response())
}

async fn callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let result = state
        .server
        .handle_callback(&params, state.deadline())
        .await?;
    Ok(login_result(result))
}

#[derive(Deserialize)]
struct PasswordForm {
    login: String,
    password: String,
}

async fn password_login(
    State(state): State<AppState>,
    Path(auth_request_id): Path<String>,
    Form(form): Form<PasswordForm>,
) -> Result<Response, ApiError> {
    let password = Secret::new(form.password);
    let result = state
        .server
        .password_login(
            &auth_request_id,
            &form.login,
            password.expose(),
            state.deadline(),
        )
        .await?;
    Ok(login_result(result))
}

#[derive(Deserialize)]
struct AssertionForm {
    state: String,
    assertion: String,
}

async fn assertion_callback(
    State(state): State<AppState>,
    Form(form): Form<AssertionForm>,
) -> Result<Response, ApiError> {
    let result = state
        .server
        .assertion_login(&form.state, &form.assertion, state.deadline())
        .await?;
    Ok(login_result(result))
}

#[derive(Deserialize)]
struct ApprovalForm {
    req: String,
    approval: String,
}

async fn approval(
    State(state): State<AppState>,
    Form(form): Form<ApprovalForm>,
) -> Result<Response, ApiError> {
    let approved = form.approval == "approve";
    let result = state
        .server
        .approve(&form.req, approved, state.deadline())
        .await?;
    Ok(login_result(result))
}

/// Undo the `application/x-www-form-urlencoded` encoding RFC 6749 section
/// 2.3.1 applies to Basic credentials.
fn form_decode(component: &str) -> Option<String> {
    percent_decode_str(&component.replace('+', " "))
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// Credentials from an `Authorization: Basic` header (`client_secret_basic`).
fn basic_credentials(headers: &HeaderMap) -> Result<Option<ClientCredentials>, oidc::Error> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let malformed = || oidc::Error::InvalidClient("malformed Authorization header".into());
    let encoded = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Basic "))
        .ok_or_else(malformed)?;
    let decoded = STANDARD.decode(encoded.trim()).map_err(|_| malformed())?;
    let decoded = Secret::new(String::from_utf8(decoded).map_err(|_| malformed())?);
    let (client_id, secret) = decoded.expose().split_once(':').ok_or_else(malformed)?;
    Ok(Some(ClientCredentials {
        client_id: form_decode(client_id).ok_or_else(malformed)?,
        client_secret: Some(Secret::new(form_decode(secret).ok_or_else(malformed)?)),
    }))
}

async fn token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Result<Response, ApiError> {
    let (grant, form_credentials) = form.into_parts()?;
    let credentials = match basic_credentials(&headers)? {
        Some(credentials) => credentials,
        None => form_credentials.ok_or_else(|| {
            oidc::Error::InvalidClient("client authentication required".into())
        })?,
    };
    let tokens = state
        .server
        .token(credentials, grant, state.deadline())
        .await?;
    Ok((
        [(header::CACHE_CONTROL, "no-store"), (header::PRAGMA, "no-cache")],
        Json(tokens),
    )
        .into_response())
}

async fn jwks(State(state): State<AppState>) -> Result<Response, ApiError> {
    let keys = state
        .server
        .keys()
        .jwks()
        .await
        .map_err(oidc::Error::from)?;
    Ok((
        [(header::CACHE_CONTROL, "max-age=60, must-revalidate")],
        Json(keys),
    )
        .into_response())
}

async fn discovery(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.server.discovery())
}

/// Liveness plus a count of published keys. Reports 503 until the first
/// signing key is available or while the key set cannot be read.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let keys = match state.server.keys().jwks().await {
        Ok(set) => set.keys.len(),
        Err(e) => {
            warn!(error = %e, "key set unavailable for health check");
            0
        }
    };
    let status = if keys > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if keys > 0 { "healthy" } else { "starting" },
        "issuer": state.server.config().issuer,
        "published_keys": keys,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus text exposition of all recorded metrics.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
