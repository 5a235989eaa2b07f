//! HTTP surface of the session manager.
//!
//! | Route | Method | Body / query | Success |
//! |-------|--------|--------------|---------|
//! | `/login`    | POST | `{phone_number}`       | code sent |
//! | `/verify`   | POST | `{phone_number, code}` | signed-in profile (JSON) |
//! | `/backup`   | GET  | `?phone=`              | `.session` + `.json` written |
//! | `/cancel`   | POST | `{phone_number}`       | pending login aborted |
//! | `/logout`   | POST | `{phone_number}`       | session dropped from memory |
//! | `/restore`  | POST | `{phone_number}`       | backed-up session loaded again |
//! | `/sessions` | GET  |                        | sessions and pending logins (JSON) |
//!
//! Errors are returned as plain text with the status from [`ApiError`].

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use layer_session::{AuthFailure, Connector, Profile, RestoreError, SessionError, SessionManager};

type Manager<C> = Arc<SessionManager<C>>;

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build the router. `manager` should already be restored.
pub fn router<C: Connector>(manager: Manager<C>) -> Router {
    Router::new()
        .route("/login",    post(login::<C>))
        .route("/verify",   post(verify::<C>))
        .route("/backup",   get(backup::<C>))
        .route("/cancel",   post(cancel::<C>))
        .route("/logout",   post(logout::<C>))
        .route("/restore",  post(restore::<C>))
        .route("/sessions", get(sessions::<C>))
        .with_state(manager)
}

// ─── ApiError ─────────────────────────────────────────────────────────────────

/// Anything a handler can fail with.
#[derive(Debug)]
pub enum ApiError {
    Session(SessionError),
    /// The request gave up waiting for the login outcome.
    Timeout(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Session(e) => match e {
                SessionError::Validation(_)  => StatusCode::BAD_REQUEST,
                SessionError::Conflict(_)    => StatusCode::CONFLICT,
                SessionError::NotFound(_)    => StatusCode::NOT_FOUND,
                SessionError::Auth(AuthFailure::ShutDown) => StatusCode::SERVICE_UNAVAILABLE,
                SessionError::Auth(_) if e.is_unauthorized() => StatusCode::UNAUTHORIZED,
                SessionError::Restore { source: RestoreError::AlreadyActive, .. } => StatusCode::CONFLICT,
                SessionError::Auth(_)
                | SessionError::Persistence(_)
                | SessionError::Restore { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self { Self::Session(e) }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self { Self::Session(SessionError::Validation(e.body_text())) }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self { Self::Session(SessionError::Validation(e.body_text())) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Session(e) => e.to_string(),
            Self::Timeout(s) => s.clone(),
        };
        if status.is_server_error() {
            tracing::error!("[gateway] {status}: {body}");
        } else {
            tracing::debug!("[gateway] {status}: {body}");
        }
        (status, body).into_response()
    }
}

// ─── Request / response bodies ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PhoneRequest {
    pub phone_number: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub phone_number: String,
    pub code:         String,
}

#[derive(Debug, Deserialize)]
pub struct PhoneQuery {
    pub phone: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub phone:   String,
    pub profile: Profile,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionView {
    pub phone:      String,
    pub state:      String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingLoginView {
    pub phone:           String,
    pub state:           String,
    pub expires_in_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions:       Vec<SessionView>,
    pub pending_logins: Vec<PendingLoginView>,
}

/// An unencoded `+` in a query string decodes to a space; put it back.
pub fn normalize_query_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    if raw.starts_with(' ') && !trimmed.is_empty() && !trimmed.starts_with('+') {
        format!("+{trimmed}")
    } else {
        trimmed.to_string()
    }
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

async fn login<C: Connector>(
    State(m): State<Manager<C>>,
    body:     Result<Json<PhoneRequest>, JsonRejection>,
) -> Result<String, ApiError> {
    let Json(req) = body?;
    let ticket = m.login(req.phone_number.trim()).await?;
    Ok(format!("Verification code sent to phone number {}", ticket.phone))
}

async fn verify<C: Connector>(
    State(m): State<Manager<C>>,
    body:     Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let Json(req) = body?;
    let phone = req.phone_number.trim().to_string();

    let limit = m.config().verify_timeout;
    let profile = match tokio::time::timeout(limit, m.verify(&phone, &req.code)).await {
        Ok(r)  => r?,
        Err(_) => {
            return Err(ApiError::Timeout(format!(
                "login for phone number {phone} did not finish within {}s", limit.as_secs()
            )));
        }
    };
    tracing::info!("[gateway] Login verified for {phone}");
    Ok(Json(VerifyResponse { phone, profile }))
}

async fn backup<C: Connector>(
    State(m): State<Manager<C>>,
    query:    Result<Query<PhoneQuery>, QueryRejection>,
) -> Result<String, ApiError> {
    let Query(q) = query?;
    let phone  = normalize_query_phone(&q.phone);
    let report = m.backup(&phone).await?;
    Ok(format!("Session backed up to {} and {}", report.session_file, report.metadata_file))
}

async fn cancel<C: Connector>(
    State(m): State<Manager<C>>,
    body:     Result<Json<PhoneRequest>, JsonRejection>,
) -> Result<String, ApiError> {
    let Json(req) = body?;
    let phone = req.phone_number.trim();
    m.cancel(phone)?;
    Ok(format!("Login cancelled for phone number {phone}"))
}

async fn logout<C: Connector>(
    State(m): State<Manager<C>>,
    body:     Result<Json<PhoneRequest>, JsonRejection>,
) -> Result<String, ApiError> {
    let Json(req) = body?;
    let phone = req.phone_number.trim();
    m.forget(phone).ok_or_else(|| {
        ApiError::Session(SessionError::NotFound(format!("session not found for phone number {phone}")))
    })?;
    Ok(format!("Session dropped for phone number {phone}"))
}

async fn restore<C: Connector>(
    State(m): State<Manager<C>>,
    body:     Result<Json<PhoneRequest>, JsonRejection>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let Json(req) = body?;
    let phone   = req.phone_number.trim().to_string();
    let profile = m.restore_phone(&phone).await?;
    Ok(Json(VerifyResponse { phone, profile }))
}

async fn sessions<C: Connector>(State(m): State<Manager<C>>) -> Json<SessionsResponse> {
    let now = tokio::time::Instant::now();
    let sessions = m
        .sessions()
        .into_iter()
        .map(|e| SessionView {
            phone:      e.phone,
            state:      e.state.to_string(),
            created_at: e.created_at,
            updated_at: e.updated_at,
        })
        .collect();
    let pending_logins = m
        .flows()
        .live_flows()
        .into_iter()
        .map(|f| PendingLoginView {
            phone:           f.phone,
            state:           f.state.to_string(),
            expires_in_secs: f.deadline.saturating_duration_since(now).as_secs(),
        })
        .collect();
    Json(SessionsResponse { sessions, pending_logins })
}
