//! Error types for layer-session.
//!
//! Two layers: [`ClientError`] is what the Telegram client reports for a
//! single network call, [`SessionError`] is what the session manager reports
//! to its callers.

use std::{fmt, io};

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by Telegram's servers in response to an RPC call.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code:  i32,
    /// Error name in SCREAMING_SNAKE_CASE with digits removed.
    pub name:  String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw Telegram error message like `"FLOOD_WAIT_30"` into an `RpcError`.
    pub fn from_telegram(code: i32, message: &str) -> Self {
        if let Some((name, suffix)) = message.rsplit_once('_') {
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    return Self { code, name: name.to_string(), value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// - `err.is("PHONE_CODE_*")`: starts-with match
    /// - `err.is("*_UNREGISTERED")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }
}

// ─── ClientError ──────────────────────────────────────────────────────────────

/// The error type returned by every [`crate::client`] call.
#[derive(Debug)]
pub enum ClientError {
    /// Telegram rejected the request.
    Rpc(RpcError),
    /// Network / I/O failure.
    Io(io::Error),
    /// A persisted session blob could not be decoded.
    InvalidSession(String),
    /// The connection was dropped before the call completed.
    Dropped,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)            => write!(f, "{e}"),
            Self::Io(e)             => write!(f, "I/O error: {e}"),
            Self::InvalidSession(s) => write!(f, "invalid session: {s}"),
            Self::Dropped           => write!(f, "connection dropped"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rpc(e) => Some(e),
            Self::Io(e)  => Some(e),
            _            => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<RpcError> for ClientError {
    fn from(e: RpcError) -> Self { Self::Rpc(e) }
}

impl ClientError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _            => false,
        }
    }

    /// Returns `true` if Telegram refused the credentials rather than the
    /// call failing for a transport reason.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Rpc(e) => e.code == 401 || e.is("PHONE_CODE_*") || e.is("AUTH_KEY_*"),
            _            => false,
        }
    }
}

// ─── AuthFailure ──────────────────────────────────────────────────────────────

/// Why a login flow ended without an authenticated session.
#[derive(Debug)]
pub enum AuthFailure {
    /// The client rejected the code or the login call failed.
    Rejected(ClientError),
    /// No code arrived before the flow's deadline.
    Expired,
    /// The flow was torn down from outside (e.g. `/cancel`).
    Cancelled(String),
    /// The controller is shutting down.
    ShutDown,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(e)  => write!(f, "{e}"),
            Self::Expired      => write!(f, "login code was not submitted before the deadline"),
            Self::Cancelled(r) => write!(f, "login cancelled: {r}"),
            Self::ShutDown     => write!(f, "session manager is shutting down"),
        }
    }
}

// ─── RestoreError ─────────────────────────────────────────────────────────────

/// Why a single persisted session could not be brought back at startup.
#[derive(Debug)]
pub enum RestoreError {
    /// The blob file could not be read.
    Read(io::Error),
    /// The client refused to rebuild a handle from the blob.
    Decode(ClientError),
    /// The rebuilt handle failed the liveness check (`get_me`).
    Liveness(ClientError),
    /// The blob belongs to a different account than its file name says.
    PhoneMismatch { found: String },
    /// The phone already has a live session.
    AlreadyActive,
}

impl fmt::Display for RestoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(e)                 => write!(f, "cannot read session blob: {e}"),
            Self::Decode(e)               => write!(f, "cannot decode session blob: {e}"),
            Self::Liveness(e)             => write!(f, "session is not usable: {e}"),
            Self::PhoneMismatch { found } => write!(f, "session belongs to phone number {found}"),
            Self::AlreadyActive           => write!(f, "session already active"),
        }
    }
}

impl std::error::Error for RestoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read(e)     => Some(e),
            Self::Decode(e)   => Some(e),
            Self::Liveness(e) => Some(e),
            Self::PhoneMismatch { .. } | Self::AlreadyActive => None,
        }
    }
}

// ─── SessionError ─────────────────────────────────────────────────────────────

/// The error type returned from every [`crate::SessionManager`] operation.
#[derive(Debug)]
pub enum SessionError {
    /// Malformed input (bad phone number, bad request body).
    Validation(String),
    /// A login flow, code submission or session already exists for the phone.
    Conflict(String),
    /// Unknown phone, or no live login flow for it.
    NotFound(String),
    /// The login flow failed.
    Auth(AuthFailure),
    /// A durable read or write failed.
    Persistence(io::Error),
    /// A persisted session could not be restored.
    Restore { phone: String, source: RestoreError },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(s)            => write!(f, "invalid request: {s}"),
            Self::Conflict(s)              => write!(f, "{s}"),
            Self::NotFound(s)              => write!(f, "{s}"),
            Self::Auth(e)                  => write!(f, "authentication failed: {e}"),
            Self::Persistence(e)           => write!(f, "storage error: {e}"),
            Self::Restore { phone, source } => write!(f, "cannot restore {phone}: {source}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Persistence(e)         => Some(e),
            Self::Restore { source, .. } => Some(source),
            Self::Auth(AuthFailure::Rejected(e)) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self { Self::Persistence(e) }
}

impl From<AuthFailure> for SessionError {
    fn from(e: AuthFailure) -> Self { Self::Auth(e) }
}

impl SessionError {
    pub(crate) fn conflict(phone: &str, what: &str) -> Self {
        Self::Conflict(format!("{what} already active for phone number {phone}"))
    }

    pub(crate) fn no_flow(phone: &str) -> Self {
        Self::NotFound(format!("no login flow in progress for phone number {phone}"))
    }

    pub(crate) fn no_session(phone: &str) -> Self {
        Self::NotFound(format!("session not found for phone number {phone}"))
    }

    /// Returns `true` if the failure means the supplied credentials were
    /// refused (wrong code, revoked key) rather than a server-side problem.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Auth(AuthFailure::Rejected(e)) if e.is_unauthorized())
    }
}
