//! The Telegram client as seen by the session manager.
//!
//! The wire protocol, key exchange and RPC schema live in the client library;
//! this crate only needs four capabilities from it, expressed by
//! [`Connector`] and [`SessionHandle`].

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::errors::ClientError;

// ─── Profile ──────────────────────────────────────────────────────────────────

/// The logged-in account, as returned by `users.getUsers([inputUserSelf])`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id:         i64,
    pub first_name: Option<String>,
    pub last_name:  Option<String>,
    pub username:   Option<String>,
    pub phone:      Option<String>,
}

impl Profile {
    /// Display name for log lines.
    pub fn display_name(&self) -> String {
        let first = self.first_name.as_deref().unwrap_or("");
        let last  = self.last_name.as_deref().unwrap_or("");
        let name  = format!("{first} {last}").trim().to_string();
        if !name.is_empty() {
            return name;
        }
        match &self.username {
            Some(u) => format!("@{u}"),
            None    => format!("user {}", self.id),
        }
    }
}

// ─── LoginToken ───────────────────────────────────────────────────────────────

/// Opaque token returned by [`SessionHandle::request_login_code`].
///
/// Pass to [`SessionHandle::sign_in`] together with the received code.
#[derive(Clone, Debug)]
pub struct LoginToken {
    pub phone:           String,
    pub phone_code_hash: String,
}

// ─── Connector ────────────────────────────────────────────────────────────────

/// Opens connections to Telegram.
pub trait Connector: Send + Sync + 'static {
    type Handle: SessionHandle;

    /// Open a fresh, unauthorized connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Handle, ClientError>> + Send;

    /// Rebuild a connection from a blob previously produced by
    /// [`SessionHandle::export_session`].
    fn restore(&self, blob: &[u8]) -> impl Future<Output = Result<Self::Handle, ClientError>> + Send;
}

// ─── SessionHandle ────────────────────────────────────────────────────────────

/// A live connection. Cheap to clone; clones share the same connection.
pub trait SessionHandle: Clone + Send + Sync + 'static {
    /// Ask Telegram to send a login code to `phone`.
    ///
    /// Returning `Ok` means the client is ready to accept the code.
    fn request_login_code(&self, phone: &str)
        -> impl Future<Output = Result<LoginToken, ClientError>> + Send;

    /// Complete sign-in with the code sent to the phone.
    fn sign_in(&self, token: &LoginToken, code: &str)
        -> impl Future<Output = Result<Profile, ClientError>> + Send;

    /// Fetch information about the logged-in user.
    fn get_me(&self) -> impl Future<Output = Result<Profile, ClientError>> + Send;

    /// Serialize the authorization so it can be restored later.
    fn export_session(&self) -> impl Future<Output = Result<Vec<u8>, ClientError>> + Send;
}
