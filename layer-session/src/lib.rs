//! # layer-session
//!
//! Multi-account session manager for Telegram user accounts.
//!
//! ## Features
//! - Phone-number login: request code → submit code → authorized session
//! - At most one login flow and one session per phone, enforced under
//!   concurrent requests
//! - Login deadlines, force-cancel and clean shutdown of pending flows
//! - Backups: opaque session blob + JSON profile document per phone
//! - Best-effort restore of every backed-up session at startup
//!
//! The Telegram client itself is pluggable through [`Connector`];
//! [`LoopbackConnector`] is an in-process implementation for tests and
//! local runs.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use layer_session::{Config, LoopbackConnector, SessionManager};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config  = Config::from_env()?;
//! let manager = SessionManager::new(config, LoopbackConnector::new())?;
//! manager.restore().await;
//!
//! manager.login("+15550000").await?;
//! let me = manager.verify("+15550000", "54321").await?;
//! println!("signed in as {}", me.display_name());
//! manager.backup("+15550000").await?;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod errors;
pub mod backup;
pub mod client;
pub mod config;
pub mod flow;
pub mod loopback;
pub mod persist;
pub mod registry;
pub mod restore;

pub use backup::BackupReport;
pub use client::{Connector, LoginToken, Profile, SessionHandle};
pub use config::{Config, ConfigError, DeviceConfig};
pub use errors::{AuthFailure, ClientError, RestoreError, RpcError, SessionError};
pub use flow::{AuthFlowController, FlowInfo, FlowTicket};
pub use loopback::{LoopbackConnector, LoopbackHandle};
pub use persist::{PersistenceCodec, ProfileMetadata};
pub use registry::{SessionEntry, SessionRegistry, SessionState};
pub use restore::{RestoreReport, SessionRestorer};

use std::io;
use std::sync::Arc;

// ─── SessionManager ───────────────────────────────────────────────────────────

/// Ties the registry, the login flows and the session directory together.
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct SessionManager<C: Connector> {
    pub(crate) config:    Arc<Config>,
    pub(crate) connector: Arc<C>,
    pub(crate) registry:  Arc<SessionRegistry<C::Handle>>,
    pub(crate) flows:     AuthFlowController<C>,
    pub(crate) codec:     PersistenceCodec,
}

impl<C: Connector> SessionManager<C> {
    /// Open (creating if needed) the session directory and set up an empty
    /// registry. Call [`SessionManager::restore`] before serving requests.
    pub fn new(config: Config, connector: C) -> io::Result<Self> {
        let codec     = PersistenceCodec::open(&config.session_dir)?;
        let connector = Arc::new(connector);
        let registry  = Arc::new(SessionRegistry::new());
        let flows     = AuthFlowController::new(connector.clone(), registry.clone(), config.login_timeout);
        Ok(Self { config: Arc::new(config), connector, registry, flows, codec })
    }

    pub fn config(&self) -> &Config { &self.config }

    pub fn registry(&self) -> &SessionRegistry<C::Handle> { &self.registry }

    pub fn flows(&self) -> &AuthFlowController<C> { &self.flows }

    pub fn codec(&self) -> &PersistenceCodec { &self.codec }

    // ── Login ──────────────────────────────────────────────────────────────

    /// Start a login for `phone`; see [`AuthFlowController::start_login`].
    pub async fn login(&self, phone: &str) -> Result<FlowTicket, SessionError> {
        self.flows.start_login(phone).await
    }

    /// Submit the login code; see [`AuthFlowController::submit_code`].
    pub async fn verify(&self, phone: &str, code: &str) -> Result<Profile, SessionError> {
        self.flows.submit_code(phone, code).await
    }

    /// Abort a pending login.
    pub fn cancel(&self, phone: &str) -> Result<(), SessionError> {
        self.flows.cancel(phone, "cancelled by request")
    }

    pub fn state(&self, phone: &str) -> Result<SessionState, SessionError> {
        self.flows.state(phone)
    }

    /// Every registered session, ordered by phone.
    pub fn sessions(&self) -> Vec<SessionEntry<C::Handle>> {
        self.registry.snapshot()
    }

    /// Forget the session for `phone`. Persisted files are left alone.
    pub fn forget(&self, phone: &str) -> Option<SessionEntry<C::Handle>> {
        self.registry.remove(phone)
    }

    // ── Startup / shutdown ─────────────────────────────────────────────────

    /// Load every persisted session into the registry.
    pub async fn restore(&self) -> RestoreReport {
        SessionRestorer::new(self.connector.clone(), self.codec.clone(), self.registry.clone())
            .run()
            .await
    }

    /// Bring back one persisted session, e.g. after [`SessionManager::forget`].
    ///
    /// `Conflict` while a login for `phone` is in progress.
    pub async fn restore_phone(&self, phone: &str) -> Result<Profile, SessionError> {
        if matches!(self.flows.state(phone), Ok(s) if s != SessionState::Authenticated) {
            return Err(SessionError::conflict(phone, "login flow"));
        }
        SessionRestorer::new(self.connector.clone(), self.codec.clone(), self.registry.clone())
            .restore_phone(phone)
            .await
    }

    /// Fail all pending logins and wait for their tasks.
    pub async fn shutdown(&self) {
        self.flows.shutdown().await;
    }
}
