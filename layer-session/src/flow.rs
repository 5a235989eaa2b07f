//! Per-phone login state machine.
//!
//! [`AuthFlowController::start_login`] spawns one background task per phone.
//! The task connects, asks Telegram for a login code and then waits for
//! whichever comes first:
//!
//! * the code, delivered by [`AuthFlowController::submit_code`];
//! * an error injected by [`AuthFlowController::cancel`] (or the flow being
//!   torn down, which closes the channel);
//! * the flow's deadline;
//! * controller shutdown.
//!
//! The HTTP request that submits the code and the task that consumes it only
//! meet through the flow's single-shot channels, which live in an
//! [`AuthFlowHandle`] keyed by phone number.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::{Connector, LoginToken, Profile, SessionHandle};
use crate::errors::{AuthFailure, ClientError, SessionError};
use crate::persist::validate_phone;
use crate::registry::{SessionRegistry, SessionState};

// ─── AuthFlowHandle ───────────────────────────────────────────────────────────

struct CodeSubmission {
    code:  String,
    reply: oneshot::Sender<Result<Profile, SessionError>>,
}

/// The live half of one login flow, owned by the controller.
///
/// Exists only while the flow has not reached a terminal state. Dropping it
/// closes both channels, which the background task treats as cancellation.
struct AuthFlowHandle {
    id:       u64,
    code_tx:  Option<oneshot::Sender<CodeSubmission>>,
    error_tx: Option<oneshot::Sender<AuthFailure>>,
    deadline: Instant,
    state:    watch::Sender<SessionState>,
}

impl AuthFlowHandle {
    fn advance(&self, next: SessionState) -> bool {
        let ok = self.state.borrow().can_advance_to(&next);
        if ok {
            self.state.send_replace(next);
        }
        ok
    }
}

// ─── FlowTicket / FlowInfo ────────────────────────────────────────────────────

/// Returned by [`AuthFlowController::start_login`].
#[derive(Debug)]
pub struct FlowTicket {
    pub phone:    String,
    /// When the flow gives up waiting for a code.
    pub deadline: Instant,
    /// Every state the flow passes through, including the final one.
    pub state:    watch::Receiver<SessionState>,
}

impl FlowTicket {
    /// Wait until the flow is `Authenticated` or `Failed`.
    pub async fn finished(&mut self) -> SessionState {
        if let Ok(s) = self.state.wait_for(SessionState::is_terminal).await {
            return s.clone();
        }
        self.state.borrow().clone()
    }
}

/// A flow that has not finished yet.
#[derive(Clone, Debug)]
pub struct FlowInfo {
    pub phone:    String,
    pub state:    SessionState,
    pub deadline: Instant,
}

// ─── AuthFlowController ───────────────────────────────────────────────────────

struct Inner<C: Connector> {
    connector: Arc<C>,
    registry:  Arc<SessionRegistry<C::Handle>>,
    flows:     Mutex<HashMap<String, AuthFlowHandle>>,
    timeout:   Duration,
    next_id:   AtomicU64,
    shutdown:  CancellationToken,
    tasks:     TaskTracker,
}

impl<C: Connector> Inner<C> {
    fn flows(&self) -> MutexGuard<'_, HashMap<String, AuthFlowHandle>> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, id: u64, phone: &str, next: SessionState) {
        if let Some(f) = self.flows().get(phone).filter(|f| f.id == id) {
            if f.advance(next.clone()) {
                tracing::debug!("[flow] {phone} → {next}");
            }
        }
    }

    /// Record the terminal state and destroy the handle.
    fn finish(&self, id: u64, phone: &str, last: SessionState) {
        let mut flows = self.flows();
        if flows.get(phone).is_some_and(|f| f.id == id) {
            if let Some(f) = flows.remove(phone) {
                f.advance(last);
            }
        }
    }

    fn fail(&self, id: u64, phone: &str, why: &AuthFailure) {
        tracing::warn!("[flow] Login for {phone} failed: {why}");
        self.finish(id, phone, SessionState::Failed(why.to_string()));
    }
}

/// Drives phone-number logins and hands finished sessions to the registry.
///
/// Cheap to clone; internally Arc-wrapped.
pub struct AuthFlowController<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for AuthFlowController<C> {
    fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl<C: Connector> AuthFlowController<C> {
    /// `timeout` is how long each flow waits for its code.
    pub fn new(connector: Arc<C>, registry: Arc<SessionRegistry<C::Handle>>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                registry,
                flows:    Mutex::new(HashMap::new()),
                timeout,
                next_id:  AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                tasks:    TaskTracker::new(),
            }),
        }
    }

    // ── Start ──────────────────────────────────────────────────────────────

    /// Begin a login for `phone`.
    ///
    /// Fails with `Conflict` if the phone already has a flow or a session.
    /// Returns once Telegram has sent the code (`CodeRequested`).
    pub async fn start_login(&self, phone: &str) -> Result<FlowTicket, SessionError> {
        validate_phone(phone)?;
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(AuthFailure::ShutDown.into());
        }

        let (code_tx, code_rx)   = oneshot::channel();
        let (error_tx, error_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Unauthenticated);
        let deadline = Instant::now() + inner.timeout;
        let id       = inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut flows = inner.flows();
            if inner.registry.contains(phone) {
                return Err(SessionError::conflict(phone, "session"));
            }
            if flows.contains_key(phone) {
                return Err(SessionError::conflict(phone, "login flow"));
            }
            flows.insert(phone.to_string(), AuthFlowHandle {
                id,
                code_tx:  Some(code_tx),
                error_tx: Some(error_tx),
                deadline,
                state:    state_tx,
            });
        }
        tracing::info!("[flow] Starting login for {phone}");

        let task = FlowTask {
            inner:  inner.clone(),
            id,
            phone:  phone.to_string(),
            cancel: inner.shutdown.child_token(),
            deadline,
        };
        inner.tasks.spawn(task.run(code_rx, error_rx, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(FlowTicket { phone: phone.to_string(), deadline, state: state_rx }),
            Ok(Err(e)) => Err(e),
            Err(_)     => Err(AuthFailure::Cancelled("login task ended unexpectedly".into()).into()),
        }
    }

    // ── Verify ─────────────────────────────────────────────────────────────

    /// Deliver the login code for `phone` and wait for the outcome.
    ///
    /// `NotFound` if no flow is live (never started, finished, or expired)
    /// or its code has not been requested yet; `Conflict` if a code was
    /// already submitted. A rejected code ends the
    /// flow; the caller must start a new login.
    pub async fn submit_code(&self, phone: &str, code: &str) -> Result<Profile, SessionError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(SessionError::Validation("empty login code".into()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut flows = self.inner.flows();
            let flow = flows.get_mut(phone).ok_or_else(|| SessionError::no_flow(phone))?;
            if *flow.state.borrow() == SessionState::Unauthenticated {
                return Err(SessionError::NotFound(format!(
                    "login code not requested yet for phone number {phone}"
                )));
            }
            let code_tx = flow.code_tx.take().ok_or_else(|| {
                SessionError::Conflict(format!("login code already submitted for phone number {phone}"))
            })?;
            if code_tx.send(CodeSubmission { code: code.to_string(), reply: reply_tx }).is_err() {
                // The task stopped listening (deadline or cancel) and is about
                // to drop the handle.
                return Err(SessionError::no_flow(phone));
            }
            flow.advance(SessionState::Verifying);
        }
        tracing::debug!("[flow] Code submitted for {phone}");

        // A dropped reply means the task never took the code: the deadline,
        // a cancel or shutdown won the race against this submission.
        reply_rx.await.unwrap_or_else(|_| Err(SessionError::no_flow(phone)))
    }

    // ── Cancel / inspect ───────────────────────────────────────────────────

    /// Abort the live flow for `phone`. Its task fails the flow with
    /// `AuthFailure::Cancelled(reason)`.
    pub fn cancel(&self, phone: &str, reason: &str) -> Result<(), SessionError> {
        let mut flows = self.inner.flows();
        let flow = flows.get_mut(phone).ok_or_else(|| SessionError::no_flow(phone))?;
        if let Some(tx) = flow.error_tx.take() {
            let _ = tx.send(AuthFailure::Cancelled(reason.to_string()));
        }
        tracing::info!("[flow] Cancelling login for {phone}: {reason}");
        Ok(())
    }

    /// Current state of `phone`: the live flow's state, else `Authenticated`
    /// if the registry holds it.
    pub fn state(&self, phone: &str) -> Result<SessionState, SessionError> {
        if let Some(f) = self.inner.flows().get(phone) {
            return Ok(f.state.borrow().clone());
        }
        if self.inner.registry.contains(phone) {
            return Ok(SessionState::Authenticated);
        }
        Err(SessionError::no_session(phone))
    }

    /// Flows that have not finished, ordered by phone number.
    pub fn live_flows(&self) -> Vec<FlowInfo> {
        let mut out: Vec<FlowInfo> = self
            .inner
            .flows()
            .iter()
            .map(|(phone, f)| FlowInfo {
                phone:    phone.clone(),
                state:    f.state.borrow().clone(),
                deadline: f.deadline,
            })
            .collect();
        out.sort_by(|a, b| a.phone.cmp(&b.phone));
        out
    }

    /// Fail every live flow and wait for their tasks to exit. New logins
    /// are refused afterwards.
    pub async fn shutdown(&self) {
        let live = self.inner.flows().len();
        if live > 0 {
            tracing::info!("[flow] Shutting down {live} login flow(s)");
        }
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

// ─── FlowTask ─────────────────────────────────────────────────────────────────

struct FlowTask<C: Connector> {
    inner:    Arc<Inner<C>>,
    id:       u64,
    phone:    String,
    cancel:   CancellationToken,
    deadline: Instant,
}

impl<C: Connector> FlowTask<C> {
    async fn run(
        self,
        code_rx:      oneshot::Receiver<CodeSubmission>,
        mut error_rx: oneshot::Receiver<AuthFailure>,
        ready_tx:     oneshot::Sender<Result<(), SessionError>>,
    ) {
        let (inner, id, phone) = (&self.inner, self.id, self.phone.as_str());

        // ── Connect and request the code ───────────────────────────────
        let requested = tokio::select! {
            r = self.request_code() => r.map_err(AuthFailure::Rejected),
            f = interrupted(&mut error_rx, &self.cancel) => Err(f),
        };
        let (handle, token) = match requested {
            Ok(v) => v,
            Err(f) => {
                inner.fail(id, phone, &f);
                let _ = ready_tx.send(Err(f.into()));
                return;
            }
        };
        inner.advance(id, phone, SessionState::CodeRequested);
        tracing::info!("[flow] Login code sent to {phone}");
        let _ = ready_tx.send(Ok(()));

        // ── Wait for the code ──────────────────────────────────────────
        let submission = tokio::select! {
            biased;
            r = code_rx => r.map_err(|_| AuthFailure::Cancelled("login flow was torn down".into())),
            f = interrupted(&mut error_rx, &self.cancel) => Err(f),
            _ = sleep_until(self.deadline) => Err(AuthFailure::Expired),
        };
        let CodeSubmission { code, reply } = match submission {
            Ok(s) => s,
            Err(f) => {
                inner.fail(id, phone, &f);
                return;
            }
        };

        // ── Sign in ────────────────────────────────────────────────────
        let signed_in = tokio::select! {
            r = handle.sign_in(&token, &code) => r.map_err(AuthFailure::Rejected),
            f = interrupted(&mut error_rx, &self.cancel) => Err(f),
        };
        let outcome = match signed_in {
            Ok(profile) => match inner.registry.insert(phone, handle) {
                Ok(()) => {
                    inner.finish(id, phone, SessionState::Authenticated);
                    tracing::info!("[flow] {phone} signed in ✓  ({})", profile.display_name());
                    Ok(profile)
                }
                Err(e) => {
                    tracing::warn!("[flow] Login for {phone} finished but {e}");
                    inner.finish(id, phone, SessionState::Failed(e.to_string()));
                    Err(e)
                }
            },
            Err(f) => {
                inner.fail(id, phone, &f);
                Err(f.into())
            }
        };
        let _ = reply.send(outcome);
    }

    async fn request_code(&self) -> Result<(C::Handle, LoginToken), ClientError> {
        let handle = self.inner.connector.connect().await?;
        let token  = handle.request_login_code(&self.phone).await?;
        Ok((handle, token))
    }
}

/// Resolves when the flow is cancelled from outside or the controller shuts down.
async fn interrupted(
    error_rx: &mut oneshot::Receiver<AuthFailure>,
    shutdown: &CancellationToken,
) -> AuthFailure {
    tokio::select! {
        r = error_rx => r.unwrap_or_else(|_| AuthFailure::Cancelled("login flow was torn down".into())),
        _ = shutdown.cancelled() => AuthFailure::ShutDown,
    }
}
