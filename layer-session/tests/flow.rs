use std::sync::Arc;
use std::time::Duration;

use layer_session::{
    AuthFailure, Config, LoopbackConnector, SessionError, SessionManager, SessionState,
};
use tempfile::TempDir;

const PHONE: &str = "+15550000";
const CODE:  &str = "54321";

fn manager(dir: &TempDir) -> SessionManager<LoopbackConnector> {
    manager_with(dir, LoopbackConnector::new().with_code(CODE), Duration::from_secs(300))
}

fn manager_with(dir: &TempDir, net: LoopbackConnector, timeout: Duration) -> SessionManager<LoopbackConnector> {
    let mut cfg = Config::new(12345, "0123456789abcdef", dir.path());
    cfg.login_timeout = timeout;
    SessionManager::new(cfg, net).unwrap()
}

// ── Happy path ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn login_then_verify_authenticates() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir);

    let mut ticket = m.login(PHONE).await.unwrap();
    assert_eq!(*ticket.state.borrow(), SessionState::CodeRequested);
    assert_eq!(m.state(PHONE).unwrap(), SessionState::CodeRequested);

    let me = m.verify(PHONE, CODE).await.unwrap();
    assert_eq!(me.phone.as_deref(), Some("15550000"));

    assert_eq!(ticket.finished().await, SessionState::Authenticated);
    assert_eq!(m.registry().get(PHONE).unwrap().state, SessionState::Authenticated);
    assert_eq!(m.state(PHONE).unwrap(), SessionState::Authenticated);
    assert!(m.flows().live_flows().is_empty());
}

#[tokio::test]
async fn code_is_trimmed() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir);
    m.login(PHONE).await.unwrap();
    m.verify(PHONE, " 54321\n").await.unwrap();
    assert!(m.registry().contains(PHONE));
}

#[tokio::test]
async fn unrelated_phones_log_in_concurrently() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir);

    let (a, b) = tokio::join!(m.login("+15550001"), m.login("+15550002"));
    a.unwrap();
    b.unwrap();
    let (a, b) = tokio::join!(m.verify("+15550001", CODE), m.verify("+15550002", CODE));
    assert_ne!(a.unwrap().id, b.unwrap().id);
    assert_eq!(m.registry().len(), 2);
}

// ── Conflicts ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn second_login_conflicts_while_flow_is_live() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir);

    let (first, second) = tokio::join!(m.login(PHONE), m.login(PHONE));
    let oks = [first.is_ok(), second.is_ok()];
    assert_eq!(oks.iter().filter(|ok| **ok).count(), 1);
    let err = if first.is_err() { first.unwrap_err() } else { second.unwrap_err() };
    assert!(matches!(err, SessionError::Conflict(_)));

    assert!(matches!(m.login(PHONE).await, Err(SessionError::Conflict(_))));
}

#[tokio::test]
async fn login_conflicts_with_authenticated_session() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir);
    m.login(PHONE).await.unwrap();
    m.verify(PHONE, CODE).await.unwrap();

    assert!(matches!(m.login(PHONE).await, Err(SessionError::Conflict(_))));

    // Explicit cleanup allows a fresh login.
    assert!(m.forget(PHONE).is_some());
    m.login(PHONE).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn second_code_while_verifying_conflicts() {
    let dir = TempDir::new().unwrap();
    let net = LoopbackConnector::new().with_code(CODE).with_latency(Duration::from_millis(200));
    let m = Arc::new(manager_with(&dir, net, Duration::from_secs(300)));
    m.login(PHONE).await.unwrap();

    let first = tokio::spawn({
        let m = m.clone();
        async move { m.verify(PHONE, CODE).await }
    });
    while m.state(PHONE).unwrap() != SessionState::Verifying {
        tokio::task::yield_now().await;
    }

    let err = m.verify(PHONE, CODE).await.unwrap_err();
    assert!(matches!(err, SessionError::Conflict(_)), "{err}");

    first.await.unwrap().unwrap();
    assert!(m.registry().contains(PHONE));
}

// ── Missing / expired flows ───────────────────────────────────────────────────

#[tokio::test]
async fn verify_without_flow_is_not_found() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir);
    for code in [CODE, "00000", "anything"] {
        assert!(matches!(m.verify(PHONE, code).await, Err(SessionError::NotFound(_))));
    }
}

#[tokio::test(start_paused = true)]
async fn code_is_refused_until_login_returns() {
    let dir = TempDir::new().unwrap();
    let net = LoopbackConnector::new().with_code(CODE).with_latency(Duration::from_millis(500));
    let m = Arc::new(manager_with(&dir, net, Duration::from_secs(300)));

    let login = tokio::spawn({
        let m = m.clone();
        async move { m.login(PHONE).await }
    });
    while m.state(PHONE).is_err() {
        tokio::task::yield_now().await;
    }
    assert_eq!(m.state(PHONE).unwrap(), SessionState::Unauthenticated);

    let err = m.verify(PHONE, CODE).await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)), "{err}");
    assert!(!m.registry().contains(PHONE));

    // The early attempt does not consume the flow.
    login.await.unwrap().unwrap();
    assert_eq!(m.state(PHONE).unwrap(), SessionState::CodeRequested);
    m.verify(PHONE, CODE).await.unwrap();
    assert!(m.registry().contains(PHONE));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn code_racing_the_deadline_is_accepted_or_not_found() {
    let dir = TempDir::new().unwrap();
    let m = manager_with(&dir, LoopbackConnector::new().with_code(CODE), Duration::from_millis(20));

    for i in 0..30 {
        let phone = format!("+1555000{i:02}");
        let ticket = m.login(&phone).await.unwrap();
        tokio::time::sleep_until(ticket.deadline).await;
        match m.verify(&phone, CODE).await {
            Ok(_) => assert!(m.registry().contains(&phone)),
            Err(SessionError::NotFound(_)) => assert!(!m.registry().contains(&phone)),
            Err(e) => panic!("{phone}: unexpected {e}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_fails_the_flow() {
    let dir = TempDir::new().unwrap();
    let m = manager_with(&dir, LoopbackConnector::new().with_code(CODE), Duration::from_secs(120));

    let mut ticket = m.login(PHONE).await.unwrap();
    let last = ticket.finished().await;
    assert!(matches!(last, SessionState::Failed(_)), "{last:?}");
    assert!(tokio::time::Instant::now() >= ticket.deadline);

    assert!(matches!(m.verify(PHONE, CODE).await, Err(SessionError::NotFound(_))));
    assert!(matches!(m.state(PHONE), Err(SessionError::NotFound(_))));
    assert!(!m.registry().contains(PHONE));
}

// ── Failures ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_code_is_terminal() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir);
    let mut ticket = m.login(PHONE).await.unwrap();

    let err = m.verify(PHONE, "11111").await.unwrap_err();
    assert!(err.is_unauthorized(), "{err}");
    assert!(matches!(ticket.finished().await, SessionState::Failed(_)));
    assert!(!m.registry().contains(PHONE));

    assert!(matches!(m.verify(PHONE, CODE).await, Err(SessionError::NotFound(_))));

    // A new flow starts from scratch.
    m.login(PHONE).await.unwrap();
    m.verify(PHONE, CODE).await.unwrap();
}

#[tokio::test]
async fn empty_code_is_rejected_without_consuming_the_flow() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir);
    m.login(PHONE).await.unwrap();
    assert!(matches!(m.verify(PHONE, "  ").await, Err(SessionError::Validation(_))));
    m.verify(PHONE, CODE).await.unwrap();
}

#[tokio::test]
async fn malformed_phone_is_rejected() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir);
    assert!(matches!(m.login("not-a-phone").await, Err(SessionError::Validation(_))));
    assert!(matches!(m.login("../../x").await, Err(SessionError::Validation(_))));
}

#[tokio::test]
async fn cancel_tears_the_flow_down() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir);
    let mut ticket = m.login(PHONE).await.unwrap();

    m.cancel(PHONE).unwrap();
    match ticket.finished().await {
        SessionState::Failed(reason) => assert!(reason.contains("cancelled"), "{reason}"),
        other => panic!("unexpected state {other:?}"),
    }
    assert!(matches!(m.verify(PHONE, CODE).await, Err(SessionError::NotFound(_))));
    assert!(matches!(m.cancel(PHONE), Err(SessionError::NotFound(_))));
}

#[tokio::test]
async fn shutdown_fails_pending_flows_and_refuses_new_ones() {
    let dir = TempDir::new().unwrap();
    let m = manager(&dir);
    let mut ticket = m.login(PHONE).await.unwrap();

    m.shutdown().await;
    assert!(matches!(ticket.finished().await, SessionState::Failed(_)));
    assert!(m.flows().live_flows().is_empty());
    assert!(matches!(
        m.login("+15550009").await,
        Err(SessionError::Auth(AuthFailure::ShutDown))
    ));
}
