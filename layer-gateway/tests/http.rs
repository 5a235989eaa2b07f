use std::fs;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use layer_gateway::{SessionsResponse, VerifyResponse, router};
use layer_session::{Config, LoopbackConnector, SessionManager};
use tempfile::TempDir;
use tower::ServiceExt;

const PHONE: &str = "+15550000";
const CODE:  &str = "54321";

fn app(dir: &TempDir) -> Router {
    let manager = SessionManager::new(
        Config::new(12345, "0123456789abcdef", dir.path()),
        LoopbackConnector::new().with_code(CODE),
    ).unwrap();
    router(Arc::new(manager))
}

fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
    let res    = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes  = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn log_in(app: &Router, phone: &str) {
    let (s, _) = send(app, post("/login", serde_json::json!({ "phone_number": phone }))).await;
    assert_eq!(s, StatusCode::OK);
    let (s, body) = send(app, post("/verify", serde_json::json!({ "phone_number": phone, "code": CODE }))).await;
    assert_eq!(s, StatusCode::OK, "{body}");
}

// ── Full sequence ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn login_verify_backup() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir);

    let (s, body) = send(&app, post("/login", serde_json::json!({ "phone_number": PHONE }))).await;
    assert_eq!(s, StatusCode::OK);
    assert_eq!(body, "Verification code sent to phone number +15550000");

    let (s, body) = send(&app, post("/verify", serde_json::json!({ "phone_number": PHONE, "code": CODE }))).await;
    assert_eq!(s, StatusCode::OK, "{body}");
    let verified: VerifyResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(verified.phone, PHONE);

    let (s, body) = send(&app, get("/backup?phone=%2B15550000")).await;
    assert_eq!(s, StatusCode::OK, "{body}");
    assert!(body.contains("+15550000.session") && body.contains("+15550000.json"), "{body}");

    assert!(dir.path().join("+15550000.session").is_file());
    let json: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.path().join("+15550000.json")).unwrap()).unwrap();
    assert_eq!(json["phone"], PHONE);
    assert_eq!(json["id"], verified.profile.id);
}

#[tokio::test]
async fn unencoded_plus_in_backup_query() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir);
    log_in(&app, PHONE).await;

    let (s, body) = send(&app, get("/backup?phone=+15550000")).await;
    assert_eq!(s, StatusCode::OK, "{body}");
    assert!(dir.path().join("+15550000.json").is_file());
}

// ── Error statuses ────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_login_is_conflict() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir);
    let body = serde_json::json!({ "phone_number": PHONE });

    assert_eq!(send(&app, post("/login", body.clone())).await.0, StatusCode::OK);
    let (s, msg) = send(&app, post("/login", body)).await;
    assert_eq!(s, StatusCode::CONFLICT);
    assert!(msg.contains(PHONE), "{msg}");
}

#[tokio::test]
async fn verify_without_login_is_not_found() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir);
    let (s, _) = send(&app, post("/verify", serde_json::json!({ "phone_number": PHONE, "code": CODE }))).await;
    assert_eq!(s, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn wrong_code_is_unauthorized() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir);
    send(&app, post("/login", serde_json::json!({ "phone_number": PHONE }))).await;

    let (s, _) = send(&app, post("/verify", serde_json::json!({ "phone_number": PHONE, "code": "11111" }))).await;
    assert_eq!(s, StatusCode::UNAUTHORIZED);

    // The flow is gone; backup has nothing to write.
    assert_eq!(send(&app, get("/backup?phone=%2B15550000")).await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir);

    let no_field = post("/login", serde_json::json!({ "phone": PHONE }));
    assert_eq!(send(&app, no_field).await.0, StatusCode::BAD_REQUEST);

    let not_json = Request::post("/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{"))
        .unwrap();
    assert_eq!(send(&app, not_json).await.0, StatusCode::BAD_REQUEST);

    let bad_phone = post("/login", serde_json::json!({ "phone_number": "abc" }));
    assert_eq!(send(&app, bad_phone).await.0, StatusCode::BAD_REQUEST);

    assert_eq!(send(&app, get("/backup")).await.0, StatusCode::BAD_REQUEST);
    assert_eq!(send(&app, get("/backup?phone=../etc")).await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn backup_of_unknown_phone_is_not_found() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir);
    assert_eq!(send(&app, get("/backup?phone=%2B15550000")).await.0, StatusCode::NOT_FOUND);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

// ── Cancel / logout / listing ─────────────────────────────────────────────────

#[tokio::test]
async fn cancel_then_login_again() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir);
    let body = serde_json::json!({ "phone_number": PHONE });

    send(&app, post("/login", body.clone())).await;
    assert_eq!(send(&app, post("/cancel", body.clone())).await.0, StatusCode::OK);

    // The flow's task tears itself down asynchronously.
    let mut status = StatusCode::CONFLICT;
    for _ in 0..100 {
        status = send(&app, post("/login", body.clone())).await.0;
        if status != StatusCode::CONFLICT {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn logout_drops_the_session() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir);
    let body = serde_json::json!({ "phone_number": PHONE });
    log_in(&app, PHONE).await;

    assert_eq!(send(&app, post("/logout", body.clone())).await.0, StatusCode::OK);
    assert_eq!(send(&app, post("/logout", body.clone())).await.0, StatusCode::NOT_FOUND);
    assert_eq!(send(&app, post("/login", body)).await.0, StatusCode::OK);
}

#[tokio::test]
async fn sessions_lists_registry_and_pending_logins() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir);
    log_in(&app, "+15550001").await;
    send(&app, post("/login", serde_json::json!({ "phone_number": "+15550002" }))).await;

    let (s, body) = send(&app, get("/sessions")).await;
    assert_eq!(s, StatusCode::OK);
    let list: SessionsResponse = serde_json::from_str(&body).unwrap();

    assert_eq!(list.sessions.len(), 1);
    assert_eq!(list.sessions[0].phone, "+15550001");
    assert_eq!(list.sessions[0].state, "authenticated");

    assert_eq!(list.pending_logins.len(), 1);
    assert_eq!(list.pending_logins[0].phone, "+15550002");
    assert_eq!(list.pending_logins[0].state, "code requested");
    assert!(list.pending_logins[0].expires_in_secs > 0);
}

#[tokio::test]
async fn restore_after_logout() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir);
    let body = serde_json::json!({ "phone_number": PHONE });
    log_in(&app, PHONE).await;

    // Nothing backed up yet.
    send(&app, post("/logout", body.clone())).await;
    assert_eq!(send(&app, post("/restore", body.clone())).await.0, StatusCode::NOT_FOUND);

    log_in(&app, PHONE).await;
    assert_eq!(send(&app, get("/backup?phone=%2B15550000")).await.0, StatusCode::OK);
    assert_eq!(send(&app, post("/logout", body.clone())).await.0, StatusCode::OK);

    let (s, text) = send(&app, post("/restore", body.clone())).await;
    assert_eq!(s, StatusCode::OK, "{text}");
    let restored: VerifyResponse = serde_json::from_str(&text).unwrap();
    assert_eq!(restored.profile.phone.as_deref(), Some("15550000"));

    assert_eq!(send(&app, post("/restore", body)).await.0, StatusCode::CONFLICT);
}
