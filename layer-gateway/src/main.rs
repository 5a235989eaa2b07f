//! layer-gateway — HTTP front end for layer-session.
//!
//! Configure through the environment (or a `.env` file):
//!
//!   APP_ID=12345 APP_HASH=... SESSION_DIR=./sessions cargo run -p layer-gateway
//!
//! Optional: LISTEN_ADDR, LOGIN_TIMEOUT_SECS, VERIFY_TIMEOUT_SECS, LOGIN_CODE.

use std::sync::Arc;

use layer_session::{Config, LoopbackConnector, SessionManager};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    // Enable logging: RUST_LOG=layer_session=debug,layer_gateway=debug cargo run
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "layer_session=info,layer_gateway=info"); }
    }
    env_logger::init();

    if let Err(e) = run().await {
        eprintln!("✗ {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let addr   = config.listen_addr;

    let mut connector = LoopbackConnector::new();
    if let Some(code) = &config.login_code {
        connector = connector.with_code(code.as_str());
    }

    let manager = Arc::new(SessionManager::new(config, connector)?);
    tracing::info!("[gateway] Session directory: {}", manager.codec().dir().display());

    let report = manager.restore().await;
    tracing::info!(
        "[gateway] Restored {} session(s), skipped {}",
        report.restored.len(), report.skipped.len()
    );
    for (phone, why) in &report.skipped {
        tracing::warn!("[gateway] Not restored {phone}: {why}");
    }

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("[gateway] Listening on {} ✓", listener.local_addr()?);

    let app = layer_gateway::router(manager.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let manager = manager.clone();
            async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("[gateway] Cannot listen for Ctrl+C: {e}");
                    std::future::pending::<()>().await;
                }
                tracing::info!("[gateway] Shutting down …");
                manager.shutdown().await;
            }
        })
        .await?;

    tracing::info!("[gateway] Stopped");
    Ok(())
}
