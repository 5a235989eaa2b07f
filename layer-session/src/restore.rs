//! Startup restore of persisted sessions.
//!
//! Best effort: every phone is tried independently and any failure is
//! logged and reported, never propagated.

use std::io;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::client::{Connector, Profile, SessionHandle};
use crate::errors::{RestoreError, SessionError};
use crate::persist::{PersistenceCodec, validate_phone};
use crate::registry::SessionRegistry;

/// Outcome of one restore pass.
#[derive(Debug, Default)]
pub struct RestoreReport {
    /// Phones now in the registry, sorted.
    pub restored: Vec<String>,
    /// Phones that were left out, and why.
    pub skipped:  Vec<(String, RestoreError)>,
}

/// Rebuilds registry entries from the blobs in the session directory.
pub struct SessionRestorer<C: Connector> {
    connector: Arc<C>,
    codec:     PersistenceCodec,
    registry:  Arc<SessionRegistry<C::Handle>>,
}

impl<C: Connector> SessionRestorer<C> {
    pub fn new(connector: Arc<C>, codec: PersistenceCodec, registry: Arc<SessionRegistry<C::Handle>>) -> Self {
        Self { connector, codec, registry }
    }

    /// Restore every persisted phone that is not already registered.
    pub async fn run(&self) -> RestoreReport {
        let mut report = RestoreReport::default();

        let codec = self.codec.clone();
        let phones = match tokio::task::spawn_blocking(move || codec.list_persisted_phones()).await {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => {
                tracing::warn!("[restore] Cannot scan {}: {e}", self.codec.dir().display());
                return report;
            }
            Err(e) => {
                tracing::error!("[restore] Directory scan task failed: {e}");
                return report;
            }
        };
        if phones.is_empty() {
            tracing::info!("[restore] No persisted sessions in {}", self.codec.dir().display());
            return report;
        }
        tracing::info!("[restore] Found {} persisted session(s)", phones.len());

        let mut set = JoinSet::new();
        for phone in phones {
            if self.registry.contains(&phone) {
                report.skipped.push((phone, RestoreError::AlreadyActive));
                continue;
            }
            let connector = self.connector.clone();
            let codec     = self.codec.clone();
            set.spawn(async move {
                let result = restore_one(&*connector, codec, &phone).await;
                (phone, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (phone, result) = match joined {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!("[restore] Restore task panicked: {e}");
                    continue;
                }
            };
            let outcome = result.and_then(|(handle, me)| self.admit(&phone, handle).map(|()| me));
            match outcome {
                Ok(me) => {
                    tracing::info!("[restore] Restored {phone} ✓  ({})", me.display_name());
                    report.restored.push(phone);
                }
                Err(e) => {
                    tracing::warn!("[restore] Skipping {phone}: {e}");
                    report.skipped.push((phone, e));
                }
            }
        }

        report.restored.sort();
        report.skipped.sort_by(|a, b| a.0.cmp(&b.0));
        tracing::info!(
            "[restore] Restored {} session(s), skipped {}",
            report.restored.len(),
            report.skipped.len(),
        );
        report
    }

    /// Restore a single persisted phone on demand, e.g. after it was
    /// forgotten.
    ///
    /// `NotFound` if there is no blob for `phone`; every other failure is a
    /// [`SessionError::Restore`].
    pub async fn restore_phone(&self, phone: &str) -> Result<Profile, SessionError> {
        validate_phone(phone)?;
        let fail = |source: RestoreError| SessionError::Restore { phone: phone.to_string(), source };
        if self.registry.contains(phone) {
            return Err(fail(RestoreError::AlreadyActive));
        }

        let (handle, me) = match restore_one(&*self.connector, self.codec.clone(), phone).await {
            Ok(v) => v,
            Err(RestoreError::Read(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(format!(
                    "no persisted session for phone number {phone}"
                )));
            }
            Err(e) => return Err(fail(e)),
        };
        self.admit(phone, handle).map_err(fail)?;
        tracing::info!("[restore] Restored {phone} ✓  ({})", me.display_name());
        Ok(me)
    }

    fn admit(&self, phone: &str, handle: C::Handle) -> Result<(), RestoreError> {
        self.registry.insert(phone, handle).map_err(|_| RestoreError::AlreadyActive)
    }
}

async fn restore_one<C: Connector>(
    connector: &C,
    codec:     PersistenceCodec,
    phone:     &str,
) -> Result<(C::Handle, Profile), RestoreError> {
    let owned = phone.to_string();
    let blob = tokio::task::spawn_blocking(move || codec.read_blob(&owned))
        .await
        .map_err(|e| RestoreError::Read(io::Error::other(e)))?
        .map_err(|e| RestoreError::Read(into_io(e)))?;

    let handle = connector.restore(&blob).await.map_err(RestoreError::Decode)?;
    let me     = handle.get_me().await.map_err(RestoreError::Liveness)?;
    if let Some(found) = me.phone.as_deref() {
        if !same_number(phone, found) {
            return Err(RestoreError::PhoneMismatch { found: found.to_string() });
        }
    }
    Ok((handle, me))
}

/// Telegram reports phones as bare digits; file names may carry a `+`.
fn same_number(a: &str, b: &str) -> bool {
    a.trim_start_matches('+') == b.trim_start_matches('+')
}

fn into_io(e: SessionError) -> io::Error {
    match e {
        SessionError::Persistence(e) => e,
        SessionError::NotFound(s)    => io::Error::new(io::ErrorKind::NotFound, s),
        other                        => io::Error::other(other.to_string()),
    }
}
