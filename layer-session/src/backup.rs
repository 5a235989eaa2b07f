//! Session backups: the client's blob plus a readable profile document.

use chrono::Utc;

use crate::client::{Connector, Profile, SessionHandle};
use crate::config::Config;
use crate::errors::{AuthFailure, SessionError};
use crate::persist::{ProfileMetadata, metadata_file_name, session_file_name, validate_phone};
use crate::SessionManager;

const DEFAULT_AVATAR: &str = "img/default.png";

/// What [`SessionManager::backup`] wrote.
#[derive(Clone, Debug)]
pub struct BackupReport {
    pub phone:         String,
    pub session_file:  String,
    pub metadata_file: String,
    pub profile:       Profile,
}

/// Metadata document for `phone`, timestamped `now` (Unix seconds).
///
/// `register_time` is kept from an earlier backup when one exists.
pub fn build_metadata(
    config:        &Config,
    phone:         &str,
    me:            &Profile,
    register_time: Option<i64>,
    now:           i64,
) -> ProfileMetadata {
    let d = &config.device;
    ProfileMetadata {
        session_file:     session_file_name(phone),
        phone:            phone.to_string(),
        app_id:           config.api_id,
        app_hash:         config.api_hash.clone(),
        sdk:              d.system_version.clone(),
        app_version:      d.app_version.clone(),
        device:           d.device_model.clone(),
        lang_pack:        d.lang_pack.clone(),
        system_lang_pack: d.system_lang_code.clone(),
        username:         me.username.clone(),
        ipv6:             false,
        first_name:       me.first_name.clone(),
        last_name:        me.last_name.clone(),
        register_time:    register_time.unwrap_or(now),
        sex:              None,
        last_check_time:  now,
        lang_code:        d.lang_code.clone(),
        avatar:           DEFAULT_AVATAR.to_string(),
        proxy:            None,
        two_fa:           String::new(),
        block:            false,
        system_lang_code: d.system_lang_code.clone(),
        id:               me.id,
    }
}

impl<C: Connector> SessionManager<C> {
    /// Write `<phone>.session` and `<phone>.json` for a registered session.
    ///
    /// The registry is left untouched if anything fails; on success only the
    /// entry's `updated_at` moves.
    pub async fn backup(&self, phone: &str) -> Result<BackupReport, SessionError> {
        validate_phone(phone)?;
        let entry = self.registry.get(phone)?;

        let blob = entry.handle.export_session().await
            .map_err(|e| SessionError::Auth(AuthFailure::Rejected(e)))?;
        let me = entry.handle.get_me().await
            .map_err(|e| SessionError::Auth(AuthFailure::Rejected(e)))?;

        let codec  = self.codec.clone();
        let config = self.config.clone();
        let owned  = phone.to_string();
        let prof   = me.clone();
        tokio::task::spawn_blocking(move || {
            let previous = codec.read_metadata(&owned).ok().map(|m| m.register_time);
            let meta = build_metadata(&config, &owned, &prof, previous, Utc::now().timestamp());
            codec.write(&owned, &blob, &meta)
        })
        .await
        .map_err(|e| SessionError::Persistence(std::io::Error::other(e)))??;

        self.registry.touch(phone);
        tracing::info!("[backup] {phone} backed up ✓");
        Ok(BackupReport {
            phone:         phone.to_string(),
            session_file:  session_file_name(phone),
            metadata_file: metadata_file_name(phone),
            profile:       me,
        })
    }
}
