//! Durable storage for session blobs and their profile metadata.
//!
//! Layout under the session directory, one pair per phone:
//!
//! | File | Contents |
//! |------|----------|
//! | `<phone>.session` | opaque blob from the client, mode `0600` |
//! | `<phone>.json`    | [`ProfileMetadata`] |
//!
//! File names are a pure function of the phone number, so the set of
//! persisted sessions is recovered by listing the directory.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::errors::SessionError;

pub const SESSION_EXT:  &str = "session";
pub const METADATA_EXT: &str = "json";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

// ─── Phone numbers ────────────────────────────────────────────────────────────

/// A phone number usable as a file stem: optional leading `+`, then 5–20
/// ASCII digits.
pub fn is_valid_phone(phone: &str) -> bool {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    (5..=20).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Reject anything [`is_valid_phone`] does not accept.
pub fn validate_phone(phone: &str) -> Result<(), SessionError> {
    if is_valid_phone(phone) {
        Ok(())
    } else {
        Err(SessionError::Validation(format!("malformed phone number {phone:?}")))
    }
}

/// `<phone>.session`
pub fn session_file_name(phone: &str) -> String {
    format!("{phone}.{SESSION_EXT}")
}

/// `<phone>.json`
pub fn metadata_file_name(phone: &str) -> String {
    format!("{phone}.{METADATA_EXT}")
}

/// Inverse of [`session_file_name`]; `None` for anything else.
pub fn phone_from_session_file(name: &str) -> Option<&str> {
    name.strip_suffix(SESSION_EXT)
        .and_then(|s| s.strip_suffix('.'))
        .filter(|p| is_valid_phone(p))
}

// ─── ProfileMetadata ──────────────────────────────────────────────────────────

/// Human-readable snapshot of an account, written next to its blob.
///
/// Field names are part of the on-disk format consumed by other tools.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    pub session_file:     String,
    pub phone:            String,
    pub app_id:           i32,
    pub app_hash:         String,
    pub sdk:              String,
    pub app_version:      String,
    pub device:           String,
    pub lang_pack:        String,
    pub system_lang_pack: String,
    pub username:         Option<String>,
    pub ipv6:             bool,
    pub first_name:       Option<String>,
    pub last_name:        Option<String>,
    /// Unix timestamp (seconds).
    pub register_time:    i64,
    pub sex:              Option<i32>,
    /// Unix timestamp (seconds).
    pub last_check_time:  i64,
    pub lang_code:        String,
    pub avatar:           String,
    pub proxy:            Option<String>,
    #[serde(rename = "twoFA")]
    pub two_fa:           String,
    pub block:            bool,
    pub system_lang_code: String,
    pub id:               i64,
}

// ─── PersistenceCodec ─────────────────────────────────────────────────────────

/// Reads and writes the per-phone file pair under one directory.
///
/// All methods block; async callers should run them on the blocking pool.
#[derive(Clone, Debug)]
pub struct PersistenceCodec {
    dir: PathBuf,
}

impl PersistenceCodec {
    /// Use `dir` as the session directory, creating it if absent.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            let mut b = fs::DirBuilder::new();
            b.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                b.mode(0o755);
            }
            b.create(&dir)?;
            tracing::info!("[persist] Created session directory {}", dir.display());
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn blob_path(&self, phone: &str) -> PathBuf {
        self.dir.join(session_file_name(phone))
    }

    pub fn metadata_path(&self, phone: &str) -> PathBuf {
        self.dir.join(metadata_file_name(phone))
    }

    /// Persist a blob and its metadata, blob first.
    ///
    /// Not atomic across the two files: if the metadata write fails the blob
    /// stays on disk and the error is returned. The pair is only durable once
    /// this returns `Ok`; [`PersistenceCodec::write_metadata`] can finish a
    /// half-written pair.
    pub fn write(&self, phone: &str, blob: &[u8], meta: &ProfileMetadata) -> Result<(), SessionError> {
        validate_phone(phone)?;
        write_file(&self.blob_path(phone), blob)?;
        self.write_metadata(phone, meta)
    }

    /// Write only the metadata half of the pair.
    pub fn write_metadata(&self, phone: &str, meta: &ProfileMetadata) -> Result<(), SessionError> {
        validate_phone(phone)?;
        let json = serde_json::to_vec_pretty(meta)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_file(&self.metadata_path(phone), &json)?;
        Ok(())
    }

    /// Read back the blob for `phone` verbatim.
    pub fn read_blob(&self, phone: &str) -> Result<Vec<u8>, SessionError> {
        validate_phone(phone)?;
        read_file(&self.blob_path(phone), phone)
    }

    pub fn read_metadata(&self, phone: &str) -> Result<ProfileMetadata, SessionError> {
        validate_phone(phone)?;
        let raw = read_file(&self.metadata_path(phone), phone)?;
        serde_json::from_slice(&raw)
            .map_err(|e| SessionError::Persistence(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    /// Phones that have a correctly named blob file in the directory.
    pub fn list_persisted_phones(&self) -> io::Result<BTreeSet<String>> {
        let mut phones = BTreeSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(phone) = name.to_str().and_then(phone_from_session_file) {
                phones.insert(phone.to_string());
            }
        }
        Ok(phones)
    }
}

fn read_file(path: &Path, phone: &str) -> Result<Vec<u8>, SessionError> {
    match fs::read(path) {
        Ok(b) => Ok(b),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SessionError::NotFound(
            format!("no persisted session for phone number {phone}"),
        )),
        Err(e) => Err(SessionError::Persistence(e)),
    }
}

/// Write `data` to a sibling temp file with owner-only permissions, then
/// rename it over `path`.
fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let n   = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_file_name(format!("{name}.{n}.tmp"));

    let result = (|| {
        let mut opts = fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut f = opts.open(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(io::Error::new(e.kind(), format!("writing {}: {e}", path.display())));
    }
    Ok(())
}
