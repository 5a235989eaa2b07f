//! In-process stand-in for the Telegram network.
//!
//! [`LoopbackConnector`] implements [`Connector`] without opening a socket.
//! Login codes are written to the log instead of being delivered to a phone,
//! and session blobs use a small binary layout:
//!
//! ```text
//! magic "LYSS" | version u8 | home_dc_id i32 | user_id i64 | phone_len u8 | phone | auth_key [u8; 256]
//! ```
//!
//! It backs the gateway binary when no real transport is linked in and every
//! test in this workspace.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::client::{Connector, LoginToken, Profile, SessionHandle};
use crate::errors::{ClientError, RpcError};

const BLOB_MAGIC:   &[u8; 4] = b"LYSS";
const BLOB_VERSION: u8       = 1;
const HOME_DC_ID:   i32      = 2;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn random_bytes<const N: usize>() -> Result<[u8; N], ClientError> {
    let mut b = [0u8; N];
    getrandom::getrandom(&mut b).map_err(|e| ClientError::Io(io::Error::other(e.to_string())))?;
    Ok(b)
}

fn rpc(code: i32, name: &str) -> ClientError {
    ClientError::Rpc(RpcError::from_telegram(code, name))
}

// ─── Account ──────────────────────────────────────────────────────────────────

struct Account {
    user_id:   i64,
    auth_keys: Vec<[u8; 256]>,
    pending:   Option<PendingCode>,
}

struct PendingCode {
    phone_code_hash: String,
    code:            String,
}

impl Account {
    fn new(phone: &str) -> Self {
        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        let tail = digits
            .get(digits.len().saturating_sub(9)..)
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        Self { user_id: 5_000_000_000 + tail, auth_keys: Vec::new(), pending: None }
    }

    fn profile(&self, phone: &str) -> Profile {
        let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
        let suffix = digits.get(digits.len().saturating_sub(4)..).unwrap_or_default();
        Profile {
            id:         self.user_id,
            first_name: Some("User".to_string()),
            last_name:  Some(suffix.to_string()),
            username:   None,
            phone:      Some(digits),
        }
    }
}

// ─── LoopbackConnector ────────────────────────────────────────────────────────

struct Network {
    fixed_code: Option<String>,
    latency:    Option<Duration>,
    accounts:   Mutex<HashMap<String, Account>>,
    revoked:    Mutex<HashSet<String>>,
}

impl Network {
    async fn round_trip(&self) {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
    }

    fn issue_code(&self) -> Result<String, ClientError> {
        if let Some(code) = &self.fixed_code {
            return Ok(code.clone());
        }
        let n = u32::from_le_bytes(random_bytes::<4>()?) % 100_000;
        Ok(format!("{n:05}"))
    }
}

/// A [`Connector`] that talks to an in-memory fake of Telegram.
///
/// Cheap to clone; clones share the same fake network.
#[derive(Clone)]
pub struct LoopbackConnector {
    net: Arc<Network>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self {
            net: Arc::new(Network {
                fixed_code: None,
                latency:    None,
                accounts:   Mutex::new(HashMap::new()),
                revoked:    Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Issue `code` for every login instead of a random 5-digit one.
    pub fn with_code(self, code: impl Into<String>) -> Self {
        self.reconfigure(|n| n.fixed_code = Some(code.into()))
    }

    /// Delay every simulated network call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.reconfigure(|n| n.latency = Some(latency))
    }

    fn reconfigure(self, f: impl FnOnce(&mut Network)) -> Self {
        let mut net = match Arc::try_unwrap(self.net) {
            Ok(net) => net,
            Err(shared) => Network {
                fixed_code: shared.fixed_code.clone(),
                latency:    shared.latency,
                accounts:   Mutex::new(HashMap::new()),
                revoked:    Mutex::new(HashSet::new()),
            },
        };
        f(&mut net);
        Self { net: Arc::new(net) }
    }

    /// Invalidate every authorization of `phone`, as if it was terminated
    /// from another device. Restored blobs for it will fail the liveness check.
    pub fn revoke(&self, phone: &str) {
        if let Some(acc) = lock(&self.net.accounts).get_mut(phone) {
            acc.auth_keys.clear();
        }
        lock(&self.net.revoked).insert(phone.to_string());
    }
}

impl Default for LoopbackConnector {
    fn default() -> Self { Self::new() }
}

impl Connector for LoopbackConnector {
    type Handle = LoopbackHandle;

    async fn connect(&self) -> Result<LoopbackHandle, ClientError> {
        self.net.round_trip().await;
        Ok(LoopbackHandle {
            net:   self.net.clone(),
            state: Arc::new(Mutex::new(HandleState {
                auth_key: random_bytes::<256>()?,
                phone:    None,
            })),
        })
    }

    async fn restore(&self, blob: &[u8]) -> Result<LoopbackHandle, ClientError> {
        let decoded = decode_blob(blob)?;
        self.net.round_trip().await;

        // The fake network has no memory across restarts; adopt the account
        // described by the blob unless it was explicitly revoked.
        if !lock(&self.net.revoked).contains(&decoded.phone) {
            let mut accounts = lock(&self.net.accounts);
            let acc = accounts.entry(decoded.phone.clone()).or_insert_with(|| Account {
                user_id:   decoded.user_id,
                auth_keys: Vec::new(),
                pending:   None,
            });
            if !acc.auth_keys.contains(&decoded.auth_key) {
                acc.auth_keys.push(decoded.auth_key);
            }
        }

        Ok(LoopbackHandle {
            net:   self.net.clone(),
            state: Arc::new(Mutex::new(HandleState {
                auth_key: decoded.auth_key,
                phone:    Some(decoded.phone),
            })),
        })
    }
}

// ─── LoopbackHandle ───────────────────────────────────────────────────────────

struct HandleState {
    auth_key: [u8; 256],
    /// Set once the key is bound to an account.
    phone:    Option<String>,
}

/// A connection to the loopback network.
#[derive(Clone)]
pub struct LoopbackHandle {
    net:   Arc<Network>,
    state: Arc<Mutex<HandleState>>,
}

impl LoopbackHandle {
    fn authorized(&self) -> Result<(String, [u8; 256]), ClientError> {
        let st = lock(&self.state);
        let phone = st.phone.clone().ok_or_else(|| rpc(401, "AUTH_KEY_UNREGISTERED"))?;
        let registered = lock(&self.net.accounts)
            .get(&phone)
            .is_some_and(|acc| acc.auth_keys.contains(&st.auth_key));
        if !registered {
            return Err(rpc(401, "AUTH_KEY_UNREGISTERED"));
        }
        Ok((phone, st.auth_key))
    }
}

impl SessionHandle for LoopbackHandle {
    async fn request_login_code(&self, phone: &str) -> Result<LoginToken, ClientError> {
        self.net.round_trip().await;
        let code = self.net.issue_code()?;
        let hash: String = random_bytes::<8>()?.iter().map(|b| format!("{b:02x}")).collect();

        lock(&self.net.revoked).remove(phone);
        lock(&self.net.accounts)
            .entry(phone.to_string())
            .or_insert_with(|| Account::new(phone))
            .pending = Some(PendingCode { phone_code_hash: hash.clone(), code: code.clone() });

        tracing::info!("[loopback] Login code for {phone}: {code}");
        Ok(LoginToken { phone: phone.to_string(), phone_code_hash: hash })
    }

    async fn sign_in(&self, token: &LoginToken, code: &str) -> Result<Profile, ClientError> {
        self.net.round_trip().await;
        let key = lock(&self.state).auth_key;

        let profile = {
            let mut accounts = lock(&self.net.accounts);
            let acc = accounts
                .get_mut(&token.phone)
                .ok_or_else(|| rpc(400, "PHONE_NUMBER_UNOCCUPIED"))?;
            let pending = acc.pending.as_ref().ok_or_else(|| rpc(400, "PHONE_CODE_EXPIRED"))?;
            if pending.phone_code_hash != token.phone_code_hash {
                return Err(rpc(400, "PHONE_CODE_EXPIRED"));
            }
            if pending.code != code.trim() {
                return Err(rpc(400, "PHONE_CODE_INVALID"));
            }
            acc.pending = None;
            acc.auth_keys.push(key);
            acc.profile(&token.phone)
        };

        lock(&self.state).phone = Some(token.phone.clone());
        tracing::debug!("[loopback] {} signed in", token.phone);
        Ok(profile)
    }

    async fn get_me(&self) -> Result<Profile, ClientError> {
        self.net.round_trip().await;
        let (phone, _) = self.authorized()?;
        lock(&self.net.accounts)
            .get(&phone)
            .map(|acc| acc.profile(&phone))
            .ok_or_else(|| rpc(401, "AUTH_KEY_UNREGISTERED"))
    }

    async fn export_session(&self) -> Result<Vec<u8>, ClientError> {
        let (phone, auth_key) = self.authorized()?;
        let user_id = lock(&self.net.accounts)
            .get(&phone)
            .map(|acc| acc.user_id)
            .ok_or_else(|| rpc(401, "AUTH_KEY_UNREGISTERED"))?;
        Ok(encode_blob(&BlobContents { user_id, phone, auth_key }))
    }
}

// ─── Blob layout ──────────────────────────────────────────────────────────────

struct BlobContents {
    user_id:  i64,
    phone:    String,
    auth_key: [u8; 256],
}

fn encode_blob(c: &BlobContents) -> Vec<u8> {
    let mut b = Vec::with_capacity(4 + 1 + 4 + 8 + 1 + c.phone.len() + 256);
    b.extend_from_slice(BLOB_MAGIC);
    b.push(BLOB_VERSION);
    b.extend_from_slice(&HOME_DC_ID.to_le_bytes());
    b.extend_from_slice(&c.user_id.to_le_bytes());
    let pb = c.phone.as_bytes();
    b.push(pb.len() as u8);
    b.extend_from_slice(pb);
    b.extend_from_slice(&c.auth_key);
    b
}

fn decode_blob(buf: &[u8]) -> Result<BlobContents, ClientError> {
    let mut p = 0usize;
    macro_rules! r {
        ($n:expr) => {{
            if p + $n > buf.len() {
                return Err(ClientError::InvalidSession("truncated session".into()));
            }
            let s = &buf[p..p + $n];
            p += $n;
            s
        }};
    }
    macro_rules! arr {
        ($n:expr) => {{
            let mut a = [0u8; $n];
            a.copy_from_slice(r!($n));
            a
        }};
    }

    if r!(4) != BLOB_MAGIC {
        return Err(ClientError::InvalidSession("not a layer session".into()));
    }
    let version = r!(1)[0];
    if version != BLOB_VERSION {
        return Err(ClientError::InvalidSession(format!("unsupported version {version}")));
    }
    let _home_dc_id = i32::from_le_bytes(arr!(4));
    let user_id     = i64::from_le_bytes(arr!(8));
    let pl          = r!(1)[0] as usize;
    let phone       = String::from_utf8(r!(pl).to_vec())
        .map_err(|_| ClientError::InvalidSession("phone is not UTF-8".into()))?;
    let auth_key    = arr!(256);
    if p != buf.len() {
        return Err(ClientError::InvalidSession("trailing bytes".into()));
    }
    Ok(BlobContents { user_id, phone, auth_key })
}
