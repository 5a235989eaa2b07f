//! Concurrency-safe map from phone number to an authorized connection.
//!
//! The map is split into [`SHARDS`] independently locked shards chosen by a
//! hash of the phone number, so requests for unrelated phones almost never
//! wait on each other. No lock is ever held across an `.await`.

use std::collections::HashMap;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::errors::SessionError;

const SHARDS: usize = 16;

// ─── SessionState ─────────────────────────────────────────────────────────────

/// Lifecycle of one phone's login.
///
/// Moves forward only: `Unauthenticated → CodeRequested → Verifying →
/// Authenticated`. `Failed` can be reached from any non-terminal state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    CodeRequested,
    Verifying,
    Authenticated,
    Failed(String),
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            Self::Unauthenticated => 0,
            Self::CodeRequested   => 1,
            Self::Verifying       => 2,
            Self::Authenticated   => 3,
            Self::Failed(_)       => 4,
        }
    }

    /// `true` for `Authenticated` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Failed(_))
    }

    /// Whether moving from `self` to `next` respects the state machine.
    pub fn can_advance_to(&self, next: &SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed(_) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::CodeRequested   => write!(f, "code requested"),
            Self::Verifying       => write!(f, "verifying"),
            Self::Authenticated   => write!(f, "authenticated"),
            Self::Failed(r)       => write!(f, "failed: {r}"),
        }
    }
}

// ─── SessionEntry ─────────────────────────────────────────────────────────────

/// One authorized phone and its connection.
#[derive(Clone, Debug)]
pub struct SessionEntry<H> {
    pub phone:      String,
    pub handle:     H,
    pub state:      SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── SessionRegistry ──────────────────────────────────────────────────────────

/// Holds at most one [`SessionEntry`] per phone number.
pub struct SessionRegistry<H> {
    shards: Vec<Mutex<HashMap<String, SessionEntry<H>>>>,
}

impl<H: Clone> SessionRegistry<H> {
    pub fn new() -> Self {
        Self { shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect() }
    }

    fn shard(&self, phone: &str) -> MutexGuard<'_, HashMap<String, SessionEntry<H>>> {
        let mut h = DefaultHasher::new();
        phone.hash(&mut h);
        let idx = (h.finish() as usize) % self.shards.len();
        self.shards[idx].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the session for `phone`.
    pub fn get(&self, phone: &str) -> Result<SessionEntry<H>, SessionError> {
        self.shard(phone)
            .get(phone)
            .cloned()
            .ok_or_else(|| SessionError::no_session(phone))
    }

    pub fn contains(&self, phone: &str) -> bool {
        self.shard(phone).contains_key(phone)
    }

    /// Register an authorized connection for `phone`.
    ///
    /// Never replaces an existing entry: a second login for the same phone
    /// gets [`SessionError::Conflict`].
    pub fn insert(&self, phone: &str, handle: H) -> Result<(), SessionError> {
        let mut shard = self.shard(phone);
        match shard.entry(phone.to_string()) {
            Entry::Occupied(_) => Err(SessionError::conflict(phone, "session")),
            Entry::Vacant(slot) => {
                let now = Utc::now();
                slot.insert(SessionEntry {
                    phone:      phone.to_string(),
                    handle,
                    state:      SessionState::Authenticated,
                    created_at: now,
                    updated_at: now,
                });
                Ok(())
            }
        }
    }

    /// Drop the session for `phone`, returning it if there was one.
    pub fn remove(&self, phone: &str) -> Option<SessionEntry<H>> {
        self.shard(phone).remove(phone)
    }

    /// Bump `updated_at` for `phone`. Returns `false` if it is not registered.
    pub fn touch(&self, phone: &str) -> bool {
        match self.shard(phone).get_mut(phone) {
            Some(e) => { e.updated_at = Utc::now(); true }
            None    => false,
        }
    }

    /// Every entry, ordered by phone number.
    ///
    /// Shards are locked one at a time, so the result is not a single atomic
    /// cut across concurrent inserts.
    pub fn snapshot(&self) -> Vec<SessionEntry<H>> {
        let mut all: Vec<SessionEntry<H>> = self
            .shards
            .iter()
            .flat_map(|s| {
                let guard = s.lock().unwrap_or_else(PoisonError::into_inner);
                guard.values().cloned().collect::<Vec<_>>()
            })
            .collect();
        all.sort_by(|a, b| a.phone.cmp(&b.phone));
        all
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl<H: Clone> Default for SessionRegistry<H> {
    fn default() -> Self { Self::new() }
}
