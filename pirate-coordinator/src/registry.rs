//! In-memory session registry.
//!
//! Many concurrent HTTP/WS handlers touch one session at a time, so each
//! session's mutable record lives behind a `std::sync::Mutex` the way the
//! teacher's `SharedState` guards its fields — the single-owner,
//! lock-free actor style used by the client's Sync Kernel doesn't fit
//! here, since there is no one task that owns a session end to end.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use pirate_common::clock::Clock;
use pirate_common::config::SyncConfig;
use pirate_common::domain::{Session, Track};
use pirate_common::wire::{encode, SyncMessage, WireEnvelope};

use crate::error::CoordinatorError;

const BROADCAST_CAPACITY: usize = 256;
const NONCE_HISTORY: usize = 256;

/// Everything a session needs beyond the plain [`Session`] record: the
/// outbound broadcast channel every connected socket relays from, the
/// timers that touch it, and bookkeeping for idempotent queue adds.
pub struct SessionHandle {
    pub session: Mutex<Session>,
    pub clock: Arc<dyn Clock>,
    pub config: SyncConfig,
    broadcast_tx: broadcast::Sender<String>,
    known_tracks: Mutex<HashMap<String, Track>>,
    seen_nonces: Mutex<VecDeque<String>>,
    connected_members: Mutex<HashSet<String>>,
    last_client_seq: AtomicU64,
    pub(crate) advancement_generation: AtomicU64,
    pub(crate) advancement_timer: Mutex<Option<JoinHandle<()>>>,
    pub(crate) grace_timer: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    fn new(session: Session, clock: Arc<dyn Clock>, config: SyncConfig) -> Arc<Self> {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            session: Mutex::new(session),
            clock,
            config,
            broadcast_tx,
            known_tracks: Mutex::new(HashMap::new()),
            seen_nonces: Mutex::new(VecDeque::new()),
            connected_members: Mutex::new(HashSet::new()),
            last_client_seq: AtomicU64::new(0),
            advancement_generation: AtomicU64::new(0),
            advancement_timer: Mutex::new(None),
            grace_timer: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.broadcast_tx.subscribe()
    }

    /// Stamp and fan out a coordinator-authored message: epoch/seq/
    /// timestamp always reflect the coordinator's own view, per the state
    /// broadcast target rule.
    pub fn broadcast(&self, message: SyncMessage, epoch: u64, seq: u64) {
        let envelope = WireEnvelope { message, epoch, seq, timestamp_ms: self.clock.now_ms() };
        let _ = self.broadcast_tx.send(encode(&envelope));
    }

    pub fn remember_track(&self, track: Track) {
        self.known_tracks.lock().unwrap().insert(track.id.clone(), track);
    }

    pub fn known_track(&self, track_id: &str) -> Option<Track> {
        self.known_tracks.lock().unwrap().get(track_id).cloned()
    }

    /// Returns `true` the first time a nonce is seen, `false` on replay.
    pub fn accept_nonce(&self, nonce: String) -> bool {
        let mut seen = self.seen_nonces.lock().unwrap();
        if seen.contains(&nonce) {
            return false;
        }
        if seen.len() >= NONCE_HISTORY {
            seen.pop_front();
        }
        seen.push_back(nonce);
        true
    }

    pub fn mark_connected(&self, user_id: &str) {
        self.connected_members.lock().unwrap().insert(user_id.to_string());
    }

    /// Removes the member from the connected set; returns the number of
    /// members still connected afterward.
    pub fn mark_disconnected(&self, user_id: &str) -> usize {
        let mut connected = self.connected_members.lock().unwrap();
        connected.remove(user_id);
        connected.len()
    }

    pub fn connected_count(&self) -> usize {
        self.connected_members.lock().unwrap().len()
    }

    pub fn connected_members(&self) -> HashSet<String> {
        self.connected_members.lock().unwrap().clone()
    }

    /// Accepts a client-assigned sequence number (used for the
    /// `playPrepare`/`playCommit` "seq accepted if strictly increasing"
    /// ingress rule) iff it's strictly greater than the last one this
    /// session has seen. Tracked separately from `Session::sequence`,
    /// which is the coordinator's own outbound counter.
    pub fn accept_client_sequence(&self, seq: u64) -> bool {
        let mut last = self.last_client_seq.load(Ordering::Acquire);
        loop {
            if seq <= last {
                return false;
            }
            match self.last_client_seq.compare_exchange_weak(
                last,
                seq,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => last = observed,
            }
        }
    }
}

fn generate_join_code(rng: &mut impl Rng) -> String {
    format!("{:04}", rng.gen_range(0..10_000))
}

/// The coordinator's whole view of live sessions: lookup by id and by
/// join code, plus the bearer-token table from `/auth` bootstrap.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Arc<SessionHandle>>>,
    by_join_code: Mutex<HashMap<String, Uuid>>,
    tokens: Mutex<HashMap<String, String>>,
    display_names: Mutex<HashMap<String, String>>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SessionRegistry {
    pub fn new(clock: Arc<dyn Clock>, config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            by_join_code: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            display_names: Mutex::new(HashMap::new()),
            clock,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn issue_token(&self, user_id: &str, display_name: &str) -> String {
        let token = pirate_common::auth::generate_token();
        self.tokens.lock().unwrap().insert(token.clone(), user_id.to_string());
        self.display_names.lock().unwrap().insert(user_id.to_string(), display_name.to_string());
        token
    }

    pub fn resolve_token(&self, token: &str) -> Option<String> {
        self.tokens.lock().unwrap().get(token).cloned()
    }

    pub fn display_name_of(&self, user_id: &str) -> String {
        self.display_names
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| user_id.to_string())
    }

    pub fn create_session(&self, creator_id: &str) -> Arc<SessionHandle> {
        let now_ms = self.clock.now_ms();
        let id = Uuid::new_v4();
        let mut rng = rand::thread_rng();
        let join_code = loop {
            let candidate = generate_join_code(&mut rng);
            if !self.by_join_code.lock().unwrap().contains_key(&candidate) {
                break candidate;
            }
        };

        let mut session = Session::new(id, join_code.clone(), creator_id.to_string(), now_ms);
        session.members.push(pirate_common::domain::Member {
            user_id: creator_id.to_string(),
            display_name: self.display_name_of(creator_id),
            connected: true,
        });

        let handle = SessionHandle::new(session, Arc::clone(&self.clock), self.config);
        self.sessions.lock().unwrap().insert(id, Arc::clone(&handle));
        self.by_join_code.lock().unwrap().insert(join_code.clone(), id);
        info!(session_id = %id, join_code, creator = creator_id, "session created");
        handle
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    pub fn get_by_join_code(&self, code: &str) -> Result<Arc<SessionHandle>, CoordinatorError> {
        let id = *self
            .by_join_code
            .lock()
            .unwrap()
            .get(code)
            .ok_or(CoordinatorError::InvalidJoinCode)?;
        self.get(id).ok_or(CoordinatorError::SessionNotFound)
    }

    /// Adds `user_id` as a connected member, rejecting with `sessionFull`
    /// before any WebSocket upgrade is attempted.
    pub fn join(&self, handle: &Arc<SessionHandle>, user_id: &str) -> Result<(), CoordinatorError> {
        let mut session = handle.session.lock().unwrap();
        if session.members.iter().any(|m| m.user_id == user_id) {
            return Ok(());
        }
        if session.members.len() >= handle.config.max_members {
            return Err(CoordinatorError::SessionFull);
        }
        session.members.push(pirate_common::domain::Member {
            user_id: user_id.to_string(),
            display_name: self.display_name_of(user_id),
            connected: true,
        });
        Ok(())
    }

    pub fn destroy(&self, id: Uuid) {
        if let Some(handle) = self.sessions.lock().unwrap().remove(&id) {
            self.by_join_code.lock().unwrap().remove(&handle.session.lock().unwrap().join_code);
            info!(session_id = %id, "session destroyed");
        }
    }

    pub fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.lock().unwrap().keys().copied().collect()
    }
}
