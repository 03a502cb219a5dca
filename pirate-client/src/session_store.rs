//! Session Store — projects Sync Kernel events into an observable model
//! for UI consumers and forwards DJ intents into the kernel. Mirrors the
//! teacher's `SharedState` getter/setter-over-lock style, but reads are
//! a `watch::Receiver<Model>` snapshot rather than per-field `RwLock`s,
//! since every field here changes together on each kernel event.
//!
//! **Single-owner rule:** this module never calls `MusicSource::play` or
//! any other adapter method. It only ever calls through to
//! [`crate::kernel::SyncKernel`]; reacting to a `stateSync` with its own
//! play call would double-play the track the kernel just started (see
//! the design notes on the single-owner rule).

use std::sync::Arc;

use tokio::sync::watch;

use pirate_common::domain::{Member, NtpAnchoredPosition, Track};

use crate::adapter::MusicSource;
use crate::error::Result;
use crate::kernel::{KernelEvent, SyncKernel, SyncStatus};
use crate::transport::ConnectionState;

/// Read-only projection of authoritative session state, refreshed on
/// every kernel event.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub current_track: Option<Track>,
    pub is_playing: bool,
    pub position_ms: u64,
    pub queue: Vec<Track>,
    pub members: Vec<Member>,
    pub dj_user_id: Option<String>,
    pub connection_state: ConnectionState,
    pub sync_status: Option<SyncStatus>,
    pub last_anchor: Option<NtpAnchoredPosition>,
    pub clock_offset_ms: i64,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            current_track: None,
            is_playing: false,
            position_ms: 0,
            queue: Vec::new(),
            members: Vec::new(),
            dj_user_id: None,
            connection_state: ConnectionState::Disconnected,
            sync_status: None,
            last_anchor: None,
            clock_offset_ms: 0,
        }
    }
}

/// Mirrors kernel-owned state for UI consumers; forwards DJ intents into
/// the kernel. See the module doc for the single-owner rule this type
/// must never violate.
pub struct SessionStore<S: MusicSource> {
    kernel: Arc<SyncKernel<S>>,
    local_user_id: String,
    model_tx: watch::Sender<Model>,
}

impl<S: MusicSource + 'static> SessionStore<S> {
    pub fn new(kernel: Arc<SyncKernel<S>>, local_user_id: String) -> Arc<Self> {
        let (model_tx, _) = watch::channel(Model::default());
        Arc::new(Self { kernel, local_user_id, model_tx })
    }

    pub fn subscribe(&self) -> watch::Receiver<Model> {
        self.model_tx.subscribe()
    }

    pub fn is_dj(&self) -> bool {
        self.model_tx.borrow().dj_user_id.as_deref() == Some(self.local_user_id.as_str())
    }

    /// Current playback position for UI scrubbing / visual sync,
    /// derived from the last anchor rather than any animated UI
    /// variable (see the design-notes distinction between a time anchor
    /// and an animated variable).
    pub fn current_playback_position_s(&self, at_wall_clock_ms: u64) -> Option<f64> {
        self.model_tx.borrow().last_anchor.map(|a| a.position_at(at_wall_clock_ms))
    }

    /// Spawn the task that drains kernel events into the model. Call
    /// once after `SyncKernel::spawn`.
    pub fn spawn(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let mut events = store.kernel.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                store.apply(event);
            }
        });
    }

    fn apply(&self, event: KernelEvent) {
        self.model_tx.send_modify(|model| match event {
            KernelEvent::TrackChanged(track) => model.current_track = track,
            KernelEvent::PlaybackStateChanged { is_playing, position_ms } => {
                model.is_playing = is_playing;
                model.position_ms = position_ms;
            }
            KernelEvent::QueueUpdated(tracks) => model.queue = tracks,
            KernelEvent::MemberJoined { user_id, display_name } => {
                if !model.members.iter().any(|m| m.user_id == user_id) {
                    model.members.push(Member { user_id, display_name, connected: true });
                }
            }
            KernelEvent::MemberLeft { user_id } => {
                model.members.retain(|m| m.user_id != user_id);
            }
            KernelEvent::ConnectionStateChanged(state) => model.connection_state = state,
            KernelEvent::SyncStatusChanged(status) => model.sync_status = Some(status),
            KernelEvent::AnchorUpdated { anchor, clock_offset_ms } => {
                model.last_anchor = Some(anchor);
                model.clock_offset_ms = clock_offset_ms;
            }
        });
    }

    // -- DJ intent forwarding --------------------------------------------

    pub async fn play(&self, track: Track, position_ms: u64) -> Result<()> {
        self.kernel.dj_play(track, position_ms).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.kernel.dj_pause().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.kernel.dj_resume().await
    }

    pub async fn seek(&self, position_ms: u64) -> Result<()> {
        self.kernel.dj_seek(position_ms).await
    }

    pub async fn skip(&self) -> Result<()> {
        self.kernel.skip().await
    }

    pub async fn add_to_queue(&self, track: Track, nonce: String) -> Result<()> {
        self.kernel.add_to_queue(track, nonce).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MockMusicSource, MusicSourceDriver};
    use crate::transport::{FakeTransport, Transport};
    use pirate_common::clock::{Clock, SystemClock};
    use pirate_common::config::SyncConfig;
    use std::time::Duration;

    async fn build_store() -> Arc<SessionStore<MockMusicSource>> {
        let (transport, _rx) = FakeTransport::new();
        let transport: Arc<dyn Transport> = Arc::new(transport);
        transport.connect("s1", "tok").await.unwrap();
        let (source, _callbacks) = MockMusicSource::new(Duration::from_millis(1), false);
        let adapter = Arc::new(MusicSourceDriver::new(source, 1_000));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let kernel = SyncKernel::new(SyncConfig::default(), clock, transport, adapter, "listener1".into());
        SessionStore::new(kernel, "listener1".into())
    }

    #[tokio::test]
    async fn non_dj_cannot_forward_play_intent() {
        let store = build_store().await;
        let track = Track {
            id: "t1".into(),
            name: "Song".into(),
            artist: "Artist".into(),
            album: "Album".into(),
            album_art_url: None,
            duration_ms: 1000,
        };
        assert!(store.play(track, 0).await.is_err());
    }

    #[tokio::test]
    async fn model_applies_track_changed_event() {
        let store = build_store().await;
        let track = Track {
            id: "t1".into(),
            name: "Song".into(),
            artist: "Artist".into(),
            album: "Album".into(),
            album_art_url: None,
            duration_ms: 1000,
        };
        assert!(store.model_tx.borrow().current_track.is_none());
        store.apply(KernelEvent::TrackChanged(Some(track.clone())));
        assert_eq!(store.model_tx.borrow().current_track.as_ref(), Some(&track));
    }

    #[tokio::test]
    async fn model_applies_member_joined_and_left() {
        let store = build_store().await;
        store.apply(KernelEvent::MemberJoined { user_id: "u1".into(), display_name: "Alice".into() });
        assert_eq!(store.model_tx.borrow().members.len(), 1);
        store.apply(KernelEvent::MemberLeft { user_id: "u1".into() });
        assert!(store.model_tx.borrow().members.is_empty());
    }
}
