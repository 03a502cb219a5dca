//! The Sync Kernel — the actor that owns epoch/sequence state, the
//! two-phase play protocol, drift correction, latency calibration, and
//! state-sync reconciliation. The one and only component on a client
//! that is allowed to call `MusicSourceDriver::play`.
//!
//! Role-independent invariants (epoch/sequence gating) and the DJ-only
//! action set both live here, mirroring the teacher's `SharedState`
//! broadcast-backed observable model but replacing its audio-engine
//! semantics with this spec's synchronization semantics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use pirate_common::clock::Clock;
use pirate_common::config::SyncConfig;
use pirate_common::domain::{DriftTier, Member, NtpAnchoredPosition, SessionSnapshot, Track};
use pirate_common::wire::{SyncMessage, WireEnvelope};

use crate::adapter::MusicSource;
use crate::adapter::MusicSourceDriver;
use crate::error::{KernelError, Result};
use crate::transport::{ConnectionState, Transport};

/// Three-tier drift status surfaced to the Session Store, matching the
/// wire-level vocabulary (`synced`, `drifting(drift)`, `correcting`,
/// `lost`) used throughout the error-kind table.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SyncStatus {
    Synced,
    Drifting(u64),
    Correcting,
    Lost,
}

/// The fixed set of observable events the kernel emits to the Session
/// Store. Nothing else crosses this boundary (see the component design
/// for the Sync Kernel).
#[derive(Debug, Clone)]
pub enum KernelEvent {
    TrackChanged(Option<Track>),
    PlaybackStateChanged { is_playing: bool, position_ms: u64 },
    QueueUpdated(Vec<Track>),
    MemberJoined { user_id: String, display_name: String },
    MemberLeft { user_id: String },
    ConnectionStateChanged(ConnectionState),
    SyncStatusChanged(SyncStatus),
    AnchorUpdated { anchor: NtpAnchoredPosition, clock_offset_ms: i64 },
}

struct KernelInner {
    epoch: u64,
    /// Doubles as the outbound sequence counter: a DJ-originated message
    /// bumps this the same way accepting an inbound one would, so an
    /// echo of our own message back through the coordinator is dropped
    /// rather than reprocessed.
    last_processed_seq: u64,
    dj_user_id: Option<String>,
    anchor: Option<NtpAnchoredPosition>,
    current_track_id: Option<String>,
    prepared_track_id: Option<String>,
    last_correction_time_ms: Option<u64>,
    drift_task: Option<JoinHandle<()>>,
}

/// The Sync Kernel actor. Generic over the concrete `MusicSource` so
/// tests can swap in `MockMusicSource` without touching the protocol
/// logic.
pub struct SyncKernel<S: MusicSource> {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    adapter: Arc<MusicSourceDriver<S>>,
    local_user_id: String,
    inner: Mutex<KernelInner>,
    event_tx: broadcast::Sender<KernelEvent>,
    /// Bumped on epoch change, stateSync, transport failure, or
    /// teardown. A scheduled continuation (pre-commit sleep, scheduled
    /// local play, drift sleep) checks this after every await point and
    /// silently drops its side effect if it no longer matches.
    generation: AtomicU64,
}

impl<S: MusicSource + 'static> SyncKernel<S> {
    pub fn new(
        config: SyncConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        adapter: Arc<MusicSourceDriver<S>>,
        local_user_id: String,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            clock,
            transport,
            adapter,
            local_user_id,
            inner: Mutex::new(KernelInner {
                epoch: 0,
                last_processed_seq: 0,
                dj_user_id: None,
                anchor: None,
                current_track_id: None,
                prepared_track_id: None,
                last_correction_time_ms: None,
                drift_task: None,
            }),
            event_tx,
            generation: AtomicU64::new(0),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.event_tx.subscribe()
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub async fn is_dj(&self) -> bool {
        self.inner.lock().await.dj_user_id.as_deref() == Some(self.local_user_id.as_str())
    }

    pub async fn current_dj_user_id(&self) -> Option<String> {
        self.inner.lock().await.dj_user_id.clone()
    }

    /// Spawn the kernel's background tasks: the inbound-message pump and
    /// the connection-state forwarder. The caller owns `incoming_rx`,
    /// typically the receiver returned alongside a `WsTransport`/
    /// `FakeTransport`.
    pub fn spawn(self: &Arc<Self>, mut incoming_rx: mpsc::UnboundedReceiver<WireEnvelope>) {
        let kernel = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = incoming_rx.recv().await {
                kernel.handle_inbound(envelope).await;
            }
        });

        let kernel = Arc::clone(self);
        let mut conn_rx = self.transport.connection_state();
        tokio::spawn(async move {
            loop {
                if conn_rx.changed().await.is_err() {
                    return;
                }
                let state = conn_rx.borrow().clone();
                kernel.publish(KernelEvent::ConnectionStateChanged(state.clone()));
                if matches!(
                    state,
                    ConnectionState::Disconnected
                        | ConnectionState::Reconnecting { .. }
                        | ConnectionState::Failed { .. }
                ) {
                    kernel.generation.fetch_add(1, Ordering::SeqCst);
                    kernel.cancel_drift_checker().await;
                }
            }
        });
    }

    fn publish(&self, event: KernelEvent) {
        let _ = self.event_tx.send(event);
    }

    // -- epoch/sequence gating --------------------------------------

    /// Adopts a newer epoch (resetting sequence) and drops anything from
    /// an older one or already-seen within the current one. Exempt for
    /// `driftReport`, which callers must check before invoking this.
    async fn gate(&self, epoch: u64, seq: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if epoch < inner.epoch {
            return false;
        }
        if epoch > inner.epoch {
            inner.epoch = epoch;
            inner.last_processed_seq = 0;
        }
        if seq <= inner.last_processed_seq {
            return false;
        }
        inner.last_processed_seq = seq;
        true
    }

    async fn current_epoch(&self) -> u64 {
        self.inner.lock().await.epoch
    }

    async fn next_outbound_seq(&self) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.last_processed_seq += 1;
        inner.last_processed_seq
    }

    async fn send(&self, message: SyncMessage, epoch: u64, seq: u64) -> Result<()> {
        let envelope = WireEnvelope {
            message,
            epoch,
            seq,
            timestamp_ms: self.clock.now_ms(),
        };
        self.transport.send(envelope).await.map_err(KernelError::from)
    }

    async fn ensure_dj(&self, action: &'static str) -> Result<()> {
        if self.is_dj().await {
            Ok(())
        } else {
            Err(KernelError::NotDj(action))
        }
    }

    // -- inbound dispatch ---------------------------------------------

    pub async fn handle_inbound(self: &Arc<Self>, envelope: WireEnvelope) {
        if !envelope.message.is_drift_report() && !self.gate(envelope.epoch, envelope.seq).await {
            debug!(epoch = envelope.epoch, seq = envelope.seq, "dropping stale/duplicate message");
            return;
        }

        match envelope.message {
            SyncMessage::PlayPrepare { track_id, .. } => {
                self.inner.lock().await.prepared_track_id = Some(track_id);
            }
            SyncMessage::PlayCommit { track_id, start_at_ntp_ms, .. } => {
                self.execute_play_commit(&track_id, start_at_ntp_ms, 0.0).await;
                self.start_drift_checker().await;
            }
            SyncMessage::Pause { .. } => {
                if let Err(e) = self.adapter.pause().await {
                    warn!(error = %e, "pause dispatch failed");
                }
                self.cancel_drift_checker().await;
                self.publish(KernelEvent::PlaybackStateChanged { is_playing: false, position_ms: 0 });
            }
            SyncMessage::Resume { at_ntp_ms } => {
                self.schedule_local_play_at(at_ntp_ms);
                self.start_drift_checker().await;
            }
            SyncMessage::Seek { position_ms, .. } => {
                if let Err(e) = self.adapter.seek(position_ms as f64 / 1000.0).await {
                    warn!(error = %e, "seek dispatch failed");
                }
            }
            SyncMessage::Skip => {
                // Informational only: the authoritative change arrives as
                // a stateSync broadcast, which `handle_state_sync` applies.
            }
            SyncMessage::DriftReport { .. } => {
                // DJ-side monitoring only; listeners discard.
            }
            SyncMessage::StateSync(snapshot) => self.handle_state_sync(snapshot).await,
            SyncMessage::QueueUpdate { tracks } => {
                self.publish(KernelEvent::QueueUpdated(tracks));
            }
            SyncMessage::MemberJoined { user_id, display_name } => {
                self.publish(KernelEvent::MemberJoined { user_id, display_name });
            }
            SyncMessage::MemberLeft { user_id } => {
                self.publish(KernelEvent::MemberLeft { user_id });
            }
        }
    }

    /// `calibrated_latency_ms` — mean of the last 5 recorded play
    /// latencies, defaulting to 300ms when empty. Delegated to the
    /// adapter, which is the component that actually records samples.
    async fn calibrated_latency_ms(&self) -> f64 {
        self.adapter.average_play_latency_ms().await
    }

    async fn execute_play_commit(self: &Arc<Self>, track_id: &str, start_at_ntp_ms: u64, position_s: f64) {
        let generation = self.generation.load(Ordering::SeqCst);
        let latency_ms = self.calibrated_latency_ms().await;
        let wait_ms = start_at_ntp_ms as i64 - self.clock.now_ms() as i64 - latency_ms as i64;
        if wait_ms > 0 {
            tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;
        }

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(track_id, "play commit superseded while sleeping, dropping");
            return;
        }

        if let Err(e) = self.adapter.play(track_id, position_s).await {
            error!(track_id, error = %e, "play commit dispatch failed");
            // Retried at most once automatically per the error-kind table.
            if let Err(e2) = self.adapter.play(track_id, position_s).await {
                error!(track_id, error = %e2, "retried play commit also failed");
                self.publish(KernelEvent::SyncStatusChanged(SyncStatus::Lost));
                return;
            }
        }

        let anchor = NtpAnchoredPosition::playing(position_s, start_at_ntp_ms);
        {
            let mut inner = self.inner.lock().await;
            inner.anchor = Some(anchor);
            inner.current_track_id = Some(track_id.to_string());
        }
        self.publish(KernelEvent::AnchorUpdated { anchor, clock_offset_ms: self.clock.offset_ms() });
        self.publish(KernelEvent::PlaybackStateChanged {
            is_playing: true,
            position_ms: (position_s * 1000.0) as u64,
        });
    }

    fn schedule_local_play_at(self: &Arc<Self>, ntp_t: u64) {
        let kernel = Arc::clone(self);
        let generation = self.generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            let latency_ms = kernel.calibrated_latency_ms().await;
            let wait_ms = ntp_t as i64 - kernel.clock.now_ms() as i64 - latency_ms as i64;
            if wait_ms > 0 {
                tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;
            }
            if kernel.generation.load(Ordering::SeqCst) != generation {
                debug!("scheduled local play superseded while sleeping, dropping");
                return;
            }

            let (anchor, track_id) = {
                let inner = kernel.inner.lock().await;
                (inner.anchor, inner.current_track_id.clone())
            };
            let (Some(anchor), Some(track_id)) = (anchor, track_id) else {
                return;
            };
            let position_s = anchor.position_at(ntp_t);
            if let Err(e) = kernel.adapter.play(&track_id, position_s).await {
                warn!(error = %e, "scheduled local play failed");
                return;
            }
            let new_anchor = NtpAnchoredPosition::playing(position_s, ntp_t);
            kernel.inner.lock().await.anchor = Some(new_anchor);
            kernel.publish(KernelEvent::AnchorUpdated {
                anchor: new_anchor,
                clock_offset_ms: kernel.clock.offset_ms(),
            });
            kernel.publish(KernelEvent::PlaybackStateChanged {
                is_playing: true,
                position_ms: (position_s * 1000.0) as u64,
            });
        });
    }

    async fn handle_state_sync(self: &Arc<Self>, snapshot: SessionSnapshot) {
        // A newer authoritative state always supersedes an in-flight
        // scheduled play, even one that arrived at the same epoch (e.g.
        // a late-join snapshot racing a just-issued djResume).
        self.generation.fetch_add(1, Ordering::SeqCst);

        {
            let mut inner = self.inner.lock().await;
            inner.epoch = snapshot.epoch;
            inner.last_processed_seq = snapshot.sequence;
            inner.dj_user_id = Some(snapshot.dj_user_id.clone());
        }

        let anchor = snapshot.anchor();
        if anchor.is_playing() {
            if let Some(track_id) = snapshot.track_id.clone() {
                let now = self.clock.now_ms();
                let position_s = anchor.position_at(now);
                if let Err(e) = self.adapter.play(&track_id, position_s).await {
                    error!(track_id, error = %e, "stateSync play failed");
                } else {
                    self.inner.lock().await.current_track_id = Some(track_id);
                    self.start_drift_checker().await;
                }
            }
        } else {
            if let Err(e) = self.adapter.pause().await {
                warn!(error = %e, "stateSync pause failed");
            }
            self.cancel_drift_checker().await;
        }

        self.inner.lock().await.anchor = Some(anchor);
        self.publish(KernelEvent::AnchorUpdated { anchor, clock_offset_ms: self.clock.offset_ms() });
        self.publish(KernelEvent::TrackChanged(snapshot.current_track.clone()));
        self.publish(KernelEvent::QueueUpdated(snapshot.queue.clone()));
        self.publish(KernelEvent::PlaybackStateChanged {
            is_playing: anchor.is_playing(),
            position_ms: (anchor.position_at(self.clock.now_ms()) * 1000.0).max(0.0) as u64,
        });
    }

    // -- DJ actions -----------------------------------------------------

    pub async fn dj_play(self: &Arc<Self>, track: Track, position_ms: u64) -> Result<()> {
        self.ensure_dj("djPlay").await?;
        let epoch = self.current_epoch().await;

        let prepare_deadline_ms = self.clock.now_ms() + self.config.lead_time_ms;
        let prep_seq = self.next_outbound_seq().await;
        self.send(
            SyncMessage::PlayPrepare { track_id: track.id.clone(), prepare_deadline_ms },
            epoch,
            prep_seq,
        )
        .await?;

        tokio::time::sleep(Duration::from_millis(self.config.lead_time_ms)).await;

        let start_at_ntp_ms = self.clock.now_ms() + self.config.commit_buffer_ms;
        let commit_seq = self.next_outbound_seq().await;
        self.send(
            SyncMessage::PlayCommit {
                track_id: track.id.clone(),
                start_at_ntp_ms,
                ref_seq: prep_seq,
            },
            epoch,
            commit_seq,
        )
        .await?;

        self.execute_play_commit(&track.id, start_at_ntp_ms, position_ms as f64 / 1000.0).await;
        self.start_drift_checker().await;
        Ok(())
    }

    pub async fn dj_pause(self: &Arc<Self>) -> Result<()> {
        self.ensure_dj("djPause").await?;
        let epoch = self.current_epoch().await;
        let seq = self.next_outbound_seq().await;
        let at_ntp_ms = self.clock.now_ms() + 100;
        self.send(SyncMessage::Pause { at_ntp_ms }, epoch, seq).await?;
        self.adapter.pause().await?;
        self.cancel_drift_checker().await;
        self.publish(KernelEvent::PlaybackStateChanged { is_playing: false, position_ms: 0 });
        Ok(())
    }

    pub async fn dj_resume(self: &Arc<Self>) -> Result<()> {
        self.ensure_dj("djResume").await?;
        let epoch = self.current_epoch().await;
        let seq = self.next_outbound_seq().await;
        let at_ntp_ms = self.clock.now_ms() + 1500;
        self.send(SyncMessage::Resume { at_ntp_ms }, epoch, seq).await?;
        self.schedule_local_play_at(at_ntp_ms);
        self.start_drift_checker().await;
        Ok(())
    }

    pub async fn dj_seek(self: &Arc<Self>, position_ms: u64) -> Result<()> {
        self.ensure_dj("djSeek").await?;
        let epoch = self.current_epoch().await;
        let seq = self.next_outbound_seq().await;
        let at_ntp_ms = self.clock.now_ms() + 200;
        self.send(SyncMessage::Seek { position_ms, at_ntp_ms }, epoch, seq).await?;
        self.adapter.seek(position_ms as f64 / 1000.0).await?;
        Ok(())
    }

    pub async fn skip(self: &Arc<Self>) -> Result<()> {
        self.ensure_dj("skip").await?;
        let epoch = self.current_epoch().await;
        let seq = self.next_outbound_seq().await;
        self.send(SyncMessage::Skip, epoch, seq).await
    }

    pub async fn add_to_queue(self: &Arc<Self>, track: Track, nonce: String) -> Result<()> {
        let epoch = self.current_epoch().await;
        let seq = self.next_outbound_seq().await;
        self.send(SyncMessage::AddToQueue { track, nonce }, epoch, seq).await
    }

    // -- drift correction loop ------------------------------------------

    async fn start_drift_checker(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.drift_task.take() {
            handle.abort();
        }
        let kernel = Arc::clone(self);
        inner.drift_task = Some(tokio::spawn(async move { kernel.drift_loop().await }));
    }

    async fn cancel_drift_checker(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.drift_task.take() {
            handle.abort();
        }
    }

    async fn drift_loop(self: Arc<Self>) {
        let mut tick: u32 = 0;
        loop {
            let interval_ms = if tick < self.config.drift_fast_window_ticks {
                self.config.drift_check_fast_ms
            } else {
                self.config.drift_check_slow_ms
            };
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            tick += 1;
            self.drift_tick().await;
        }
    }

    async fn drift_tick(self: &Arc<Self>) {
        let anchor = self.inner.lock().await.anchor;
        let Some(anchor) = anchor else { return };
        if !anchor.is_playing() {
            return;
        }

        let now_ms = self.clock.now_ms();
        let expected_position_ms = (anchor.position_at(now_ms) * 1000.0).max(0.0) as i64;
        let actual_position_ms = (self.adapter.current_position_s().await * 1000.0).max(0.0) as i64;
        let drift_ms = expected_position_ms.abs_diff(actual_position_ms);

        let in_cooldown = {
            let inner = self.inner.lock().await;
            inner
                .last_correction_time_ms
                .is_some_and(|last| now_ms.saturating_sub(last) < self.config.drift_cooldown_ms)
        };

        if !in_cooldown {
            match DriftTier::classify(drift_ms, self.config.drift_ignore_ms, self.config.drift_hard_seek_ms) {
                DriftTier::Ignore => {
                    self.publish(KernelEvent::SyncStatusChanged(SyncStatus::Synced));
                }
                DriftTier::RateAdjust => {
                    // A fractional-rate nudge is degraded to report-only
                    // status when the adapter can't rate-adjust, per the
                    // spec's explicitly allowed Tier 2 fallback.
                    self.publish(KernelEvent::SyncStatusChanged(SyncStatus::Drifting(drift_ms)));
                    self.inner.lock().await.last_correction_time_ms = Some(now_ms);
                }
                DriftTier::HardSeek => {
                    if let Err(e) = self.adapter.seek(expected_position_ms as f64 / 1000.0).await {
                        warn!(error = %e, "hard-seek correction failed");
                    }
                    self.publish(KernelEvent::SyncStatusChanged(SyncStatus::Correcting));
                    self.inner.lock().await.last_correction_time_ms = Some(now_ms);
                }
            }
        }

        self.send_drift_report(actual_position_ms.max(0) as u64, now_ms).await;
    }

    async fn send_drift_report(self: &Arc<Self>, position_ms: u64, now_ms: u64) {
        let track_id = self.inner.lock().await.current_track_id.clone();
        let Some(track_id) = track_id else { return };
        let epoch = self.current_epoch().await;
        // Exempt from sequencing: reuse the current counter rather than
        // advancing it, so drift reports never perturb ordering of
        // authoritative messages.
        let seq = self.inner.lock().await.last_processed_seq;
        if let Err(e) = self
            .send(
                SyncMessage::DriftReport { track_id, position_ms, ntp_timestamp_ms: now_ms },
                epoch,
                seq,
            )
            .await
        {
            warn!(error = %e, "failed to send drift report");
        }
    }
}

/// Event published when an upstream roster change occurs, used by
/// `SessionStore` when composing its own member-list projection (kept
/// here rather than in `domain` since it's purely a kernel→store
/// transport, not a stored entity field).
#[derive(Debug, Clone)]
pub struct MemberChange {
    pub member: Member,
    pub joined: bool,
}
