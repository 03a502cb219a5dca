//! Music Source Adapter — serializes every call into a vendor playback
//! SDK through a single state machine, so overlapping calls can't race
//! and per-call latency can be measured.
//!
//! State machine: `Idle -> Preparing(track) -> WaitingForCallback(track,
//! deadline) -> Playing(track) -> Idle`. A `play` issued while
//! `Preparing`/`WaitingForCallback` overwrites a single-slot "pending"
//! command (keep-latest policy) instead of queuing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{AdapterError, Result};

const LATENCY_WINDOW: usize = 5;
const LATENCY_RING_CAP: usize = 10;
const DEFAULT_LATENCY_MS: f64 = 300.0;

/// The vendor-facing surface the state machine drives. A real
/// implementation binds this to a specific provider SDK; [`MockMusicSource`]
/// stands in for one in tests and as a reference adapter.
#[async_trait::async_trait]
pub trait MusicSource: Send + Sync {
    async fn dispatch_play(&self, track_id: &str, position_s: f64) -> Result<()>;
    async fn dispatch_pause(&self) -> Result<()>;
    async fn dispatch_seek(&self, position_s: f64) -> Result<()>;
    async fn query_position_s(&self) -> Result<f64>;

    /// Whether this adapter can nudge its playback rate fractionally for
    /// Tier 2 drift correction. Adapters that can't degrade to report-only
    /// (`drifting`) status instead of a real correction.
    fn supports_rate_adjust(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Preparing,
    WaitingForCallback,
    Playing,
}

#[derive(Debug, Clone)]
struct PendingPlay {
    track_id: String,
    position_s: f64,
}

/// Observable playback state, published as a lossy latest-value stream.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub track_id: Option<String>,
    pub is_playing: bool,
    pub position_s: f64,
    pub timestamp_ms: u64,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            track_id: None,
            is_playing: false,
            position_s: 0.0,
            timestamp_ms: 0,
        }
    }
}

struct Inner {
    phase: Phase,
    pending: Option<PendingPlay>,
    latency_samples: VecDeque<f64>,
    current_track: Option<String>,
}

/// Drives a [`MusicSource`] through its state machine, measuring play
/// latency and enforcing the keep-latest pending-command policy.
pub struct MusicSourceDriver<S: MusicSource> {
    source: S,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<PlaybackState>,
    watchdog_ms: u64,
}

impl<S: MusicSource> MusicSourceDriver<S> {
    pub fn new(source: S, watchdog_ms: u64) -> Self {
        let (state_tx, _) = watch::channel(PlaybackState::default());
        Self {
            source,
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                pending: None,
                latency_samples: VecDeque::with_capacity(LATENCY_RING_CAP),
                current_track: None,
            }),
            state_tx,
            watchdog_ms,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state_tx.subscribe()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// `average_play_latency_ms()` — mean of the last 5 recorded play
    /// latencies, defaulting to 300 ms when the window is empty.
    pub async fn average_play_latency_ms(&self) -> f64 {
        let inner = self.inner.lock().await;
        if inner.latency_samples.is_empty() {
            return DEFAULT_LATENCY_MS;
        }
        let window: Vec<f64> = inner
            .latency_samples
            .iter()
            .rev()
            .take(LATENCY_WINDOW)
            .copied()
            .collect();
        window.iter().sum::<f64>() / window.len() as f64
    }

    /// `play(track, pos)` in Idle or Playing moves to Preparing and
    /// dispatches the vendor call; in Preparing/WaitingForCallback it
    /// overwrites the single pending slot instead. Takes `Arc<Self>` so
    /// the watchdog it arms can outlive this call without borrowing the
    /// driver.
    pub async fn play(self: &Arc<Self>, track_id: &str, position_s: f64) -> Result<()> {
        let should_dispatch = {
            let mut inner = self.inner.lock().await;
            match inner.phase {
                Phase::Idle | Phase::Playing => {
                    inner.phase = Phase::Preparing;
                    true
                }
                Phase::Preparing | Phase::WaitingForCallback => {
                    inner.pending = Some(PendingPlay {
                        track_id: track_id.to_string(),
                        position_s,
                    });
                    debug!(track_id, "play overwrote pending command (keep-latest)");
                    false
                }
            }
        };

        if !should_dispatch {
            return Ok(());
        }

        let dispatch_time = Instant::now();
        let dispatch_result = self.source.dispatch_play(track_id, position_s).await;

        if let Err(e) = dispatch_result {
            warn!(track_id, error = %e, "vendor play dispatch failed");
            self.transition_to_idle_and_drain().await;
            return Err(e);
        }

        {
            let mut inner = self.inner.lock().await;
            inner.phase = Phase::WaitingForCallback;
        }

        self.arm_watchdog(track_id.to_string());
        Ok(())
    }

    /// Spawns a background task that, unless the callback (or a newer
    /// dispatch) beat it to it, drops the driver back to `Idle` and
    /// drains any pending command after `watchdog_ms`.
    fn arm_watchdog(self: &Arc<Self>, expected_track_id: String) {
        let driver = Arc::clone(self);
        let watchdog_ms = self.watchdog_ms;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(watchdog_ms)).await;
            let drained = {
                let mut inner = driver.inner.lock().await;
                if inner.phase == Phase::WaitingForCallback {
                    warn!(track_id = %expected_track_id, "playback watchdog fired, no start callback");
                    inner.phase = Phase::Idle;
                    inner.pending.take()
                } else {
                    None
                }
            };
            if let Some(pending) = drained {
                let _ = driver.play(&pending.track_id, pending.position_s).await;
            }
        });
    }

    /// Vendor "playback started" callback. Records latency, transitions
    /// to Playing, and drains any pending command.
    pub async fn on_playback_started(self: &Arc<Self>, track_id: &str, dispatch_time: Instant) {
        let elapsed_ms = dispatch_time.elapsed().as_secs_f64() * 1000.0;
        let pending = {
            let mut inner = self.inner.lock().await;
            if inner.phase != Phase::WaitingForCallback {
                return;
            }
            inner.phase = Phase::Playing;
            inner.current_track = Some(track_id.to_string());
            inner.latency_samples.push_back(elapsed_ms);
            while inner.latency_samples.len() > LATENCY_RING_CAP {
                inner.latency_samples.pop_front();
            }
            inner.pending.take()
        };

        self.publish(track_id, true, 0.0).await;

        if let Some(pending) = pending {
            let _ = self.play(&pending.track_id, pending.position_s).await;
        }
    }

    pub async fn pause(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            inner.phase = Phase::Idle;
            inner.pending = None;
        }
        self.source.dispatch_pause().await?;
        self.publish_paused().await;
        Ok(())
    }

    pub async fn seek(&self, position_s: f64) -> Result<()> {
        self.source.dispatch_seek(position_s).await
    }

    /// `current_position()` — query the vendor; default 0 on failure.
    pub async fn current_position_s(&self) -> f64 {
        self.source.query_position_s().await.unwrap_or(0.0)
    }

    pub fn supports_rate_adjust(&self) -> bool {
        self.source.supports_rate_adjust()
    }

    async fn transition_to_idle_and_drain(&self) {
        let mut inner = self.inner.lock().await;
        inner.phase = Phase::Idle;
        inner.pending = None;
    }

    async fn publish(&self, track_id: &str, is_playing: bool, position_s: f64) {
        let _ = self.state_tx.send(PlaybackState {
            track_id: Some(track_id.to_string()),
            is_playing,
            position_s,
            timestamp_ms: 0,
        });
    }

    async fn publish_paused(&self) {
        let current = self.inner.lock().await.current_track.clone();
        let _ = self.state_tx.send(PlaybackState {
            track_id: current,
            is_playing: false,
            position_s: 0.0,
            timestamp_ms: 0,
        });
    }
}

/// A configurable reference `MusicSource`: artificial latency, optional
/// failure injection, and in-memory "current position" tracking. Backs
/// the kernel's own tests and stands in for a real provider SDK binding.
pub struct MockMusicSource {
    latency: Duration,
    fail_next_play: std::sync::atomic::AtomicBool,
    position_s: tokio::sync::Mutex<f64>,
    supports_rate_adjust: bool,
    callback_tx: mpsc::UnboundedSender<(String, Instant)>,
}

impl MockMusicSource {
    pub fn new(latency: Duration, supports_rate_adjust: bool) -> (Self, mpsc::UnboundedReceiver<(String, Instant)>) {
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        (
            Self {
                latency,
                fail_next_play: std::sync::atomic::AtomicBool::new(false),
                position_s: tokio::sync::Mutex::new(0.0),
                supports_rate_adjust,
                callback_tx,
            },
            callback_rx,
        )
    }

    pub fn fail_next_play(&self) {
        self.fail_next_play
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl MusicSource for MockMusicSource {
    async fn dispatch_play(&self, track_id: &str, position_s: f64) -> Result<()> {
        if self
            .fail_next_play
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(AdapterError::PlaybackFailed("injected failure".into()).into());
        }
        *self.position_s.lock().await = position_s;
        let tx = self.callback_tx.clone();
        let track_id = track_id.to_string();
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let _ = tx.send((track_id, Instant::now()));
        });
        Ok(())
    }

    async fn dispatch_pause(&self) -> Result<()> {
        Ok(())
    }

    async fn dispatch_seek(&self, position_s: f64) -> Result<()> {
        *self.position_s.lock().await = position_s;
        Ok(())
    }

    async fn query_position_s(&self) -> Result<f64> {
        Ok(*self.position_s.lock().await)
    }

    fn supports_rate_adjust(&self) -> bool {
        self.supports_rate_adjust
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn play_transitions_to_waiting_then_playing_on_callback() {
        let (source, mut callbacks) = MockMusicSource::new(Duration::from_millis(10), false);
        let driver = Arc::new(MusicSourceDriver::new(source, 3_000));

        driver.play("trackA", 0.0).await.unwrap();
        let (track_id, dispatch_time) = callbacks.recv().await.unwrap();
        driver.on_playback_started(&track_id, dispatch_time).await;

        let state = driver.subscribe().borrow().clone();
        assert_eq!(state.track_id.as_deref(), Some("trackA"));
        assert!(state.is_playing);
    }

    #[tokio::test]
    async fn overlapping_play_keeps_only_latest_pending() {
        let (source, mut callbacks) = MockMusicSource::new(Duration::from_millis(50), false);
        let driver = Arc::new(MusicSourceDriver::new(source, 3_000));

        driver.play("trackA", 0.0).await.unwrap();
        // Still Preparing/WaitingForCallback — these should overwrite, not queue.
        driver.play("trackB", 1.0).await.unwrap();
        driver.play("trackC", 2.0).await.unwrap();

        let (track_id, dispatch_time) = callbacks.recv().await.unwrap();
        assert_eq!(track_id, "trackA");
        driver.on_playback_started(&track_id, dispatch_time).await;

        // Draining pending dispatches trackC (the latest), which produces
        // a second callback.
        let (track_id2, dispatch_time2) = callbacks.recv().await.unwrap();
        assert_eq!(track_id2, "trackC");
        driver.on_playback_started(&track_id2, dispatch_time2).await;

        let state = driver.subscribe().borrow().clone();
        assert_eq!(state.track_id.as_deref(), Some("trackC"));
    }

    #[tokio::test]
    async fn average_latency_defaults_to_300ms_when_empty() {
        let (source, _callbacks) = MockMusicSource::new(Duration::from_millis(10), false);
        let driver = MusicSourceDriver::new(source, 3_000);
        assert_eq!(driver.average_play_latency_ms().await, 300.0);
    }

    #[tokio::test]
    async fn watchdog_timeout_drains_pending_into_a_fresh_dispatch() {
        // Vendor never calls back inside the watchdog window; the
        // watchdog (30ms) must fire and drain "trackB" into a new
        // dispatch, which sets the mock source's position immediately.
        let (source, _callbacks) = MockMusicSource::new(Duration::from_secs(60), false);
        let driver = Arc::new(MusicSourceDriver::new(source, 30));

        driver.play("trackA", 0.0).await.unwrap();
        driver.play("trackB", 5.0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(driver.current_position_s().await, 5.0);
    }

    #[tokio::test]
    async fn rate_adjust_support_is_adapter_specific() {
        let (with_rate, _a) = MockMusicSource::new(Duration::from_millis(1), true);
        let (without_rate, _b) = MockMusicSource::new(Duration::from_millis(1), false);
        assert!(MusicSourceDriver::new(with_rate, 3_000).supports_rate_adjust());
        assert!(!MusicSourceDriver::new(without_rate, 3_000).supports_rate_adjust());
    }
}
