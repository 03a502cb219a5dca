//! Autonomous queue advancement: the timer that keeps a session "on air"
//! with nobody issuing playback commands, shifting the queue head into
//! `current_track` when the running track would otherwise finish.
//!
//! Every handler that touches playback calls either [`clear_advancement`]
//! or [`schedule_advancement`]; `schedule_advancement` always begins with
//! `clear_advancement` so overlapping timers can never stack up. A
//! generation counter, bumped on every clear, guards against a timer that
//! was already in flight when it was cleared: it checks the generation is
//! still current before calling [`advance_queue`].

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use pirate_common::domain::Track;
use pirate_common::wire::SyncMessage;

use crate::registry::SessionHandle;

pub fn clear_advancement(handle: &SessionHandle) {
    handle.advancement_generation.fetch_add(1, Ordering::SeqCst);
    if let Some(task) = handle.advancement_timer.lock().unwrap().take() {
        task.abort();
    }
}

/// Re-arms the advancement timer from the session's current state.
/// Cancels any existing timer first; arms nothing if there is no
/// current track, playback is paused, or the track's duration fails
/// validation.
pub fn schedule_advancement(handle: Arc<SessionHandle>) {
    clear_advancement(&handle);
    let generation = handle.advancement_generation.load(Ordering::SeqCst);

    let (track, position_at_anchor_s, position_timestamp_ms) = {
        let session = handle.session.lock().unwrap();
        if !session.is_playing {
            return;
        }
        match session.current_track.clone() {
            Some(track) => (track, session.position_at_anchor_s, session.position_timestamp_ms),
            None => return,
        }
    };

    if !track.has_valid_duration() {
        warn!(track_id = %track.id, duration_ms = track.duration_ms, "refusing to arm advancement timer for invalid duration");
        return;
    }

    let remaining_ms = remaining_ms(&track, position_at_anchor_s, position_timestamp_ms, handle.clock.now_ms());

    if remaining_ms <= 0 {
        advance_queue(&handle);
        return;
    }

    let delay = Duration::from_millis(remaining_ms as u64);
    let timer_handle = Arc::clone(&handle);
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if timer_handle.advancement_generation.load(Ordering::SeqCst) != generation {
            return;
        }
        advance_queue(&timer_handle);
    });
    *handle.advancement_timer.lock().unwrap() = Some(task);
}

fn remaining_ms(track: &Track, position_at_anchor_s: f64, position_timestamp_ms: u64, now_ms: u64) -> i64 {
    let elapsed_since_anchor_ms = now_ms as i64 - position_timestamp_ms as i64;
    let position_ms = (position_at_anchor_s * 1000.0).round() as i64 + elapsed_since_anchor_ms;
    track.duration_ms as i64 - position_ms
}

/// Shifts the queue head into `current_track`, bumping the epoch (a new
/// authoritative track is a new epoch) and broadcasting the result. If
/// the queue is empty, playback stops and the chain does too — the
/// immediately following `schedule_advancement` call is a no-op because
/// `is_playing` is now `false`.
pub fn advance_queue(handle: &Arc<SessionHandle>) {
    let (epoch, sequence) = {
        let mut session = handle.session.lock().unwrap();
        if session.queue.is_empty() {
            session.is_playing = false;
            session.next_sequence();
            debug!(session_id = %session.id, "queue exhausted, going idle");
        } else {
            let next = session.queue.remove(0);
            session.current_track = Some(next.clone());
            session.position_at_anchor_s = 0.0;
            session.position_timestamp_ms = handle.clock.now_ms();
            session.is_playing = true;
            session.bump_epoch();
            session.last_activity_ms = handle.clock.now_ms();
            debug!(session_id = %session.id, track_id = %next.id, epoch = session.epoch, "advanced to next track");
        }
        (session.epoch, session.sequence)
    };

    let snapshot = handle.session.lock().unwrap().snapshot();
    handle.broadcast(SyncMessage::StateSync(snapshot), epoch, sequence);
    schedule_advancement(Arc::clone(handle));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pirate_common::clock::SystemClock;
    use pirate_common::config::SyncConfig;
    use pirate_common::domain::Session;
    use uuid::Uuid;

    fn track(id: &str, duration_ms: u64) -> Track {
        Track { id: id.into(), name: "n".into(), artist: "a".into(), album: "al".into(), album_art_url: None, duration_ms }
    }

    fn handle_with(session: Session) -> Arc<SessionHandle> {
        // `SessionHandle::new` is private to the registry module; tests
        // build sessions through the registry instead.
        let registry = crate::registry::SessionRegistry::new(Arc::new(SystemClock::new()), SyncConfig::default());
        let handle = registry.create_session(&session.creator_id);
        *handle.session.lock().unwrap() = session;
        handle
    }

    #[test]
    fn remaining_ms_accounts_for_elapsed_time() {
        let t = track("t1", 200_000);
        let remaining = remaining_ms(&t, 0.0, 0, 150_000);
        assert_eq!(remaining, 50_000);
    }

    #[test]
    fn remaining_ms_goes_negative_past_duration() {
        let t = track("t1", 200_000);
        let remaining = remaining_ms(&t, 0.0, 0, 200_001);
        assert!(remaining < 0);
    }

    #[tokio::test]
    async fn schedule_advancement_noop_when_not_playing() {
        let mut session = Session::new(Uuid::new_v4(), "1234".into(), "dj".into(), 0);
        session.current_track = Some(track("t1", 1000));
        session.is_playing = false;
        let handle = handle_with(session);
        schedule_advancement(Arc::clone(&handle));
        assert!(handle.advancement_timer.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn advance_queue_bumps_epoch_and_resets_sequence() {
        let mut session = Session::new(Uuid::new_v4(), "1234".into(), "dj".into(), 0);
        session.current_track = Some(track("trackA", 200_000));
        session.is_playing = true;
        session.queue = vec![track("trackB", 180_000)];
        session.epoch = 3;
        session.sequence = 9;
        let handle = handle_with(session);

        clear_advancement(&handle);
        advance_queue(&handle);

        let session = handle.session.lock().unwrap();
        assert_eq!(session.epoch, 4);
        assert_eq!(session.sequence, 0);
        assert_eq!(session.current_track.as_ref().unwrap().id, "trackB");
        assert!(session.queue.is_empty());
    }

    #[tokio::test]
    async fn advance_queue_goes_idle_when_queue_empty() {
        let mut session = Session::new(Uuid::new_v4(), "1234".into(), "dj".into(), 0);
        session.current_track = Some(track("trackA", 200_000));
        session.is_playing = true;
        let handle = handle_with(session);

        clear_advancement(&handle);
        advance_queue(&handle);

        assert!(!handle.session.lock().unwrap().is_playing);
        assert!(handle.advancement_timer.lock().unwrap().is_none());
    }
}
