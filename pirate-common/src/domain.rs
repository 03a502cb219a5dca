//! Core domain model shared by every component: tracks, members, the
//! session record, and the NTP-anchored position tuple that lets any
//! device compute "where are we in the track" from a wall-clock instant
//! alone.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable track metadata. Wire shape carries all of these fields
/// (`id, name, artist, album, albumArtUrl?, durationMs`) so `addToQueue`/
/// `stateSync` payloads round-trip real display metadata, not just an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub artist: String,
    pub album: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album_art_url: Option<String>,
    pub duration_ms: u64,
}

/// Upper bound on a single track's duration (30 minutes).
pub const MAX_TRACK_DURATION_MS: u64 = 30 * 60 * 1000;

impl Track {
    /// A track's duration must be finite, positive, and bounded; the
    /// coordinator rejects anything else before it ever reaches a queue.
    pub fn has_valid_duration(&self) -> bool {
        self.duration_ms > 0 && self.duration_ms <= MAX_TRACK_DURATION_MS
    }
}

/// A connected (or gracefully-disconnected-during-grace) session member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub user_id: String,
    pub display_name: String,
    pub connected: bool,
}

/// `(position_at_anchor, ntp_anchor, rate)` — the tuple that lets any
/// device compute the current playback position at any wall-clock
/// instant: `pos(t) = position_at_anchor + (t - ntp_anchor)/1000 * rate`.
///
/// `rate` is `0.0` while paused and `1.0` while playing; no other values
/// are produced by this reference implementation (a fractional-rate
/// adapter could use intermediate values for drift correction, see
/// `MusicSource::supports_rate_adjust`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NtpAnchoredPosition {
    pub position_at_anchor_s: f64,
    pub ntp_anchor_ms: u64,
    pub playback_rate: f64,
}

impl NtpAnchoredPosition {
    pub fn paused(position_s: f64, at_ms: u64) -> Self {
        Self {
            position_at_anchor_s: position_s,
            ntp_anchor_ms: at_ms,
            playback_rate: 0.0,
        }
    }

    pub fn playing(position_s: f64, anchor_ms: u64) -> Self {
        Self {
            position_at_anchor_s: position_s,
            ntp_anchor_ms: anchor_ms,
            playback_rate: 1.0,
        }
    }

    /// The position, in seconds, at wall-clock instant `now_ms`.
    pub fn position_at(&self, now_ms: u64) -> f64 {
        let elapsed_s = (now_ms as i64 - self.ntp_anchor_ms as i64) as f64 / 1000.0;
        self.position_at_anchor_s + elapsed_s * self.playback_rate
    }

    pub fn is_playing(&self) -> bool {
        self.playback_rate > 0.0
    }
}

/// Three-tier drift-correction classification. Boundaries are inclusive
/// at the lower edge: `< ignore_ms` is `Ignore`, `< hard_seek_ms` is
/// `RateAdjust`, otherwise `HardSeek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriftTier {
    Ignore,
    RateAdjust,
    HardSeek,
}

impl DriftTier {
    pub fn classify(drift_ms: u64, ignore_ms: u64, hard_seek_ms: u64) -> Self {
        if drift_ms < ignore_ms {
            DriftTier::Ignore
        } else if drift_ms < hard_seek_ms {
            DriftTier::RateAdjust
        } else {
            DriftTier::HardSeek
        }
    }
}

/// Authoritative session record, as held by the coordinator. Clients
/// never own this type directly; they reconstruct an observable model
/// from `SessionSnapshot`s and kernel events instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub join_code: String,
    pub creator_id: String,
    pub dj_user_id: String,
    pub members: Vec<Member>,
    pub queue: Vec<Track>,
    pub current_track: Option<Track>,
    pub is_playing: bool,
    pub epoch: u64,
    pub sequence: u64,
    pub position_at_anchor_s: f64,
    pub position_timestamp_ms: u64,
    pub last_activity_ms: u64,
}

/// Upper bounds from the data model invariants.
pub const MAX_MEMBERS: usize = 10;
pub const MAX_QUEUE_SIZE: usize = 100;

impl Session {
    pub fn new(id: Uuid, join_code: String, creator_id: String, now_ms: u64) -> Self {
        Self {
            id,
            join_code,
            creator_id: creator_id.clone(),
            dj_user_id: creator_id,
            members: Vec::new(),
            queue: Vec::new(),
            current_track: None,
            is_playing: false,
            epoch: 0,
            sequence: 0,
            position_at_anchor_s: 0.0,
            position_timestamp_ms: now_ms,
            last_activity_ms: now_ms,
        }
    }

    pub fn anchor(&self) -> NtpAnchoredPosition {
        NtpAnchoredPosition {
            position_at_anchor_s: self.position_at_anchor_s,
            ntp_anchor_ms: self.position_timestamp_ms,
            playback_rate: if self.is_playing { 1.0 } else { 0.0 },
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            track_id: self.current_track.as_ref().map(|t| t.id.clone()),
            position_at_anchor_s: self.position_at_anchor_s,
            ntp_anchor_ms: self.position_timestamp_ms,
            playback_rate: if self.is_playing { 1.0 } else { 0.0 },
            queue: self.queue.clone(),
            dj_user_id: self.dj_user_id.clone(),
            epoch: self.epoch,
            sequence: self.sequence,
            members: self.members.clone(),
            current_track: self.current_track.clone(),
        }
    }

    pub fn bump_epoch(&mut self) {
        self.epoch += 1;
        self.sequence = 0;
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

/// Full authoritative-state snapshot, produced by the coordinator
/// whenever authoritative state changes and consumed by clients to
/// reconcile (late join, reconnect, or any stateSync push).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub track_id: Option<String>,
    pub position_at_anchor_s: f64,
    pub ntp_anchor_ms: u64,
    pub playback_rate: f64,
    pub queue: Vec<Track>,
    pub dj_user_id: String,
    pub epoch: u64,
    pub sequence: u64,
    pub members: Vec<Member>,
    pub current_track: Option<Track>,
}

impl SessionSnapshot {
    pub fn anchor(&self) -> NtpAnchoredPosition {
        NtpAnchoredPosition {
            position_at_anchor_s: self.position_at_anchor_s,
            ntp_anchor_ms: self.ntp_anchor_ms,
            playback_rate: self.playback_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_position_advances_linearly_while_playing() {
        let anchor = NtpAnchoredPosition::playing(10.0, 1_000_000);
        assert_eq!(anchor.position_at(1_000_000), 10.0);
        assert_eq!(anchor.position_at(1_010_000), 20.0);
    }

    #[test]
    fn anchor_position_frozen_while_paused() {
        let anchor = NtpAnchoredPosition::paused(10.0, 1_000_000);
        assert_eq!(anchor.position_at(1_000_000), 10.0);
        assert_eq!(anchor.position_at(2_000_000), 10.0);
    }

    #[test]
    fn drift_tier_boundaries() {
        let cases = [
            (0, DriftTier::Ignore),
            (10, DriftTier::Ignore),
            (49, DriftTier::Ignore),
            (50, DriftTier::RateAdjust),
            (100, DriftTier::RateAdjust),
            (499, DriftTier::RateAdjust),
            (500, DriftTier::HardSeek),
            (1000, DriftTier::HardSeek),
        ];
        for (drift, expected) in cases {
            assert_eq!(DriftTier::classify(drift, 50, 500), expected, "drift={drift}");
        }
    }

    #[test]
    fn track_duration_validation() {
        let mut track = Track {
            id: "t1".into(),
            name: "Song".into(),
            artist: "Artist".into(),
            album: "Album".into(),
            album_art_url: None,
            duration_ms: 200_000,
        };
        assert!(track.has_valid_duration());
        track.duration_ms = 0;
        assert!(!track.has_valid_duration());
        track.duration_ms = MAX_TRACK_DURATION_MS + 1;
        assert!(!track.has_valid_duration());
    }

    #[test]
    fn bump_epoch_resets_sequence() {
        let mut session = Session::new(Uuid::new_v4(), "1234".into(), "u1".into(), 0);
        session.next_sequence();
        session.next_sequence();
        assert_eq!(session.sequence, 2);
        session.bump_epoch();
        assert_eq!(session.epoch, 1);
        assert_eq!(session.sequence, 0);
    }
}
