//! Wire codec — the anti-corruption layer between the domain message
//! algebra ([`SyncMessage`]) and the on-the-wire JSON schema the
//! coordinator and every client speak.
//!
//! The wire envelope is `{ "type", "data", "epoch", "seq", "timestamp" }`.
//! Field names inside `data` are fixed by the external interface (`seq`
//! not `sequenceNumber`, `trackId` not `trackID`) and this module is the
//! only place that is allowed to know that mapping. A frame that fails
//! to decode is never silently dropped: [`decode`] always returns a
//! [`WireError::DecodeFailure`] carrying the raw payload so the caller
//! can log it and surface a `decodeFailure` event, per the error-kind
//! table.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{SessionSnapshot, Track};
use crate::error::WireError;

/// The domain algebra: one variant per message type a client or the
/// coordinator may originate. `sequence`/`epoch`/`id`/`timestamp` are
/// carried at the envelope level (see [`WireEnvelope`]), not duplicated
/// inside each variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    #[serde(rename = "playPrepare")]
    PlayPrepare {
        #[serde(rename = "trackId")]
        track_id: String,
        #[serde(rename = "prepareDeadline")]
        prepare_deadline_ms: u64,
    },
    #[serde(rename = "playCommit")]
    PlayCommit {
        #[serde(rename = "trackId")]
        track_id: String,
        #[serde(rename = "startAtNtp")]
        start_at_ntp_ms: u64,
        #[serde(rename = "refSeq")]
        ref_seq: u64,
    },
    #[serde(rename = "pause")]
    Pause {
        #[serde(rename = "atNtp")]
        at_ntp_ms: u64,
    },
    #[serde(rename = "resume")]
    Resume {
        #[serde(rename = "atNtp")]
        at_ntp_ms: u64,
    },
    #[serde(rename = "seek")]
    Seek {
        #[serde(rename = "positionMs")]
        position_ms: u64,
        #[serde(rename = "atNtp")]
        at_ntp_ms: u64,
    },
    #[serde(rename = "skip")]
    Skip,
    #[serde(rename = "addToQueue")]
    AddToQueue { track: Track, nonce: String },
    #[serde(rename = "driftReport")]
    DriftReport {
        #[serde(rename = "trackId")]
        track_id: String,
        #[serde(rename = "positionMs")]
        position_ms: u64,
        #[serde(rename = "ntpTimestamp")]
        ntp_timestamp_ms: u64,
    },
    #[serde(rename = "stateSync")]
    StateSync(SessionSnapshot),
    #[serde(rename = "queueUpdate")]
    QueueUpdate { tracks: Vec<Track> },
    #[serde(rename = "memberJoined")]
    MemberJoined {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "displayName")]
        display_name: String,
    },
    #[serde(rename = "memberLeft")]
    MemberLeft {
        #[serde(rename = "userId")]
        user_id: String,
    },
}

impl SyncMessage {
    /// `driftReport` is informational only and exempt from epoch/sequence
    /// gating (see the kernel's role-independent invariants).
    pub fn is_drift_report(&self) -> bool {
        matches!(self, SyncMessage::DriftReport { .. })
    }
}

/// The top-level frame shape every message travels in: one JSON object
/// per WebSocket text frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(flatten)]
    message: Value,
    epoch: u64,
    seq: u64,
    timestamp: u64,
}

/// A decoded wire frame: the domain message plus the envelope fields
/// that gate it (epoch/sequence ordering lives one level up, in the
/// kernel and coordinator, not in this codec).
#[derive(Debug, Clone, PartialEq)]
pub struct WireEnvelope {
    pub message: SyncMessage,
    pub epoch: u64,
    pub seq: u64,
    pub timestamp_ms: u64,
}

/// Encode a message for transmission. Infallible: every `SyncMessage`
/// variant is constructed from valid Rust values, so there's nothing to
/// reject at this boundary (unlike `decode`, which must survive hostile
/// or merely buggy input from the wire).
pub fn encode(envelope: &WireEnvelope) -> String {
    let mut value = serde_json::to_value(&envelope.message)
        .expect("SyncMessage always serializes");
    let obj = value.as_object_mut().expect("tagged enum serializes to an object");
    obj.insert("epoch".into(), Value::from(envelope.epoch));
    obj.insert("seq".into(), Value::from(envelope.seq));
    obj.insert("timestamp".into(), Value::from(envelope.timestamp_ms));
    value.to_string()
}

/// Decode a raw wire frame. Never returns "drop silently" — any failure
/// is a [`WireError::DecodeFailure`] carrying the original bytes.
pub fn decode(raw: &str) -> Result<WireEnvelope, WireError> {
    let wrap = |reason: String| WireError::DecodeFailure {
        raw: raw.to_string(),
        reason,
    };

    let value: Value = serde_json::from_str(raw).map_err(|e| wrap(e.to_string()))?;
    let epoch = value
        .get("epoch")
        .and_then(Value::as_u64)
        .ok_or_else(|| wrap("missing or non-numeric 'epoch'".into()))?;
    let seq = value
        .get("seq")
        .and_then(Value::as_u64)
        .ok_or_else(|| wrap("missing or non-numeric 'seq'".into()))?;
    let timestamp_ms = value
        .get("timestamp")
        .and_then(Value::as_u64)
        .ok_or_else(|| wrap("missing or non-numeric 'timestamp'".into()))?;

    let message: SyncMessage = serde_json::from_value(value).map_err(|e| wrap(e.to_string()))?;

    Ok(WireEnvelope {
        message,
        epoch,
        seq,
        timestamp_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Member, SessionSnapshot};

    fn wrap(message: SyncMessage) -> WireEnvelope {
        WireEnvelope {
            message,
            epoch: 3,
            seq: 7,
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn play_prepare_uses_exact_wire_field_names() {
        let env = wrap(SyncMessage::PlayPrepare {
            track_id: "trackA".into(),
            prepare_deadline_ms: 11_500,
        });
        let json = encode(&env);
        assert!(json.contains("\"trackId\":\"trackA\""));
        assert!(json.contains("\"prepareDeadline\":11500"));
        assert!(!json.contains("sequenceNumber"));
        assert!(!json.contains("trackID"));
    }

    #[test]
    fn decode_failure_carries_raw_payload() {
        let raw = "{ this is not json";
        let err = decode(raw).unwrap_err();
        match err {
            WireError::DecodeFailure { raw: got, .. } => assert_eq!(got, raw),
            _ => panic!("expected DecodeFailure"),
        }
    }

    #[test]
    fn decode_rejects_frame_missing_sequencing_fields() {
        let raw = r#"{"type":"skip"}"#;
        assert!(decode(raw).is_err());
    }

    #[test]
    fn drift_report_is_exempt_from_sequencing() {
        let msg = SyncMessage::DriftReport {
            track_id: "t".into(),
            position_ms: 1000,
            ntp_timestamp_ms: 2000,
        };
        assert!(msg.is_drift_report());
        assert!(!SyncMessage::Skip.is_drift_report());
    }

    #[test]
    fn state_sync_round_trips_through_wire() {
        let snapshot = SessionSnapshot {
            track_id: Some("t1".into()),
            position_at_anchor_s: 30.0,
            ntp_anchor_ms: 2_000_000,
            playback_rate: 1.0,
            queue: vec![],
            dj_user_id: "dj".into(),
            epoch: 7,
            sequence: 42,
            members: vec![Member {
                user_id: "u1".into(),
                display_name: "Alice".into(),
                connected: true,
            }],
            current_track: None,
        };
        let env = wrap(SyncMessage::StateSync(snapshot.clone()));
        let json = encode(&env);
        let decoded = decode(&json).unwrap();
        match decoded.message {
            SyncMessage::StateSync(got) => assert_eq!(got.track_id, snapshot.track_id),
            other => panic!("expected StateSync, got {other:?}"),
        }
        assert_eq!(decoded.epoch, 3);
        assert_eq!(decoded.seq, 7);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::domain::Member;
    use proptest::prelude::*;

    fn arb_track() -> impl Strategy<Value = Track> {
        (
            "[a-z0-9]{1,12}",
            "[A-Za-z ]{1,20}",
            "[A-Za-z ]{1,20}",
            "[A-Za-z ]{1,20}",
            1u64..=crate::domain::MAX_TRACK_DURATION_MS,
        )
            .prop_map(|(id, name, artist, album, duration_ms)| Track {
                id,
                name,
                artist,
                album,
                album_art_url: None,
                duration_ms,
            })
    }

    fn arb_member() -> impl Strategy<Value = Member> {
        ("[a-z0-9]{1,10}", "[A-Za-z ]{1,16}", any::<bool>()).prop_map(
            |(user_id, display_name, connected)| Member {
                user_id,
                display_name,
                connected,
            },
        )
    }

    fn arb_message() -> impl Strategy<Value = SyncMessage> {
        prop_oneof![
            ("[a-z0-9]{1,12}", any::<u64>()).prop_map(|(track_id, prepare_deadline_ms)| {
                SyncMessage::PlayPrepare {
                    track_id,
                    prepare_deadline_ms,
                }
            }),
            ("[a-z0-9]{1,12}", any::<u64>(), any::<u64>()).prop_map(
                |(track_id, start_at_ntp_ms, ref_seq)| SyncMessage::PlayCommit {
                    track_id,
                    start_at_ntp_ms,
                    ref_seq,
                }
            ),
            any::<u64>().prop_map(|at_ntp_ms| SyncMessage::Pause { at_ntp_ms }),
            any::<u64>().prop_map(|at_ntp_ms| SyncMessage::Resume { at_ntp_ms }),
            (any::<u64>(), any::<u64>())
                .prop_map(|(position_ms, at_ntp_ms)| SyncMessage::Seek { position_ms, at_ntp_ms }),
            Just(SyncMessage::Skip),
            (arb_track(), "[a-z0-9]{1,8}")
                .prop_map(|(track, nonce)| SyncMessage::AddToQueue { track, nonce }),
            ("[a-z0-9]{1,12}", any::<u64>(), any::<u64>()).prop_map(
                |(track_id, position_ms, ntp_timestamp_ms)| SyncMessage::DriftReport {
                    track_id,
                    position_ms,
                    ntp_timestamp_ms,
                }
            ),
            prop::collection::vec(arb_track(), 0..5)
                .prop_map(|tracks| SyncMessage::QueueUpdate { tracks }),
            ("[a-z0-9]{1,10}", "[A-Za-z ]{1,16}").prop_map(|(user_id, display_name)| {
                SyncMessage::MemberJoined {
                    user_id,
                    display_name,
                }
            }),
            "[a-z0-9]{1,10}".prop_map(|user_id| SyncMessage::MemberLeft { user_id }),
            (
                proptest::option::of("[a-z0-9]{1,12}"),
                -1_000_000f64..1_000_000f64,
                any::<u64>(),
                prop_oneof![Just(0.0f64), Just(1.0f64)],
                prop::collection::vec(arb_track(), 0..3),
                "[a-z0-9]{1,10}",
                any::<u64>(),
                any::<u64>(),
                prop::collection::vec(arb_member(), 0..4),
                proptest::option::of(arb_track()),
            )
                .prop_map(
                    |(
                        track_id,
                        position_at_anchor_s,
                        ntp_anchor_ms,
                        playback_rate,
                        queue,
                        dj_user_id,
                        epoch,
                        sequence,
                        members,
                        current_track,
                    )| {
                        SyncMessage::StateSync(SessionSnapshot {
                            track_id,
                            position_at_anchor_s,
                            ntp_anchor_ms,
                            playback_rate,
                            queue,
                            dj_user_id,
                            epoch,
                            sequence,
                            members,
                            current_track,
                        })
                    }
                ),
        ]
    }

    proptest! {
        #[test]
        fn wire_round_trip(message in arb_message(), epoch in any::<u64>(), seq in any::<u64>(), timestamp_ms in any::<u64>()) {
            let env = WireEnvelope { message: message.clone(), epoch, seq, timestamp_ms };
            let json = encode(&env);
            let decoded = decode(&json).expect("encoded frame must decode");
            prop_assert_eq!(decoded.message, message);
            prop_assert_eq!(decoded.epoch, epoch);
            prop_assert_eq!(decoded.seq, seq);
            prop_assert_eq!(decoded.timestamp_ms, timestamp_ms);
        }
    }
}
