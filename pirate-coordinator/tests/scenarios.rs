//! Scenario-level integration tests driving a real `SessionRegistry` and
//! a real bound coordinator router, the way the teacher's
//! `tests/api_integration.rs` drives a whole router instead of a single
//! handler.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use pirate_common::clock::{Clock, SystemClock};
use pirate_common::config::SyncConfig;
use pirate_common::domain::Track;
use pirate_common::wire::{self, SyncMessage};
use pirate_coordinator::advancement;
use pirate_coordinator::registry::SessionRegistry;

fn track(id: &str, duration_ms: u64) -> Track {
    Track { id: id.into(), name: "n".into(), artist: "a".into(), album: "al".into(), album_art_url: None, duration_ms }
}

/// S5: server auto-advance. A session playing a track with no time left
/// advances the queue head into `current_track`, bumping the epoch and
/// resetting sequence, entirely without client involvement.
#[tokio::test]
async fn s5_session_auto_advances_when_track_runs_out() {
    let registry = SessionRegistry::new(Arc::new(SystemClock::new()), SyncConfig::default());
    let handle = registry.create_session("dj1");
    {
        let mut session = handle.session.lock().unwrap();
        session.current_track = Some(track("trackA", 30));
        session.is_playing = true;
        session.position_timestamp_ms = handle.clock.now_ms().saturating_sub(40);
        session.queue = vec![track("trackB", 200_000)];
        session.epoch = 3;
        session.sequence = 9;
    }

    let mut broadcasts = handle.subscribe();
    advancement::schedule_advancement(Arc::clone(&handle));

    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        assert!(remaining > Duration::ZERO, "never observed the advance broadcast");
        let raw = tokio::time::timeout(remaining, broadcasts.recv()).await.unwrap().unwrap();
        let envelope = wire::decode(&raw).unwrap();
        if let SyncMessage::StateSync(snapshot) = envelope.message {
            if snapshot.track_id.as_deref() == Some("trackB") {
                assert_eq!(envelope.epoch, 4, "epoch must bump for a new authoritative track");
                assert_eq!(envelope.seq, 0, "sequence resets on epoch change");
                break;
            }
        }
    }

    let session = handle.session.lock().unwrap();
    assert_eq!(session.epoch, 4);
    assert!(session.queue.is_empty());
}

/// S6: NaN/zero duration guard, exercised over the real WebSocket ingress
/// path. A track with `durationMs=0` is rejected and never reaches the
/// queue; a well-formed track sent immediately after is accepted,
/// proving the rejection didn't wedge the connection.
#[tokio::test]
async fn s6_invalid_duration_track_rejected_over_the_wire() {
    let registry = SessionRegistry::new(Arc::new(SystemClock::new()), SyncConfig::default());
    let app = pirate_coordinator::router(Arc::clone(&registry));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let http = reqwest::Client::new();
    let auth: serde_json::Value = http
        .post(format!("http://{addr}/auth"))
        .json(&serde_json::json!({ "spotifyUserId": "dj1", "displayName": "DJ One" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = auth["token"].as_str().unwrap().to_string();

    let created: serde_json::Value = http
        .post(format!("http://{addr}/sessions"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = created["id"].as_str().unwrap().to_string();

    let (ws_stream, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/ws/{session_id}?token={token}"
    ))
    .await
    .unwrap();
    let (mut write, mut read) = ws_stream.split();

    // Drain the initial stateSync greeting.
    read.next().await.unwrap().unwrap();

    let invalid = wire::encode(&pirate_common::wire::WireEnvelope {
        message: SyncMessage::AddToQueue { track: track("bad", 0), nonce: "n1".into() },
        epoch: 0,
        seq: 1,
        timestamp_ms: 0,
    });
    write.send(WsMessage::Text(invalid)).await.unwrap();

    let valid = wire::encode(&pirate_common::wire::WireEnvelope {
        message: SyncMessage::AddToQueue { track: track("good", 180_000), nonce: "n2".into() },
        epoch: 0,
        seq: 2,
        timestamp_ms: 0,
    });
    write.send(WsMessage::Text(valid)).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), read.next()).await.unwrap().unwrap().unwrap();
    let envelope = wire::decode(&frame.into_text().unwrap()).unwrap();
    match envelope.message {
        SyncMessage::QueueUpdate { tracks } => {
            assert_eq!(tracks.len(), 1, "the zero-duration track must never reach the queue");
            assert_eq!(tracks[0].id, "good");
        }
        other => panic!("expected a queueUpdate broadcast, got {other:?}"),
    }
}
