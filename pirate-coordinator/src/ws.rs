//! WebSocket ingress dispatch + broadcast fan-out.
//!
//! One upgraded connection per connected member. Inbound frames are
//! decoded through the shared wire codec and dispatched by `type` per
//! the external-interfaces table; outbound frames are whatever the
//! session's broadcast channel carries, plus a snapshot sent directly to
//! a freshly-opened socket so a late join or reconnect never waits on
//! the next authoritative event to catch up.
//!
//! Grounded on `wkmp-ap/src/api/sse.rs`'s broadcast-to-stream
//! conversion, generalized from one-way SSE to a bidirectional socket.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pirate_common::error::AuthError;
use pirate_common::wire::{self, SyncMessage, WireEnvelope};

use crate::error::CoordinatorError;
use crate::registry::{SessionHandle, SessionRegistry};

pub fn router() -> Router<Arc<SessionRegistry>> {
    Router::new().route("/ws/:session_id", get(upgrade))
}

#[derive(Deserialize)]
struct WsQuery {
    token: String,
}

async fn upgrade(
    State(registry): State<Arc<SessionRegistry>>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, CoordinatorError> {
    let user_id = registry
        .resolve_token(&query.token)
        .ok_or(CoordinatorError::Auth(AuthError::UnknownToken))?;
    let handle = registry.get(session_id).ok_or(CoordinatorError::SessionNotFound)?;
    registry.join(&handle, &user_id)?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, registry, handle, user_id)))
}

async fn handle_socket(socket: WebSocket, registry: Arc<SessionRegistry>, handle: Arc<SessionHandle>, user_id: String) {
    let (mut sink, mut stream) = socket.split();
    let session_id = handle.session.lock().unwrap().id;

    handle.mark_connected(&user_id);
    crate::lifecycle::cancel_grace(&handle);
    info!(session_id = %session_id, user_id, "member connected");

    // A fresh sequence number, not the snapshot's own, so a reconnecting
    // client that already processed this exact epoch/sequence pair once
    // still accepts this greeting rather than dropping it as a replay.
    let (snapshot, epoch, seq) = {
        let mut session = handle.session.lock().unwrap();
        let seq = session.next_sequence();
        (session.snapshot(), session.epoch, seq)
    };
    let greeting = wire::encode(&WireEnvelope {
        message: SyncMessage::StateSync(snapshot),
        epoch,
        seq,
        timestamp_ms: handle.clock.now_ms(),
    });
    if sink.send(WsMessage::Text(greeting)).await.is_err() {
        return;
    }

    broadcast_member_joined(&registry, &handle, &user_id);

    let mut broadcast_rx = handle.subscribe();
    let forward_task = tokio::spawn(async move {
        loop {
            match broadcast_rx.recv().await {
                Ok(text) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "socket fell behind the session broadcast, frames dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match wire::decode(&text) {
                Ok(envelope) => dispatch(&handle, &user_id, envelope),
                Err(e) => {
                    error!(session_id = %session_id, user_id, raw = %text, error = %e, "decode failure on inbound frame");
                }
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(session_id = %session_id, user_id, error = %e, "websocket read error");
                break;
            }
        }
    }

    forward_task.abort();
    on_disconnect(registry, handle, user_id);
}

fn broadcast_member_joined(registry: &SessionRegistry, handle: &Arc<SessionHandle>, user_id: &str) {
    let display_name = registry.display_name_of(user_id);
    let seq = {
        let mut session = handle.session.lock().unwrap();
        session.next_sequence()
    };
    let epoch = handle.session.lock().unwrap().epoch;
    handle.broadcast(
        SyncMessage::MemberJoined { user_id: user_id.to_string(), display_name },
        epoch,
        seq,
    );
}

fn on_disconnect(registry: Arc<SessionRegistry>, handle: Arc<SessionHandle>, user_id: String) {
    let remaining = handle.mark_disconnected(&user_id);
    let session_id = handle.session.lock().unwrap().id;
    info!(session_id = %session_id, user_id, remaining, "member disconnected");

    let (epoch, seq) = {
        let mut session = handle.session.lock().unwrap();
        let seq = session.next_sequence();
        (session.epoch, seq)
    };
    handle.broadcast(SyncMessage::MemberLeft { user_id: user_id.clone() }, epoch, seq);

    if remaining > 0 {
        succeed_dj_if_needed(&handle, &user_id);
    } else {
        crate::lifecycle::on_last_member_disconnected(registry, handle);
    }
}

/// If the member who just left was the DJ, hands the role to the
/// longest-tenured remaining connected member (earliest join order) and
/// bumps the epoch, since the authoritative DJ identity changed.
fn succeed_dj_if_needed(handle: &Arc<SessionHandle>, left_user_id: &str) {
    let connected = handle.connected_members();
    let (snapshot, epoch, seq) = {
        let mut session = handle.session.lock().unwrap();
        if session.dj_user_id != left_user_id {
            return;
        }
        let Some(successor) = session.members.iter().find(|m| connected.contains(&m.user_id)).map(|m| m.user_id.clone()) else {
            return;
        };
        session.dj_user_id = successor.clone();
        session.bump_epoch();
        let seq = session.next_sequence();
        info!(session_id = %session.id, new_dj = successor, "DJ disconnected, succession to longest-tenured member");
        (session.snapshot(), session.epoch, seq)
    };
    handle.broadcast(SyncMessage::StateSync(snapshot), epoch, seq);
}

/// Dispatch one decoded inbound frame by its `type`, per the
/// external-interfaces ingress table. DJ-gated message types are
/// rejected (logged, not relayed) if `user_id` is not the session's
/// current DJ.
fn dispatch(handle: &Arc<SessionHandle>, user_id: &str, envelope: WireEnvelope) {
    crate::lifecycle::touch_activity(handle);

    let is_dj = handle.session.lock().unwrap().dj_user_id == user_id;
    let dj_gated = matches!(
        envelope.message,
        SyncMessage::PlayPrepare { .. }
            | SyncMessage::PlayCommit { .. }
            | SyncMessage::Pause { .. }
            | SyncMessage::Resume { .. }
            | SyncMessage::Seek { .. }
            | SyncMessage::Skip
    );
    if dj_gated && !is_dj {
        warn!(user_id, "rejected DJ-only message from a non-DJ member");
        return;
    }

    match &envelope.message {
        SyncMessage::PlayPrepare { .. } => {
            if accept_client_seq(handle, envelope.seq) {
                relay_restamped(handle, envelope.message.clone());
            } else {
                debug!(user_id, seq = envelope.seq, "dropped out-of-order playPrepare");
            }
        }
        SyncMessage::PlayCommit { track_id, .. } => {
            if !accept_client_seq(handle, envelope.seq) {
                debug!(user_id, seq = envelope.seq, "dropped out-of-order playCommit");
                return;
            }
            {
                let mut session = handle.session.lock().unwrap();
                session.current_track = handle.known_track(track_id).or(session.current_track.clone());
                session.position_at_anchor_s = 0.0;
                session.position_timestamp_ms = handle.clock.now_ms();
                session.is_playing = true;
            }
            relay_restamped(handle, envelope.message.clone());
            crate::advancement::schedule_advancement(Arc::clone(handle));
        }
        SyncMessage::Pause { .. } => {
            handle.session.lock().unwrap().is_playing = false;
            crate::advancement::clear_advancement(handle);
            relay_restamped(handle, envelope.message.clone());
        }
        SyncMessage::Resume { .. } => {
            {
                let mut session = handle.session.lock().unwrap();
                session.is_playing = true;
                session.position_timestamp_ms = handle.clock.now_ms();
            }
            crate::advancement::schedule_advancement(Arc::clone(handle));
            relay_restamped(handle, envelope.message.clone());
        }
        SyncMessage::Seek { position_ms, .. } => {
            {
                let mut session = handle.session.lock().unwrap();
                session.position_at_anchor_s = *position_ms as f64 / 1000.0;
                session.position_timestamp_ms = handle.clock.now_ms();
            }
            crate::advancement::schedule_advancement(Arc::clone(handle));
            relay_restamped(handle, envelope.message.clone());
        }
        SyncMessage::Skip => {
            crate::advancement::advance_queue(handle);
        }
        SyncMessage::AddToQueue { track, nonce } => {
            let track = track.clone();
            if !handle.accept_nonce(nonce.clone()) {
                debug!(user_id, track_id = %track.id, "duplicate addToQueue nonce, ignored");
                return;
            }
            if !track.has_valid_duration() {
                warn!(user_id, track_id = %track.id, duration_ms = track.duration_ms, "rejected track with invalid duration");
                return;
            }
            let (queue, epoch, seq) = {
                let mut session = handle.session.lock().unwrap();
                if session.queue.len() >= handle.config.max_queue_size {
                    warn!(user_id, "queue full, dropping addToQueue");
                    return;
                }
                handle.remember_track(track.clone());
                session.queue.push(track);
                let seq = session.next_sequence();
                (session.queue.clone(), session.epoch, seq)
            };
            handle.broadcast(SyncMessage::QueueUpdate { tracks: queue }, epoch, seq);
            if handle.session.lock().unwrap().is_playing {
                crate::advancement::schedule_advancement(Arc::clone(handle));
            }
        }
        SyncMessage::DriftReport { track_id, position_ms, ntp_timestamp_ms } => {
            debug!(user_id, track_id = %track_id, position_ms, ntp_timestamp_ms, "drift report observed");
        }
        SyncMessage::StateSync(_) | SyncMessage::QueueUpdate { .. } | SyncMessage::MemberJoined { .. } | SyncMessage::MemberLeft { .. } => {
            debug!(user_id, "ignored server-originated message type received from client");
        }
    }
}

/// Tracks the highest client-assigned sequence accepted per session for
/// `playPrepare`/`playCommit` relay, separate from the coordinator's own
/// outbound sequence counter (`Session::sequence`), per the ingress
/// table's "seq accepted if strictly increasing" rule.
fn accept_client_seq(handle: &SessionHandle, seq: u64) -> bool {
    handle.accept_client_sequence(seq)
}

/// Relay a DJ-originated message to the rest of the session, stamped with
/// the coordinator's own per-epoch sequence counter rather than the DJ's
/// seq. All broadcast traffic — relayed or coordinator-authored — must
/// share one sequence space, since a listener gates every non-driftReport
/// message against a single `last_processed_seq`.
fn relay_restamped(handle: &Arc<SessionHandle>, message: SyncMessage) {
    let (epoch, seq) = {
        let mut session = handle.session.lock().unwrap();
        let seq = session.next_sequence();
        (session.epoch, seq)
    };
    handle.broadcast(message, epoch, seq);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pirate_common::clock::SystemClock;
    use pirate_common::config::SyncConfig;
    use pirate_common::domain::Track;

    fn envelope(message: SyncMessage, seq: u64) -> WireEnvelope {
        WireEnvelope { message, epoch: 0, seq, timestamp_ms: 0 }
    }

    fn registry_with_dj_and_listener() -> (Arc<SessionRegistry>, Arc<SessionHandle>) {
        let registry = SessionRegistry::new(Arc::new(SystemClock::new()), SyncConfig::default());
        let handle = registry.create_session("dj1");
        registry.join(&handle, "listener1").unwrap();
        handle.mark_connected("dj1");
        handle.mark_connected("listener1");
        (registry, handle)
    }

    #[test]
    fn add_to_queue_rejects_track_with_invalid_duration() {
        let (_registry, handle) = registry_with_dj_and_listener();
        let track = Track {
            id: "t1".into(),
            name: "n".into(),
            artist: "a".into(),
            album: "al".into(),
            album_art_url: None,
            duration_ms: 0,
        };
        dispatch(&handle, "listener1", envelope(SyncMessage::AddToQueue { track, nonce: "n1".into() }, 1));
        assert!(handle.session.lock().unwrap().queue.is_empty());
    }

    #[test]
    fn pause_from_non_dj_is_rejected() {
        let (_registry, handle) = registry_with_dj_and_listener();
        handle.session.lock().unwrap().is_playing = true;
        dispatch(&handle, "listener1", envelope(SyncMessage::Pause { at_ntp_ms: 0 }, 1));
        assert!(handle.session.lock().unwrap().is_playing, "non-DJ pause must be ignored");
    }

    #[test]
    fn play_prepare_drops_out_of_order_client_sequence() {
        let (_registry, handle) = registry_with_dj_and_listener();
        let mut relayed = handle.subscribe();
        dispatch(
            &handle,
            "dj1",
            envelope(SyncMessage::PlayPrepare { track_id: "t1".into(), prepare_deadline_ms: 0 }, 5),
        );
        dispatch(
            &handle,
            "dj1",
            envelope(SyncMessage::PlayPrepare { track_id: "t1".into(), prepare_deadline_ms: 0 }, 5),
        );
        assert!(relayed.try_recv().is_ok(), "first seq=5 must relay");
        assert!(relayed.try_recv().is_err(), "replayed seq=5 must not relay again");
    }

    #[test]
    fn dj_disconnect_promotes_longest_tenured_remaining_member() {
        let (registry, handle) = registry_with_dj_and_listener();
        let epoch_before = handle.session.lock().unwrap().epoch;

        on_disconnect(Arc::clone(&registry), Arc::clone(&handle), "dj1".to_string());

        let session = handle.session.lock().unwrap();
        assert_eq!(session.dj_user_id, "listener1");
        assert_eq!(session.epoch, epoch_before + 1);
    }

    #[test]
    fn listener_disconnect_does_not_change_dj() {
        let (registry, handle) = registry_with_dj_and_listener();

        on_disconnect(Arc::clone(&registry), Arc::clone(&handle), "listener1".to_string());

        let session = handle.session.lock().unwrap();
        assert_eq!(session.dj_user_id, "dj1");
        assert_eq!(session.epoch, 0);
    }
}
