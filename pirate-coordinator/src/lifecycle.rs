//! Session lifetime: the grace period that keeps an empty-but-active
//! session alive for a reconnect, and the idle reaper that sweeps
//! sessions whose `last_activity_ms` has gone stale regardless of grace.
//!
//! Grounded on the one-shot-timer idiom `advancement.rs` uses for the
//! autonomous advancement timer — the same "always clear before arming"
//! discipline applies here to avoid two destruction timers racing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::registry::{SessionHandle, SessionRegistry};

/// Called whenever a member's connection flag flips to connected
/// (fresh join or rejoin during grace): cancels any pending destruction
/// timer for this session.
pub fn cancel_grace(handle: &SessionHandle) {
    if let Some(task) = handle.grace_timer.lock().unwrap().take() {
        task.abort();
        debug!(session_id = %handle.session.lock().unwrap().id, "grace timer cancelled on rejoin");
    }
}

/// Called when the last connected member drops off. Arms a
/// `gracePeriodMs` destruction timer if the session is worth keeping
/// alive (non-empty queue or still playing); destroys it immediately
/// otherwise.
pub fn on_last_member_disconnected(registry: Arc<SessionRegistry>, handle: Arc<SessionHandle>) {
    cancel_grace(&handle);

    let (session_id, keep_alive) = {
        let session = handle.session.lock().unwrap();
        (session.id, session.is_playing || !session.queue.is_empty())
    };

    if !keep_alive {
        info!(session_id = %session_id, "last member left an idle session, destroying immediately");
        crate::advancement::clear_advancement(&handle);
        registry.destroy(session_id);
        return;
    }

    let grace_ms = handle.config.grace_period_ms;
    info!(session_id = %session_id, grace_ms, "last member left, arming grace timer");
    let timer_handle = Arc::clone(&handle);
    let timer_registry = Arc::clone(&registry);
    let task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(grace_ms)).await;
        if timer_handle.connected_count() == 0 {
            info!(session_id = %session_id, "grace period expired with nobody back, destroying session");
            crate::advancement::clear_advancement(&timer_handle);
            timer_registry.destroy(session_id);
        }
    });
    *handle.grace_timer.lock().unwrap() = Some(task);
}

/// Periodic sweep that reaps sessions whose `last_activity_ms` is older
/// than `idleTimeoutMs`, independent of the grace-period mechanism (a
/// session can be "active" by grace's definition — still playing — yet
/// idle by this one if, e.g., its advancement timer were somehow stuck).
pub fn spawn_idle_reaper(registry: Arc<SessionRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let sweep_interval = Duration::from_secs(30);
        loop {
            tokio::time::sleep(sweep_interval).await;
            let now_ms = registry.clock().now_ms();
            for id in registry.session_ids() {
                let Some(handle) = registry.get(id) else { continue };
                let idle_timeout_ms = handle.config.idle_timeout_ms;
                let stale = {
                    let session = handle.session.lock().unwrap();
                    now_ms.saturating_sub(session.last_activity_ms) >= idle_timeout_ms
                };
                if stale {
                    info!(session_id = %id, "idle timeout exceeded, reaping session");
                    crate::advancement::clear_advancement(&handle);
                    cancel_grace(&handle);
                    registry.destroy(id);
                }
            }
        }
    })
}

/// Bumps `last_activity_ms` to the clock's current reading. Called by
/// every ws ingress handler that accepts a message, per the coordinator's
/// "last-activity timestamp" attribute in the data model.
pub fn touch_activity(handle: &SessionHandle) {
    let now_ms = handle.clock.now_ms();
    handle.session.lock().unwrap().last_activity_ms = now_ms;
}
