//! NTP-anchored wall clock.
//!
//! Every device in a session needs a shared notion of "now" so that a
//! `PlayCommit` scheduled for `start_at_ntp` lands at (approximately) the
//! same instant everywhere. `Clock::now_ms()` returns that shared
//! estimate; `offset_ms()` is how far it currently differs from the local
//! OS clock.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::ClockError;

fn local_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shared wall-clock reading, NTP-corrected where available.
///
/// Implementations must guarantee `now_ms()` is monotonic within one
/// process even if a resync estimate would otherwise move the clock
/// backwards.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch, clock-offset applied.
    fn now_ms(&self) -> u64;

    /// Current best estimate of `shared - local`, in milliseconds.
    fn offset_ms(&self) -> i64;

    /// True once at least one successful sync has completed.
    fn is_synced(&self) -> bool;

    /// Trigger a fresh exchange with upstream time sources. Bounded retry,
    /// cancellable; failures are logged and tolerated by callers (the
    /// kernel proceeds with `is_synced() == false`).
    async fn resync(&self) -> Result<(), ClockError>;
}

/// A clock with offset pinned at zero. Used for single-process tests and
/// as the degraded mode when no NTP pool is configured.
#[derive(Debug, Default)]
pub struct SystemClock {
    monotonic_floor: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            monotonic_floor: AtomicU64::new(local_now_ms()),
        }
    }

    fn clamp_monotonic(&self, candidate: u64) -> u64 {
        let mut floor = self.monotonic_floor.load(Ordering::Acquire);
        loop {
            if candidate <= floor {
                return floor;
            }
            match self.monotonic_floor.compare_exchange_weak(
                floor,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(observed) => floor = observed,
            }
        }
    }
}

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.clamp_monotonic(local_now_ms())
    }

    fn offset_ms(&self) -> i64 {
        0
    }

    fn is_synced(&self) -> bool {
        true
    }

    async fn resync(&self) -> Result<(), ClockError> {
        Ok(())
    }
}

/// A pool of upstream time sources an `NtpClock` may exchange with.
///
/// Kept abstract (rather than hard-wiring a specific NTP crate) so tests
/// can supply a fake source; production callers configure real pool
/// hostnames via `SyncConfig`.
#[async_trait::async_trait]
pub trait NtpSource: Send + Sync {
    /// Returns the source's estimate of `shared - local`, in milliseconds.
    async fn query_offset_ms(&self, local_now_ms: u64) -> Result<i64, ClockError>;
}

/// Clock backed by a bounded, cancellable resync loop against an
/// [`NtpSource`]. `now_ms()` never regresses: a new offset estimate that
/// would move the clock backwards is clamped to the last-reported value.
pub struct NtpClock {
    source: Box<dyn NtpSource>,
    offset_ms: AtomicI64,
    synced: std::sync::atomic::AtomicBool,
    monotonic_floor: AtomicU64,
    max_attempts: u32,
}

impl NtpClock {
    pub fn new(source: Box<dyn NtpSource>, max_attempts: u32) -> Self {
        Self {
            source,
            offset_ms: AtomicI64::new(0),
            synced: std::sync::atomic::AtomicBool::new(false),
            monotonic_floor: AtomicU64::new(local_now_ms()),
            max_attempts,
        }
    }

    fn clamp_monotonic(&self, candidate: u64) -> u64 {
        let mut floor = self.monotonic_floor.load(Ordering::Acquire);
        loop {
            if candidate <= floor {
                return floor;
            }
            match self.monotonic_floor.compare_exchange_weak(
                floor,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(observed) => floor = observed,
            }
        }
    }
}

#[async_trait::async_trait]
impl Clock for NtpClock {
    fn now_ms(&self) -> u64 {
        let local = local_now_ms();
        let offset = self.offset_ms.load(Ordering::Acquire);
        let candidate = (local as i64 + offset).max(0) as u64;
        self.clamp_monotonic(candidate)
    }

    fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    async fn resync(&self) -> Result<(), ClockError> {
        let mut last_err = None;
        for attempt in 1..=self.max_attempts.max(1) {
            let local = local_now_ms();
            match self.source.query_offset_ms(local).await {
                Ok(offset) => {
                    self.offset_ms.store(offset, Ordering::Release);
                    self.synced.store(true, Ordering::Release);
                    debug!(offset_ms = offset, attempt, "clock resync succeeded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "clock resync attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(ClockError::NoSource))
    }
}
