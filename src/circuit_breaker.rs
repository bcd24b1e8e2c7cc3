//! Circuit Breaker & Verifier. Trips on tracking failure, exchange
//! disagreement, or rate-limit blindness; reads are lock-free, writes
//! (trip) are serialised; reading its own state must fail *closed*.

use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Why the breaker tripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripReason {
    PositionTrackingFailed,
    StopLossBlind,
    ExchangeDisagreement,
    RateLimitedStaleCache,
    Other(String),
}

impl TripReason {
    pub fn as_str(&self) -> String {
        match self {
            TripReason::PositionTrackingFailed => "POSITION_TRACKING_FAILED".to_string(),
            TripReason::StopLossBlind => "STOP_LOSS_BLIND".to_string(),
            TripReason::ExchangeDisagreement => "EXCHANGE_DISAGREEMENT".to_string(),
            TripReason::RateLimitedStaleCache => "RATE_LIMITED_STALE_CACHE".to_string(),
            TripReason::Other(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct TripState {
    tripped: bool,
    reason: Option<String>,
    tripped_at: Option<DateTime<Utc>>,
}

impl Default for TripState {
    fn default() -> Self {
        Self {
            tripped: false,
            reason: None,
            tripped_at: None,
        }
    }
}

/// Engine-wide circuit breaker. `is_open()` is the stage-1 gate every
/// execution-loop tick consults; any failure to read it must be treated
/// as open (fail-closed), so callers should wrap the read, never the
/// absence of a panic, as their signal.
pub struct CircuitBreaker {
    state: ArcSwap<TripState>,
    trip_lock: Mutex<()>,
    poisoned: AtomicBool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(TripState::default()),
            trip_lock: Mutex::new(()),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Lock-free read. Fails closed: a poisoned internal state reads as
    /// open even though no trip was recorded.
    pub fn is_open(&self) -> bool {
        if self.poisoned.load(Ordering::SeqCst) {
            return true;
        }
        self.state.load().tripped
    }

    pub fn reason(&self) -> Option<String> {
        self.state.load().reason.clone()
    }

    /// Mark the breaker's own state as unreadable/unreliable. From this
    /// point `is_open()` returns true regardless of the trip flag until
    /// `reset()`.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    pub fn trip(&self, reason: TripReason) {
        let _guard = self.trip_lock.lock();
        tracing::error!(reason = %reason.as_str(), "circuit breaker tripped");
        self.state.store(std::sync::Arc::new(TripState {
            tripped: true,
            reason: Some(reason.as_str()),
            tripped_at: Some(Utc::now()),
        }));
    }

    /// Manual reset, e.g. after operator intervention. Clears poisoning
    /// too.
    pub fn reset(&self) {
        let _guard = self.trip_lock.lock();
        self.poisoned.store(false, Ordering::SeqCst);
        self.state.store(std::sync::Arc::new(TripState::default()));
    }
}
