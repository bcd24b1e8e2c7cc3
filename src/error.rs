//! Error taxonomy for the trading core.
//!
//! Every error in the hot path is classified into one of four kinds so the
//! execution loop and orchestrator can apply a uniform policy instead of
//! special-casing call sites. See `ErrorKind` for the policy each kind
//! implies.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Classification of an error as the execution loop or orchestrator must
/// react to it. Ordered roughly by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transient network/API failure: timeout, rate limit, socket close,
    /// stale spot price, a single component evaluation throwing. Logged
    /// with a counter; the caller continues.
    Recoverable,
    /// Authentication failure, persistence corruption, invalid
    /// configuration, schema error. Triggers orchestrator shutdown.
    Fatal,
    /// Position recording failed after a probable successful order, the
    /// verifier found exchange-side positions the core does not track, or
    /// verification itself is rate-limited with a stale cache. Trips the
    /// circuit breaker.
    UncertaintyHalt,
    /// A signal blocked by safeguards, a window without a reference price,
    /// a variation whose threshold was not met. Never escalates.
    Skip,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Recoverable => "recoverable",
            ErrorKind::Fatal => "fatal",
            ErrorKind::UncertaintyHalt => "uncertainty_halt",
            ErrorKind::Skip => "skip",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("recoverable: {0}")]
    Recoverable(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("uncertainty halt: {0}")]
    UncertaintyHalt(String),
    #[error("skip: {0}")]
    Skip(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Recoverable(_) => ErrorKind::Recoverable,
            EngineError::Fatal(_) => ErrorKind::Fatal,
            EngineError::UncertaintyHalt(_) => ErrorKind::UncertaintyHalt,
            EngineError::Skip(_) => ErrorKind::Skip,
        }
    }
}

/// Whether an order-placement attempt is known to have reached the
/// exchange. The compiler, not a comment, forces the confirm/release
/// decision at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOutcome {
    /// The exchange acknowledged or filled the order.
    ReachedExchange,
    /// The request never left the client, or the exchange rejected it
    /// before accepting (e.g. validation failure) — safe to release.
    NeverReachedExchange,
    /// Unknown whether the exchange received it (e.g. request timed out
    /// mid-flight). Must be treated as `ReachedExchange` for safety.
    Ambiguous,
}

impl OrderOutcome {
    /// Halt-on-uncertainty: anything but a clean "never reached the
    /// exchange" must be confirmed, not released.
    pub fn must_confirm(&self) -> bool {
        !matches!(self, OrderOutcome::NeverReachedExchange)
    }
}

#[derive(Debug, Error)]
pub enum PlaceOrderError {
    #[error("order rejected before reaching the exchange: {reason}")]
    RejectedPreSubmit { reason: String },
    #[error("order submission uncertain: {reason}")]
    Uncertain { reason: String },
    #[error("exchange error after submission: {reason}")]
    ExchangeError { reason: String },
}

impl PlaceOrderError {
    pub fn outcome(&self) -> OrderOutcome {
        match self {
            PlaceOrderError::RejectedPreSubmit { .. } => OrderOutcome::NeverReachedExchange,
            PlaceOrderError::Uncertain { .. } => OrderOutcome::Ambiguous,
            PlaceOrderError::ExchangeError { .. } => OrderOutcome::ReachedExchange,
        }
    }
}

/// A bounded ring of recent error timestamps, used for health reporting.
///
/// Caps at 1000 entries and drops anything older than 5 minutes on each
/// push.
#[derive(Debug)]
pub struct ErrorRing {
    entries: VecDeque<(Instant, ErrorKind)>,
    cap: usize,
    window: Duration,
}

impl Default for ErrorRing {
    fn default() -> Self {
        Self::new(1000, Duration::from_secs(300))
    }
}

impl ErrorRing {
    pub fn new(cap: usize, window: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(4096)),
            cap,
            window,
        }
    }

    fn evict_stale(&mut self, now: Instant) {
        while let Some((ts, _)) = self.entries.front() {
            if now.duration_since(*ts) > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record(&mut self, kind: ErrorKind) {
        let now = Instant::now();
        self.evict_stale(now);
        if self.entries.len() >= self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back((now, kind));
    }

    /// Number of errors recorded in the trailing minute. Never exceeds
    /// 1000, monotone within the 60s window, decays to 0 after 60s of
    /// silence.
    pub fn error_count_1m(&mut self) -> usize {
        let now = Instant::now();
        self.evict_stale(now);
        self.entries
            .iter()
            .filter(|(ts, _)| now.duration_since(*ts) <= Duration::from_secs(60))
            .count()
            .min(1000)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_outcome_must_confirm() {
        assert!(!OrderOutcome::NeverReachedExchange.must_confirm());
        assert!(OrderOutcome::ReachedExchange.must_confirm());
        assert!(OrderOutcome::Ambiguous.must_confirm());
    }

    #[test]
    fn place_order_error_outcome_mapping() {
        let e = PlaceOrderError::RejectedPreSubmit {
            reason: "bad size".into(),
        };
        assert_eq!(e.outcome(), OrderOutcome::NeverReachedExchange);
        assert!(!e.outcome().must_confirm());

        let e = PlaceOrderError::ExchangeError {
            reason: "5xx".into(),
        };
        assert!(e.outcome().must_confirm());
    }

    #[test]
    fn ring_caps_and_counts() {
        let mut ring = ErrorRing::new(5, Duration::from_secs(300));
        for _ in 0..10 {
            ring.record(ErrorKind::Recoverable);
        }
        assert_eq!(ring.len(), 5);
        assert!(ring.error_count_1m() <= 1000);
    }

    #[test]
    fn ring_starts_empty() {
        let mut ring = ErrorRing::default();
        assert_eq!(ring.error_count_1m(), 0);
        assert!(ring.is_empty());
    }
}
