//! Safeguards: entry rate limiting, signal dedup, and the
//! reserve→confirm/release state machine keyed by `(windowId, strategyId)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationState {
    Reserved,
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationKey {
    pub window_id_hash: u64,
    pub strategy_id_hash: u64,
}

fn hash_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

impl ReservationKey {
    pub fn new(window_id: &str, strategy_id: &str) -> Self {
        Self {
            window_id_hash: hash_str(window_id),
            strategy_id_hash: hash_str(strategy_id),
        }
    }
}

pub struct Safeguards {
    reservations: Mutex<HashMap<ReservationKey, ReservationState>>,
    tick_entries: AtomicU32,
    max_entries_per_tick: u32,
}

impl Safeguards {
    pub fn new(max_entries_per_tick: u32) -> Self {
        Self {
            reservations: Mutex::new(HashMap::new()),
            tick_entries: AtomicU32::new(0),
            max_entries_per_tick,
        }
    }

    /// Called at the start of the entry-processing stage each tick.
    pub fn reset_tick_entries(&self) {
        self.tick_entries.store(0, Ordering::SeqCst);
    }

    /// Consults and increments the per-tick counter; `false` means the
    /// caller must skip this entry this tick.
    pub fn can_enter_position(&self) -> bool {
        let prev = self.tick_entries.fetch_add(1, Ordering::SeqCst);
        prev < self.max_entries_per_tick
    }

    /// `NONE -> reserved`. Mutually exclusive: a second concurrent call
    /// for the same key returns `false`.
    pub fn reserve_entry(&self, window_id: &str, strategy_id: &str) -> bool {
        let key = ReservationKey::new(window_id, strategy_id);
        let mut guard = self.reservations.lock();
        if guard.contains_key(&key) {
            return false;
        }
        guard.insert(key, ReservationState::Reserved);
        true
    }

    /// `reserved -> confirmed`. No-op (returns false) if not currently
    /// reserved.
    pub fn confirm_entry(&self, window_id: &str, strategy_id: &str) -> bool {
        let key = ReservationKey::new(window_id, strategy_id);
        let mut guard = self.reservations.lock();
        match guard.get_mut(&key) {
            Some(state @ ReservationState::Reserved) => {
                *state = ReservationState::Confirmed;
                true
            }
            _ => false,
        }
    }

    /// `reserved -> NONE`. Only valid when the caller can prove the order
    /// never reached the exchange; see `crate::error::OrderOutcome`.
    pub fn release_entry(&self, window_id: &str, strategy_id: &str) -> bool {
        let key = ReservationKey::new(window_id, strategy_id);
        let mut guard = self.reservations.lock();
        match guard.get(&key) {
            Some(ReservationState::Reserved) => {
                guard.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// `confirmed -> NONE`, called on position close.
    pub fn remove_entry(&self, window_id: &str, strategy_id: &str) -> bool {
        let key = ReservationKey::new(window_id, strategy_id);
        let mut guard = self.reservations.lock();
        guard.remove(&key).is_some()
    }

    pub fn is_reserved(&self, window_id: &str, strategy_id: &str) -> bool {
        let key = ReservationKey::new(window_id, strategy_id);
        self.reservations.lock().contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_exclusivity() {
        let sg = Safeguards::new(10);
        assert!(sg.reserve_entry("w1", "s1"));
        assert!(!sg.reserve_entry("w1", "s1"));
    }

    #[test]
    fn confirm_then_remove_on_close() {
        let sg = Safeguards::new(10);
        assert!(sg.reserve_entry("w1", "s1"));
        assert!(sg.confirm_entry("w1", "s1"));
        assert!(!sg.release_entry("w1", "s1"), "confirmed cannot be released");
        assert!(sg.remove_entry("w1", "s1"));
        assert!(!sg.is_reserved("w1", "s1"));
    }

    #[test]
    fn release_only_valid_while_reserved() {
        let sg = Safeguards::new(10);
        assert!(sg.reserve_entry("w1", "s1"));
        assert!(sg.release_entry("w1", "s1"));
        assert!(sg.reserve_entry("w1", "s1"), "key free again after release");
    }

    #[test]
    fn per_tick_counter_caps_entries() {
        let sg = Safeguards::new(2);
        assert!(sg.can_enter_position());
        assert!(sg.can_enter_position());
        assert!(!sg.can_enter_position());
        sg.reset_tick_entries();
        assert!(sg.can_enter_position());
    }

    #[test]
    fn duplicate_signal_dedup_scenario() {
        let sg = Safeguards::new(10);
        let first = sg.reserve_entry("btc-15m-E", "S");
        let second = sg.reserve_entry("btc-15m-E", "S");
        assert!(first);
        assert!(!second);
    }
}
