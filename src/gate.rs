//! Replenishment gate: serializes "check, then reserve" decisions.
//!
//! Workers take turns holding a single turn token while they decide whether
//! an item needs another batch. A granted decision records an in-flight
//! reservation; the slow part (cooking, flying) then runs without any lock.
//! Committing a reservation applies the ledger change and drops the
//! in-flight count under the same lock decisions read from, so a decider
//! never sees the stock before a commit and the count after it.
//!
//! Fairness: contenders sleep a random backoff before asking for the turn
//! and waiters are woken in no particular order. This is not FIFO; a worker
//! can in principle lose every race under heavy contention.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;

use crate::types::{ItemKey, RestockLevels};
use crate::worker::CancelToken;

const TURN_POLL: Duration = Duration::from_millis(5);

struct GateState {
    turn_taken: bool,
    in_flight: HashMap<ItemKey, u32>,
}

pub struct ReplenishGate {
    state: Mutex<GateState>,
    turn_free: Condvar,
    backoff: Duration,
}

/// True if stock plus batches already on the way stays under threshold.
pub fn below_threshold(on_hand: u64, in_flight: u32, levels: RestockLevels) -> bool {
    if levels.amount == 0 {
        return false;
    }
    let projected = on_hand.saturating_add(u64::from(in_flight).saturating_mul(levels.amount));
    projected < levels.threshold
}

impl ReplenishGate {
    pub fn new(backoff: Duration) -> Self {
        Self {
            state: Mutex::new(GateState {
                turn_taken: false,
                in_flight: HashMap::new(),
            }),
            turn_free: Condvar::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().expect("gate mutex poisoned")
    }

    /// Random pause before contending, up to the configured backoff.
    pub fn backoff(&self) -> Duration {
        let max = self.backoff.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Wait for the turn token. Returns `None` once `token` is cancelled.
    pub fn acquire_turn(&self, token: &CancelToken) -> Option<Turn<'_>> {
        let mut guard = self.lock();
        loop {
            if token.is_cancelled() {
                return None;
            }
            if !guard.turn_taken {
                guard.turn_taken = true;
                return Some(Turn { gate: self });
            }
            // Wait releases the lock and re-acquires it before returning.
            let (next, _) = self
                .turn_free
                .wait_timeout(guard, TURN_POLL)
                .expect("condvar wait failed");
            guard = next;
        }
    }

    /// Reservations currently outstanding for an item.
    pub fn in_flight(&self, item: &ItemKey) -> u32 {
        let guard = self.lock();
        guard.in_flight.get(item).copied().unwrap_or(0)
    }

    pub fn total_in_flight(&self) -> u32 {
        let guard = self.lock();
        guard.in_flight.values().sum()
    }

    fn release(guard: &mut GateState, item: &ItemKey) {
        match guard.in_flight.get_mut(item) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                guard.in_flight.remove(item);
            }
            None => debug_assert!(false, "release without reservation: {item}"),
        }
    }
}

/// Exclusive right to make one replenishment decision.
pub struct Turn<'g> {
    gate: &'g ReplenishGate,
}

impl<'g> Turn<'g> {
    /// Decide for `item`. `wanted` receives the in-flight count and reads the
    /// ledger; it runs under the gate lock so it must not block. The turn is
    /// released when this returns.
    pub fn decide(self, item: &ItemKey, wanted: impl FnOnce(u32) -> bool) -> Option<Reservation<'g>> {
        let mut guard = self.gate.lock();
        let in_flight = guard.in_flight.get(item).copied().unwrap_or(0);
        if !wanted(in_flight) {
            return None;
        }
        *guard.in_flight.entry(item.clone()).or_insert(0) += 1;
        Some(Reservation {
            gate: self.gate,
            item: item.clone(),
            settled: false,
        })
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut guard = self
            .gate
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.turn_taken = false;
        self.gate.turn_free.notify_one();
    }
}

/// One batch promised for an item. Dropping it without committing (for
/// example on cancellation) gives the slot back.
pub struct Reservation<'g> {
    gate: &'g ReplenishGate,
    item: ItemKey,
    settled: bool,
}

impl Reservation<'_> {
    pub fn item(&self) -> &ItemKey {
        &self.item
    }

    /// Apply the ledger change and release the slot atomically with respect
    /// to decisions.
    pub fn commit<R>(mut self, apply: impl FnOnce() -> R) -> R {
        let mut guard = self.gate.lock();
        let result = apply();
        ReplenishGate::release(&mut guard, &self.item);
        self.settled = true;
        drop(guard);
        result
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut guard = self
            .gate
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        ReplenishGate::release(&mut guard, &self.item);
    }
}
