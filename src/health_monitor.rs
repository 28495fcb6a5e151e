//! Liveness of staff and drone threads.
//!
//! Every `WorkerCtx` checkpoint counts as a pulse. A worker that goes longer
//! than the caller's timeout without one (stuck on a lock, waiting for the
//! replenish turn, or wedged in a long sleep that skips checkpoints) is
//! flagged until its next pulse. Flags are sticky between scans so a brief
//! stall is still visible to whoever asks next.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::types::WorkerId;

struct Pulse {
    last: Instant,
    flagged: bool,
}

impl Pulse {
    fn fresh() -> Self {
        Self {
            last: Instant::now(),
            flagged: false,
        }
    }
}

pub struct WorkerMonitor {
    pulses: Mutex<HashMap<WorkerId, Pulse>>,
}

impl WorkerMonitor {
    pub fn new() -> Self {
        Self {
            pulses: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkerId, Pulse>> {
        self.pulses.lock().expect("worker monitor mutex poisoned")
    }

    /// A new worker counts as alive from the moment it is registered.
    pub fn register(&self, worker: WorkerId) {
        self.lock().entry(worker).or_insert_with(Pulse::fresh);
    }

    /// Forget a retired staff member or drone.
    pub fn deregister(&self, worker: &WorkerId) {
        self.lock().remove(worker);
    }

    pub fn heartbeat(&self, worker: &WorkerId) {
        let mut guard = self.lock();
        match guard.get_mut(worker) {
            Some(pulse) => *pulse = Pulse::fresh(),
            None => {
                guard.insert(worker.clone(), Pulse::fresh());
            }
        }
    }

    /// Flag every worker silent for longer than `timeout` and return all
    /// flagged workers, including ones flagged by an earlier scan.
    pub fn detect_unresponsive(&self, timeout: Duration) -> BTreeSet<WorkerId> {
        let now = Instant::now();
        let mut guard = self.lock();
        guard
            .iter_mut()
            .filter_map(|(worker, pulse)| {
                if now.saturating_duration_since(pulse.last) > timeout {
                    pulse.flagged = true;
                }
                pulse.flagged.then(|| worker.clone())
            })
            .collect()
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    fn backdate(&self, worker: WorkerId, by: Duration) {
        let last = Instant::now() - by;
        self.lock().insert(
            worker,
            Pulse {
                last,
                flagged: false,
            },
        );
    }
}

impl Default for WorkerMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::ReplenishGate;
    use crate::worker::{CancelToken, WorkerCtx};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn a_drone_silent_past_the_timeout_is_flagged() {
        let monitor = WorkerMonitor::new();
        monitor.backdate(WorkerId::Drone(7), Duration::from_millis(50));
        monitor.register(WorkerId::Drone(8));
        let silent = monitor.detect_unresponsive(Duration::from_millis(10));
        assert_eq!(silent, BTreeSet::from([WorkerId::Drone(7)]));
    }

    #[test]
    fn flags_stick_until_the_next_checkpoint() {
        let monitor = WorkerMonitor::new();
        let ann = WorkerId::Staff("Ann".into());
        monitor.backdate(ann.clone(), Duration::from_millis(30));
        assert!(monitor.detect_unresponsive(Duration::from_millis(5)).contains(&ann));
        // A generous timeout does not clear a flag by itself.
        assert!(monitor.detect_unresponsive(Duration::from_secs(5)).contains(&ann));
        monitor.heartbeat(&ann);
        assert!(monitor.detect_unresponsive(Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn retired_workers_are_forgotten() {
        let monitor = WorkerMonitor::new();
        let drone = WorkerId::Drone(3);
        monitor.backdate(drone.clone(), Duration::from_secs(5));
        assert!(monitor.detect_unresponsive(Duration::from_secs(1)).contains(&drone));
        monitor.deregister(&drone);
        assert!(monitor.detect_unresponsive(Duration::from_secs(1)).is_empty());
        assert_eq!(monitor.tracked(), 0);
    }

    #[test]
    fn staff_stuck_waiting_for_the_turn_is_reported() {
        let monitor = Arc::new(WorkerMonitor::new());
        let gate = ReplenishGate::new(Duration::ZERO);
        let slice = Duration::from_millis(1);
        let ann = WorkerId::Staff("Ann".into());
        let drone = WorkerId::Drone(1);
        let cook = WorkerCtx::new(ann.clone(), CancelToken::new(), Arc::clone(&monitor), slice);
        let flyer_token = CancelToken::new();
        let flyer = WorkerCtx::new(drone.clone(), flyer_token.clone(), Arc::clone(&monitor), slice);

        let held = gate.acquire_turn(&CancelToken::new()).expect("turn");
        let (while_blocked, after) = thread::scope(|scope| {
            let gate = &gate;
            let cooking = scope.spawn(move || {
                cook.checkpoint().expect("not cancelled");
                let turn = gate.acquire_turn(cook.token());
                drop(turn);
                cook.checkpoint().expect("not cancelled");
            });
            // Sleeping through the ctx keeps the drone's pulse going.
            scope.spawn(move || while flyer.sleep(Duration::from_millis(5)).is_ok() {});

            thread::sleep(Duration::from_millis(80));
            let while_blocked = monitor.detect_unresponsive(Duration::from_millis(30));
            drop(held);
            cooking.join().expect("staff thread panicked");
            let after = monitor.detect_unresponsive(Duration::from_secs(5));
            flyer_token.cancel();
            (while_blocked, after)
        });
        assert!(while_blocked.contains(&ann));
        assert!(!while_blocked.contains(&drone));
        assert!(!after.contains(&ann));
    }
}
