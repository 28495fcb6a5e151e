//! Change notifications for the layer that replicates state to clients.
//!
//! The core publishes here and never knows about transport. Subscribers get
//! an unbounded `mpsc` receiver; dropped receivers are pruned on publish.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::order::OrderState;
use crate::types::{DroneId, ItemKey};

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    StockChanged { item: ItemKey, quantity: u64 },
    StockRemoved { item: ItemKey },
    OrderChanged { order: String, state: OrderState },
    DroneChanged {
        drone: DroneId,
        status: String,
        progress: f64,
        battery: f64,
    },
    StaffChanged {
        name: String,
        status: String,
        fatigue: f64,
    },
    /// A staff member finished a batch; `quantity` is the batch size.
    BatchPrepared {
        staff: String,
        dish: String,
        quantity: u64,
    },
    /// A drone returned to base and committed its manifest.
    TripCompleted {
        drone: DroneId,
        manifest: BTreeMap<String, u64>,
        weight: f64,
    },
    /// Entities were added or removed, or settings toggled.
    CatalogChanged,
}

/// Cheaply cloneable fan-out publisher.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        let mut guard = self.subscribers.lock().expect("event bus mutex poisoned");
        guard.push(tx);
        rx
    }

    pub fn publish(&self, event: Event) {
        let mut guard = self.subscribers.lock().expect("event bus mutex poisoned");
        if guard.is_empty() {
            return;
        }
        guard.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let guard = self.subscribers.lock().expect("event bus mutex poisoned");
        guard.len()
    }
}
