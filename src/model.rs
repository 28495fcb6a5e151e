//! Shared state every worker is bound to.
//!
//! One `Model` is owned by the engine and handed to each worker as an
//! `Arc<Model>`; nothing here is global.
//!
//! Lock order, outermost first: order list, order state, users, gate,
//! catalog, ledger. An order's dish list is only taken under its state or
//! on its own. Drone and staff records, the event bus, the snapshot
//! signal and the worker monitor are leaves and are never held while
//! taking another lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::config::SimConfig;
use crate::drone::SharedDrone;
use crate::error::{Result, SupplyError};
use crate::events::{Event, EventBus};
use crate::gate::ReplenishGate;
use crate::health_monitor::WorkerMonitor;
use crate::ledger::StockLedger;
use crate::location::{Postcode, Restaurant};
use crate::order::{OrderBook, SharedOrder};
use crate::persistence::SnapshotSignal;
use crate::staff::SharedStaff;
use crate::types::{DroneId, WorkerId};
use crate::worker::{CancelToken, WorkerCtx};

/// A customer. `orders` shares the same order objects as the order book.
#[derive(Clone, Debug)]
pub struct User {
    pub name: String,
    pub address: String,
    pub postcode: Postcode,
    pub orders: Vec<SharedOrder>,
}

/// Persisted user; orders are referenced by name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub address: String,
    pub postcode: Postcode,
    pub orders: Vec<String>,
}

impl User {
    pub fn record(&self) -> UserRecord {
        UserRecord {
            name: self.name.clone(),
            address: self.address.clone(),
            postcode: self.postcode.clone(),
            orders: self.orders.iter().map(|o| o.name().to_string()).collect(),
        }
    }
}

pub struct Model {
    pub(crate) config: SimConfig,
    pub(crate) events: EventBus,
    pub(crate) ledger: StockLedger,
    pub(crate) gate: ReplenishGate,
    pub(crate) catalog: Catalog,
    pub(crate) orders: OrderBook,
    pub(crate) users: Mutex<Vec<User>>,
    pub(crate) restaurant: Mutex<Option<Restaurant>>,
    pub(crate) drones: Mutex<Vec<SharedDrone>>,
    pub(crate) staff: Mutex<Vec<SharedStaff>>,
    pub(crate) monitor: Arc<WorkerMonitor>,
    pub(crate) snapshots: SnapshotSignal,
    restock_dishes: AtomicBool,
    restock_ingredients: AtomicBool,
    next_drone_id: AtomicU64,
}

impl Model {
    pub fn new(config: SimConfig) -> Self {
        Self::assemble(config, EventBus::new(), Catalog::new(), OrderBook::new())
    }

    pub(crate) fn assemble(
        config: SimConfig,
        events: EventBus,
        catalog: Catalog,
        orders: OrderBook,
    ) -> Self {
        let gate = ReplenishGate::new(std::time::Duration::from_millis(config.gate_backoff_ms));
        Self {
            ledger: StockLedger::new(events.clone()),
            gate,
            catalog,
            orders,
            users: Mutex::new(Vec::new()),
            restaurant: Mutex::new(None),
            drones: Mutex::new(Vec::new()),
            staff: Mutex::new(Vec::new()),
            monitor: Arc::new(WorkerMonitor::new()),
            snapshots: SnapshotSignal::new(),
            restock_dishes: AtomicBool::new(true),
            restock_ingredients: AtomicBool::new(true),
            next_drone_id: AtomicU64::new(1),
            events,
            config,
        }
    }

    pub(crate) fn users(&self) -> MutexGuard<'_, Vec<User>> {
        self.users.lock().expect("users mutex poisoned")
    }

    pub(crate) fn drones(&self) -> MutexGuard<'_, Vec<SharedDrone>> {
        self.drones.lock().expect("drone list mutex poisoned")
    }

    pub(crate) fn staff(&self) -> MutexGuard<'_, Vec<SharedStaff>> {
        self.staff.lock().expect("staff list mutex poisoned")
    }

    pub fn restaurant(&self) -> Result<Restaurant> {
        let guard = self.restaurant.lock().expect("restaurant mutex poisoned");
        guard.clone().ok_or(SupplyError::NoRestaurant)
    }

    pub(crate) fn set_restaurant(&self, restaurant: Restaurant) {
        let origin = restaurant.postcode.clone();
        {
            let mut guard = self.restaurant.lock().expect("restaurant mutex poisoned");
            *guard = Some(restaurant);
        }
        self.catalog.remeasure(&origin);
        for user in self.users().iter_mut() {
            user.postcode.distance = user.postcode.distance_to(&origin);
        }
    }

    pub fn restocking_dishes(&self) -> bool {
        self.restock_dishes.load(Ordering::SeqCst)
    }

    pub fn restocking_ingredients(&self) -> bool {
        self.restock_ingredients.load(Ordering::SeqCst)
    }

    pub(crate) fn set_restocking(&self, dishes: Option<bool>, ingredients: Option<bool>) {
        if let Some(enabled) = dishes {
            self.restock_dishes.store(enabled, Ordering::SeqCst);
        }
        if let Some(enabled) = ingredients {
            self.restock_ingredients.store(enabled, Ordering::SeqCst);
        }
    }

    pub(crate) fn next_drone_id(&self) -> DroneId {
        self.next_drone_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn peek_drone_id(&self) -> DroneId {
        self.next_drone_id.load(Ordering::SeqCst)
    }

    pub(crate) fn reserve_drone_ids_from(&self, next: DroneId) {
        self.next_drone_id.fetch_max(next, Ordering::SeqCst);
    }

    /// Request a snapshot of the current state.
    pub fn touched(&self) {
        self.snapshots.request();
    }

    /// Entity list or setting changed.
    pub(crate) fn catalog_changed(&self) {
        self.events.publish(Event::CatalogChanged);
        self.touched();
    }

    /// Delivery postcode of the customer who placed `order`.
    pub fn customer_of(&self, order: &SharedOrder) -> Result<(String, Postcode)> {
        let users = self.users();
        users
            .iter()
            .find(|u| u.name == order.customer())
            .map(|u| (u.name.clone(), u.postcode.clone()))
            .ok_or_else(|| SupplyError::CustomerNotFound {
                order: order.name().to_string(),
            })
    }

    pub(crate) fn worker_ctx(&self, id: WorkerId, token: CancelToken) -> WorkerCtx {
        WorkerCtx::new(id, token, Arc::clone(&self.monitor), self.config.cancel_poll())
    }

    pub(crate) fn publish_order(&self, order: &SharedOrder) {
        self.events.publish(Event::OrderChanged {
            order: order.name().to_string(),
            state: order.state(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::Order;
    use std::collections::BTreeMap;

    #[test]
    fn restaurant_is_required() {
        let model = Model::new(SimConfig::accelerated(1));
        assert!(matches!(model.restaurant(), Err(SupplyError::NoRestaurant)));
        model.set_restaurant(Restaurant::new("Home", Postcode::new("SO17 1BJ", 50.937, -1.396)));
        assert_eq!(model.restaurant().expect("restaurant").name, "Home");
    }

    #[test]
    fn missing_customer_is_reported() {
        let model = Model::new(SimConfig::accelerated(1));
        let order: SharedOrder = Arc::new(Order::new("o-1", "ghost", BTreeMap::new()));
        let err = model.customer_of(&order).unwrap_err();
        assert!(matches!(err, SupplyError::CustomerNotFound { .. }));
    }

    #[test]
    fn users_are_remeasured_with_the_restaurant() {
        let model = Model::new(SimConfig::accelerated(1));
        model.users().push(User {
            name: "alice".into(),
            address: "1 High St".into(),
            postcode: Postcode::new("SO15 1AA", 50.91, -1.42),
            orders: Vec::new(),
        });
        model.set_restaurant(Restaurant::new("Home", Postcode::new("SO17 1BJ", 50.937, -1.396)));
        assert!(model.users()[0].postcode.distance > 0.0);
    }
}
