//! Crash-safe snapshots of the whole model.
//!
//! Every mutation calls `Model::touched`, which only raises a flag. A
//! background writer coalesces those requests over the debounce window and
//! then serializes the full model once. Each write still costs O(model
//! size); the debounce bounds how often that cost is paid, not its size.
//!
//! Each save writes its own `<path>.<pid>.<seq>.tmp` and renames it over
//! `<path>`, so a reader sees either the previous snapshot or the new one,
//! even when the writer thread and `snapshot_now` save at the same time.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::config::SimConfig;
use crate::drone::Drone;
use crate::error::PersistenceError;
use crate::events::EventBus;
use crate::ledger::StockRecord;
use crate::location::{Postcode, Restaurant};
use crate::model::{Model, User, UserRecord};
use crate::order::{Order, OrderBook, OrderRecord, SharedOrder};
use crate::staff::{self, Staff};
use crate::types::{Dish, DroneId, Ingredient, Supplier};

/// Snapshot format version; bump when the layout changes.
pub const SNAPSHOT_VERSION: u32 = 1;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

struct SignalState {
    pending: bool,
    closed: bool,
}

/// "A snapshot is wanted" flag shared by all mutators and the writer.
pub struct SnapshotSignal {
    state: Mutex<SignalState>,
    ready: Condvar,
}

impl SnapshotSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SignalState {
                pending: false,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn request(&self) {
        let mut guard = self.state.lock().expect("snapshot signal mutex poisoned");
        if guard.closed || guard.pending {
            return;
        }
        guard.pending = true;
        self.ready.notify_one();
    }

    /// Block until a snapshot is requested. Returns false once the signal is
    /// closed and nothing is pending.
    pub fn wait(&self) -> bool {
        let mut guard = self.state.lock().expect("snapshot signal mutex poisoned");
        loop {
            if guard.pending {
                return true;
            }
            if guard.closed {
                return false;
            }
            // Wait releases the lock and re-acquires it before returning.
            guard = self.ready.wait(guard).expect("condvar wait failed");
        }
    }

    /// Clear the pending flag right before capturing. Requests made after
    /// this call trigger another write.
    pub fn absorb(&self) {
        let mut guard = self.state.lock().expect("snapshot signal mutex poisoned");
        guard.pending = false;
    }

    pub fn is_closed(&self) -> bool {
        let guard = self.state.lock().expect("snapshot signal mutex poisoned");
        guard.closed
    }

    /// Stop accepting requests and wake the writer; a pending request is
    /// still honoured.
    pub fn close(&self) {
        let mut guard = self.state.lock().expect("snapshot signal mutex poisoned");
        guard.closed = true;
        self.ready.notify_all();
    }
}

impl Default for SnapshotSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Full serialized model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub version: u32,
    pub restaurant: Option<Restaurant>,
    pub dishes: Vec<Dish>,
    pub ingredients: Vec<Ingredient>,
    pub suppliers: Vec<Supplier>,
    pub postcodes: Vec<Postcode>,
    pub users: Vec<UserRecord>,
    pub orders: Vec<OrderRecord>,
    pub drones: Vec<Drone>,
    pub staff: Vec<Staff>,
    pub stock: Vec<StockRecord>,
    pub restock_dishes: bool,
    pub restock_ingredients: bool,
    pub next_drone_id: DroneId,
}

#[derive(Deserialize)]
struct Header {
    version: u32,
}

impl ModelSnapshot {
    /// Copy the model one structure at a time; no two locks are held
    /// together except an order's state under the order list.
    pub fn capture(model: &Model) -> Self {
        let restaurant = model.restaurant().ok();
        let (_, dishes) = model.catalog.dishes();
        let (_, ingredients) = model.catalog.ingredients();
        let users = model.users().iter().map(User::record).collect();
        let orders = model.orders.all().iter().map(|o| o.record()).collect();
        let drones = model
            .drones()
            .iter()
            .map(|d| d.lock().expect("drone mutex poisoned").clone())
            .collect();
        let staff = model
            .staff()
            .iter()
            .map(|s| s.lock().expect("staff mutex poisoned").clone())
            .collect();
        Self {
            version: SNAPSHOT_VERSION,
            restaurant,
            dishes,
            ingredients,
            suppliers: model.catalog.suppliers(),
            postcodes: model.catalog.postcodes(),
            users,
            orders,
            drones,
            staff,
            stock: model.ledger.records(),
            restock_dishes: model.restocking_dishes(),
            restock_ingredients: model.restocking_ingredients(),
            next_drone_id: model.peek_drone_id(),
        }
    }

    /// Rebuild a model. Interrupted deliveries go back to Preparing, drones
    /// and staff come back idle, and no reservation survives.
    pub fn restore(self, config: SimConfig) -> Restored {
        let mut recovered = 0;
        let orders: Vec<SharedOrder> = self
            .orders
            .into_iter()
            .map(|record| {
                let order = Order::from_record(record);
                if order.reset_interrupted_delivery() {
                    recovered += 1;
                }
                Arc::new(order)
            })
            .collect();
        let book = OrderBook::from_orders(orders);
        let catalog =
            Catalog::from_parts(self.dishes, self.ingredients, self.suppliers, self.postcodes);
        let model = Model::assemble(config, EventBus::new(), catalog, book);

        if let Some(restaurant) = self.restaurant.clone() {
            model.set_restaurant(restaurant);
        }
        for record in self.stock {
            model.ledger.set(record.item, record.quantity);
        }
        // Resolve histories before taking the users lock.
        let users: Vec<User> = self
            .users
            .into_iter()
            .map(|record| User {
                orders: record
                    .orders
                    .iter()
                    .filter_map(|name| model.orders.find(name))
                    .collect(),
                name: record.name,
                address: record.address,
                postcode: record.postcode,
            })
            .collect();
        model.users().extend(users);
        let home = self.restaurant.map(|r| r.postcode);
        let mut next_id = self.next_drone_id;
        {
            let mut drones = model.drones();
            for mut drone in self.drones {
                match &home {
                    Some(home) => drone.park(home),
                    None => {
                        drone.status = crate::drone::IDLE.to_string();
                        drone.current_order = None;
                        drone.progress = 0.0;
                    }
                }
                next_id = next_id.max(drone.id + 1);
                drones.push(Arc::new(Mutex::new(drone)));
            }
        }
        model.reserve_drone_ids_from(next_id);
        {
            let mut staff = model.staff();
            for mut member in self.staff {
                member.status = staff::IDLE.to_string();
                staff.push(Arc::new(Mutex::new(member)));
            }
        }
        model.set_restocking(Some(self.restock_dishes), Some(self.restock_ingredients));
        Restored { model, recovered }
    }
}

/// A model rebuilt from disk.
pub struct Restored {
    pub model: Model,
    /// Orders that were out for delivery and went back to Preparing.
    pub recovered: usize,
}

/// Location of the snapshot file.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fresh temp file next to the snapshot; never shared between saves.
    fn temp_path(&self) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::SeqCst);
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{}.{seq}.tmp", std::process::id()));
        PathBuf::from(name)
    }

    pub fn save(&self, snapshot: &ModelSnapshot) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();
        if let Err(err) = fs::write(&temp, bytes).and_then(|()| fs::rename(&temp, &self.path)) {
            let _ = fs::remove_file(&temp);
            return Err(err.into());
        }
        Ok(())
    }

    /// `Ok(None)` when no snapshot has been written yet.
    pub fn load(&self) -> Result<Option<ModelSnapshot>, PersistenceError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        let header: Header = serde_json::from_slice(&bytes)?;
        if header.version != SNAPSHOT_VERSION {
            return Err(PersistenceError::VersionMismatch {
                expected: SNAPSHOT_VERSION,
                found: header.version,
            });
        }
        let snapshot = serde_json::from_slice(&bytes)?;
        Ok(Some(snapshot))
    }
}

/// Background thread that turns snapshot requests into writes.
pub struct SnapshotWriter {
    model: Arc<Model>,
    join: Option<JoinHandle<()>>,
}

impl SnapshotWriter {
    pub fn spawn(model: Arc<Model>, store: SnapshotStore) -> std::io::Result<Self> {
        let worker_model = Arc::clone(&model);
        let join = thread::Builder::new()
            .name("snapshot-writer".to_string())
            .spawn(move || write_loop(&worker_model, &store))?;
        Ok(Self {
            model,
            join: Some(join),
        })
    }

    /// Flush anything pending and stop the thread.
    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.model.snapshots.close();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("snapshot writer panicked");
            }
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.finish();
    }
}

fn write_loop(model: &Model, store: &SnapshotStore) {
    let signal = &model.snapshots;
    let debounce = model.config.snapshot_debounce();
    while signal.wait() {
        if !signal.is_closed() {
            // Let a burst of mutations settle into one write.
            thread::sleep(debounce);
        }
        signal.absorb();
        let snapshot = ModelSnapshot::capture(model);
        match store.save(&snapshot) {
            Ok(()) => log::trace!("snapshot written to {}", store.path().display()),
            Err(err) => log::error!("snapshot failed: {err}"),
        }
    }
    log::debug!("snapshot writer stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderState;
    use crate::types::ItemKey;
    use std::collections::BTreeMap;

    fn scratch_path(tag: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let seq = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "sushi_supply_{tag}_{}_{seq}.json",
            std::process::id()
        ))
    }

    /// Temp files left next to the snapshot.
    fn leftover_temps(store: &SnapshotStore) -> usize {
        let Some(name) = store.path().file_name().and_then(|n| n.to_str()) else {
            return 0;
        };
        let Ok(entries) = fs::read_dir(std::env::temp_dir()) else {
            return 0;
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|file| file.starts_with(name) && file.ends_with(".tmp"))
            .count()
    }

    fn sample_model() -> Model {
        let model = Model::new(SimConfig::accelerated(1));
        model.set_restaurant(Restaurant::new("Home", Postcode::new("SO17 1BJ", 50.937, -1.396)));
        model
            .catalog
            .add_dish(Dish::new("Maki", "rolls", 3.0, 5, 10))
            .expect("dish");
        model.ledger.set(ItemKey::dish("Maki"), 7);
        let order: SharedOrder = Arc::new(Order::new(
            "o-1",
            "alice",
            BTreeMap::from([("Maki".to_string(), 1)]),
        ));
        order.dispatch().expect("dispatch");
        model.orders.push(Arc::clone(&order));
        model.users().push(User {
            name: "alice".into(),
            address: "1 High St".into(),
            postcode: Postcode::new("SO15 1AA", 50.91, -1.42),
            orders: vec![order],
        });
        let mut drone = Drone::new(model.next_drone_id(), 10.0, 100.0);
        drone.battery = 42.0;
        drone.status = "Delivering order o-1 to alice".into();
        drone.current_order = Some("o-1".into());
        model.drones().push(Arc::new(Mutex::new(drone)));
        model
    }

    #[test]
    fn restore_resets_interrupted_deliveries() {
        let snapshot = ModelSnapshot::capture(&sample_model());
        let restored = snapshot.restore(SimConfig::accelerated(1));
        assert_eq!(restored.recovered, 1);
        let model = restored.model;
        let order = model.orders.find("o-1").expect("order");
        assert_eq!(order.state(), OrderState::Preparing);
        // The user's history shares the order object with the book.
        assert!(Arc::ptr_eq(&model.users()[0].orders[0], &order));
        let drone = model.drones()[0].lock().expect("drone").clone();
        assert_eq!(drone.battery, 42.0);
        assert_eq!(drone.status, crate::drone::IDLE);
        assert!(drone.current_order.is_none());
        assert_eq!(model.ledger.get(&ItemKey::dish("Maki")), 7);
        assert!(model.next_drone_id() > drone.id);
    }

    #[test]
    fn store_round_trips_through_a_file() {
        let store = SnapshotStore::new(scratch_path("store"));
        assert!(store.load().expect("load").is_none());
        let snapshot = ModelSnapshot::capture(&sample_model());
        store.save(&snapshot).expect("save");
        assert_eq!(leftover_temps(&store), 0);
        let loaded = store.load().expect("load").expect("snapshot present");
        assert_eq!(loaded, snapshot);
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn concurrent_saves_never_expose_a_partial_file() {
        let store = SnapshotStore::new(scratch_path("concurrent"));
        let snapshot = ModelSnapshot::capture(&sample_model());
        store.save(&snapshot).expect("first save");
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writers: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                let snapshot = snapshot.clone();
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut failures = 0;
                    while !done.load(Ordering::SeqCst) {
                        if store.save(&snapshot).is_err() {
                            failures += 1;
                        }
                    }
                    failures
                })
            })
            .collect();
        for _ in 0..500 {
            let loaded = store.load().expect("readable").expect("present");
            assert_eq!(loaded, snapshot);
        }
        done.store(true, Ordering::SeqCst);
        let failures: usize = writers
            .into_iter()
            .map(|w| w.join().expect("writer panicked"))
            .sum();
        assert_eq!(failures, 0);
        assert_eq!(leftover_temps(&store), 0);
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn version_mismatch_is_reported() {
        let store = SnapshotStore::new(scratch_path("version"));
        let mut snapshot = ModelSnapshot::capture(&sample_model());
        snapshot.version = SNAPSHOT_VERSION + 1;
        store.save(&snapshot).expect("save");
        let err = store.load().unwrap_err();
        assert!(matches!(err, PersistenceError::VersionMismatch { .. }));
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn write_failures_do_not_panic() {
        let dir = scratch_path("missing_dir");
        let store = SnapshotStore::new(dir.join("nested").join("snapshot.json"));
        let err = store
            .save(&ModelSnapshot::capture(&sample_model()))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Io(_)));
    }

    #[test]
    fn writer_flushes_on_close() {
        let model = Arc::new(sample_model());
        let store = SnapshotStore::new(scratch_path("writer"));
        let writer = SnapshotWriter::spawn(Arc::clone(&model), store.clone()).expect("spawn");
        model.touched();
        writer.close();
        let loaded = store.load().expect("load").expect("snapshot present");
        assert_eq!(loaded.orders.len(), 1);
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn signal_coalesces_requests() {
        let signal = SnapshotSignal::new();
        signal.request();
        signal.request();
        assert!(signal.wait());
        signal.absorb();
        signal.close();
        signal.request();
        assert!(!signal.wait());
    }
}
