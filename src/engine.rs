//! Public entry point: owns the model, the worker threads and the snapshot
//! writer, and exposes the commands and queries collaborators use.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::SimConfig;
use crate::drone::{Drone, DroneWorker, SharedDrone};
use crate::error::{EntityKind, Result, SupplyError};
use crate::events::Event;
use crate::location::{Postcode, Restaurant};
use crate::model::{Model, User, UserRecord};
use crate::order::{Order, OrderRecord, OrderState, SharedOrder};
use crate::persistence::{ModelSnapshot, SnapshotStore, SnapshotWriter};
use crate::staff::{SharedStaff, Staff, StaffWorker};
use crate::types::{
    Dish, DroneId, Ingredient, ItemKey, ItemKind, Recipe, RestockLevels, Supplier, WorkerId,
};
use crate::worker::WorkerHandle;

pub struct Engine {
    model: Arc<Model>,
    workers: Mutex<HashMap<WorkerId, WorkerHandle>>,
    writer: Mutex<Option<SnapshotWriter>>,
    store: Option<SnapshotStore>,
    recovered: usize,
}

impl Engine {
    /// Start from the last snapshot in `store` if it names a restaurant,
    /// otherwise from an empty model. A snapshot that cannot be read is
    /// logged and ignored.
    pub fn start(config: SimConfig, store: Option<SnapshotStore>) -> Result<Self> {
        let loaded = match store.as_ref().map(SnapshotStore::load) {
            Some(Ok(snapshot)) => snapshot,
            Some(Err(err)) => {
                log::error!("could not load snapshot, starting empty: {err}");
                None
            }
            None => None,
        };
        let (model, recovered) = match loaded {
            Some(snapshot) if snapshot.restaurant.is_some() => {
                let restored = snapshot.restore(config);
                log::info!(
                    "restored snapshot; {} interrupted deliveries back in the kitchen",
                    restored.recovered
                );
                (restored.model, restored.recovered)
            }
            _ => (Model::new(config), 0),
        };
        let model = Arc::new(model);
        let writer = match &store {
            Some(store) => Some(SnapshotWriter::spawn(Arc::clone(&model), store.clone())?),
            None => None,
        };
        let engine = Self {
            model,
            workers: Mutex::new(HashMap::new()),
            writer: Mutex::new(writer),
            store,
            recovered,
        };
        let drones: Vec<SharedDrone> = engine.model.drones().clone();
        for drone in drones {
            engine.launch_drone(drone)?;
        }
        let staff: Vec<SharedStaff> = engine.model.staff().clone();
        for member in staff {
            engine.launch_staff(member)?;
        }
        Ok(engine)
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<WorkerId, WorkerHandle>> {
        self.workers.lock().expect("worker table mutex poisoned")
    }

    fn launch_drone(&self, drone: SharedDrone) -> Result<()> {
        let id = WorkerId::Drone(drone.lock().expect("drone mutex poisoned").id);
        let model = Arc::clone(&self.model);
        let handle = WorkerHandle::spawn(&id, move |token| {
            DroneWorker::new(model, drone, token).run();
        })?;
        self.workers().insert(id, handle);
        Ok(())
    }

    fn launch_staff(&self, staff: SharedStaff) -> Result<()> {
        let id = WorkerId::Staff(staff.lock().expect("staff mutex poisoned").name.clone());
        let model = Arc::clone(&self.model);
        let handle = WorkerHandle::spawn(&id, move |token| {
            StaffWorker::new(model, staff, token).run();
        })?;
        self.workers().insert(id, handle);
        Ok(())
    }

    fn retire(&self, id: &WorkerId) {
        let handle = self.workers().remove(id);
        if let Some(handle) = handle {
            handle.stop();
        }
        self.model.monitor.deregister(id);
    }

    // --- locations -------------------------------------------------------

    pub fn set_restaurant(&self, name: &str, postcode: Postcode) -> Result<()> {
        let restaurant = Restaurant::new(name, postcode);
        match self.model.catalog.add_postcode(restaurant.postcode.clone()) {
            Ok(()) | Err(SupplyError::AlreadyExists { .. }) => {}
            Err(err) => return Err(err),
        }
        self.model.set_restaurant(restaurant);
        self.model.catalog_changed();
        Ok(())
    }

    pub fn restaurant(&self) -> Option<Restaurant> {
        self.model.restaurant().ok()
    }

    /// Register a postcode; its distance is measured from the restaurant.
    pub fn add_postcode(&self, name: &str, latitude: f64, longitude: f64) -> Result<Postcode> {
        let postcode = match self.model.restaurant() {
            Ok(restaurant) => {
                Postcode::measured_from(name, latitude, longitude, &restaurant.postcode)
            }
            Err(_) => Postcode::new(name, latitude, longitude),
        };
        self.model.catalog.add_postcode(postcode.clone())?;
        self.model.catalog_changed();
        Ok(postcode)
    }

    pub fn remove_postcode(&self, name: &str) -> Result<()> {
        if self.restaurant().is_some_and(|r| r.postcode.name == name) {
            return Err(SupplyError::Invalid(format!(
                "postcode \"{name}\" belongs to the restaurant"
            )));
        }
        self.model.catalog.remove_postcode(name)?;
        self.model.catalog_changed();
        Ok(())
    }

    fn known_postcode(&self, name: &str) -> Result<Postcode> {
        self.model
            .catalog
            .postcode(name)
            .ok_or_else(|| SupplyError::not_found(EntityKind::Postcode, name))
    }

    pub fn postcodes(&self) -> Vec<Postcode> {
        self.model.catalog.postcodes()
    }

    // --- suppliers, ingredients, dishes ----------------------------------

    pub fn add_supplier(&self, name: &str, postcode: &str) -> Result<()> {
        let postcode = self.known_postcode(postcode)?;
        self.model.catalog.add_supplier(Supplier::new(name, postcode))?;
        self.model.catalog_changed();
        Ok(())
    }

    pub fn remove_supplier(&self, name: &str) -> Result<()> {
        self.model.catalog.remove_supplier(name)?;
        self.model.catalog_changed();
        Ok(())
    }

    pub fn suppliers(&self) -> Vec<Supplier> {
        self.model.catalog.suppliers()
    }

    /// Add to the supply list and register its ledger row at 0.
    pub fn add_ingredient(&self, ingredient: Ingredient) -> Result<()> {
        let key = ingredient.key();
        self.model.catalog.add_ingredient(ingredient)?;
        self.model.ledger.set(key, 0);
        self.model.catalog_changed();
        Ok(())
    }

    pub fn remove_ingredient(&self, name: &str) -> Result<()> {
        self.model.catalog.remove_ingredient(name)?;
        self.model.ledger.remove(&ItemKey::ingredient(name))?;
        self.model.catalog_changed();
        Ok(())
    }

    pub fn ingredients(&self) -> Vec<Ingredient> {
        self.model.catalog.ingredients().1
    }

    /// Add to the menu and register its ledger row at 0.
    pub fn add_dish(&self, dish: Dish) -> Result<()> {
        let key = dish.key();
        self.model.catalog.add_dish(dish)?;
        self.model.ledger.set(key, 0);
        self.model.catalog_changed();
        Ok(())
    }

    pub fn remove_dish(&self, name: &str) -> Result<()> {
        self.model.catalog.remove_dish(name)?;
        self.model.ledger.remove(&ItemKey::dish(name))?;
        self.model.catalog_changed();
        Ok(())
    }

    pub fn dishes(&self) -> Vec<Dish> {
        self.model.catalog.dishes().1
    }

    pub fn set_recipe(&self, dish: &str, recipe: Recipe) -> Result<()> {
        self.model.catalog.set_recipe(dish, recipe)?;
        self.model.catalog_changed();
        Ok(())
    }

    /// Set how much of `ingredient` one `dish` needs; 0 removes the line.
    pub fn add_ingredient_to_dish(&self, dish: &str, ingredient: &str, quantity: u64) -> Result<()> {
        self.model.catalog.set_recipe_line(dish, ingredient, quantity)?;
        self.model.catalog_changed();
        Ok(())
    }

    pub fn set_restock_levels(&self, item: &ItemKey, threshold: u64, amount: u64) -> Result<()> {
        self.model
            .catalog
            .set_restock_levels(item, RestockLevels { threshold, amount })?;
        self.model.catalog_changed();
        Ok(())
    }

    // --- stock -----------------------------------------------------------

    pub fn stock(&self, item: &ItemKey) -> u64 {
        self.model.ledger.get(item)
    }

    /// Overwrite a registered ledger row.
    pub fn set_stock(&self, item: ItemKey, quantity: u64) -> Result<()> {
        if !self.model.ledger.is_registered(&item) {
            return Err(SupplyError::not_found(EntityKind::Stock, item.to_string()));
        }
        self.model.ledger.set(item, quantity);
        self.model.touched();
        Ok(())
    }

    pub fn dish_stock(&self) -> BTreeMap<String, u64> {
        self.model.ledger.levels(ItemKind::Dish)
    }

    pub fn ingredient_stock(&self) -> BTreeMap<String, u64> {
        self.model.ledger.levels(ItemKind::Ingredient)
    }

    /// Batches reserved but not yet committed.
    pub fn in_flight(&self, item: &ItemKey) -> u32 {
        self.model.gate.in_flight(item)
    }

    pub fn set_restock_dishes(&self, enabled: bool) {
        self.model.set_restocking(Some(enabled), None);
        self.model.catalog_changed();
    }

    pub fn set_restock_ingredients(&self, enabled: bool) {
        self.model.set_restocking(None, Some(enabled));
        self.model.catalog_changed();
    }

    pub fn restocking_dishes(&self) -> bool {
        self.model.restocking_dishes()
    }

    pub fn restocking_ingredients(&self) -> bool {
        self.model.restocking_ingredients()
    }

    // --- workers ---------------------------------------------------------

    pub fn add_drone(&self, speed: f64) -> Result<DroneId> {
        self.add_drone_with_capacity(speed, self.model.config.drone_capacity)
    }

    pub fn add_drone_with_capacity(&self, speed: f64, capacity: f64) -> Result<DroneId> {
        if !(speed > 0.0) || !(capacity > 0.0) {
            return Err(SupplyError::Invalid(format!(
                "drone speed and capacity must be positive (got {speed}, {capacity})"
            )));
        }
        let id = self.model.next_drone_id();
        let mut drone = Drone::new(id, speed, capacity);
        if let Ok(restaurant) = self.model.restaurant() {
            drone.park(&restaurant.postcode);
        }
        let shared = Arc::new(Mutex::new(drone));
        self.model.drones().push(Arc::clone(&shared));
        self.launch_drone(shared)?;
        self.model.catalog_changed();
        Ok(id)
    }

    /// Cancel the drone's worker and wait for it to stop.
    pub fn remove_drone(&self, id: DroneId) -> Result<()> {
        {
            let mut drones = self.model.drones();
            let index = drones
                .iter()
                .position(|d| d.lock().expect("drone mutex poisoned").id == id)
                .ok_or_else(|| SupplyError::not_found(EntityKind::Drone, id.to_string()))?;
            drones.remove(index);
        }
        self.retire(&WorkerId::Drone(id));
        self.model.catalog_changed();
        Ok(())
    }

    pub fn drone(&self, id: DroneId) -> Result<Drone> {
        self.model
            .drones()
            .iter()
            .map(|d| d.lock().expect("drone mutex poisoned").clone())
            .find(|d| d.id == id)
            .ok_or_else(|| SupplyError::not_found(EntityKind::Drone, id.to_string()))
    }

    pub fn drones(&self) -> Vec<Drone> {
        self.model
            .drones()
            .iter()
            .map(|d| d.lock().expect("drone mutex poisoned").clone())
            .collect()
    }

    pub fn add_staff(&self, name: &str) -> Result<()> {
        let shared = {
            let mut staff = self.model.staff();
            if staff
                .iter()
                .any(|s| s.lock().expect("staff mutex poisoned").name == name)
            {
                return Err(SupplyError::already_exists(EntityKind::Staff, name));
            }
            let shared = Arc::new(Mutex::new(Staff::new(name)));
            staff.push(Arc::clone(&shared));
            shared
        };
        self.launch_staff(shared)?;
        self.model.catalog_changed();
        Ok(())
    }

    pub fn remove_staff(&self, name: &str) -> Result<()> {
        {
            let mut staff = self.model.staff();
            let index = staff
                .iter()
                .position(|s| s.lock().expect("staff mutex poisoned").name == name)
                .ok_or_else(|| SupplyError::not_found(EntityKind::Staff, name))?;
            staff.remove(index);
        }
        self.retire(&WorkerId::Staff(name.to_string()));
        self.model.catalog_changed();
        Ok(())
    }

    pub fn staff_member(&self, name: &str) -> Result<Staff> {
        self.model
            .staff()
            .iter()
            .map(|s| s.lock().expect("staff mutex poisoned").clone())
            .find(|s| s.name == name)
            .ok_or_else(|| SupplyError::not_found(EntityKind::Staff, name))
    }

    pub fn staff(&self) -> Vec<Staff> {
        self.model
            .staff()
            .iter()
            .map(|s| s.lock().expect("staff mutex poisoned").clone())
            .collect()
    }

    /// Workers whose last heartbeat is older than `timeout`.
    pub fn unresponsive_workers(&self, timeout: Duration) -> BTreeSet<WorkerId> {
        self.model.monitor.detect_unresponsive(timeout)
    }

    // --- users and orders ------------------------------------------------

    pub fn add_user(&self, name: &str, address: &str, postcode: &str) -> Result<()> {
        let postcode = self.known_postcode(postcode)?;
        {
            let mut users = self.model.users();
            if users.iter().any(|u| u.name == name) {
                return Err(SupplyError::already_exists(EntityKind::User, name));
            }
            users.push(User {
                name: name.to_string(),
                address: address.to_string(),
                postcode,
                orders: Vec::new(),
            });
        }
        self.model.catalog_changed();
        Ok(())
    }

    /// Their orders stay in the order book; undelivered ones can no longer
    /// be dispatched.
    pub fn remove_user(&self, name: &str) -> Result<()> {
        {
            let mut users = self.model.users();
            let index = users
                .iter()
                .position(|u| u.name == name)
                .ok_or_else(|| SupplyError::not_found(EntityKind::User, name))?;
            users.remove(index);
        }
        self.model.catalog_changed();
        Ok(())
    }

    pub fn users(&self) -> Vec<UserRecord> {
        self.model.users().iter().map(User::record).collect()
    }

    /// Check out `dishes` for `user`. Returns the new order's name.
    pub fn place_order(&self, user: &str, dishes: BTreeMap<String, u64>) -> Result<String> {
        let dishes: BTreeMap<String, u64> =
            dishes.into_iter().filter(|(_, qty)| *qty > 0).collect();
        if dishes.is_empty() {
            return Err(SupplyError::Invalid("an order needs at least one dish".into()));
        }
        for name in dishes.keys() {
            if self.model.catalog.dish(name).is_none() {
                return Err(SupplyError::not_found(EntityKind::Dish, name.clone()));
            }
        }
        if !self.model.users().iter().any(|u| u.name == user) {
            return Err(SupplyError::not_found(EntityKind::User, user));
        }

        let name = self.model.orders.next_name();
        let order: SharedOrder = Arc::new(Order::new(name.clone(), user, dishes));
        self.model.orders.push(Arc::clone(&order));
        let attached = {
            let mut users = self.model.users();
            match users.iter_mut().find(|u| u.name == user) {
                Some(found) => {
                    found.orders.push(Arc::clone(&order));
                    true
                }
                None => false,
            }
        };
        if !attached {
            // The user was removed while checking out.
            self.model.orders.remove(&name);
            return Err(SupplyError::not_found(EntityKind::User, user));
        }
        log::info!("order {name} placed by {user}");
        self.model.publish_order(&order);
        self.model.touched();
        Ok(name)
    }

    fn find_order(&self, name: &str) -> Result<SharedOrder> {
        self.model
            .orders
            .find(name)
            .ok_or_else(|| SupplyError::not_found(EntityKind::Order, name))
    }

    /// Cancel a Preparing or OutForDelivery order. A drone carrying it turns
    /// back on its next tick.
    pub fn cancel_order(&self, name: &str) -> Result<()> {
        let order = self.find_order(name)?;
        order.cancel()?;
        log::info!("order {name} cancelled");
        self.model.publish_order(&order);
        self.model.touched();
        Ok(())
    }

    /// Drop a Complete or Cancelled order from the book and its customer's
    /// history.
    pub fn remove_order(&self, name: &str) -> Result<()> {
        let order = self.find_order(name)?;
        let state = order.state();
        if !state.is_terminal() {
            return Err(SupplyError::InvalidTransition {
                order: name.to_string(),
                from: state.to_string(),
                action: "be removed",
            });
        }
        self.model.orders.remove(name);
        for user in self.model.users().iter_mut() {
            user.orders.retain(|o| o.name() != name);
        }
        self.model.catalog_changed();
        Ok(())
    }

    /// Sum of price times quantity at current menu prices. Dishes no longer
    /// on the menu are not charged.
    pub fn order_cost(&self, name: &str) -> Result<f64> {
        let order = self.find_order(name)?;
        let cost = order
            .dishes()
            .iter()
            .filter_map(|(dish, qty)| {
                self.model
                    .catalog
                    .dish(dish)
                    .map(|d| d.price * *qty as f64)
            })
            .sum();
        Ok(cost)
    }

    /// Set the quantity of `dish` on a Preparing order; 0 removes it.
    pub fn add_dish_to_order(&self, order: &str, dish: &str, quantity: u64) -> Result<()> {
        if quantity > 0 && self.model.catalog.dish(dish).is_none() {
            return Err(SupplyError::not_found(EntityKind::Dish, dish));
        }
        let edited = self
            .model
            .orders
            .edit(order, |found| found.set_dish(dish, quantity).map(|()| Arc::clone(found)))
            .ok_or_else(|| SupplyError::not_found(EntityKind::Order, order))??;
        log::info!("order {order}: {dish} x{quantity}");
        self.model.publish_order(&edited);
        self.model.touched();
        Ok(())
    }

    pub fn remove_dish_from_order(&self, order: &str, dish: &str) -> Result<()> {
        self.add_dish_to_order(order, dish, 0)
    }

    /// Metres from the restaurant to the customer's postcode.
    pub fn order_distance(&self, name: &str) -> Result<f64> {
        let order = self.find_order(name)?;
        let (_, postcode) = self.model.customer_of(&order)?;
        Ok(postcode.distance)
    }

    pub fn supplier_distance(&self, name: &str) -> Result<f64> {
        self.model
            .catalog
            .supplier(name)
            .map(|supplier| supplier.postcode.distance)
            .ok_or_else(|| SupplyError::not_found(EntityKind::Supplier, name))
    }

    pub fn order_state(&self, name: &str) -> Result<OrderState> {
        Ok(self.find_order(name)?.state())
    }

    pub fn order(&self, name: &str) -> Result<OrderRecord> {
        Ok(self.find_order(name)?.record())
    }

    pub fn orders(&self) -> Vec<OrderRecord> {
        self.model.orders.all().iter().map(|o| o.record()).collect()
    }

    pub fn user_orders(&self, user: &str) -> Result<Vec<OrderRecord>> {
        let users = self.model.users();
        let found = users
            .iter()
            .find(|u| u.name == user)
            .ok_or_else(|| SupplyError::not_found(EntityKind::User, user))?;
        Ok(found.orders.iter().map(|o| o.record()).collect())
    }

    // --- events and persistence ------------------------------------------

    pub fn subscribe(&self) -> Receiver<Event> {
        self.model.events.subscribe()
    }

    /// Capture the model now and, if a store is configured, write it
    /// synchronously.
    pub fn snapshot_now(&self) -> Result<ModelSnapshot> {
        let snapshot = ModelSnapshot::capture(&self.model);
        if let Some(store) = &self.store {
            store.save(&snapshot)?;
        }
        Ok(snapshot)
    }

    /// Orders that were out for delivery in the restored snapshot.
    pub fn recovered_orders(&self) -> usize {
        self.recovered
    }

    pub fn config(&self) -> &SimConfig {
        &self.model.config
    }

    /// Stop every worker, then flush the last snapshot.
    pub fn shutdown(self) {
        self.stop_all();
    }

    fn stop_all(&self) {
        let handles: Vec<(WorkerId, WorkerHandle)> = self.workers().drain().collect();
        for (_, handle) in &handles {
            handle.cancel();
        }
        for (id, handle) in handles {
            handle.stop();
            self.model.monitor.deregister(&id);
        }
        let writer = self
            .writer
            .lock()
            .expect("snapshot writer mutex poisoned")
            .take();
        if let Some(writer) = writer {
            writer.close();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_all();
    }
}
