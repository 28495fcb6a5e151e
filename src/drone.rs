//! Delivery drones: ingredient runs to suppliers and order deliveries.
//!
//! Each idle cycle a drone first restocks ingredients, batching several
//! suppliers into one trip while its remaining capacity allows, and then
//! delivers the first ready order in the order book. Travel is simulated in
//! ticks; each tick covers `speed` metres and drains `battery_per_tick`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::SupplyError;
use crate::events::Event;
use crate::gate::{Reservation, below_threshold};
use crate::location::{Postcode, Restaurant, round2};
use crate::model::Model;
use crate::order::{OrderState, SharedOrder};
use crate::types::{DroneId, Ingredient, Supplier, WorkerId};
use crate::worker::{CancelToken, Halt, WorkerCtx, report_failure};

pub const IDLE: &str = "Idle";
const FULL_BATTERY: f64 = 100.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Drone {
    pub id: DroneId,
    /// Metres covered per tick.
    pub speed: f64,
    /// Maximum carried weight.
    pub capacity: f64,
    pub battery: f64,
    pub progress: f64,
    pub status: String,
    pub source: Option<Postcode>,
    pub destination: Option<Postcode>,
    pub current_order: Option<String>,
}

impl Drone {
    pub fn new(id: DroneId, speed: f64, capacity: f64) -> Self {
        Self {
            id,
            speed,
            capacity,
            battery: FULL_BATTERY,
            progress: 0.0,
            status: IDLE.to_string(),
            source: None,
            destination: None,
            current_order: None,
        }
    }

    /// Back at base with nothing to do; battery is kept.
    pub fn park(&mut self, home: &Postcode) {
        self.status = IDLE.to_string();
        self.progress = 0.0;
        self.source = Some(home.clone());
        self.destination = Some(home.clone());
        self.current_order = None;
    }
}

pub type SharedDrone = Arc<Mutex<Drone>>;

/// How a leg ended.
#[derive(Debug, PartialEq)]
enum Leg {
    Arrived,
    /// The watched order was cancelled after `covered` metres.
    Aborted { covered: f64 },
}

/// One reserved ingredient batch on the current trip.
struct Pickup<'g> {
    ingredient: Ingredient,
    supplier: Supplier,
    reservation: Reservation<'g>,
}

pub struct DroneWorker {
    model: Arc<Model>,
    drone: SharedDrone,
    id: DroneId,
    ctx: WorkerCtx,
}

impl DroneWorker {
    pub fn new(model: Arc<Model>, drone: SharedDrone, token: CancelToken) -> Self {
        let id = drone.lock().expect("drone mutex poisoned").id;
        let ctx = model.worker_ctx(WorkerId::Drone(id), token);
        Self {
            model,
            drone,
            id,
            ctx,
        }
    }

    pub fn run(self) {
        log::info!("{} on duty", self.ctx.id());
        loop {
            let idle = match self.cycle() {
                Ok(worked) => !worked,
                Err(Halt::Cancelled) => break,
                Err(Halt::Failed(err)) => {
                    report_failure(self.ctx.id(), &err);
                    true
                }
            };
            if idle && self.ctx.sleep(self.model.config.idle_poll()).is_err() {
                break;
            }
        }
        self.abandon_delivery();
        log::debug!("{} stopping", self.ctx.id());
    }

    /// Returns whether any trip was flown.
    fn cycle(&self) -> Result<bool, Halt> {
        self.ctx.checkpoint()?;
        let restaurant = match self.model.restaurant() {
            Ok(restaurant) => restaurant,
            Err(SupplyError::NoRestaurant) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        self.park(&restaurant);
        let mut worked = false;
        if self.model.restocking_ingredients() {
            worked |= self.restock_ingredients(&restaurant)? > 0;
        }
        worked |= self.deliver_next_order(&restaurant)?;
        Ok(worked)
    }

    /// A decommissioned drone cannot finish its delivery; the order goes
    /// back to the kitchen, as it would after a restart.
    fn abandon_delivery(&self) {
        let current = self.drone.lock().expect("drone mutex poisoned").current_order.take();
        let Some(name) = current else {
            return;
        };
        if let Some(order) = self.model.orders.find(&name) {
            if order.reset_interrupted_delivery() {
                log::warn!("{}: order {name} returned to preparing", self.ctx.id());
                self.model.publish_order(&order);
                self.model.touched();
            }
        }
    }

    fn park(&self, restaurant: &Restaurant) {
        let parked = {
            let drone = self.drone.lock().expect("drone mutex poisoned");
            drone.status == IDLE
                && drone.progress == 0.0
                && drone.current_order.is_none()
                && drone.destination.as_ref() == Some(&restaurant.postcode)
        };
        if !parked {
            self.update(|drone| drone.park(&restaurant.postcode));
        }
    }

    fn capacity(&self) -> f64 {
        self.drone.lock().expect("drone mutex poisoned").capacity
    }

    fn battery(&self) -> f64 {
        self.drone.lock().expect("drone mutex poisoned").battery
    }

    // --- ingredient runs -------------------------------------------------

    /// One pass over the supply list. Returns the number of trips flown.
    fn restock_ingredients(&self, restaurant: &Restaurant) -> Result<usize, Halt> {
        let (version, supplies) = self.model.catalog.ingredients();
        let mut trips = 0;
        for listed in &supplies {
            loop {
                self.ctx.checkpoint()?;
                self.model.catalog.ensure_version(version)?;
                let Some(first) = self.reserve_ingredient(&listed.name, self.capacity())? else {
                    break;
                };
                self.collect_trip(restaurant, first, &supplies)?;
                trips += 1;
            }
        }
        Ok(trips)
    }

    /// Reserve one batch of `name` if it is below threshold and a whole
    /// batch fits in `room`. Batches are never split.
    fn reserve_ingredient(&self, name: &str, room: f64) -> Result<Option<Pickup<'_>>, Halt> {
        let Some(ingredient) = self.model.catalog.ingredient(name) else {
            return Ok(None);
        };
        if ingredient.restock.amount == 0 || ingredient.batch_weight() > room {
            return Ok(None);
        }
        let key = ingredient.key();
        let ledger = &self.model.ledger;
        let gate = &self.model.gate;
        if !below_threshold(ledger.get(&key), gate.in_flight(&key), ingredient.restock) {
            return Ok(None);
        }
        let Some(supplier) = self.model.catalog.supplier(&ingredient.supplier) else {
            log::warn!("{}: no supplier for {name}", self.ctx.id());
            return Ok(None);
        };
        self.ctx.sleep(gate.backoff())?;
        let turn = gate.acquire_turn(self.ctx.token()).ok_or(Halt::Cancelled)?;
        let levels = ingredient.restock;
        let reservation = turn.decide(&key, |in_flight| {
            below_threshold(ledger.get(&key), in_flight, levels)
        });
        Ok(reservation.map(|reservation| Pickup {
            ingredient,
            supplier,
            reservation,
        }))
    }

    /// Fly `first` and any further batches that fit, then return and commit
    /// the manifest.
    fn collect_trip<'g>(
        &'g self,
        restaurant: &Restaurant,
        first: Pickup<'g>,
        supplies: &[Ingredient],
    ) -> Result<(), Halt> {
        let capacity = self.capacity();
        let mut manifest: Vec<Pickup<'g>> = Vec::new();
        let mut load = 0.0;
        let mut here = restaurant.postcode.clone();
        let mut next = Some(first);
        while let Some(pickup) = next.take() {
            let status = format!(
                "Retrieving {} from {}",
                pickup.ingredient.name, pickup.supplier.name
            );
            self.fly_leg(restaurant, &here, &pickup.supplier.postcode, &status, None)?;
            here = pickup.supplier.postcode.clone();
            load += pickup.ingredient.batch_weight();
            manifest.push(pickup);

            for candidate in supplies {
                if manifest.iter().any(|p| p.ingredient.name == candidate.name) {
                    continue;
                }
                if let Some(pickup) = self.reserve_ingredient(&candidate.name, capacity - load)? {
                    next = Some(pickup);
                    break;
                }
            }
        }
        let status = format!("Returning to {} with ingredients", restaurant.name);
        self.fly_leg(restaurant, &here, &restaurant.postcode, &status, None)?;
        self.commit_manifest(manifest, load);
        Ok(())
    }

    fn commit_manifest(&self, manifest: Vec<Pickup<'_>>, weight: f64) {
        let model = &self.model;
        let mut delivered = BTreeMap::new();
        for Pickup {
            ingredient,
            reservation,
            ..
        } in manifest
        {
            let amount = ingredient.restock.amount;
            let added = reservation.commit(|| {
                model.catalog.ingredient(&ingredient.name)?;
                model.ledger.add(&ingredient.key(), amount)
            });
            match added {
                Some(_) => {
                    delivered.insert(ingredient.name, amount);
                }
                None => log::debug!("{} was dropped while in transit", ingredient.name),
            }
        }
        log::debug!("{} unloaded {delivered:?} ({weight})", self.ctx.id());
        model.events.publish(Event::TripCompleted {
            drone: self.id,
            manifest: delivered,
            weight,
        });
        model.touched();
    }

    // --- deliveries ------------------------------------------------------

    /// First order in list order that is Preparing with its dishes on hand.
    /// Stock is taken and the order dispatched while the book is held, so
    /// two drones never claim the same order.
    fn claim_ready_order(&self) -> Option<(SharedOrder, String, Postcode)> {
        let model = &self.model;
        model.orders.claim_first(|order| {
            if order.state() != OrderState::Preparing {
                return None;
            }
            let wanted = order.wanted_stock();
            if !model.ledger.covers(&wanted) {
                return None;
            }
            let (customer, postcode) = match model.customer_of(order) {
                Ok(found) => found,
                Err(err) => {
                    report_failure(self.ctx.id(), &err);
                    return None;
                }
            };
            if !model.ledger.take_all(&wanted) {
                return None;
            }
            if order.dispatch().is_err() {
                // Cancelled between the check and the dispatch.
                for (item, quantity) in &wanted {
                    model.ledger.add(item, *quantity);
                }
                return None;
            }
            Some((Arc::clone(order), customer, postcode))
        })
    }

    fn deliver_next_order(&self, restaurant: &Restaurant) -> Result<bool, Halt> {
        let Some((order, customer, postcode)) = self.claim_ready_order() else {
            return Ok(false);
        };
        log::info!("{} delivering {} to {customer}", self.ctx.id(), order.name());
        self.model.publish_order(&order);
        self.model.touched();
        self.update(|drone| drone.current_order = Some(order.name().to_string()));

        let status = format!("Delivering order {} to {customer}", order.name());
        let outcome = self.fly_leg(
            restaurant,
            &restaurant.postcode,
            &postcode,
            &status,
            Some(&order),
        )?;
        match outcome {
            Leg::Arrived => {
                match order.complete() {
                    Ok(_) => {
                        self.model.publish_order(&order);
                        self.model.touched();
                    }
                    Err(err) => log::info!("{}: {err}", self.ctx.id()),
                }
                self.update(|drone| drone.current_order = None);
                let status = format!("Returning to {}", restaurant.name);
                self.fly_leg(restaurant, &postcode, &restaurant.postcode, &status, None)?;
            }
            Leg::Aborted { covered } => {
                log::info!("{}: order {} cancelled mid-flight", self.ctx.id(), order.name());
                self.update(|drone| {
                    drone.current_order = None;
                    drone.status = format!("Order cancelled - returning to {}", restaurant.name);
                    drone.source = Some(postcode.clone());
                    drone.destination = Some(restaurant.postcode.clone());
                });
                self.travel(restaurant, covered, &restaurant.postcode, None)?;
            }
        }
        Ok(true)
    }

    // --- travel ----------------------------------------------------------

    fn fly_leg(
        &self,
        restaurant: &Restaurant,
        from: &Postcode,
        to: &Postcode,
        status: &str,
        watch: Option<&SharedOrder>,
    ) -> Result<Leg, Halt> {
        self.update(|drone| {
            drone.status = status.to_string();
            drone.source = Some(from.clone());
            drone.destination = Some(to.clone());
            drone.progress = 0.0;
        });
        let distance = restaurant.leg_distance(from, to);
        self.travel(restaurant, distance, to, watch)
    }

    /// Tick towards `destination`. An empty battery away from base forces a
    /// detour home to recharge, after which the leg restarts from base.
    fn travel(
        &self,
        restaurant: &Restaurant,
        mut distance: f64,
        destination: &Postcode,
        watch: Option<&SharedOrder>,
    ) -> Result<Leg, Halt> {
        let heading_home = restaurant.is_home(destination);
        let rate = self.model.config.battery_per_tick;
        let (speed, mut status) = {
            let drone = self.drone.lock().expect("drone mutex poisoned");
            (drone.speed, drone.status.clone())
        };
        let mut covered = 0.0;
        while covered < distance {
            if self.battery() <= 0.0 {
                if heading_home {
                    status = format!("Out of battery, returning to {} to recharge", restaurant.name);
                    self.update(|drone| drone.status = status.clone());
                } else if self.full_charge_covers(distance, speed) {
                    self.detour_to_recharge(restaurant, covered, destination, &status)?;
                    distance = restaurant.leg_distance(&restaurant.postcode, destination);
                    covered = 0.0;
                }
                // Otherwise the leg is longer than a full charge: fly on reserve.
            }
            if watch.is_some_and(|order| order.state() == OrderState::Cancelled) {
                return Ok(Leg::Aborted { covered });
            }
            self.ctx.sleep(self.model.config.tick())?;
            covered += speed;
            let progress = if distance > 0.0 {
                round2((covered / distance * 100.0).min(100.0))
            } else {
                100.0
            };
            self.update(|drone| {
                drone.progress = progress;
                drone.battery = (drone.battery - rate).max(0.0);
            });
        }
        if heading_home && self.battery() <= 0.0 {
            self.recharge()?;
        }
        Ok(Leg::Arrived)
    }

    fn full_charge_covers(&self, distance: f64, speed: f64) -> bool {
        if speed <= 0.0 {
            return false;
        }
        (distance / speed).ceil() * self.model.config.battery_per_tick <= FULL_BATTERY
    }

    fn detour_to_recharge(
        &self,
        restaurant: &Restaurant,
        covered: f64,
        destination: &Postcode,
        status: &str,
    ) -> Result<(), Halt> {
        log::debug!("{} out of battery after {covered}m", self.ctx.id());
        self.update(|drone| {
            drone.status = format!("Out of battery, returning to {} to recharge", restaurant.name);
            drone.source = Some(restaurant.postcode.clone());
            drone.destination = Some(restaurant.postcode.clone());
            drone.progress = 0.0;
        });
        self.travel(restaurant, covered, &restaurant.postcode, None)?;
        // A zero-length return leg skips the recharge inside `travel`.
        if self.battery() <= 0.0 {
            self.recharge()?;
        }
        self.update(|drone| {
            drone.status = status.to_string();
            drone.source = Some(restaurant.postcode.clone());
            drone.destination = Some(destination.clone());
            drone.progress = 0.0;
        });
        Ok(())
    }

    fn recharge(&self) -> Result<(), Halt> {
        self.update(|drone| drone.status = "Recharging battery".to_string());
        let config = &self.model.config;
        self.ctx
            .sleep(config.sim_duration(config.drone_recharge_secs as f64))?;
        self.update(|drone| drone.battery = FULL_BATTERY);
        Ok(())
    }

    /// Mutate the record, then publish its new state with the lock released.
    fn update<R>(&self, f: impl FnOnce(&mut Drone) -> R) -> R {
        let (result, event) = {
            let mut drone = self.drone.lock().expect("drone mutex poisoned");
            let result = f(&mut drone);
            let event = Event::DroneChanged {
                drone: drone.id,
                status: drone.status.clone(),
                progress: drone.progress,
                battery: drone.battery,
            };
            (result, event)
        };
        self.model.events.publish(event);
        self.model.touched();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::model::User;
    use crate::order::Order;
    use crate::types::{Dish, ItemKey};
    use std::sync::mpsc::Receiver;
    use std::thread;
    use std::time::Duration;

    fn home() -> Restaurant {
        Restaurant::new("Sushi Bar", Postcode::new("SO17 1BJ", 50.937, -1.396))
    }

    fn at(name: &str, distance: f64) -> Postcode {
        Postcode {
            name: name.to_string(),
            latitude: 50.90,
            longitude: -1.40,
            distance,
        }
    }

    fn model(config: SimConfig) -> Arc<Model> {
        let model = Model::new(config);
        model.set_restaurant(home());
        Arc::new(model)
    }

    fn worker(model: &Arc<Model>, drone: Drone) -> DroneWorker {
        DroneWorker::new(
            Arc::clone(model),
            Arc::new(Mutex::new(drone)),
            CancelToken::new(),
        )
    }

    fn drone_events(rx: &Receiver<Event>) -> Vec<(String, f64)> {
        rx.try_iter()
            .filter_map(|event| match event {
                Event::DroneChanged { status, battery, .. } => Some((status, battery)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn empty_battery_detours_home_and_resumes() {
        let model = model(SimConfig {
            battery_per_tick: 10.0,
            drone_recharge_secs: 1,
            ..SimConfig::accelerated(1)
        });
        let events = model.events.subscribe();
        let mut drone = Drone::new(1, 10.0, 100.0);
        drone.battery = 20.0;
        let worker = worker(&model, drone);
        let restaurant = home();
        let customer = at("SO15 1AA", 50.0);

        let leg = worker
            .fly_leg(&restaurant, &restaurant.postcode, &customer, "Delivering", None)
            .expect("leg");
        assert_eq!(leg, Leg::Arrived);
        assert_eq!(worker.battery(), 50.0);

        let seen = drone_events(&events);
        assert!(seen.iter().all(|(_, battery)| *battery >= 0.0));
        let recharged = seen
            .iter()
            .position(|(status, _)| status == "Recharging battery")
            .expect("recharge happened");
        let after = seen[recharged + 1..]
            .iter()
            .find(|(status, _)| status != "Recharging battery")
            .expect("event after recharge");
        assert_eq!(after.1, FULL_BATTERY);
        let last = seen.last().expect("events");
        assert_eq!(last.0, "Delivering");
    }

    #[test]
    fn legs_beyond_one_charge_fly_on_reserve() {
        let model = model(SimConfig {
            battery_per_tick: 50.0,
            drone_recharge_secs: 1,
            ..SimConfig::accelerated(1)
        });
        let worker = worker(&model, Drone::new(2, 10.0, 100.0));
        let restaurant = home();
        let far = at("FAR", 40.0);
        // Four ticks at 50% each cannot be flown on one charge.
        let leg = worker
            .fly_leg(&restaurant, &restaurant.postcode, &far, "Far away", None)
            .expect("leg");
        assert_eq!(leg, Leg::Arrived);
        assert_eq!(worker.battery(), 0.0);
    }

    #[test]
    fn trip_manifests_fit_the_drone() {
        let model = model(SimConfig::accelerated(1));
        let restaurant = home();
        for (supplier, distance) in [("North", 20.0), ("South", 30.0)] {
            model
                .catalog
                .add_supplier(Supplier::new(supplier, at(supplier, distance)))
                .expect("supplier");
        }
        // Batches weigh 40, 50 and 30 against a capacity of 100.
        for (name, supplier, weight) in [
            ("Rice", "North", 4.0),
            ("Nori", "South", 5.0),
            ("Salmon", "North", 3.0),
        ] {
            model
                .catalog
                .add_ingredient(Ingredient::new(name, "kg", supplier, 5, 10, weight))
                .expect("ingredient");
            model.ledger.set(ItemKey::ingredient(name), 0);
        }
        let events = model.events.subscribe();
        let worker = worker(&model, Drone::new(3, 10.0, 100.0));
        let trips = worker.restock_ingredients(&restaurant).expect("pass");
        assert!(trips >= 1);

        let weights: Vec<f64> = events
            .try_iter()
            .filter_map(|event| match event {
                Event::TripCompleted { weight, .. } => Some(weight),
                _ => None,
            })
            .collect();
        assert_eq!(weights.len(), trips);
        assert!(weights.iter().all(|w| *w <= 100.0));
        // Rice and Nori share the first trip; Salmon no longer fits.
        assert_eq!(weights[0], 90.0);
        for name in ["Rice", "Nori", "Salmon"] {
            assert_eq!(model.ledger.get(&ItemKey::ingredient(name)), 10);
        }
        assert_eq!(model.gate.total_in_flight(), 0);
    }

    fn stocked_order(model: &Arc<Model>, customer_distance: f64) -> SharedOrder {
        model
            .catalog
            .add_dish(Dish::new("Maki", "", 3.0, 0, 0))
            .expect("dish");
        model.ledger.set(ItemKey::dish("Maki"), 5);
        model.users().push(User {
            name: "alice".into(),
            address: "1 High St".into(),
            postcode: at("SO15 1AA", customer_distance),
            orders: Vec::new(),
        });
        let order: SharedOrder = Arc::new(Order::new(
            "o-1",
            "alice",
            BTreeMap::from([("Maki".to_string(), 2)]),
        ));
        model.orders.push(Arc::clone(&order));
        order
    }

    #[test]
    fn ready_order_is_delivered_and_completed() {
        let model = model(SimConfig::accelerated(1));
        let order = stocked_order(&model, 30.0);
        let worker = worker(&model, Drone::new(4, 10.0, 100.0));
        assert!(worker.deliver_next_order(&home()).expect("delivery"));
        assert_eq!(order.state(), OrderState::Complete);
        assert_eq!(model.ledger.get(&ItemKey::dish("Maki")), 3);
        let drone = worker.drone.lock().expect("drone").clone();
        assert!(drone.current_order.is_none());
        assert_eq!(drone.destination, Some(home().postcode));
    }

    #[test]
    fn unready_orders_stay_in_the_kitchen() {
        let model = model(SimConfig::accelerated(1));
        let order = stocked_order(&model, 30.0);
        model.ledger.set(ItemKey::dish("Maki"), 1);
        let worker = worker(&model, Drone::new(5, 10.0, 100.0));
        assert!(!worker.deliver_next_order(&home()).expect("delivery"));
        assert_eq!(order.state(), OrderState::Preparing);
        assert_eq!(model.ledger.get(&ItemKey::dish("Maki")), 1);
    }

    #[test]
    fn orders_without_a_customer_are_skipped() {
        let model = model(SimConfig::accelerated(1));
        let order = stocked_order(&model, 30.0);
        model.users().clear();
        let worker = worker(&model, Drone::new(6, 10.0, 100.0));
        assert!(!worker.deliver_next_order(&home()).expect("delivery"));
        assert_eq!(order.state(), OrderState::Preparing);
        assert_eq!(model.ledger.get(&ItemKey::dish("Maki")), 5);
    }

    #[test]
    fn cancellation_mid_flight_turns_the_drone_back() {
        let model = model(SimConfig::accelerated(2));
        let order = stocked_order(&model, 10_000.0);
        let events = model.events.subscribe();
        let worker = worker(&model, Drone::new(7, 10.0, 100.0));
        let handle = {
            let order = Arc::clone(&order);
            thread::spawn(move || {
                for _ in 0..500 {
                    if order.state() == OrderState::OutForDelivery {
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                thread::sleep(Duration::from_millis(10));
                order.cancel().expect("cancel");
            })
        };
        assert!(worker.deliver_next_order(&home()).expect("delivery"));
        handle.join().expect("canceller panicked");
        assert_eq!(order.state(), OrderState::Cancelled);
        let seen = drone_events(&events);
        assert!(seen
            .iter()
            .any(|(status, _)| status == "Order cancelled - returning to Sushi Bar"));
        assert!(worker.drone.lock().expect("drone").current_order.is_none());
    }
}
