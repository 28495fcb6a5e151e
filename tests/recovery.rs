//! Snapshot and restore through the public engine API.

use std::collections::BTreeMap;
use std::fs;
use std::thread;
use std::time::{Duration, Instant};

mod common;

use common::scratch_path;

use sushi_supply::config::SimConfig;
use sushi_supply::drone::IDLE;
use sushi_supply::engine::Engine;
use sushi_supply::location::Postcode;
use sushi_supply::order::OrderState;
use sushi_supply::persistence::SnapshotStore;
use sushi_supply::types::{Dish, ItemKey};

fn config() -> SimConfig {
    SimConfig::accelerated(1)
}

/// Restaurant, one customer and a dish that staff never restock.
fn open_shop(engine: &Engine) -> String {
    engine
        .set_restaurant("Sakura Sushi", Postcode::new("SO17 1BJ", 50.9346, -1.3968))
        .expect("restaurant");
    engine.add_postcode("SO15 2JS", 50.9097, -1.4165).expect("postcode");
    engine.add_user("alice", "1 Shirley Road", "SO15 2JS").expect("user");
    engine
        .add_dish(Dish::new("Maki", "rolls", 3.5, 0, 0))
        .expect("dish");
    engine.set_stock(ItemKey::dish("Maki"), 10).expect("stock");
    engine
        .place_order("alice", BTreeMap::from([("Maki".to_string(), 3)]))
        .expect("order")
}

fn wait_for_state(engine: &Engine, order: &str, want: OrderState, max_wait: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if engine.order_state(order).expect("order") == want {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn interrupted_delivery_comes_back_as_preparing() {
    let store = SnapshotStore::new(scratch_path("recovery-live"));
    let crashed = SnapshotStore::new(scratch_path("recovery-crash"));

    let engine = Engine::start(config(), Some(store.clone())).expect("start");
    let order = open_shop(&engine);
    // Slow enough that the delivery is still in the air when we look.
    let drone = engine.add_drone(0.01).expect("drone");
    assert!(wait_for_state(
        &engine,
        &order,
        OrderState::OutForDelivery,
        Duration::from_secs(5)
    ));
    assert_eq!(engine.stock(&ItemKey::dish("Maki")), 7);

    let mut snapshot = engine.snapshot_now().expect("snapshot");
    engine.shutdown();
    assert!(
        snapshot
            .orders
            .iter()
            .any(|o| o.name == order && o.state == OrderState::OutForDelivery)
    );
    // Empty the shelf in the saved copy so the restored drone has nothing
    // to re-dispatch while we look.
    for row in &mut snapshot.stock {
        row.quantity = 0;
    }
    crashed.save(&snapshot).expect("save copy");

    let restored = Engine::start(config(), Some(crashed.clone())).expect("restore");
    assert_eq!(restored.recovered_orders(), 1);
    assert_eq!(
        restored.order_state(&order).expect("order"),
        OrderState::Preparing
    );
    assert_eq!(restored.user_orders("alice").expect("history").len(), 1);
    let parked = restored.drone(drone).expect("drone");
    assert_eq!(parked.speed, 0.01);
    assert_eq!(parked.status, IDLE);
    assert_eq!(parked.current_order, None);
    assert_eq!(parked.source.as_ref().map(|p| p.name.as_str()), Some("SO17 1BJ"));
    // New drones never reuse a restored id.
    assert!(restored.add_drone(10.0).expect("drone") > drone);
    restored.shutdown();

    for path in [store.path(), crashed.path()] {
        let _ = fs::remove_file(path);
    }
}

#[test]
fn shutdown_flushes_the_final_state() {
    let store = SnapshotStore::new(scratch_path("recovery-flush"));
    let engine = Engine::start(config(), Some(store.clone())).expect("start");
    let order = open_shop(&engine);
    engine.add_staff("Aiko").expect("staff");
    engine.cancel_order(&order).expect("cancel");
    engine.set_restock_ingredients(false);
    engine.shutdown();

    let snapshot = store.load().expect("load").expect("snapshot written");
    assert_eq!(snapshot.orders.len(), 1);
    assert_eq!(snapshot.orders[0].state, OrderState::Cancelled);
    assert_eq!(snapshot.staff.len(), 1);
    assert!(!snapshot.restock_ingredients);

    let restored = Engine::start(config(), Some(store.clone())).expect("restore");
    assert_eq!(restored.recovered_orders(), 0);
    assert_eq!(restored.order_state(&order).expect("order"), OrderState::Cancelled);
    assert!(!restored.restocking_ingredients());
    assert_eq!(restored.staff_member("Aiko").expect("staff").status, "Idle");
    restored.shutdown();
    let _ = fs::remove_file(store.path());
}

#[test]
fn unreadable_snapshot_starts_an_empty_engine() {
    let store = SnapshotStore::new(scratch_path("recovery-bad"));
    fs::write(store.path(), br#"{"version": 99}"#).expect("write");
    let engine = Engine::start(config(), Some(store.clone())).expect("start");
    assert!(engine.restaurant().is_none());
    assert!(engine.orders().is_empty());
    engine.shutdown();
    let _ = fs::remove_file(store.path());
}

#[test]
fn restored_orders_are_delivered() {
    let store = SnapshotStore::new(scratch_path("recovery-deliver"));
    let engine = Engine::start(config(), Some(store.clone())).expect("start");
    let order = open_shop(&engine);
    engine.shutdown();

    let restored = Engine::start(config(), Some(store.clone())).expect("restore");
    restored.add_drone(500.0).expect("drone");
    assert!(wait_for_state(
        &restored,
        &order,
        OrderState::Complete,
        Duration::from_secs(10)
    ));
    assert_eq!(restored.stock(&ItemKey::dish("Maki")), 7);
    restored.shutdown();
    let _ = fs::remove_file(store.path());
}
