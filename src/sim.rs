//! Demo, benchmark, stress and inspect runners for the supply engine.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::SimConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::events::Event;
use crate::location::Postcode;
use crate::order::{OrderRecord, OrderState};
use crate::persistence::SnapshotStore;
use crate::types::{Dish, Ingredient, ItemKey, RestockLevels};

// Demo timing knobs (small for quick CLI feedback).
const DEMO_TICK_MS: u64 = 2;
const DEMO_MAX_WAIT_MS: u64 = 30_000;
// Benchmarks may queue many orders behind few workers.
const BENCH_MAX_WAIT_MS: u64 = 120_000;
// A worker silent for this long is reported as unresponsive.
const LIVENESS_TIMEOUT_MS: u64 = 2_000;
// Polling interval used while waiting for orders to settle.
const SETTLE_POLL_MS: u64 = 10;
const DRONE_SPEED: f64 = 200.0;

const RESTAURANT: (&str, &str, f64, f64) = ("Sakura Sushi", "SO17 1BJ", 50.9346, -1.3968);
const SUPPLIERS: [(&str, &str, f64, f64); 2] = [
    ("Itchen Fish Market", "SO14 2AQ", 50.9015, -1.4043),
    ("Bitterne Rice Co", "SO18 2NU", 50.9228, -1.3647),
];
const CUSTOMER_POSTCODES: [(&str, f64, f64); 4] = [
    ("SO15 2JS", 50.9097, -1.4165),
    ("SO16 3RW", 50.9317, -1.4354),
    ("SO19 9AB", 50.8985, -1.3602),
    ("SO50 5PB", 50.9683, -1.3497),
];
const MENU: [&str; 3] = ["Maki", "Nigiri", "Sashimi"];

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    use libc::{RUSAGE_SELF, getrusage, rusage};
    // SAFETY: rusage is plain old data; an all-zero value is valid.
    let mut usage: rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { getrusage(RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let user = usage.ru_utime.tv_sec as f64 + (usage.ru_utime.tv_usec as f64 / 1_000_000.0);
    let sys = usage.ru_stime.tv_sec as f64 + (usage.ru_stime.tv_usec as f64 / 1_000_000.0);
    Some((user, sys))
}

/// Stub on non-Unix platforms.
#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

/// Fast profile used when no config file is given.
fn quick_config(tick_ms: u64) -> SimConfig {
    SimConfig {
        prep_secs_min: 5,
        prep_secs_max: 15,
        staff_rest_secs: 20,
        drone_recharge_secs: 30,
        ..SimConfig::accelerated(tick_ms)
    }
}

/// Highest level a row may reach while restocking: a grant needs
/// `on_hand + k * amount < threshold`, so after all commits the row is at most
/// `threshold - 1 + amount`. Rows that start above that may only fall.
fn restock_bound(initial: u64, levels: RestockLevels) -> u64 {
    if levels.threshold == 0 || levels.amount == 0 {
        return initial;
    }
    initial.max(levels.threshold - 1 + levels.amount)
}

/// Watches the event stream for overshoot and counts kitchen work.
struct StockWatch {
    events: Receiver<Event>,
    bounds: HashMap<ItemKey, u64>,
    overshoot: bool,
    batches: usize,
    trips: usize,
}

impl StockWatch {
    fn new(engine: &Engine) -> Self {
        // Subscribe before reading levels so no change slips between them.
        let events = engine.subscribe();
        let mut bounds = HashMap::new();
        let dish_stock = engine.dish_stock();
        for dish in engine.dishes() {
            let initial = dish_stock.get(&dish.name).copied().unwrap_or(0);
            bounds.insert(dish.key(), restock_bound(initial, dish.restock));
        }
        let ingredient_stock = engine.ingredient_stock();
        for ingredient in engine.ingredients() {
            let initial = ingredient_stock.get(&ingredient.name).copied().unwrap_or(0);
            bounds.insert(ingredient.key(), restock_bound(initial, ingredient.restock));
        }
        Self {
            events,
            bounds,
            overshoot: false,
            batches: 0,
            trips: 0,
        }
    }

    fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.observe(event);
        }
    }

    fn observe(&mut self, event: Event) {
        match event {
            Event::StockChanged { item, quantity } => {
                if let Some(&bound) = self.bounds.get(&item) {
                    if quantity > bound {
                        log::error!("{item} reached {quantity}, above its bound of {bound}");
                        self.overshoot = true;
                    }
                }
            }
            Event::BatchPrepared { .. } => self.batches += 1,
            Event::TripCompleted { .. } => self.trips += 1,
            _ => {}
        }
    }
}

/// Restaurant, suppliers, supply list, menu and `customers` users.
/// Returns the customer names.
fn stock_kitchen(engine: &Engine, customers: usize) -> Result<Vec<String>> {
    let (name, postcode, lat, lon) = RESTAURANT;
    engine.set_restaurant(name, Postcode::new(postcode, lat, lon))?;
    for (supplier, postcode, lat, lon) in SUPPLIERS {
        engine.add_postcode(postcode, lat, lon)?;
        engine.add_supplier(supplier, postcode)?;
    }
    for (postcode, lat, lon) in CUSTOMER_POSTCODES {
        engine.add_postcode(postcode, lat, lon)?;
    }

    let fish = SUPPLIERS[0].0;
    let rice = SUPPLIERS[1].0;
    engine.add_ingredient(Ingredient::new("Rice", "cup", rice, 30, 60, 0.2))?;
    engine.add_ingredient(Ingredient::new("Nori", "sheet", rice, 15, 40, 0.01))?;
    engine.add_ingredient(Ingredient::new("Salmon", "slice", fish, 20, 40, 0.05))?;

    engine.add_dish(
        Dish::new("Maki", "Cucumber and rice rolls", 3.5, 5, 10)
            .with_ingredient("Rice", 2)
            .with_ingredient("Nori", 1),
    )?;
    engine.add_dish(
        Dish::new("Nigiri", "Hand-pressed salmon on rice", 4.0, 4, 8)
            .with_ingredient("Rice", 1)
            .with_ingredient("Salmon", 1),
    )?;
    engine.add_dish(
        Dish::new("Sashimi", "Sliced raw salmon", 6.5, 3, 6).with_ingredient("Salmon", 2),
    )?;

    let mut names = Vec::with_capacity(customers);
    for i in 0..customers {
        let (postcode, _, _) = CUSTOMER_POSTCODES[i % CUSTOMER_POSTCODES.len()];
        let name = format!("customer-{}", i + 1);
        engine.add_user(&name, &format!("{} Portswood Road", i + 1), postcode)?;
        names.push(name);
    }
    Ok(names)
}

/// Order `i` takes one to three portions of a single dish.
fn bench_order(i: usize) -> BTreeMap<String, u64> {
    BTreeMap::from([(MENU[i % MENU.len()].to_string(), ((i / MENU.len()) % 3) as u64 + 1)])
}

fn count_states(orders: &[OrderRecord]) -> BTreeMap<OrderState, usize> {
    let mut counts = BTreeMap::new();
    for order in orders {
        *counts.entry(order.state).or_insert(0) += 1;
    }
    counts
}

/// Poll until no order is Preparing or out for delivery, or `max_wait`
/// passes. Returns the number still unsettled.
fn wait_for_orders(engine: &Engine, watch: &mut StockWatch, max_wait: Duration) -> usize {
    let start = Instant::now();
    loop {
        watch.drain();
        let pending = engine
            .orders()
            .iter()
            .filter(|order| !order.state.is_terminal())
            .count();
        if pending == 0 || start.elapsed() >= max_wait {
            return pending;
        }
        thread::sleep(Duration::from_millis(SETTLE_POLL_MS));
    }
}

/// Per-run snapshot file under the system temp dir.
fn scratch_path(tag: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!(
        "sushi_supply_{tag}_{}_{seq}.json",
        std::process::id()
    ))
}

/// Run the CLI demo: one small restaurant, a handful of orders, a snapshot
/// and a restore.
pub fn run_demo(config: Option<SimConfig>) -> Result<()> {
    let config = config.unwrap_or_else(|| quick_config(DEMO_TICK_MS));
    let store = SnapshotStore::new(scratch_path("demo"));
    let engine = Engine::start(config.clone(), Some(store.clone()))?;
    let customers = stock_kitchen(&engine, 3)?;
    let mut watch = StockWatch::new(&engine);
    for name in ["Aiko", "Ben", "Chiara"] {
        engine.add_staff(name)?;
    }
    for _ in 0..2 {
        engine.add_drone(DRONE_SPEED)?;
    }

    let start = Instant::now();
    let wanted = [
        (0, vec![("Maki", 3), ("Nigiri", 2)]),
        (1, vec![("Sashimi", 2)]),
        (2, vec![("Maki", 4), ("Sashimi", 1)]),
        (1, vec![("Nigiri", 6)]),
    ];
    let mut placed = Vec::new();
    for (customer, dishes) in wanted {
        let dishes = dishes
            .into_iter()
            .map(|(dish, qty)| (dish.to_string(), qty))
            .collect();
        let name = engine.place_order(&customers[customer], dishes)?;
        let cost = engine.order_cost(&name)?;
        log::info!("[DEMO] {name} placed, cost {cost:.2}");
        placed.push(name);
    }
    if let Some(last) = placed.last() {
        engine.cancel_order(last)?;
    }

    let pending = wait_for_orders(&engine, &mut watch, Duration::from_millis(DEMO_MAX_WAIT_MS));
    if pending > 0 {
        log::warn!("[DEMO] {pending} orders still open after {DEMO_MAX_WAIT_MS}ms");
    }
    let unresponsive = engine.unresponsive_workers(Duration::from_millis(LIVENESS_TIMEOUT_MS));
    let orders = engine.orders();
    let counts = count_states(&orders);
    log::debug!("[DEMO] dish stock at end = {:?}", engine.dish_stock());
    log::debug!("[DEMO] ingredient stock at end = {:?}", engine.ingredient_stock());
    engine.shutdown();
    watch.drain();
    log::info!("[DEMO] finished in {}ms", start.elapsed().as_millis());

    let restored = Engine::start(config, Some(store.clone()))?;
    let recovered = restored.recovered_orders();
    let restored_orders = restored.orders().len();
    restored.shutdown();
    if let Err(err) = fs::remove_file(store.path()) {
        log::debug!("could not remove {}: {err}", store.path().display());
    }

    let state = |s: OrderState| counts.get(&s).copied().unwrap_or(0);
    println!("DEMO SUMMARY");
    println!("orders_placed={}", placed.len());
    println!("orders_complete={}", state(OrderState::Complete));
    println!("orders_cancelled={}", state(OrderState::Cancelled));
    println!(
        "orders_pending={}",
        state(OrderState::Preparing) + state(OrderState::OutForDelivery)
    );
    println!("batches_prepared={} drone_trips={}", watch.batches, watch.trips);
    println!("overshoot_violation={}", watch.overshoot);
    println!("unresponsive_workers={}", unresponsive.len());
    println!("restored_orders={restored_orders}");
    println!("recovered_orders={recovered}");
    Ok(())
}

struct BenchResult {
    staff: usize,
    drones: usize,
    orders: usize,
    elapsed_ms: f64,
    throughput: f64,
    batches: usize,
    trips: usize,
    cpu_user_s: Option<f64>,
    cpu_sys_s: Option<f64>,
    overshoot: Option<bool>,
    leftover: usize,
}

impl BenchResult {
    fn csv_header() -> &'static str {
        "staff,drones,orders,elapsed_ms,throughput_orders_per_s,batches_prepared,drone_trips,cpu_user_s,cpu_sys_s,overshoot_violation"
    }

    fn csv_row(&self) -> String {
        let cpu_user = self
            .cpu_user_s
            .map(|v| format!("{v:.4}"))
            .unwrap_or_else(|| "NA".to_string());
        let cpu_sys = self
            .cpu_sys_s
            .map(|v| format!("{v:.4}"))
            .unwrap_or_else(|| "NA".to_string());
        let overshoot = self
            .overshoot
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{},{},{},{:.2},{:.2},{},{},{},{},{}",
            self.staff,
            self.drones,
            self.orders,
            self.elapsed_ms,
            self.throughput,
            self.batches,
            self.trips,
            cpu_user,
            cpu_sys,
            overshoot
        )
    }

    fn report_warnings(&self) {
        if self.leftover > 0 {
            eprintln!("# warning,leftover_orders,{}", self.leftover);
        }
        if self.overshoot == Some(true) {
            eprintln!("# violation,restock_overshoot");
        }
    }
}

fn benchmark_once(
    config: &SimConfig,
    staff: usize,
    drones: usize,
    orders: usize,
    validate: bool,
) -> Result<BenchResult> {
    let cpu_start = cpu_times_seconds();
    let engine = Engine::start(config.clone(), None)?;
    let customers = stock_kitchen(&engine, CUSTOMER_POSTCODES.len())?;
    let mut watch = StockWatch::new(&engine);
    for i in 0..staff {
        engine.add_staff(&format!("cook-{}", i + 1))?;
    }
    for _ in 0..drones {
        engine.add_drone(DRONE_SPEED)?;
    }

    let start = Instant::now();
    for i in 0..orders {
        engine.place_order(&customers[i % customers.len()], bench_order(i))?;
    }
    let leftover = wait_for_orders(&engine, &mut watch, Duration::from_millis(BENCH_MAX_WAIT_MS));
    let elapsed = start.elapsed();
    engine.shutdown();
    watch.drain();
    let cpu_end = cpu_times_seconds();

    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    let delivered = orders.saturating_sub(leftover);
    let throughput = if elapsed_ms > 0.0 {
        delivered as f64 / (elapsed_ms / 1000.0)
    } else {
        0.0
    };
    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_end) {
        (Some((u0, s0)), Some((u1, s1))) => (Some(u1 - u0), Some(s1 - s0)),
        _ => (None, None),
    };
    Ok(BenchResult {
        staff,
        drones,
        orders,
        elapsed_ms,
        throughput,
        batches: watch.batches,
        trips: watch.trips,
        cpu_user_s,
        cpu_sys_s,
        overshoot: validate.then_some(watch.overshoot),
        leftover,
    })
}

/// Run a single benchmark with optional parameter overrides.
pub fn run_benchmark(
    config: Option<SimConfig>,
    staff: Option<usize>,
    drones: Option<usize>,
    orders: Option<usize>,
    tick_ms: Option<u64>,
    validate: bool,
) -> Result<()> {
    let staff = staff.unwrap_or(3);
    let drones = drones.unwrap_or(2);
    let orders = orders.unwrap_or(20);
    if staff == 0 || drones == 0 {
        eprintln!("benchmark error: staff and drones must be > 0");
        return Ok(());
    }
    if orders == 0 {
        eprintln!("benchmark error: orders must be > 0");
        return Ok(());
    }
    let mut config = config.unwrap_or_else(|| quick_config(1));
    if let Some(tick_ms) = tick_ms {
        config.tick_ms = tick_ms;
    }
    let result = benchmark_once(&config, staff, drones, orders, validate)?;
    println!("{}", BenchResult::csv_header());
    println!("{}", result.csv_row());
    result.report_warnings();
    Ok(())
}

/// Sweep multiple benchmark configurations and print CSV output.
pub fn run_stress(
    config: Option<SimConfig>,
    staff_sets: Option<Vec<usize>>,
    drone_sets: Option<Vec<usize>>,
    order_sets: Option<Vec<usize>>,
    tick_ms: Option<u64>,
    validate: bool,
) -> Result<()> {
    let staff_sets = staff_sets.unwrap_or_else(|| vec![1, 2, 4]);
    let drone_sets = drone_sets.unwrap_or_else(|| vec![1, 2, 4]);
    let mut order_sets = order_sets.unwrap_or_else(|| vec![10, 25]);
    if staff_sets.iter().chain(&drone_sets).any(|&n| n == 0) {
        eprintln!("stress error: staff_sets and drone_sets must be > 0");
        return Ok(());
    }
    let before = order_sets.len();
    order_sets.retain(|&orders| orders > 0);
    let dropped = before - order_sets.len();
    if dropped > 0 {
        eprintln!("stress warning: ignored {dropped} order set(s) <= 0");
    }
    if order_sets.is_empty() {
        eprintln!("stress error: orders must be > 0");
        return Ok(());
    }
    let mut config = config.unwrap_or_else(|| quick_config(1));
    if let Some(tick_ms) = tick_ms {
        config.tick_ms = tick_ms;
    }

    println!("{}", BenchResult::csv_header());
    for &staff in &staff_sets {
        for &drones in &drone_sets {
            for &orders in &order_sets {
                let result = benchmark_once(&config, staff, drones, orders, validate)?;
                println!("{}", result.csv_row());
                result.report_warnings();
            }
        }
    }
    Ok(())
}

/// Print what a snapshot file holds.
pub fn run_inspect(path: &Path) -> Result<()> {
    let Some(snapshot) = SnapshotStore::new(path).load()? else {
        eprintln!("inspect: no snapshot at {}", path.display());
        return Ok(());
    };
    println!("SNAPSHOT {}", path.display());
    println!("version={}", snapshot.version);
    match &snapshot.restaurant {
        Some(restaurant) => {
            println!("restaurant={} ({})", restaurant.name, restaurant.postcode.name)
        }
        None => println!("restaurant=-"),
    }
    println!(
        "dishes={} ingredients={} suppliers={} postcodes={}",
        snapshot.dishes.len(),
        snapshot.ingredients.len(),
        snapshot.suppliers.len(),
        snapshot.postcodes.len()
    );
    println!(
        "users={} staff={} drones={} orders={}",
        snapshot.users.len(),
        snapshot.staff.len(),
        snapshot.drones.len(),
        snapshot.orders.len()
    );
    for (state, count) in count_states(&snapshot.orders) {
        println!("orders[{state}]={count}");
    }
    for row in &snapshot.stock {
        println!("stock[{}]={}", row.item, row.quantity);
    }
    println!(
        "restock_dishes={} restock_ingredients={}",
        snapshot.restock_dishes, snapshot.restock_ingredients
    );
    Ok(())
}
