//! Customer orders and their lifecycle.
//!
//! ```text
//! Preparing --dispatch--> OutForDelivery --complete--> Complete
//!     |                        |
//!     +--------cancel----------+-------------------> Cancelled
//! ```
//!
//! Complete and Cancelled are terminal. Cancelling a terminal order is
//! rejected rather than logged and applied. Dishes can be changed only
//! while the order is still Preparing.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{EntityKind, Result, SupplyError};
use crate::types::ItemKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OrderState {
    Preparing,
    OutForDelivery,
    Complete,
    Cancelled,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderState::Complete | OrderState::Cancelled)
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OrderState::Preparing => "Preparing",
            OrderState::OutForDelivery => "Out for delivery",
            OrderState::Complete => "Complete",
            OrderState::Cancelled => "Cancelled",
        };
        f.write_str(label)
    }
}

/// Orders are shared between the global list and the customer's history.
pub type SharedOrder = Arc<Order>;

/// An order. Name and customer are fixed at checkout.
#[derive(Debug)]
pub struct Order {
    name: String,
    customer: String,
    dishes: Mutex<BTreeMap<String, u64>>,
    state: Mutex<OrderState>,
}

/// Serialized form of an order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub name: String,
    pub customer: String,
    pub dishes: BTreeMap<String, u64>,
    pub state: OrderState,
}

impl Order {
    pub fn new(
        name: impl Into<String>,
        customer: impl Into<String>,
        dishes: BTreeMap<String, u64>,
    ) -> Self {
        Self::with_state(name, customer, dishes, OrderState::Preparing)
    }

    fn with_state(
        name: impl Into<String>,
        customer: impl Into<String>,
        dishes: BTreeMap<String, u64>,
        state: OrderState,
    ) -> Self {
        Self {
            name: name.into(),
            customer: customer.into(),
            dishes: Mutex::new(dishes),
            state: Mutex::new(state),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the customer recorded at checkout.
    pub fn customer(&self) -> &str {
        &self.customer
    }

    pub fn dishes(&self) -> BTreeMap<String, u64> {
        self.dishes.lock().expect("order dishes mutex poisoned").clone()
    }

    /// Ledger quantities this order needs.
    pub fn wanted_stock(&self) -> Vec<(ItemKey, u64)> {
        let dishes = self.dishes.lock().expect("order dishes mutex poisoned");
        dishes
            .iter()
            .map(|(dish, qty)| (ItemKey::dish(dish), *qty))
            .collect()
    }

    pub fn state(&self) -> OrderState {
        *self.state.lock().expect("order mutex poisoned")
    }

    fn transition(
        &self,
        action: &'static str,
        allowed: impl Fn(OrderState) -> bool,
        next: OrderState,
    ) -> Result<OrderState> {
        let mut guard = self.state.lock().expect("order mutex poisoned");
        if !allowed(*guard) {
            return Err(SupplyError::InvalidTransition {
                order: self.name.clone(),
                from: guard.to_string(),
                action,
            });
        }
        *guard = next;
        Ok(next)
    }

    /// Preparing -> OutForDelivery. Readiness is checked by the caller.
    pub fn dispatch(&self) -> Result<OrderState> {
        self.transition(
            "go out for delivery",
            |s| s == OrderState::Preparing,
            OrderState::OutForDelivery,
        )
    }

    pub fn complete(&self) -> Result<OrderState> {
        self.transition(
            "complete",
            |s| s == OrderState::OutForDelivery,
            OrderState::Complete,
        )
    }

    pub fn cancel(&self) -> Result<OrderState> {
        self.transition("be cancelled", |s| !s.is_terminal(), OrderState::Cancelled)
    }

    /// Set how many of `dish` the order wants; 0 takes the dish off. The
    /// state lock is held throughout, so a drone cannot dispatch the order
    /// halfway through the change.
    pub fn set_dish(&self, dish: &str, quantity: u64) -> Result<()> {
        let state = self.state.lock().expect("order mutex poisoned");
        if *state != OrderState::Preparing {
            return Err(SupplyError::InvalidTransition {
                order: self.name.clone(),
                from: state.to_string(),
                action: "be changed",
            });
        }
        let mut dishes = self.dishes.lock().expect("order dishes mutex poisoned");
        if quantity > 0 {
            dishes.insert(dish.to_string(), quantity);
            return Ok(());
        }
        if !dishes.contains_key(dish) {
            return Err(SupplyError::not_found(EntityKind::Dish, dish));
        }
        if dishes.len() == 1 {
            return Err(SupplyError::Invalid(format!(
                "order {} would have no dishes left",
                self.name
            )));
        }
        dishes.remove(dish);
        Ok(())
    }

    /// Delivery progress is not persisted, so an interrupted delivery goes
    /// back to the kitchen. Returns true if the state changed.
    pub fn reset_interrupted_delivery(&self) -> bool {
        let mut guard = self.state.lock().expect("order mutex poisoned");
        if *guard == OrderState::OutForDelivery {
            *guard = OrderState::Preparing;
            true
        } else {
            false
        }
    }

    pub fn record(&self) -> OrderRecord {
        OrderRecord {
            name: self.name.clone(),
            customer: self.customer.clone(),
            dishes: self.dishes(),
            state: self.state(),
        }
    }

    pub fn from_record(record: OrderRecord) -> Self {
        Self::with_state(record.name, record.customer, record.dishes, record.state)
    }
}

/// Global order list in checkout order.
pub struct OrderBook {
    orders: Mutex<Vec<SharedOrder>>,
    sequence: AtomicU64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            orders: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn from_orders(orders: Vec<SharedOrder>) -> Self {
        let sequence = AtomicU64::new(orders.len() as u64);
        Self {
            orders: Mutex::new(orders),
            sequence,
        }
    }

    /// Timestamp-derived unique order name.
    pub fn next_name(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!("{millis}-{seq:04}")
    }

    pub fn push(&self, order: SharedOrder) {
        let mut guard = self.orders.lock().expect("order book mutex poisoned");
        guard.push(order);
    }

    pub fn find(&self, name: &str) -> Option<SharedOrder> {
        let guard = self.orders.lock().expect("order book mutex poisoned");
        guard.iter().find(|o| o.name() == name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<SharedOrder> {
        let mut guard = self.orders.lock().expect("order book mutex poisoned");
        let index = guard.iter().position(|o| o.name() == name)?;
        Some(guard.remove(index))
    }

    pub fn all(&self) -> Vec<SharedOrder> {
        let guard = self.orders.lock().expect("order book mutex poisoned");
        guard.clone()
    }

    /// Scan in list order while holding the book, so two callers never
    /// pick the same order. The first order `pick` accepts wins.
    pub fn claim_first<T>(&self, mut pick: impl FnMut(&SharedOrder) -> Option<T>) -> Option<T> {
        let guard = self.orders.lock().expect("order book mutex poisoned");
        guard.iter().find_map(|order| pick(order))
    }

    /// Run `f` on the named order with the book held. Edits made this way
    /// never interleave with a drone claiming the order.
    pub fn edit<T>(&self, name: &str, f: impl FnOnce(&SharedOrder) -> T) -> Option<T> {
        let guard = self.orders.lock().expect("order book mutex poisoned");
        guard.iter().find(|o| o.name() == name).map(f)
    }

    pub fn len(&self) -> usize {
        let guard = self.orders.lock().expect("order book mutex poisoned");
        guard.len()
    }
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}
