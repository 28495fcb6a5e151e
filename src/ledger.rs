//! Thread-safe stock ledger shared by every worker.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{EntityKind, Result, SupplyError};
use crate::events::{Event, EventBus};
use crate::types::{ItemKey, ItemKind};

/// One persisted ledger row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    pub item: ItemKey,
    pub quantity: u64,
}

/// On-hand quantities keyed by item name. Quantities are unsigned and
/// deductions go through `take_all`, which refuses rather than underflow.
pub struct StockLedger {
    levels: Mutex<HashMap<ItemKey, u64>>,
    events: EventBus,
}

impl StockLedger {
    pub fn new(events: EventBus) -> Self {
        Self {
            levels: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// On-hand quantity; 0 for unregistered items.
    pub fn get(&self, item: &ItemKey) -> u64 {
        let guard = self.levels.lock().expect("ledger mutex poisoned");
        guard.get(item).copied().unwrap_or(0)
    }

    pub fn is_registered(&self, item: &ItemKey) -> bool {
        let guard = self.levels.lock().expect("ledger mutex poisoned");
        guard.contains_key(item)
    }

    /// Register or overwrite a row. Keys are name-based, so a re-delivered
    /// copy of an item replaces the existing row instead of duplicating it.
    pub fn set(&self, item: ItemKey, quantity: u64) {
        {
            let mut guard = self.levels.lock().expect("ledger mutex poisoned");
            guard.insert(item.clone(), quantity);
        }
        self.events.publish(Event::StockChanged { item, quantity });
    }

    pub fn remove(&self, item: &ItemKey) -> Result<u64> {
        let removed = {
            let mut guard = self.levels.lock().expect("ledger mutex poisoned");
            guard.remove(item)
        };
        match removed {
            Some(quantity) => {
                self.events.publish(Event::StockRemoved { item: item.clone() });
                Ok(quantity)
            }
            None => Err(SupplyError::not_found(EntityKind::Stock, item.to_string())),
        }
    }

    /// Add to a registered row; returns the new level, or `None` if the item
    /// was removed in the meantime.
    pub fn add(&self, item: &ItemKey, amount: u64) -> Option<u64> {
        self.update(item, |level| level.saturating_add(amount))
    }

    fn update(&self, item: &ItemKey, f: impl FnOnce(u64) -> u64) -> Option<u64> {
        let quantity = {
            let mut guard = self.levels.lock().expect("ledger mutex poisoned");
            let level = guard.get_mut(item)?;
            *level = f(*level);
            *level
        };
        self.events.publish(Event::StockChanged {
            item: item.clone(),
            quantity,
        });
        Some(quantity)
    }

    /// True if every requested quantity is on hand.
    pub fn covers(&self, wanted: &[(ItemKey, u64)]) -> bool {
        let guard = self.levels.lock().expect("ledger mutex poisoned");
        wanted
            .iter()
            .all(|(item, qty)| guard.get(item).copied().unwrap_or(0) >= *qty)
    }

    /// Deduct every requested quantity, or nothing if any is short.
    pub fn take_all(&self, wanted: &[(ItemKey, u64)]) -> bool {
        let changed: Vec<(ItemKey, u64)> = {
            let mut guard = self.levels.lock().expect("ledger mutex poisoned");
            let enough = wanted
                .iter()
                .all(|(item, qty)| guard.get(item).copied().unwrap_or(0) >= *qty);
            if !enough {
                return false;
            }
            wanted
                .iter()
                .filter_map(|(item, qty)| {
                    let level = guard.get_mut(item)?;
                    *level -= *qty;
                    Some((item.clone(), *level))
                })
                .collect()
        };
        for (item, quantity) in changed {
            self.events.publish(Event::StockChanged { item, quantity });
        }
        true
    }

    /// Levels for one kind of item, by name.
    pub fn levels(&self, kind: ItemKind) -> BTreeMap<String, u64> {
        let guard = self.levels.lock().expect("ledger mutex poisoned");
        guard
            .iter()
            .filter(|(item, _)| item.kind == kind)
            .map(|(item, qty)| (item.name.clone(), *qty))
            .collect()
    }

    pub fn records(&self) -> Vec<StockRecord> {
        let guard = self.levels.lock().expect("ledger mutex poisoned");
        let mut records: Vec<StockRecord> = guard
            .iter()
            .map(|(item, quantity)| StockRecord {
                item: item.clone(),
                quantity: *quantity,
            })
            .collect();
        records.sort_by(|a, b| a.item.cmp(&b.item));
        records
    }
}
