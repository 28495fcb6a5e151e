//! Shared identifiers and catalog items used across the system.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::location::Postcode;

/// Unique identifier for a drone.
pub type DroneId = u64;

/// Ingredient name to quantity needed per prepared dish.
pub type Recipe = BTreeMap<String, u64>;

/// Which side of the ledger an item lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemKind {
    Dish,
    Ingredient,
}

/// Ledger identity of an item. Items are matched by name, never by instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub kind: ItemKind,
    pub name: String,
}

impl ItemKey {
    pub fn dish(name: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Dish,
            name: name.into(),
        }
    }

    pub fn ingredient(name: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Ingredient,
            name: name.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ItemKind::Dish => write!(f, "dish:{}", self.name),
            ItemKind::Ingredient => write!(f, "ingredient:{}", self.name),
        }
    }
}

/// Threshold and batch size shared by both kinds of item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestockLevels {
    pub threshold: u64,
    pub amount: u64,
}

/// A menu item prepared by staff.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dish {
    pub name: String,
    pub description: String,
    pub price: f64,
    pub restock: RestockLevels,
    pub recipe: Recipe,
}

impl Dish {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        price: f64,
        threshold: u64,
        amount: u64,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            price,
            restock: RestockLevels { threshold, amount },
            recipe: Recipe::new(),
        }
    }

    pub fn with_ingredient(mut self, ingredient: impl Into<String>, quantity: u64) -> Self {
        self.recipe.insert(ingredient.into(), quantity);
        self
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::dish(&self.name)
    }
}

/// A raw ingredient collected from a supplier by drones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub name: String,
    pub unit: String,
    pub supplier: String,
    pub restock: RestockLevels,
    /// Weight of a single unit.
    pub weight: f64,
}

impl Ingredient {
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        supplier: impl Into<String>,
        threshold: u64,
        amount: u64,
        weight: f64,
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            supplier: supplier.into(),
            restock: RestockLevels { threshold, amount },
            weight,
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::ingredient(&self.name)
    }

    /// Weight of one restock batch.
    pub fn batch_weight(&self) -> f64 {
        self.restock.amount as f64 * self.weight
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Supplier {
    pub name: String,
    pub postcode: Postcode,
}

impl Supplier {
    pub fn new(name: impl Into<String>, postcode: Postcode) -> Self {
        Self {
            name: name.into(),
            postcode,
        }
    }
}

/// Identity of a concurrent worker.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerId {
    Staff(String),
    Drone(DroneId),
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerId::Staff(name) => write!(f, "staff-{name}"),
            WorkerId::Drone(id) => write!(f, "drone-{id}"),
        }
    }
}
