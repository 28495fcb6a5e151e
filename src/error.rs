//! Error taxonomy for the supply engine.

use std::fmt;

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SupplyError>;

/// Kind of entity named in a lookup failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Dish,
    Ingredient,
    Supplier,
    Postcode,
    Drone,
    Staff,
    User,
    Order,
    Stock,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityKind::Dish => "dish",
            EntityKind::Ingredient => "ingredient",
            EntityKind::Supplier => "supplier",
            EntityKind::Postcode => "postcode",
            EntityKind::Drone => "drone",
            EntityKind::Staff => "staff member",
            EntityKind::User => "user",
            EntityKind::Order => "order",
            EntityKind::Stock => "stock entry",
        };
        f.write_str(label)
    }
}

/// Errors reported by the engine to its callers.
#[derive(Debug, Error)]
pub enum SupplyError {
    #[error("{kind} \"{name}\" does not exist")]
    NotFound { kind: EntityKind, name: String },

    #[error("{kind} \"{name}\" already exists")]
    AlreadyExists { kind: EntityKind, name: String },

    /// The menu or ingredient list changed while a worker was iterating it.
    #[error("catalog changed during iteration")]
    ConcurrentMutation,

    #[error("no customer placed order \"{order}\"")]
    CustomerNotFound { order: String },

    #[error("order \"{order}\" cannot {action} while {from}")]
    InvalidTransition {
        order: String,
        from: String,
        action: &'static str,
    },

    #[error("no restaurant has been configured")]
    NoRestaurant,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("failed to start thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl SupplyError {
    pub fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        SupplyError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn already_exists(kind: EntityKind, name: impl Into<String>) -> Self {
        SupplyError::AlreadyExists {
            kind,
            name: name.into(),
        }
    }
}

/// Snapshot read/write failures.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}
