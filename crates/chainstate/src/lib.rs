//! Chain state: block and transaction validation over a key-value store.

pub mod address_index;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod index;
pub mod metrics;
pub mod overlay;
pub mod pending;
pub mod records;
pub mod spentindex;
pub mod store;
pub mod validation;

pub use engine::{EngineOptions, ValidationEngine};
pub use error::EngineError;
pub use events::ChainEvent;
pub use metrics::{ConnectMetrics, ConnectMetricsSnapshot};
pub use pending::PendingPool;
pub use records::{Branch, TxPool, TxSummary, UnconfirmedPool};
pub use store::{ChainStore, StoreStats};
pub use validation::ValidationError;
