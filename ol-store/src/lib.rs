//! Durable storage for Orderline: work queue, dead letters, idempotency
//! markers, clarification contexts, and the order aggregate.
//!
//! Everything lives in one embedded SQLite database so that queued work and
//! in-flight dialog state survive a restart.

mod context;
mod db;
mod error;
mod markers;
mod orders;
mod queue;

pub use context::{ClarificationContext, ContextProduct, ContextStore, MissingField};
pub use db::Database;
pub use error::{Result, StoreError};
pub use markers::{MarkerKind, MarkerStore};
pub use orders::{
    NewOrder, Order, OrderItem, OrderStatus, OrderStore, TransitionFields,
};
pub use queue::{DeadLetterEntry, QueuedMessage, WorkQueue};
