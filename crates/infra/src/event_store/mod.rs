//! Append-only event store boundary.
//!
//! One log shared by all writers. Each stream (one per product) carries a
//! contiguous version sequence; the log as a whole carries a global position
//! that follows append order.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError};
