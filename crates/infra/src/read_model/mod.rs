//! Query-side storage for the derived product view.

pub mod postgres;
pub mod store;

pub use postgres::PostgresReadModelStore;
pub use store::{InMemoryReadModelStore, ProductView, ReadModelStore};
