//! Infrastructure layer: event store, read model, checkpoints and the projector.

pub mod config;
pub mod error;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod retry;
pub mod schema;
pub mod stock_service;
pub mod workers;

mod integration_tests;

pub use error::StorageError;
