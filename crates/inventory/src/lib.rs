//! Inventory domain module (event-sourced).
//!
//! This crate contains business rules for stock movements, implemented purely
//! as deterministic domain logic (no IO, no storage).

pub mod item;

pub use item::{
    AddStock, InventoryCommand, InventoryItem, RehydrateError, ReleaseStock, ReserveStock,
    STOCK_ADDED, STOCK_RELEASED, STOCK_RESERVED, StockAdded, StockEvent, StockReleased,
    StockReserved,
};
