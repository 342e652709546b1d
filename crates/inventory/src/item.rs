use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use stockview_core::{Aggregate, AggregateRoot, DomainError, StreamId};
use stockview_events::{
    DecodeError, DecodeEvent, Event, EventRecord, VersionGap, check_contiguous,
};

pub const STOCK_ADDED: &str = "StockAdded";
pub const STOCK_RESERVED: &str = "StockReserved";
pub const STOCK_RELEASED: &str = "StockReleased";

/// Event: StockAdded (goods received, stock goes up).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdded {
    pub qty: u32,
}

/// Event: StockReserved (stock held for an order, stock goes down).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    pub qty: u32,
}

/// Event: StockReleased (a reservation was compensated, stock goes back up).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReleased {
    pub qty: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StockEvent {
    StockAdded(StockAdded),
    StockReserved(StockReserved),
    StockReleased(StockReleased),
}

impl StockEvent {
    pub fn qty(&self) -> u32 {
        match self {
            StockEvent::StockAdded(e) => e.qty,
            StockEvent::StockReserved(e) => e.qty,
            StockEvent::StockReleased(e) => e.qty,
        }
    }

    /// Signed effect of this event on available stock.
    pub fn delta(&self) -> i64 {
        match self {
            StockEvent::StockAdded(e) => i64::from(e.qty),
            StockEvent::StockReserved(e) => -i64::from(e.qty),
            StockEvent::StockReleased(e) => i64::from(e.qty),
        }
    }
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::StockAdded(_) => STOCK_ADDED,
            StockEvent::StockReserved(_) => STOCK_RESERVED,
            StockEvent::StockReleased(_) => STOCK_RELEASED,
        }
    }

    fn to_payload(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            StockEvent::StockAdded(e) => serde_json::to_value(e),
            StockEvent::StockReserved(e) => serde_json::to_value(e),
            StockEvent::StockReleased(e) => serde_json::to_value(e),
        }
    }
}

impl DecodeEvent for StockEvent {
    fn decode(event_type: &str, payload: &JsonValue) -> Result<Self, DecodeError> {
        let event = match event_type {
            STOCK_ADDED => StockEvent::StockAdded(parse(event_type, payload)?),
            STOCK_RESERVED => StockEvent::StockReserved(parse(event_type, payload)?),
            STOCK_RELEASED => StockEvent::StockReleased(parse(event_type, payload)?),
            other => return Err(DecodeError::UnknownType(other.to_string())),
        };

        if event.qty() == 0 {
            return Err(DecodeError::malformed(event_type, "qty must be positive"));
        }
        Ok(event)
    }
}

fn parse<T: DeserializeOwned>(event_type: &str, payload: &JsonValue) -> Result<T, DecodeError> {
    T::deserialize(payload).map_err(|e| DecodeError::malformed(event_type, e.to_string()))
}

/// Command: AddStock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddStock {
    pub qty: u32,
}

/// Command: ReserveStock (hard check against available stock).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub qty: u32,
}

/// Command: ReleaseStock (compensation; always allowed).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStock {
    pub qty: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCommand {
    AddStock(AddStock),
    ReserveStock(ReserveStock),
    ReleaseStock(ReleaseStock),
}

/// Failure to rebuild an aggregate from its stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RehydrateError {
    #[error(transparent)]
    Gap(#[from] VersionGap),

    #[error("record v{version} belongs to stream '{found}', not '{expected}'")]
    ForeignStream {
        expected: StreamId,
        found: StreamId,
        version: u64,
    },

    #[error("cannot decode v{version}: {source}")]
    Decode { version: u64, source: DecodeError },
}

/// Aggregate root: one product's stock, rebuilt by replaying its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryItem {
    id: StreamId,
    available: i64,
    version: u64,
}

impl InventoryItem {
    /// Create an empty aggregate instance for rehydration.
    pub fn empty(id: StreamId) -> Self {
        Self {
            id,
            available: 0,
            version: 0,
        }
    }

    /// Rebuild from a full stream read starting at version 1.
    pub fn from_history(id: StreamId, records: &[EventRecord]) -> Result<Self, RehydrateError> {
        let mut item = Self::empty(id);
        item.replay(records)?;
        Ok(item)
    }

    /// Fold records that follow the current version.
    ///
    /// Event types this aggregate does not know still consume their version so
    /// that the next append lands on the right slot.
    pub fn replay(&mut self, records: &[EventRecord]) -> Result<(), RehydrateError> {
        check_contiguous(records, self.version + 1)?;

        for record in records {
            if record.stream_id() != &self.id {
                return Err(RehydrateError::ForeignStream {
                    expected: self.id.clone(),
                    found: record.stream_id().clone(),
                    version: record.version(),
                });
            }

            match record.decode::<StockEvent>() {
                Ok(event) => self.apply(&event),
                Err(DecodeError::UnknownType(_)) => self.version += 1,
                Err(source) => {
                    return Err(RehydrateError::Decode {
                        version: record.version(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn available(&self) -> i64 {
        self.available
    }
}

impl AggregateRoot for InventoryItem {
    type Id = StreamId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for InventoryItem {
    type Command = InventoryCommand;
    type Event = StockEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        self.available += event.delta();
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Self::Event, Self::Error> {
        match command {
            InventoryCommand::AddStock(cmd) => {
                ensure_positive(cmd.qty)?;
                Ok(StockEvent::StockAdded(StockAdded { qty: cmd.qty }))
            }
            InventoryCommand::ReserveStock(cmd) => {
                ensure_positive(cmd.qty)?;
                if i64::from(cmd.qty) > self.available {
                    return Err(DomainError::invariant(format!(
                        "insufficient stock for '{}': available {}, requested {}",
                        self.id, self.available, cmd.qty
                    )));
                }
                Ok(StockEvent::StockReserved(StockReserved { qty: cmd.qty }))
            }
            InventoryCommand::ReleaseStock(cmd) => {
                ensure_positive(cmd.qty)?;
                Ok(StockEvent::StockReleased(StockReleased { qty: cmd.qty }))
            }
        }
    }
}

fn ensure_positive(qty: u32) -> Result<(), DomainError> {
    if qty == 0 {
        return Err(DomainError::validation("qty must be positive"));
    }
    Ok(())
}
