//! Event log primitives shared by the write and read sides.

pub mod event;
pub mod record;

pub use event::{DecodeError, DecodeEvent, Event};
pub use record::{EventRecord, NewEvent, Position, VersionGap, check_contiguous};
