//! Background workers.

pub mod projector;

pub use projector::{
    BatchReport, FailurePolicy, Projector, ProjectorConfig, ProjectorError, ProjectorHandle,
    ProjectorState, ProjectorStatus,
};
