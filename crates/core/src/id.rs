//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Upper bound on the length of textual identifiers (bytes).
pub const MAX_ID_LEN: usize = 128;

/// Projector id used when none is configured.
pub const DEFAULT_PROJECTOR_ID: &str = "main_projector";

/// Identifier of an event stream: one stream per product (e.g. a SKU such as `iphone-15`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

/// Identifier of a projector; each projector owns one checkpoint over the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectorId(String);

/// Identifier of a persisted event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

macro_rules! impl_text_id {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Validate and wrap a textual identifier.
            ///
            /// Rejects empty values, surrounding whitespace and values longer
            /// than [`MAX_ID_LEN`].
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: cannot be empty", $name)));
                }
                if value.trim() != value {
                    return Err(DomainError::invalid_id(format!(
                        "{}: surrounding whitespace in '{}'",
                        $name, value
                    )));
                }
                if value.len() > MAX_ID_LEN {
                    return Err(DomainError::invalid_id(format!(
                        "{}: longer than {} bytes",
                        $name, MAX_ID_LEN
                    )));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_text_id!(StreamId, "StreamId");
impl_text_id!(ProjectorId, "ProjectorId");

impl Default for ProjectorId {
    fn default() -> Self {
        Self(DEFAULT_PROJECTOR_ID.to_string())
    }
}

impl EventId {
    /// Create a new identifier (UUIDv7, time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for EventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for EventId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}
