use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ensure;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

/// Session id the client uses before the first message creates a real session.
pub const NEW_SESSION_SENTINEL: &str = "new";

/// Opaque session identifier.
///
/// Ids minted locally are UUIDv7 strings, but ids coming back from the remote
/// service are accepted verbatim as long as they are usable as a path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let trimmed = raw.trim();
        ensure!(
            !trimmed.is_empty(),
            InvalidIdSnafu {
                stage: "parse-session-id",
                id_type: "session-id",
                raw: raw.to_string(),
                details: "id is empty",
            }
        );
        ensure!(
            !trimmed.contains(['/', '?', '#']),
            InvalidIdSnafu {
                stage: "parse-session-id",
                id_type: "session-id",
                raw: raw.to_string(),
                details: "id contains a path delimiter",
            }
        );
        Ok(Self(trimmed.to_string()))
    }

    /// Time-ordered id with random tail, collision resistant across devices.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn sentinel() -> Self {
        Self(NEW_SESSION_SENTINEL.to_string())
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 == NEW_SESSION_SENTINEL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

/// Time-derived message identifier (unix milliseconds, plus a segment offset
/// for multi-part replies).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn now() -> Self {
        Self(crate::unix_timestamp_millis())
    }

    /// Returns a fresh id that sorts strictly after `previous`.
    pub fn next_after(previous: MessageId) -> Self {
        let now = Self::now();
        if now > previous { now } else { previous.offset(1) }
    }

    pub const fn offset(self, index: u64) -> Self {
        Self(self.0.saturating_add(index))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        raw.trim().parse::<u64>().map(Self).map_err(|_| {
            InvalidIdSnafu {
                stage: "parse-message-id",
                id_type: "message-id",
                raw: raw.to_string(),
                details: "id is not an unsigned integer",
            }
            .build()
        })
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}
