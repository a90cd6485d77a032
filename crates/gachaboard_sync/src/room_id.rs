//! Validated room identifiers.
//!
//! A [`RoomId`] is built once from the raw path segment a client connected
//! with. Every character outside `[A-Za-z0-9_-]` is replaced with `_`, so the
//! value can be joined onto the rooms directory without escaping it.

use serde::Serialize;
use std::fmt;

/// Longest accepted raw room identifier, in bytes.
pub const MAX_ROOM_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomIdError {
    #[error("room id is empty")]
    Empty,
    #[error("room id is {0} bytes, limit is {MAX_ROOM_ID_LEN}")]
    TooLong(usize),
}

/// A sanitized room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Sanitize a raw identifier taken from a request.
    pub fn parse(raw: &str) -> Result<Self, RoomIdError> {
        if raw.is_empty() {
            return Err(RoomIdError::Empty);
        }
        if raw.len() > MAX_ROOM_ID_LEN {
            return Err(RoomIdError::TooLong(raw.len()));
        }

        let sanitized = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        Ok(Self(sanitized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the room's SQLite store.
    pub fn db_file_name(&self) -> String {
        format!("{}.db", self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
