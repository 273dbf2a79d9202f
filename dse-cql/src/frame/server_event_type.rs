//! Kinds of server-pushed events a connection can REGISTER for.

use std::fmt;
use std::str::FromStr;

use super::frame_errors::CqlEventParseError;

/// Kind of an out-of-band event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[expect(clippy::enum_variant_names)]
pub enum EventType {
    /// A node joined or left the cluster.
    TopologyChange,
    /// A node went up or down.
    StatusChange,
    /// A schema object was created, altered or dropped.
    SchemaChange,
}

impl EventType {
    pub const ALL: [EventType; 3] = [
        EventType::TopologyChange,
        EventType::StatusChange,
        EventType::SchemaChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TopologyChange => "TOPOLOGY_CHANGE",
            Self::StatusChange => "STATUS_CHANGE",
            Self::SchemaChange => "SCHEMA_CHANGE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CqlEventParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CqlEventParseError::UnknownEventType(s.to_owned()))
    }
}
