//! EVENT response: topology, status and schema notifications pushed by the server.

use crate::frame::frame_errors::{CqlEventParseError, LowLevelDeserializationError};
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use crate::frame::ProtocolVersion;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
#[expect(clippy::enum_variant_names)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
    /// Sent by v2 and v3 servers when a node's tokens moved.
    MovedNode(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

/// A schema object was created, altered or dropped.
///
/// `object_name` is absent for keyspace-level changes. `arguments` is only
/// populated for functions and aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChangeEvent {
    pub change_type: SchemaChangeType,
    pub target: SchemaChangeTarget,
    pub keyspace_name: String,
    pub object_name: Option<String>,
    pub arguments: Vec<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    Invalid,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchemaChangeTarget {
    Keyspace,
    Table,
    Type,
    Function,
    Aggregate,
}

impl Event {
    pub fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, CqlEventParseError> {
        let event_type: EventType = types::read_string(buf)
            .map_err(CqlEventParseError::EventTypeParseError)?
            .parse()?;
        match event_type {
            EventType::TopologyChange => Ok(Self::TopologyChange(
                TopologyChangeEvent::deserialize(buf)?,
            )),
            EventType::StatusChange => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            EventType::SchemaChange => Ok(Self::SchemaChange(
                SchemaChangeEvent::deserialize(version, buf).map_err(|err| {
                    CqlEventParseError::MalformedPayload {
                        event_type: "SCHEMA_CHANGE",
                        err,
                    }
                })?,
            )),
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Event::TopologyChange(_) => EventType::TopologyChange,
            Event::StatusChange(_) => EventType::StatusChange,
            Event::SchemaChange(_) => EventType::SchemaChange,
        }
    }
}

fn read_change_and_address(
    event_type: &'static str,
    buf: &mut &[u8],
) -> Result<(String, SocketAddr), CqlEventParseError> {
    let malformed = |err| CqlEventParseError::MalformedPayload { event_type, err };
    let change = types::read_string(buf).map_err(malformed)?.to_owned();
    let addr = types::read_inet(buf).map_err(malformed)?;
    Ok((change, addr))
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let (change, addr) = read_change_and_address("TOPOLOGY_CHANGE", buf)?;
        match change.as_str() {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            "MOVED_NODE" => Ok(Self::MovedNode(addr)),
            _ => Err(CqlEventParseError::UnknownChangeType {
                event_type: "TOPOLOGY_CHANGE",
                change,
            }),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let (change, addr) = read_change_and_address("STATUS_CHANGE", buf)?;
        match change.as_str() {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(CqlEventParseError::UnknownChangeType {
                event_type: "STATUS_CHANGE",
                change,
            }),
        }
    }
}

impl SchemaChangeEvent {
    /// Parses the schema change payload shared by EVENT and RESULT:Schema_change.
    ///
    /// v2 sends `<change><keyspace><table>`, with an empty table for
    /// keyspace-level changes. v3+ sends `<change><target><options>`.
    pub fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, LowLevelDeserializationError> {
        let change_type = match types::read_string(buf)? {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        };

        if version == ProtocolVersion::V2 {
            let keyspace_name = types::read_string(buf)?.to_owned();
            let table = types::read_string(buf)?;
            let (target, object_name) = if table.is_empty() {
                (SchemaChangeTarget::Keyspace, None)
            } else {
                (SchemaChangeTarget::Table, Some(table.to_owned()))
            };
            return Ok(Self {
                change_type,
                target,
                keyspace_name,
                object_name,
                arguments: Vec::new(),
            });
        }

        let target = types::read_string(buf)?;
        let keyspace_name = types::read_string(buf)?.to_owned();
        let (target, object_name, arguments) = match target {
            "TABLE" => (
                SchemaChangeTarget::Table,
                Some(types::read_string(buf)?.to_owned()),
                Vec::new(),
            ),
            "TYPE" => (
                SchemaChangeTarget::Type,
                Some(types::read_string(buf)?.to_owned()),
                Vec::new(),
            ),
            "FUNCTION" | "AGGREGATE" => {
                let name = types::read_string(buf)?.to_owned();
                let arguments = types::read_string_list(buf)?;
                let target = if target == "FUNCTION" {
                    SchemaChangeTarget::Function
                } else {
                    SchemaChangeTarget::Aggregate
                };
                (target, Some(name), arguments)
            }
            // "KEYSPACE" and anything newer than we know about
            _ => (SchemaChangeTarget::Keyspace, None, Vec::new()),
        };

        Ok(Self {
            change_type,
            target,
            keyspace_name,
            object_name,
            arguments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::{write_inet, write_string, write_string_list};
    use assert_matches::assert_matches;

    #[test]
    fn status_change() {
        let addr: SocketAddr = "10.0.0.7:9042".parse().unwrap();
        let mut body = Vec::new();
        write_string("STATUS_CHANGE", &mut body).unwrap();
        write_string("DOWN", &mut body).unwrap();
        write_inet(addr, &mut body);

        let event = Event::deserialize(ProtocolVersion::V4, &mut &body[..]).unwrap();
        assert_eq!(event, Event::StatusChange(StatusChangeEvent::Down(addr)));
        assert_eq!(event.event_type(), EventType::StatusChange);
    }

    #[test]
    fn schema_change_v2_and_v4() {
        let mut v2 = Vec::new();
        write_string("SCHEMA_CHANGE", &mut v2).unwrap();
        write_string("DROPPED", &mut v2).unwrap();
        write_string("ks", &mut v2).unwrap();
        write_string("", &mut v2).unwrap();
        let event = Event::deserialize(ProtocolVersion::V2, &mut &v2[..]).unwrap();
        assert_matches!(
            event,
            Event::SchemaChange(SchemaChangeEvent {
                change_type: SchemaChangeType::Dropped,
                target: SchemaChangeTarget::Keyspace,
                object_name: None,
                ..
            })
        );

        let mut v4 = Vec::new();
        write_string("SCHEMA_CHANGE", &mut v4).unwrap();
        write_string("CREATED", &mut v4).unwrap();
        write_string("FUNCTION", &mut v4).unwrap();
        write_string("ks", &mut v4).unwrap();
        write_string("avg_state", &mut v4).unwrap();
        write_string_list(&["int", "bigint"], &mut v4).unwrap();
        let Event::SchemaChange(change) = Event::deserialize(ProtocolVersion::V4, &mut &v4[..])
            .unwrap()
        else {
            panic!("expected schema change");
        };
        assert_eq!(change.target, SchemaChangeTarget::Function);
        assert_eq!(change.object_name.as_deref(), Some("avg_state"));
        assert_eq!(change.arguments, vec!["int", "bigint"]);
    }

    #[test]
    fn unknown_event_type() {
        let mut body = Vec::new();
        write_string("CLIENT_ROUTES_CHANGE", &mut body).unwrap();
        assert_matches!(
            Event::deserialize(ProtocolVersion::V4, &mut &body[..]),
            Err(CqlEventParseError::UnknownEventType(t)) if t == "CLIENT_ROUTES_CHANGE"
        );
    }
}
