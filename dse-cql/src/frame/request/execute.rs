use bytes::Bytes;

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::request::{query::QueryParameters, RequestOpcode, SerializableRequest};
use crate::frame::types;
use crate::frame::ProtocolVersion;

/// Executes a statement prepared earlier on the same node.
#[derive(Debug, Clone)]
pub struct Execute<'a> {
    pub id: Bytes,
    pub parameters: QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        self.serialize_for(ProtocolVersion::V4, buf)
    }

    fn serialize_for(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        types::write_short_bytes(&self.id[..], buf)?;
        self.parameters.serialize(version, buf)
    }
}
