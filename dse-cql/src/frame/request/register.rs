use crate::frame::{
    frame_errors::CqlRequestSerializationError,
    request::{RequestOpcode, SerializableRequest},
    server_event_type::EventType,
    types,
};

/// Subscribes the connection to the listed event kinds.
#[derive(Debug)]
pub struct Register {
    pub event_types_to_register_for: Vec<EventType>,
}

impl SerializableRequest for Register {
    const OPCODE: RequestOpcode = RequestOpcode::Register;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        let event_types_list: Vec<&str> = self
            .event_types_to_register_for
            .iter()
            .map(EventType::as_str)
            .collect();

        types::write_string_list(&event_types_list, buf)?;
        Ok(())
    }
}
