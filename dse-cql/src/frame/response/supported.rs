use crate::frame::frame_errors::LowLevelDeserializationError;
use crate::frame::request::options;
use crate::frame::types;
use crate::frame::Compression;
use std::collections::HashMap;

/// Options the server is willing to accept in STARTUP.
#[derive(Debug, Clone, Default)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, LowLevelDeserializationError> {
        let options = types::read_string_multimap(buf)?;
        Ok(Supported { options })
    }

    /// Compression algorithms the server advertised, in their wire names.
    pub fn compression_algorithms(&self) -> impl Iterator<Item = &str> {
        self.options
            .get(options::COMPRESSION)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn supports_compression(&self, compression: Compression) -> bool {
        let wanted = compression.as_str();
        self.compression_algorithms().any(|c| c == wanted)
    }
}
