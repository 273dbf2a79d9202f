//! Errors returned while building and parsing CQL frames.

use std::num::TryFromIntError;
use std::sync::Arc;

use thiserror::Error;

use super::response::ResponseOpcode;
use super::TryFromPrimitiveError;

/// An error that occurred while reading or validating a frame header,
/// or while delimiting the frame body.
///
/// Every variant of this error means that the byte stream can no longer be
/// trusted, so the connection that produced it must be closed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameHeaderParseError {
    /// The direction bit says the frame was sent by a client.
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,

    /// The direction bit says the frame was sent by a server.
    #[error("Received frame marked as coming from a server")]
    FrameFromServer,

    /// The frame carries a protocol version this crate does not speak.
    #[error("Received a frame from version {0}, but only versions 2, 3 and 4 are supported")]
    VersionNotSupported(u8),

    /// The frame carries a version other than the one the connection negotiated.
    #[error("Received a frame from version {actual}, but the connection uses version {expected}")]
    VersionMismatch {
        /// Version in use on the connection.
        expected: u8,
        /// Version found in the header.
        actual: u8,
    },

    /// The opcode byte does not name any known response.
    #[error("Unrecognized response opcode: {0}")]
    UnknownOpcode(#[from] TryFromPrimitiveError<u8>),

    /// Fewer bytes than a full header were available.
    #[error("Frame header is incomplete: got {received} out of {expected} bytes")]
    HeaderTooShort {
        /// Header size for the protocol version.
        expected: usize,
        /// Bytes available.
        received: usize,
    },

    /// The declared body length is larger than the configured limit.
    #[error("Frame body length {declared} exceeds the maximum frame size {max}")]
    FrameTooLarge {
        /// Length from the header.
        declared: usize,
        /// Limit in force.
        max: usize,
    },

    /// The stream ended before the whole body was received.
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),

    /// The buffer holds more bytes than the header declared.
    #[error("Frame body length mismatch: header declares {declared} bytes, got {actual}")]
    BodyLengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Bytes that followed the header.
        actual: usize,
    },

    /// I/O failure while reading the header.
    #[error("Failed to read the frame header: {0}")]
    HeaderIoError(Arc<std::io::Error>),

    /// I/O failure while reading the body.
    #[error("Failed to read a chunk of the frame body: {0}")]
    BodyChunkIoError(Arc<std::io::Error>),
}

impl FrameHeaderParseError {
    /// Whether the error concerns frame delimitation (a body shorter or longer
    /// than declared) rather than the header contents.
    pub fn is_framing_error(&self) -> bool {
        matches!(
            self,
            Self::HeaderTooShort { .. }
                | Self::FrameTooLarge { .. }
                | Self::ConnectionClosed(..)
                | Self::BodyLengthMismatch { .. }
        )
    }
}

/// An error that occurred while removing the optional envelopes around a
/// response body: compression, tracing id, warnings and custom payload.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameBodyExtensionsParseError {
    /// The compression flag was set on a connection without compression.
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,

    /// Snappy decompression failed.
    #[error("Snappy decompression failed: {0}")]
    SnapDecompressError(Arc<snap::Error>),

    /// LZ4 decompression failed.
    #[error("Error decompressing lz4 data: {0}")]
    Lz4DecompressError(Arc<lz4_flex::block::DecompressError>),

    /// The LZ4 body did not even hold its length prefix.
    #[error("Lz4 body is too short to hold the uncompressed length prefix")]
    Lz4MissingLength,

    /// Malformed tracing id.
    #[error("Malformed tracing id: {0}")]
    TraceIdParse(LowLevelDeserializationError),

    /// Malformed warning list.
    #[error("Malformed warnings list: {0}")]
    WarningsListParse(LowLevelDeserializationError),

    /// Malformed custom payload map.
    #[error("Malformed custom payload map: {0}")]
    CustomPayloadMapParse(LowLevelDeserializationError),
}

/// An error that occurred while serializing a request body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlRequestSerializationError {
    /// A length did not fit the field used to carry it on the wire.
    #[error("Value length does not fit the wire representation: {0}")]
    LengthOverflow(#[from] TryFromIntError),

    /// Too many bound values for a single request.
    #[error("Too many bound values: {0}, at most {max} are allowed", max = u16::MAX)]
    TooManyValues(usize),

    /// A request option is not representable in the protocol version in use.
    #[error("{what} is not supported by protocol version {version}")]
    UnsupportedByVersion {
        /// Feature that cannot be serialized.
        what: &'static str,
        /// Version in use.
        version: u8,
    },

    /// Snappy compression failed.
    #[error("Snappy compression failed: {0}")]
    SnapCompressError(Arc<snap::Error>),
}

/// An error that occurred while parsing the body of a response.
///
/// Unlike [FrameHeaderParseError], the frame boundary is intact when this
/// error is returned, so only the request owning the frame is affected.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResponseParseError {
    /// ERROR body.
    #[error("Failed to deserialize ERROR response: {0}")]
    CqlErrorParseError(LowLevelDeserializationError),
    /// AUTHENTICATE body.
    #[error("Failed to deserialize AUTHENTICATE response: {0}")]
    CqlAuthenticateParseError(LowLevelDeserializationError),
    /// AUTH_SUCCESS body.
    #[error("Failed to deserialize AUTH_SUCCESS response: {0}")]
    CqlAuthSuccessParseError(LowLevelDeserializationError),
    /// AUTH_CHALLENGE body.
    #[error("Failed to deserialize AUTH_CHALLENGE response: {0}")]
    CqlAuthChallengeParseError(LowLevelDeserializationError),
    /// SUPPORTED body.
    #[error("Failed to deserialize SUPPORTED response: {0}")]
    CqlSupportedParseError(LowLevelDeserializationError),
    /// EVENT body.
    #[error("Failed to deserialize EVENT response: {0}")]
    CqlEventParseError(#[from] CqlEventParseError),
    /// RESULT body.
    #[error("Failed to deserialize RESULT response: {0}")]
    CqlResultParseError(#[from] CqlResultParseError),
    /// Removing compression or other envelopes failed.
    #[error(transparent)]
    BodyExtensionsParseError(#[from] FrameBodyExtensionsParseError),
}

impl CqlResponseParseError {
    /// Opcode of the response whose body failed to parse, if known.
    pub fn opcode(&self) -> Option<ResponseOpcode> {
        match self {
            Self::CqlErrorParseError(_) => Some(ResponseOpcode::Error),
            Self::CqlAuthenticateParseError(_) => Some(ResponseOpcode::Authenticate),
            Self::CqlAuthSuccessParseError(_) => Some(ResponseOpcode::AuthSuccess),
            Self::CqlAuthChallengeParseError(_) => Some(ResponseOpcode::AuthChallenge),
            Self::CqlSupportedParseError(_) => Some(ResponseOpcode::Supported),
            Self::CqlEventParseError(_) => Some(ResponseOpcode::Event),
            Self::CqlResultParseError(_) => Some(ResponseOpcode::Result),
            Self::BodyExtensionsParseError(_) => None,
        }
    }
}

/// An error that occurred while parsing an EVENT body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlEventParseError {
    /// Malformed event type string.
    #[error("Malformed event type string: {0}")]
    EventTypeParseError(LowLevelDeserializationError),
    /// Event type string not known.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    /// Malformed event payload.
    #[error("Malformed {event_type} event payload: {err}")]
    MalformedPayload {
        /// Kind of the event.
        event_type: &'static str,
        /// Underlying failure.
        err: LowLevelDeserializationError,
    },
    /// Unknown change kind inside a topology or status event.
    #[error("Unknown change type in {event_type} event: {change}")]
    UnknownChangeType {
        /// Kind of the event.
        event_type: &'static str,
        /// Offending change string.
        change: String,
    },
}

/// An error that occurred while parsing a RESULT body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResultParseError {
    /// Malformed result kind.
    #[error("Malformed RESULT kind: {0}")]
    ResultIdParseError(LowLevelDeserializationError),
    /// Result kind not known.
    #[error("Unknown RESULT kind: {0}")]
    UnknownResultId(i32),
    /// Malformed SET_KEYSPACE payload.
    #[error("RESULT:Set_keyspace response deserialization failed: {0}")]
    SetKeyspaceParseError(LowLevelDeserializationError),
    /// Malformed SCHEMA_CHANGE payload.
    #[error("RESULT:Schema_change response deserialization failed: {0}")]
    SchemaChangeParseError(LowLevelDeserializationError),
    /// Malformed PREPARED payload.
    #[error("RESULT:Prepared response deserialization failed: {0}")]
    PreparedParseError(LowLevelDeserializationError),
    /// Malformed ROWS payload.
    #[error("RESULT:Rows response deserialization failed: {0}")]
    RowsParseError(LowLevelDeserializationError),
    /// Column type id not known.
    #[error("Unknown column type id: {0:#06x}")]
    UnknownColumnType(u16),
    /// Cell contents did not match the declared column type.
    #[error("Failed to deserialize a value of type {typ}: {err}")]
    ValueParseError {
        /// Name of the column type.
        typ: String,
        /// Underlying failure.
        err: LowLevelDeserializationError,
    },
}

/// A low-level deserialization error, raised by the primitive readers in
/// [crate::frame::types].
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    /// Underlying read failed (usually the buffer ended).
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    /// A length prefix did not fit `usize`.
    #[error(transparent)]
    TryFromIntError(#[from] TryFromIntError),
    /// Not enough bytes left for the announced length.
    #[error("Not enough bytes! expected: {expected}, received: {received}")]
    TooFewBytesReceived {
        /// Bytes required.
        expected: usize,
        /// Bytes left.
        received: usize,
    },
    /// A `[value]` length below -2.
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    /// Unknown consistency code.
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    /// `[inet]` address length other than 4 or 16.
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    /// String was not valid UTF-8.
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

