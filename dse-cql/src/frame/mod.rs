//! Framing of the CQL native protocol: headers, compression envelopes and the
//! codec that turns requests into frames and frames into responses.

pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;
pub mod value;

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, OnceLock};

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use frame_errors::{
    CqlRequestSerializationError, CqlResponseParseError, FrameBodyExtensionsParseError,
    FrameHeaderParseError,
};
use request::{RequestOpcode, SerializableRequest};
use response::{Response, ResponseOpcode};

// Frame flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub const FLAG_WARNING: u8 = 0x08;

/// Direction bit of the version byte, set on frames sent by the server.
const RESPONSE_DIRECTION: u8 = 0x80;

/// Frames with a longer declared body are refused outright.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Stream id the server uses for pushed EVENT frames.
pub const EVENT_STREAM_ID: i16 = -1;

/// Native protocol version spoken on a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ProtocolVersion {
    V2 = 2,
    V3 = 3,
    #[default]
    V4 = 4,
}

impl ProtocolVersion {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// v2 carries the stream id in one byte, later versions in two.
    pub fn header_size(self) -> usize {
        match self {
            ProtocolVersion::V2 => 8,
            ProtocolVersion::V3 | ProtocolVersion::V4 => 9,
        }
    }

    /// Number of distinct non-negative stream ids the version can address.
    pub fn max_streams(self) -> usize {
        match self {
            ProtocolVersion::V2 => 128,
            ProtocolVersion::V3 | ProtocolVersion::V4 => 32768,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            4 => Ok(Self::V4),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ProtocolVersion",
                primitive: value,
            }),
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum Compression {
    /// LZ4 block, prefixed with the big-endian uncompressed length.
    Lz4,
    /// Raw Snappy.
    Snappy,
}

impl Compression {
    /// Name used in the COMPRESSION option of SUPPORTED and STARTUP.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request frame with a placeholder stream id.
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    data: Vec<u8>,
    version: ProtocolVersion,
}

impl SerializedRequest {
    /// Builds a complete frame for `req`.
    ///
    /// The body is compressed only when `compression` is given and the body is
    /// at least `compression_threshold` bytes long. STARTUP and OPTIONS are
    /// always sent uncompressed, because the server enables compression only
    /// after STARTUP.
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        compression_threshold: usize,
        tracing: bool,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        let header_size = version.header_size();
        let mut flags = 0;
        let mut data = vec![0; header_size];

        let compression = compression
            .filter(|_| !matches!(R::OPCODE, RequestOpcode::Startup | RequestOpcode::Options));

        match compression {
            Some(compression) => {
                let mut body = Vec::new();
                req.serialize_for(version, &mut body)?;
                if body.len() >= compression_threshold {
                    flags |= FLAG_COMPRESSION;
                    compress_append(&body, compression, &mut data)?;
                } else {
                    data.extend_from_slice(&body);
                }
            }
            None => req.serialize_for(version, &mut data)?,
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = version.as_u8();
        data[1] = flags;
        // Stream id stays zeroed until `set_stream`.
        data[header_size - 5] = R::OPCODE as u8;

        let body_len = u32::try_from(data.len() - header_size)?;
        data[header_size - 4..header_size].copy_from_slice(&body_len.to_be_bytes());

        Ok(Self { data, version })
    }

    /// Stamps the stream id into the header.
    ///
    /// For v2 only the low byte is written; callers never allocate ids
    /// outside the version's range.
    pub fn set_stream(&mut self, stream: i16) {
        match self.version {
            ProtocolVersion::V2 => self.data[2] = stream as i8 as u8,
            ProtocolVersion::V3 | ProtocolVersion::V4 => {
                self.data[2..4].copy_from_slice(&stream.to_be_bytes())
            }
        }
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn into_bytes(self) -> Bytes {
        self.data.into()
    }

    pub fn flags(&self) -> u8 {
        self.data[1]
    }
}

/// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl FrameParams {
    pub fn is_response(&self) -> bool {
        self.version & RESPONSE_DIRECTION != 0
    }

    pub fn is_event(&self) -> bool {
        self.stream == EVENT_STREAM_ID
    }
}

fn check_version_byte(
    raw_version: u8,
    expected: ProtocolVersion,
) -> Result<(), FrameHeaderParseError> {
    if raw_version & RESPONSE_DIRECTION == 0 {
        return Err(FrameHeaderParseError::FrameFromClient);
    }
    let actual = raw_version & !RESPONSE_DIRECTION;
    ProtocolVersion::try_from(actual)
        .map_err(|_| FrameHeaderParseError::VersionNotSupported(actual))?;
    if actual != expected.as_u8() {
        return Err(FrameHeaderParseError::VersionMismatch {
            expected: expected.as_u8(),
            actual,
        });
    }
    Ok(())
}

/// Parses a complete header, returning its parameters, opcode and declared
/// body length.
fn parse_header(
    mut buf: &[u8],
    version: ProtocolVersion,
    max_frame_size: usize,
) -> Result<(FrameParams, ResponseOpcode, usize), FrameHeaderParseError> {
    let raw_version = buf.get_u8();
    check_version_byte(raw_version, version)?;

    let flags = buf.get_u8();
    let stream = match version {
        ProtocolVersion::V2 => buf.get_i8() as i16,
        ProtocolVersion::V3 | ProtocolVersion::V4 => buf.get_i16(),
    };
    let opcode = ResponseOpcode::try_from(buf.get_u8())?;
    let length = buf.get_u32() as usize;
    if length > max_frame_size {
        return Err(FrameHeaderParseError::FrameTooLarge {
            declared: length,
            max: max_frame_size,
        });
    }

    let params = FrameParams {
        version: raw_version,
        flags,
        stream,
    };
    Ok((params, opcode, length))
}

/// Reads one response frame from `reader`.
///
/// The reader may deliver the frame in arbitrarily small pieces.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
    version: ProtocolVersion,
    max_frame_size: usize,
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameHeaderParseError> {
    let mut raw_header = [0u8; 9];
    let raw_header = &mut raw_header[..version.header_size()];
    reader
        .read_exact(raw_header)
        .await
        .map_err(|err| FrameHeaderParseError::HeaderIoError(Arc::new(err)))?;

    let (params, opcode, length) = parse_header(raw_header, version, max_frame_size)?;

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader
            .read_buf(&mut raw_body)
            .await
            .map_err(|err| FrameHeaderParseError::BodyChunkIoError(Arc::new(err)))?;
        if n == 0 {
            // EOF, too early
            return Err(FrameHeaderParseError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((params, opcode, raw_body.into_inner().into()))
}

/// Decodes a buffer holding exactly one response frame.
pub fn decode_response_frame(
    buf: &[u8],
    version: ProtocolVersion,
    max_frame_size: usize,
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameHeaderParseError> {
    let header_size = version.header_size();
    if buf.len() < header_size {
        return Err(FrameHeaderParseError::HeaderTooShort {
            expected: header_size,
            received: buf.len(),
        });
    }
    let (header, body) = buf.split_at(header_size);
    let (params, opcode, length) = parse_header(header, version, max_frame_size)?;

    if body.len() < length {
        return Err(FrameHeaderParseError::ConnectionClosed(
            length - body.len(),
            length,
        ));
    }
    if body.len() > length {
        return Err(FrameHeaderParseError::BodyLengthMismatch {
            declared: length,
            actual: body.len(),
        });
    }

    Ok((params, opcode, Bytes::copy_from_slice(body)))
}

/// Envelopes the server may wrap around a response body.
#[derive(Debug, Clone, Default)]
pub struct ResponseExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

/// A response body with its envelopes already stripped.
#[derive(Debug)]
pub struct ResponseBodyWithExtensions {
    pub extensions: ResponseExtensions,
    pub body: Bytes,
}

/// Strips compression, tracing id, warnings and custom payload, in the order
/// the protocol lays them out.
pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameBodyExtensionsParseError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameBodyExtensionsParseError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id =
            types::read_uuid(buf).map_err(FrameBodyExtensionsParseError::TraceIdParse)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)
            .map_err(FrameBodyExtensionsParseError::WarningsListParse)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf)
            .map_err(FrameBodyExtensionsParseError::CustomPayloadMapParse)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        extensions: ResponseExtensions {
            trace_id,
            warnings,
            custom_payload,
        },
        body,
    })
}

fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), CqlRequestSerializationError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = u32::try_from(uncomp_body.len())?;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|err| CqlRequestSerializationError::SnapCompressError(Arc::new(err)))?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

fn decompress(
    mut comp_body: &[u8],
    compression: Compression,
) -> Result<Vec<u8>, FrameBodyExtensionsParseError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameBodyExtensionsParseError::Lz4MissingLength);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            lz4_flex::decompress(comp_body, uncomp_len)
                .map_err(|err| FrameBodyExtensionsParseError::Lz4DecompressError(Arc::new(err)))
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|err| FrameBodyExtensionsParseError::SnapDecompressError(Arc::new(err))),
    }
}

/// Encodes requests into frames and decodes response frames for one connection.
///
/// Clones share the negotiated compression, which can be set once, after the
/// server has advertised what it supports.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    version: ProtocolVersion,
    compression: Arc<OnceLock<Compression>>,
    compression_threshold: usize,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            compression: Arc::new(OnceLock::new()),
            compression_threshold: 0,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Bodies shorter than `threshold` bytes are sent uncompressed.
    /// 0 compresses every eligible body.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compression.get().copied()
    }

    /// Records the negotiated compression. Returns false if one was already set.
    pub fn set_compression(&self, compression: Compression) -> bool {
        self.compression.set(compression).is_ok()
    }

    pub fn serialize_request<R: SerializableRequest>(
        &self,
        req: &R,
        tracing: bool,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        SerializedRequest::make(
            req,
            self.version,
            self.compression(),
            self.compression_threshold,
            tracing,
        )
    }

    /// Encodes `req` into a complete frame on `stream_id`.
    pub fn encode<R: SerializableRequest>(
        &self,
        req: &R,
        stream_id: i16,
        tracing: bool,
    ) -> Result<Bytes, CqlRequestSerializationError> {
        let mut serialized = self.serialize_request(req, tracing)?;
        serialized.set_stream(stream_id);
        Ok(serialized.into_bytes())
    }

    pub async fn read_frame(
        &self,
        reader: &mut (impl AsyncRead + Unpin),
    ) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameHeaderParseError> {
        read_response_frame(reader, self.version, self.max_frame_size).await
    }

    pub fn decode_frame(
        &self,
        buf: &[u8],
    ) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameHeaderParseError> {
        decode_response_frame(buf, self.version, self.max_frame_size)
    }

    /// Parses the body of a correctly delimited frame into a typed response.
    pub fn parse_response(
        &self,
        params: FrameParams,
        opcode: ResponseOpcode,
        body: Bytes,
    ) -> Result<(Response, ResponseExtensions), CqlResponseParseError> {
        let body_with_ext =
            parse_response_body_extensions(params.flags, self.compression(), body)?;
        let response = Response::deserialize(self.version, opcode, &mut &*body_with_ext.body)?;
        Ok((response, body_with_ext.extensions))
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discrimant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}
