//! Defines CQL protocol-level types for talking to DSE and Apache Cassandra
//! over the native protocol, versions 2 to 4.
//!
//! Mainly intended to be used by the `dse-driver` crate, but can also be
//! useful for other applications that need to speak CQL, such as proxies or
//! test servers.

pub mod frame;

pub use crate::frame::types::Consistency;
pub use crate::frame::{Compression, FrameCodec, ProtocolVersion};
