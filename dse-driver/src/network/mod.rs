//! A single multiplexed connection to a node and the bookkeeping of its streams.

mod connection;
mod stream_table;

pub use connection::{Connection, ConnectionConfig, ErrorReceiver, PendingResponse};
pub use stream_table::{PendingRequest, StreamAcquireError, StreamRegisterError, StreamTable};
