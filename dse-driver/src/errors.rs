//! Errors returned by connections and policies.

use std::net::SocketAddr;
use std::sync::Arc;

use dse_cql::frame::frame_errors::{
    CqlRequestSerializationError, CqlResponseParseError, FrameHeaderParseError,
};
use dse_cql::frame::request::RequestOpcode;
use dse_cql::frame::response::ResponseOpcode;
use thiserror::Error;

use crate::authentication::AuthError;

pub use dse_cql::frame::response::error::{DbError, WriteType};

/// Error that occurred while a single request was in flight.
///
/// Only [RequestError::BrokenConnection] and [RequestError::ConnectionClosed]
/// mean the connection is unusable; every other variant concerns this request alone.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Every stream id of the connection is taken by a pending request.
    /// The caller may retry later or pick another connection.
    #[error("No stream id available, all streams of the connection are in use")]
    StreamsExhausted,

    /// The connection was closed, either before the request was sent
    /// or while it was waiting for a response.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The connection broke while the request was pending.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// Failed to serialize the request.
    #[error("Failed to serialize request: {0}")]
    CqlRequestSerialization(#[from] CqlRequestSerializationError),

    /// The response was correctly framed, but its body could not be parsed.
    #[error("Failed to deserialize response: {0}")]
    ResponseParse(#[from] CqlResponseParseError),

    /// Server answered with a response that makes no sense for the request.
    #[error("Received unexpected response {response:?} to {request} request")]
    UnexpectedResponse {
        /// Opcode of the request.
        request: RequestOpcode,
        /// Opcode the server answered with.
        response: ResponseOpcode,
    },
}

impl RequestError {
    /// Whether the connection this error came from can still serve requests.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RequestError::BrokenConnection(_) | RequestError::ConnectionClosed
        )
    }
}

/// A fatal error that broke an established connection.
///
/// It is delivered to every pending request of the connection, so it must be cloneable.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BrokenConnectionError {
    /// Failed to read or delimit a frame. Stream correlation cannot be trusted afterwards.
    #[error("Failed to read frame: {0}")]
    FrameHeaderParseError(#[from] FrameHeaderParseError),

    /// Writing to the socket failed.
    #[error("Failed to write to the socket: {0}")]
    WriteError(Arc<std::io::Error>),

    /// Keepalive OPTIONS was not answered in time.
    #[error("Timed out while waiting for response to keepalive request on connection to node {0}")]
    KeepaliveTimeout(SocketAddr),

    /// Keepalive OPTIONS failed.
    #[error("Failed to execute keepalive request: {0}")]
    KeepaliveRequestError(Arc<RequestError>),
}

/// Error that occurred while opening a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Could not establish the TCP connection within `connect_timeout`.
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// Socket level failure.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// `init` was called on a connection that has already been initialized or closed.
    #[error("Connection cannot be initialized in state {0}")]
    InvalidState(&'static str),

    /// A request of the handshake failed.
    #[error("Failed to perform a connection setup request. Request: {request}, reason: {error}")]
    SetupRequest {
        /// Opcode of the failed request.
        request: RequestOpcode,
        /// Why it failed.
        error: RequestError,
    },

    /// The server demands authentication, but no authenticator is configured.
    #[error("Authentication is required by {0}, but no authenticator provider was configured")]
    MissingAuthentication(String),

    /// The authenticator rejected a server message or failed on its own.
    #[error("Authentication failed: {0}")]
    AuthError(AuthError),

    /// The initial keyspace could not be set.
    #[error(transparent)]
    UseKeyspace(#[from] UseKeyspaceError),

    /// The connection broke after the handshake.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(error: std::io::Error) -> ConnectionError {
        ConnectionError::IoError(Arc::new(error))
    }
}

/// Invalid keyspace name given to `Connection::set_keyspace()`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BadKeyspaceName {
    /// Keyspace name is empty
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character - only alphanumeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// Error occurring during `Connection::set_keyspace()`
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum UseKeyspaceError {
    /// Caller passed invalid keyspace name
    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// The USE request failed.
    #[error(transparent)]
    RequestError(#[from] RequestError),

    /// The server switched to some other keyspace than requested.
    #[error("Keyspace name mismatch; expected: {expected_keyspace_name_lowercase}, received: {result_keyspace_name_lowercase}")]
    KeyspaceNameMismatch {
        /// Keyspace the connection asked for.
        expected_keyspace_name_lowercase: String,
        /// Keyspace the server switched to.
        result_keyspace_name_lowercase: String,
    },
}

/// Error occurring during `Connection::fetch_schema_version()`
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum SchemaVersionError {
    /// The query for the schema version failed.
    #[error(transparent)]
    RequestError(#[from] RequestError),

    /// `system.local` returned no row, or the row had no schema version.
    #[error("system.local did not return a schema version")]
    MissingSchemaVersion,
}

/// Error raised while initializing a load balancing policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LoadBalancingPolicyError {
    /// The topology contains no hosts at all.
    #[error("Cannot initialize {policy}: cluster topology has no hosts")]
    NoHosts {
        /// Name of the policy.
        policy: String,
    },

    /// The configured local datacenter has no hosts in the topology.
    #[error("Local datacenter '{0}' has no hosts in the cluster topology")]
    UnknownLocalDatacenter(String),
}
