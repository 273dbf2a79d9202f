use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dse_cql::frame::request::options::{
    COMPRESSION, CQL_VERSION, DEFAULT_CQL_VERSION, DEFAULT_DRIVER_NAME, DEFAULT_DRIVER_VERSION,
    DRIVER_NAME, DRIVER_VERSION,
};
use dse_cql::frame::response::error::Error;
use dse_cql::frame::response::event::Event;
use futures::future::RemoteHandle;
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::stream_table::{PendingRequest, StreamAcquireError, StreamTable};
use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, ConnectionError, RequestError, SchemaVersionError,
    UseKeyspaceError,
};
use crate::frame::request::{
    AuthResponse, Execute, Options, Prepare, Query, Register, RequestOpcode, SerializableRequest,
    Startup,
};
use crate::frame::response::{result, Response, ResponseOpcode, Supported};
use crate::frame::server_event_type::EventType;
use crate::frame::{Compression, FrameCodec, FrameParams, ProtocolVersion};
use crate::response::QueryResponse;
use crate::statement::{BoundStatement, PreparedStatement, Statement};

// Query used to fetch the schema version of the node the connection is open to.
const LOCAL_VERSION: &str = "SELECT schema_version FROM system.local WHERE key='local'";

// Events not yet received by a slow subscriber are dropped past this many.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Receives the error that broke an initialized connection, if it ever breaks.
pub type ErrorReceiver = oneshot::Receiver<ConnectionError>;

/// Configuration of a single connection.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Protocol version spoken on the connection. It is not negotiated down.
    pub protocol_version: ProtocolVersion,
    /// Compression to request. Falls back to none if the server does not support it.
    pub compression: Option<Compression>,
    /// Bodies shorter than this are sent uncompressed.
    pub compression_threshold: usize,
    /// Time allowed for the TCP connection to be established.
    pub connect_timeout: Duration,
    /// Sets `TCP_NODELAY` on the socket.
    pub tcp_nodelay: bool,
    /// Idle time before TCP keepalive probes start. `None` leaves the OS default.
    pub tcp_keepalive_interval: Option<Duration>,
    /// `SO_RCVBUF` of the socket. `None` leaves the OS default.
    pub recv_buffer_size: Option<usize>,
    /// Caps the number of concurrent requests below what the protocol version allows.
    pub max_streams: Option<usize>,
    /// Period of OPTIONS heartbeats. `None` disables them.
    pub keepalive_interval: Option<Duration>,
    /// A heartbeat not answered within this time breaks the connection.
    pub keepalive_timeout: Option<Duration>,
    /// Used when the server answers STARTUP with AUTHENTICATE.
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    /// Events to REGISTER for. No REGISTER is sent if empty.
    pub event_types: Vec<EventType>,
    /// Keyspace to `USE` right after the handshake.
    pub keyspace: Option<String>,
    /// Whether `keyspace` is quoted, keeping its case.
    pub keyspace_case_sensitive: bool,
    /// Sent as `DRIVER_NAME` in STARTUP.
    pub driver_name: String,
    /// Sent as `DRIVER_VERSION` in STARTUP.
    pub driver_version: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V4,
            compression: None,
            compression_threshold: 0,
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            recv_buffer_size: None,
            max_streams: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            authenticator: None,
            event_types: Vec::new(),
            keyspace: None,
            keyspace_case_sensitive: false,
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            driver_version: DEFAULT_DRIVER_VERSION.to_owned(),
        }
    }
}

impl ConnectionConfig {
    /// Sets the protocol version.
    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Sets the compression to request.
    pub fn with_compression(mut self, compression: Option<Compression>) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the minimum body size for compression.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the idle time before TCP keepalive probes.
    pub fn with_tcp_keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.tcp_keepalive_interval = interval;
        self
    }

    /// Sets the socket receive buffer size.
    pub fn with_recv_buffer_size(mut self, size: Option<usize>) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Caps the number of concurrent requests.
    pub fn with_max_streams(mut self, max_streams: usize) -> Self {
        self.max_streams = Some(max_streams);
        self
    }

    /// Sets heartbeat interval and timeout. `None` interval disables heartbeats.
    pub fn with_keepalive(mut self, interval: Option<Duration>, timeout: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_timeout = timeout;
        self
    }

    /// Sets the authenticator provider.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn AuthenticatorProvider>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Sets the events to register for.
    pub fn with_event_types(mut self, event_types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types = event_types.into_iter().collect();
        self
    }

    /// Sets the keyspace to use after the handshake.
    /// See [Connection::set_keyspace] for `case_sensitive`.
    pub fn with_keyspace(mut self, keyspace: impl Into<String>, case_sensitive: bool) -> Self {
        self.keyspace = Some(keyspace.into());
        self.keyspace_case_sensitive = case_sensitive;
        self
    }

    fn stream_capacity(&self) -> usize {
        let protocol_max = self.protocol_version.max_streams();
        self.max_streams
            .map_or(protocol_max, |max| max.clamp(1, protocol_max))
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("protocol_version", &self.protocol_version)
            .field("compression", &self.compression)
            .field("compression_threshold", &self.compression_threshold)
            .field("connect_timeout", &self.connect_timeout)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("tcp_keepalive_interval", &self.tcp_keepalive_interval)
            .field("recv_buffer_size", &self.recv_buffer_size)
            .field("max_streams", &self.max_streams)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("authenticator", &self.authenticator.is_some())
            .field("event_types", &self.event_types)
            .field("keyspace", &self.keyspace)
            .field("keyspace_case_sensitive", &self.keyspace_case_sensitive)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Created,
    Initializing,
    Ready,
    Closed,
}

impl ConnectionState {
    fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Created => "created",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The part of a connection shared with its router task.
#[derive(Debug)]
struct RouterHandle {
    submit_channel: mpsc::Sender<Bytes>,
    stream_table: Arc<StdMutex<StreamTable>>,
    codec: FrameCodec,
}

impl RouterHandle {
    fn send_request<R: SerializableRequest>(
        &self,
        request: &R,
        tracing: bool,
    ) -> Result<PendingResponse, RequestError> {
        let mut serialized = self.codec.serialize_request(request, tracing)?;
        let (response_sender, receiver) = oneshot::channel();

        let (stream_id, frame) = {
            let mut stream_table = lock(&self.stream_table);
            let stream_id = stream_table.acquire().map_err(|err| match err {
                StreamAcquireError::Busy => RequestError::StreamsExhausted,
                StreamAcquireError::Closed => RequestError::ConnectionClosed,
            })?;
            serialized.set_stream(stream_id);
            let frame = serialized.into_bytes();
            if let Err(err) =
                stream_table.register(PendingRequest::new(stream_id, frame.clone(), response_sender))
            {
                error!("Could not register request on stream {}: {}", stream_id, err);
                stream_table.release(stream_id);
                return Err(RequestError::ConnectionClosed);
            }
            (stream_id, frame)
        };

        // The queue holds at most one frame per stream id, so it is never full.
        if self.submit_channel.try_send(frame).is_err() {
            lock(&self.stream_table).resolve(stream_id, Err(RequestError::ConnectionClosed));
            return Err(RequestError::ConnectionClosed);
        }

        Ok(PendingResponse {
            stream_id,
            receiver,
        })
    }
}

/// Response to a request sent with [Connection::send].
///
/// Dropping it does not cancel the request; its stream id stays in use
/// until the server answers or the connection closes.
#[derive(Debug)]
pub struct PendingResponse {
    stream_id: i16,
    receiver: oneshot::Receiver<Result<QueryResponse, RequestError>>,
}

impl PendingResponse {
    /// Stream id the request was sent on.
    pub fn stream_id(&self) -> i16 {
        self.stream_id
    }
}

impl Future for PendingResponse {
    type Output = Result<QueryResponse, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(RequestError::ConnectionClosed)))
    }
}

/// A single connection to a node, multiplexing concurrent requests over one socket.
///
/// The connection is created closed. [Connection::init] opens the socket, starts
/// the router task and performs the handshake. Every request takes a stream id
/// for as long as it waits for its response, so at most
/// [ProtocolVersion::max_streams] requests may be in flight at once; more fail
/// with [RequestError::StreamsExhausted].
pub struct Connection {
    endpoint: SocketAddr,
    config: ConnectionConfig,
    codec: FrameCodec,
    state: StdMutex<ConnectionState>,
    stream_table: Arc<StdMutex<StreamTable>>,
    router_handle: OnceLock<Arc<RouterHandle>>,
    worker_handle: StdMutex<Option<RemoteHandle<()>>>,
    keyspace: ArcSwapOption<String>,
    // Serializes concurrent `set_keyspace` calls.
    keyspace_lock: tokio::sync::Mutex<()>,
    event_sender: broadcast::Sender<Arc<Event>>,
}

impl Connection {
    /// Creates a closed connection to `endpoint`. Nothing is sent until [Connection::init].
    pub fn new(endpoint: SocketAddr, config: ConnectionConfig) -> Self {
        let codec = FrameCodec::new(config.protocol_version)
            .with_compression_threshold(config.compression_threshold);
        let stream_table = StreamTable::new(config.stream_capacity());
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            endpoint,
            config,
            codec,
            state: StdMutex::new(ConnectionState::Created),
            stream_table: Arc::new(StdMutex::new(stream_table)),
            router_handle: OnceLock::new(),
            worker_handle: StdMutex::new(None),
            keyspace: ArcSwapOption::empty(),
            keyspace_lock: tokio::sync::Mutex::new(()),
            event_sender,
        }
    }

    /// Connects, starts the router and performs the handshake:
    /// OPTIONS, STARTUP, authentication if requested, REGISTER if any event
    /// types are configured, and `USE` of the configured keyspace.
    ///
    /// The returned receiver yields the error that breaks the connection later on.
    /// If the handshake fails, the connection is closed.
    pub async fn init(&self) -> Result<ErrorReceiver, ConnectionError> {
        {
            let mut state = lock(&self.state);
            if *state != ConnectionState::Created {
                return Err(ConnectionError::InvalidState(state.as_str()));
            }
            *state = ConnectionState::Initializing;
        }

        match self.open_and_handshake().await {
            Ok(error_receiver) => {
                let mut state = lock(&self.state);
                if *state == ConnectionState::Closed {
                    drop(state);
                    // Closed while the handshake ran; the router must go too.
                    self.close();
                    return Err(ConnectionError::InvalidState(ConnectionState::Closed.as_str()));
                }
                *state = ConnectionState::Ready;
                debug!(
                    "Connection to {} ready, protocol {}, compression {:?}",
                    self.endpoint,
                    self.codec.version(),
                    self.codec.compression()
                );
                Ok(error_receiver)
            }
            Err(err) => {
                debug!("Failed to initialize connection to {}: {}", self.endpoint, err);
                self.close();
                Err(err)
            }
        }
    }

    async fn open_and_handshake(&self) -> Result<ErrorReceiver, ConnectionError> {
        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.endpoint),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_) => return Err(ConnectionError::ConnectTimeout),
        };
        stream.set_nodelay(self.config.tcp_nodelay)?;
        if let Some(tcp_keepalive_interval) = self.config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }
        if let Some(recv_buffer_size) = self.config.recv_buffer_size {
            SockRef::from(&stream).set_recv_buffer_size(recv_buffer_size)?;
        }
        debug!("Connected to {}", self.endpoint);

        let capacity = lock(&self.stream_table).capacity();
        let (submit_channel, receiver) = mpsc::channel(capacity);
        let (error_sender, error_receiver) = oneshot::channel();
        let router_handle = Arc::new(RouterHandle {
            submit_channel,
            stream_table: self.stream_table.clone(),
            codec: self.codec.clone(),
        });

        let worker_handle = Self::run_router(
            stream,
            receiver,
            error_sender,
            router_handle.clone(),
            self.event_sender.clone(),
            self.config.keepalive_interval,
            self.config.keepalive_timeout,
            self.endpoint,
        );
        *lock(&self.worker_handle) = Some(worker_handle);
        // `init` runs at most once, so the handle is always unset here.
        let _ = self.router_handle.set(router_handle);

        self.handshake().await?;
        Ok(error_receiver)
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our interval is what socket2 calls "time": idleness before the first keepalive packet.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        #[cfg(any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        #[cfg(any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        SockRef::from(stream).set_tcp_keepalive(&tcp_keepalive)
    }

    async fn handshake(&self) -> Result<(), ConnectionError> {
        let setup_error =
            |request: RequestOpcode| move |error: RequestError| ConnectionError::SetupRequest {
                request,
                error,
            };
        let unexpected = |request: RequestOpcode, response: &Response| ConnectionError::SetupRequest {
            request,
            error: RequestError::UnexpectedResponse {
                request,
                response: response.opcode(),
            },
        };

        let supported = self
            .get_options()
            .await
            .map_err(setup_error(RequestOpcode::Options))?;

        let mut options: HashMap<Cow<'_, str>, Cow<'_, str>> = HashMap::new();
        options.insert(CQL_VERSION.into(), DEFAULT_CQL_VERSION.into());
        options.insert(DRIVER_NAME.into(), self.config.driver_name.as_str().into());
        options.insert(DRIVER_VERSION.into(), self.config.driver_version.as_str().into());
        if let Some(compression) = self.config.compression {
            if supported.supports_compression(compression) {
                options.insert(COMPRESSION.into(), compression.as_str().into());
                // STARTUP itself always goes out uncompressed.
                self.codec.set_compression(compression);
                debug!("Using {} compression on connection to {}", compression, self.endpoint);
            } else {
                warn!(
                    "Node {} does not support {} compression, falling back to no compression",
                    self.endpoint, compression
                );
            }
        }

        let response = self
            .request(&Startup { options }, false)
            .await
            .map_err(setup_error(RequestOpcode::Startup))?;
        match response.response {
            Response::Ready => {}
            Response::Authenticate(authenticate) => {
                self.perform_authenticate(&authenticate.authenticator_name)
                    .await?
            }
            other => return Err(unexpected(RequestOpcode::Startup, &other)),
        }

        if !self.config.event_types.is_empty() {
            let register = Register {
                event_types_to_register_for: self.config.event_types.clone(),
            };
            let response = self
                .request(&register, false)
                .await
                .map_err(setup_error(RequestOpcode::Register))?;
            if !matches!(response.response, Response::Ready) {
                return Err(unexpected(RequestOpcode::Register, &response.response));
            }
        }

        if let Some(keyspace) = &self.config.keyspace {
            self.set_keyspace(keyspace, self.config.keyspace_case_sensitive)
                .await?;
        }

        Ok(())
    }

    async fn perform_authenticate(&self, authenticator_name: &str) -> Result<(), ConnectionError> {
        let authenticator = self
            .config
            .authenticator
            .as_ref()
            .ok_or_else(|| ConnectionError::MissingAuthentication(authenticator_name.to_owned()))?;

        let (mut response, mut session) = authenticator
            .start_authentication_session(authenticator_name)
            .await
            .map_err(ConnectionError::AuthError)?;

        loop {
            let auth_response = self
                .request(&AuthResponse { response }, false)
                .await
                .map_err(|error| ConnectionError::SetupRequest {
                    request: RequestOpcode::AuthResponse,
                    error,
                })?;

            match auth_response.response {
                Response::AuthChallenge(challenge) => {
                    response = session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(ConnectionError::AuthError)?;
                }
                Response::AuthSuccess(success) => {
                    session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(ConnectionError::AuthError)?;
                    debug!("Authenticated to {} with {}", self.endpoint, authenticator_name);
                    return Ok(());
                }
                other => {
                    return Err(ConnectionError::SetupRequest {
                        request: RequestOpcode::AuthResponse,
                        error: RequestError::UnexpectedResponse {
                            request: RequestOpcode::AuthResponse,
                            response: other.opcode(),
                        },
                    })
                }
            }
        }
    }

    /// Sends `request` and returns a future of its response.
    ///
    /// Fails immediately with [RequestError::StreamsExhausted] if every stream
    /// id is in use, and with [RequestError::ConnectionClosed] if the connection
    /// is not open. An ERROR response resolves as [RequestError::DbError].
    pub fn send<R: SerializableRequest>(&self, request: &R) -> Result<PendingResponse, RequestError> {
        self.send_with_tracing(request, false)
    }

    fn send_with_tracing<R: SerializableRequest>(
        &self,
        request: &R,
        tracing: bool,
    ) -> Result<PendingResponse, RequestError> {
        self.router_handle
            .get()
            .ok_or(RequestError::ConnectionClosed)?
            .send_request(request, tracing)
    }

    async fn request<R: SerializableRequest>(
        &self,
        request: &R,
        tracing: bool,
    ) -> Result<QueryResponse, RequestError> {
        self.send_with_tracing(request, tracing)?.await
    }

    /// Executes an unprepared statement.
    pub async fn query(&self, statement: &Statement) -> Result<QueryResponse, RequestError> {
        let query = Query {
            contents: Cow::Borrowed(statement.contents.as_str()),
            parameters: statement.parameters(),
        };
        self.request(&query, statement.config.tracing).await
    }

    /// Prepares `statement` on the node this connection is open to.
    pub async fn prepare(&self, statement: &str) -> Result<PreparedStatement, RequestError> {
        let prepared = self
            .request(&Prepare { query: statement }, false)
            .await?
            .into_prepared()?;
        Ok(PreparedStatement::new(statement, prepared))
    }

    /// Executes a statement prepared on this node.
    pub async fn execute(&self, bound: &BoundStatement) -> Result<QueryResponse, RequestError> {
        let prepared = bound.prepared();
        let execute = Execute {
            id: prepared.get_id().clone(),
            parameters: bound.parameters(),
        };
        self.request(&execute, prepared.config.tracing).await
    }

    /// Asks the node which STARTUP options it supports.
    pub async fn get_options(&self) -> Result<Supported, RequestError> {
        let response = self.request(&Options, false).await?;
        match response.response {
            Response::Supported(supported) => Ok(supported),
            other => Err(RequestError::UnexpectedResponse {
                request: RequestOpcode::Options,
                response: other.opcode(),
            }),
        }
    }

    /// Reads the schema version the node currently agrees on.
    pub async fn fetch_schema_version(&self) -> Result<Uuid, SchemaVersionError> {
        let rows = self.query(&Statement::new(LOCAL_VERSION)).await?.into_rows()?;
        rows.column("schema_version")
            .and_then(|mut column| column.next().flatten())
            .and_then(|value| value.as_uuid())
            .ok_or(SchemaVersionError::MissingSchemaVersion)
    }

    /// Keyspace the connection currently uses, as reported by the server.
    pub fn keyspace(&self) -> Option<Arc<String>> {
        self.keyspace.load_full()
    }

    /// Switches the connection to `keyspace` with `USE`.
    ///
    /// Without `case_sensitive` the name behaves like an unquoted CQL identifier
    /// and is lowercased by the server; with it, the name is quoted and kept as is.
    /// Nothing is sent if the connection already uses that keyspace. The current
    /// keyspace only changes once the server confirms the switch.
    pub async fn set_keyspace(
        &self,
        keyspace: &str,
        case_sensitive: bool,
    ) -> Result<(), UseKeyspaceError> {
        let keyspace_name = VerifiedKeyspaceName::new(keyspace.to_owned(), case_sensitive)?;
        let _guard = self.keyspace_lock.lock().await;

        let unchanged = self
            .keyspace
            .load()
            .as_ref()
            .is_some_and(|current| **current == keyspace_name.effective_name());
        if unchanged {
            return Ok(());
        }

        let confirmed = self.use_keyspace(&keyspace_name).await?;
        debug!("Connection to {} now uses keyspace {}", self.endpoint, confirmed);
        self.keyspace.store(Some(Arc::new(confirmed)));
        Ok(())
    }

    async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<String, UseKeyspaceError> {
        // Keyspace names cannot be bound values, so the name goes into the text.
        let query: Statement = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()).into(),
            false => format!("USE {}", keyspace_name.as_str()).into(),
        };

        let response = self.query(&query).await?;
        Self::verify_use_keyspace_result(keyspace_name, response)
    }

    fn verify_use_keyspace_result(
        keyspace_name: &VerifiedKeyspaceName,
        query_response: QueryResponse,
    ) -> Result<String, UseKeyspaceError> {
        match query_response.into_result(RequestOpcode::Query)? {
            result::Result::SetKeyspace(set_keyspace) => {
                if !set_keyspace
                    .keyspace_name
                    .eq_ignore_ascii_case(keyspace_name.as_str())
                {
                    return Err(UseKeyspaceError::KeyspaceNameMismatch {
                        expected_keyspace_name_lowercase: keyspace_name.as_str().to_lowercase(),
                        result_keyspace_name_lowercase: set_keyspace.keyspace_name.to_lowercase(),
                    });
                }
                Ok(set_keyspace.keyspace_name)
            }
            _ => Err(UseKeyspaceError::RequestError(
                RequestError::UnexpectedResponse {
                    request: RequestOpcode::Query,
                    response: ResponseOpcode::Result,
                },
            )),
        }
    }

    /// Subscribes to events pushed by the server. Dropping the receiver unsubscribes.
    ///
    /// Only events REGISTERed for with [ConnectionConfig::event_types] are sent
    /// by the server. A subscriber that falls more than 1024 events behind
    /// loses the oldest ones and is told how many it missed.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Arc<Event>> {
        self.event_sender.subscribe()
    }

    /// Closes the connection. Every pending request fails with
    /// [RequestError::ConnectionClosed]. Closing twice is a no-op.
    pub fn close(&self) {
        let already_closed = {
            let mut state = lock(&self.state);
            std::mem::replace(&mut *state, ConnectionState::Closed) == ConnectionState::Closed
        };

        // Dropping the handle aborts the router, which owns and closes the socket.
        // `init` may store the handle after an earlier `close`, so take it every time.
        let worker_handle = lock(&self.worker_handle).take();
        drop(worker_handle);
        if already_closed {
            return;
        }

        let failed = lock(&self.stream_table).drain_all(RequestError::ConnectionClosed);
        debug!(
            "Closed connection to {}, {} pending requests failed",
            self.endpoint, failed
        );
    }

    /// Whether the connection cannot accept requests: before `init`,
    /// after `close`, or after a fatal error.
    pub fn is_closed(&self) -> bool {
        let state = *lock(&self.state);
        matches!(state, ConnectionState::Created | ConnectionState::Closed)
            || lock(&self.stream_table).is_closed()
    }

    /// Number of requests currently waiting for a response.
    pub fn in_flight(&self) -> usize {
        lock(&self.stream_table).in_use()
    }

    /// Address of the node.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Protocol version of the connection.
    pub fn version(&self) -> ProtocolVersion {
        self.codec.version()
    }

    /// Compression negotiated during the handshake.
    pub fn compression(&self) -> Option<Compression> {
        self.codec.compression()
    }

    #[expect(clippy::too_many_arguments)]
    fn run_router(
        stream: TcpStream,
        receiver: mpsc::Receiver<Bytes>,
        error_sender: oneshot::Sender<ConnectionError>,
        router_handle: Arc<RouterHandle>,
        event_sender: broadcast::Sender<Arc<Event>>,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
        endpoint: SocketAddr,
    ) -> RemoteHandle<()> {
        let (task, handle) = Self::router(
            stream,
            receiver,
            error_sender,
            router_handle,
            event_sender,
            keepalive_interval,
            keepalive_timeout,
            endpoint,
        )
        .remote_handle();
        tokio::task::spawn(task);
        handle
    }

    #[expect(clippy::too_many_arguments)]
    async fn router(
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Bytes>,
        error_sender: oneshot::Sender<ConnectionError>,
        router_handle: Arc<RouterHandle>,
        event_sender: broadcast::Sender<Arc<Event>>,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
        endpoint: SocketAddr,
    ) {
        let (read_half, write_half) = split(stream);

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &router_handle.codec,
            &router_handle.stream_table,
            &event_sender,
        );
        let w = Self::writer(BufWriter::with_capacity(8192, write_half), receiver);
        let k = Self::keepaliver(&router_handle, keepalive_interval, keepalive_timeout, endpoint);

        let result = futures::try_join!(r, w, k);

        let error: BrokenConnectionError = match result {
            Ok(_) => return,
            Err(err) => err,
        };

        let failed = lock(&router_handle.stream_table)
            .drain_all(RequestError::BrokenConnection(error.clone()));
        error!(
            "Connection to {} broke, {} pending requests failed: {}",
            endpoint, failed, error
        );

        // If someone is listening for connection errors notify them
        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        codec: &FrameCodec,
        stream_table: &StdMutex<StreamTable>,
        event_sender: &broadcast::Sender<Arc<Event>>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = codec.read_frame(&mut read_half).await?;

            match params.stream.cmp(&-1) {
                Ordering::Less => {
                    // Only stream -1 carries events, other negative ids are not in use.
                    trace!("Ignoring frame on stream {}", params.stream);
                    continue;
                }
                Ordering::Equal => {
                    Self::handle_event(codec, params, opcode, body, event_sender);
                    continue;
                }
                Ordering::Greater => {}
            }

            let response = Self::parse_response(codec, params, opcode, body);
            if !lock(stream_table).resolve(params.stream, response) {
                debug!(
                    "Received response with unexpected stream id {}, discarding it",
                    params.stream
                );
            }
        }
    }

    fn parse_response(
        codec: &FrameCodec,
        params: FrameParams,
        opcode: ResponseOpcode,
        body: Bytes,
    ) -> Result<QueryResponse, RequestError> {
        let (response, extensions) = codec.parse_response(params, opcode, body)?;
        for warning in &extensions.warnings {
            warn!(
                warning = warning.as_str(),
                "Response from the database contains a warning",
            );
        }
        match response {
            Response::Error(Error { error, reason }) => Err(RequestError::DbError(error, reason)),
            response => Ok(QueryResponse::with_extensions(response, extensions)),
        }
    }

    fn handle_event(
        codec: &FrameCodec,
        params: FrameParams,
        opcode: ResponseOpcode,
        body: Bytes,
        event_sender: &broadcast::Sender<Arc<Event>>,
    ) {
        match codec.parse_response(params, opcode, body) {
            Ok((Response::Event(event), _)) => {
                trace!("Received event {:?}", event);
                // No subscribers is not an error.
                let _ = event_sender.send(Arc::new(event));
            }
            Ok((other, _)) => {
                warn!("Expected an EVENT on stream -1, got {:?}; ignoring it", other.opcode());
            }
            Err(err) => {
                warn!("Failed to parse event, ignoring it: {}", err);
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        mut frame_receiver: mpsc::Receiver<Bytes>,
    ) -> Result<(), BrokenConnectionError> {
        let write_error = |err| BrokenConnectionError::WriteError(Arc::new(err));

        while let Some(mut frame) = frame_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            loop {
                total_sent += frame.len();
                num_requests += 1;
                write_half.write_all(&frame).await.map_err(write_error)?;
                frame = match frame_receiver.try_recv() {
                    Ok(next) => next,
                    Err(_) => break,
                };
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half.flush().await.map_err(write_error)?;
        }

        Ok(())
    }

    async fn keepaliver(
        router_handle: &RouterHandle,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
        endpoint: SocketAddr,
    ) -> Result<(), BrokenConnectionError> {
        let Some(keepalive_interval) = keepalive_interval else {
            return Ok(());
        };

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await; // The first tick completes immediately.

        // Default behaviour (Burst) is not suitable for sending keepalives.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let pending = match router_handle.send_request(&Options, false) {
                Ok(pending) => pending,
                Err(RequestError::StreamsExhausted) => {
                    // A connection this busy is evidently alive.
                    trace!("Skipping keepalive to {}, all streams are in use", endpoint);
                    continue;
                }
                Err(err) => {
                    return Err(BrokenConnectionError::KeepaliveRequestError(Arc::new(err)))
                }
            };

            let result = match keepalive_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, pending).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            "Timed out while waiting for response to keepalive request on connection to node {}",
                            endpoint
                        );
                        return Err(BrokenConnectionError::KeepaliveTimeout(endpoint));
                    }
                },
                None => pending.await,
            };

            if let Err(err) = result {
                warn!(
                    "Failed to execute keepalive request on connection to node {} - {}",
                    endpoint, err
                );
                return Err(BrokenConnectionError::KeepaliveRequestError(Arc::new(err)));
            }
            trace!("Keepalive request successful on connection to node {}", endpoint);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("state", &*lock(&self.state))
            .field("keyspace", &self.keyspace.load_full())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// This type can only hold a valid keyspace name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(keyspace_name: String, case_sensitive: bool) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    /// The name the server resolves this one to.
    pub(crate) fn effective_name(&self) -> Cow<'_, str> {
        match self.is_case_sensitive {
            true => Cow::Borrowed(self.as_str()),
            false => Cow::Owned(self.as_str().to_lowercase()),
        }
    }

    // Up to 48 characters, letters, digits and underscores.
    // Cassandra accepts an underscore as the first character, so we do too.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        let keyspace_name_len: usize = keyspace_name.chars().count();
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        if let Some(character) = keyspace_name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(BadKeyspaceName::IllegalCharacter(
                keyspace_name.to_string(),
                character,
            ));
        }

        Ok(())
    }
}
