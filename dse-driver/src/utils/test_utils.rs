//! An in-process node answering enough of the native protocol to drive a
//! [Connection](crate::Connection) through its handshake and queries.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes};
use dse_cql::frame::types;
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

pub(crate) const PASSWORD_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";
pub(crate) const SCHEMA_VERSION: Uuid = Uuid::from_u128(0x6a3b_8c4e_1f2d_4e5a_9b7c_0d1e_2f3a_4b5c);
pub(crate) const PREPARED_ID: &[u8] = b"mock-prepared-id";

// Queries with a scripted answer.
pub(crate) const KEYSPACES_QUERY: &str = "SELECT * FROM system.schema_keyspaces";
pub(crate) const FAILING_QUERY: &str = "SELECT WILL FAIL";
pub(crate) const WARNING_QUERY: &str = "SELECT WITH WARNING";
// Requires a current keyspace, like any unqualified table name.
pub(crate) const UNQUALIFIED_QUERY: &str = "SELECT * FROM peers";
// Queries starting with this are answered only by `MockNode::release_held_queries`.
pub(crate) const HELD_QUERY_PREFIX: &str = "HOLD";
pub(crate) const WARNING: &str = "Aggregation query used without partition key";

const LOCAL_VERSION: &str = "SELECT schema_version FROM system.local WHERE key='local'";

const FLAG_COMPRESSION: u8 = 0x01;
const FLAG_TRACING: u8 = 0x02;
const FLAG_WARNING: u8 = 0x08;

mod opcode {
    pub(super) const ERROR: u8 = 0x00;
    pub(super) const STARTUP: u8 = 0x01;
    pub(super) const READY: u8 = 0x02;
    pub(super) const AUTHENTICATE: u8 = 0x03;
    pub(super) const OPTIONS: u8 = 0x05;
    pub(super) const SUPPORTED: u8 = 0x06;
    pub(super) const QUERY: u8 = 0x07;
    pub(super) const RESULT: u8 = 0x08;
    pub(super) const PREPARE: u8 = 0x09;
    pub(super) const EXECUTE: u8 = 0x0A;
    pub(super) const REGISTER: u8 = 0x0B;
    pub(super) const EVENT: u8 = 0x0C;
    pub(super) const AUTH_RESPONSE: u8 = 0x0F;
    pub(super) const AUTH_SUCCESS: u8 = 0x10;
}

#[derive(Debug, Clone)]
pub(crate) struct MockNodeConfig {
    /// Compression algorithms listed in SUPPORTED.
    pub(crate) compression: Vec<&'static str>,
    /// Username and password demanded after STARTUP.
    pub(crate) credentials: Option<(String, String)>,
}

impl Default for MockNodeConfig {
    fn default() -> Self {
        Self {
            compression: vec!["lz4"],
            credentials: None,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    silent: AtomicBool,
    startup_options: Mutex<HashMap<String, String>>,
    queries: Mutex<Vec<String>>,
    connections: AtomicUsize,
    disconnections: AtomicUsize,
}

/// Instructions to every open connection of the node.
#[derive(Debug, Clone)]
enum Control {
    /// EVENT body to push on stream -1.
    Event(Bytes),
    /// Answer held queries, the latest first.
    ReleaseHeld,
    /// Send a void RESULT on a stream no request uses.
    AnswerStream(i16),
    /// Write these bytes as they are.
    Raw(Bytes),
}

/// A node listening on an ephemeral local port. Stops accepting when dropped.
pub(crate) struct MockNode {
    addr: SocketAddr,
    state: Arc<MockState>,
    controls: broadcast::Sender<Control>,
    _acceptor: RemoteHandle<()>,
}

impl MockNode {
    pub(crate) async fn start(config: MockNodeConfig) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());
        let (controls, _) = broadcast::channel(64);

        let acceptor = {
            let state = state.clone();
            let controls = controls.clone();
            async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    state.connections.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(serve_connection(
                        socket,
                        config.clone(),
                        state.clone(),
                        controls.subscribe(),
                    ));
                }
            }
        };
        let (task, handle) = acceptor.remote_handle();
        tokio::spawn(task);

        MockNode {
            addr,
            state,
            controls,
            _acceptor: handle,
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops answering requests on every connection, the sockets stay open.
    pub(crate) fn go_silent(&self) {
        self.state.silent.store(true, Ordering::Relaxed);
    }

    pub(crate) fn startup_options(&self) -> HashMap<String, String> {
        self.state.startup_options.lock().unwrap().clone()
    }

    /// Texts of QUERY requests received so far.
    pub(crate) fn queries(&self) -> Vec<String> {
        self.state.queries.lock().unwrap().clone()
    }

    pub(crate) fn connections(&self) -> usize {
        self.state.connections.load(Ordering::Relaxed)
    }

    /// Connections whose client side went away.
    pub(crate) fn disconnections(&self) -> usize {
        self.state.disconnections.load(Ordering::Relaxed)
    }

    /// Pushes a raw EVENT body on stream -1 of every open connection.
    pub(crate) fn push_event(&self, body: Vec<u8>) {
        let _ = self.controls.send(Control::Event(Bytes::from(body)));
    }

    /// Answers every held query in reverse order of arrival. Each answer is a
    /// single `query` text cell holding the text of the query it answers.
    pub(crate) fn release_held_queries(&self) {
        let _ = self.controls.send(Control::ReleaseHeld);
    }

    /// Sends a void RESULT on `stream`, which the client is not waiting on.
    pub(crate) fn answer_unused_stream(&self, stream: i16) {
        let _ = self.controls.send(Control::AnswerStream(stream));
    }

    /// Writes `bytes` to every open connection, bypassing any framing.
    pub(crate) fn send_raw(&self, bytes: &[u8]) {
        let _ = self.controls.send(Control::Raw(Bytes::copy_from_slice(bytes)));
    }

    pub(crate) fn push_status_change(&self, change: &str, addr: SocketAddr) {
        let mut body = Vec::new();
        types::write_string("STATUS_CHANGE", &mut body).unwrap();
        types::write_string(change, &mut body).unwrap();
        types::write_inet(addr, &mut body);
        self.push_event(body);
    }
}

pub(crate) fn frame(version: u8, flags: u8, stream: i16, opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(9 + body.len());
    frame.put_u8(0x80 | version);
    frame.put_u8(flags);
    if version >= 3 {
        frame.put_i16(stream);
    } else {
        frame.put_i8(stream as i8);
    }
    frame.put_u8(opcode);
    frame.put_i32(body.len() as i32);
    frame.extend_from_slice(body);
    frame
}

fn lz4_compress(body: &[u8]) -> Vec<u8> {
    let mut compressed = Vec::new();
    compressed.put_u32(body.len() as u32);
    compressed.extend_from_slice(&lz4_flex::compress(body));
    compressed
}

fn lz4_decompress(body: &[u8]) -> Vec<u8> {
    let len = u32::from_be_bytes(body[..4].try_into().unwrap()) as usize;
    lz4_flex::decompress(&body[4..], len).unwrap()
}

pub(crate) fn error_body(code: i32, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(code, &mut body);
    types::write_string(message, &mut body).unwrap();
    body
}

fn void_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0001, &mut body);
    body
}

fn set_keyspace_body(keyspace: &str) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0003, &mut body);
    types::write_string(keyspace, &mut body).unwrap();
    body
}

fn rows_body(table: (&str, &str), columns: &[(&str, u16)], rows: &[Vec<&[u8]>]) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0002, &mut body);
    // Global table spec.
    types::write_int(0x0001, &mut body);
    types::write_int(columns.len() as i32, &mut body);
    types::write_string(table.0, &mut body).unwrap();
    types::write_string(table.1, &mut body).unwrap();
    for (name, typ) in columns {
        types::write_string(name, &mut body).unwrap();
        types::write_short(*typ, &mut body);
    }
    types::write_int(rows.len() as i32, &mut body);
    for row in rows {
        for cell in row {
            types::write_bytes(cell, &mut body).unwrap();
        }
    }
    body
}

// `INSERT INTO ks.t (pk, v) VALUES (?, ?)`, `pk` being the partition key.
fn prepared_body(version: u8) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0004, &mut body);
    types::write_short_bytes(PREPARED_ID, &mut body).unwrap();

    types::write_int(0x0001, &mut body);
    types::write_int(2, &mut body);
    if version >= 4 {
        types::write_int(1, &mut body);
        types::write_short(0, &mut body);
    }
    types::write_string("ks", &mut body).unwrap();
    types::write_string("t", &mut body).unwrap();
    types::write_string("pk", &mut body).unwrap();
    types::write_short(0x0009, &mut body);
    types::write_string("v", &mut body).unwrap();
    types::write_short(0x000D, &mut body);

    if version >= 3 {
        // No result metadata.
        types::write_int(0x0004, &mut body);
        types::write_int(0, &mut body);
    }
    body
}

fn held_answer_body(query: &str) -> Vec<u8> {
    rows_body(("ks", "held"), &[("query", 0x000D)], &[vec![query.as_bytes()]])
}

struct ConnectionScript {
    config: MockNodeConfig,
    state: Arc<MockState>,
    keyspace: Option<String>,
    lz4: bool,
    /// Streams and texts of queries not answered yet.
    held: Vec<(i16, String)>,
}

impl ConnectionScript {
    /// Returns the opcode and body of the answer, `None` for no answer.
    fn answer(
        &mut self,
        version: u8,
        stream: i16,
        opcode: u8,
        body: &[u8],
    ) -> Option<(u8, Vec<u8>)> {
        let buf = &mut &*body;
        match opcode {
            opcode::OPTIONS => {
                let mut supported = HashMap::new();
                supported.insert(
                    "COMPRESSION".to_owned(),
                    self.config.compression.iter().map(|c| c.to_string()).collect(),
                );
                supported.insert("CQL_VERSION".to_owned(), vec!["3.4.5".to_owned()]);
                let mut body = Vec::new();
                types::write_string_multimap(&supported, &mut body).unwrap();
                Some((opcode::SUPPORTED, body))
            }
            opcode::STARTUP => {
                let options = types::read_string_map(buf).unwrap();
                self.lz4 = options.get("COMPRESSION").map(String::as_str) == Some("lz4");
                *self.state.startup_options.lock().unwrap() = options;
                match self.config.credentials {
                    Some(_) => {
                        let mut body = Vec::new();
                        types::write_string(PASSWORD_AUTHENTICATOR, &mut body).unwrap();
                        Some((opcode::AUTHENTICATE, body))
                    }
                    None => Some((opcode::READY, Vec::new())),
                }
            }
            opcode::AUTH_RESPONSE => {
                let token = types::read_bytes(buf).unwrap();
                let (username, password) = self.config.credentials.clone().unwrap_or_default();
                let expected = format!("\0{}\0{}", username, password);
                if token == expected.as_bytes() {
                    let mut body = Vec::new();
                    types::write_int(-1, &mut body);
                    Some((opcode::AUTH_SUCCESS, body))
                } else {
                    Some((
                        opcode::ERROR,
                        error_body(0x0100, "Provided username and/or password are incorrect"),
                    ))
                }
            }
            opcode::REGISTER => Some((opcode::READY, Vec::new())),
            opcode::QUERY => {
                let query = types::read_long_string(buf).unwrap().to_owned();
                self.state.queries.lock().unwrap().push(query.clone());
                if query.starts_with(HELD_QUERY_PREFIX) {
                    self.held.push((stream, query));
                    return None;
                }
                self.answer_query(&query)
            }
            opcode::PREPARE => Some((opcode::RESULT, prepared_body(version))),
            opcode::EXECUTE => {
                let id = types::read_short_bytes(buf).unwrap();
                if id == PREPARED_ID {
                    Some((opcode::RESULT, void_body()))
                } else {
                    // Unprepared.
                    let mut body = error_body(0x2500, "Prepared query with ID not found");
                    types::write_short_bytes(id, &mut body).unwrap();
                    Some((opcode::ERROR, body))
                }
            }
            _ => Some((opcode::ERROR, error_body(0x000A, "Unsupported opcode"))),
        }
    }

    fn answer_query(&mut self, query: &str) -> Option<(u8, Vec<u8>)> {
        if let Some(keyspace) = query.strip_prefix("USE ") {
            let keyspace = match keyspace.strip_prefix('"') {
                Some(quoted) => quoted.trim_end_matches('"').to_owned(),
                None => keyspace.to_lowercase(),
            };
            self.keyspace = Some(keyspace.clone());
            return Some((opcode::RESULT, set_keyspace_body(&keyspace)));
        }

        let body = match query {
            KEYSPACES_QUERY => rows_body(
                ("system", "schema_keyspaces"),
                &[("keyspace_name", 0x000D)],
                &[vec![&b"system"[..]], vec![&b"ks"[..]]],
            ),
            LOCAL_VERSION => rows_body(
                ("system", "local"),
                &[("schema_version", 0x000C)],
                &[vec![&SCHEMA_VERSION.as_bytes()[..]]],
            ),
            FAILING_QUERY => {
                return Some((
                    opcode::ERROR,
                    error_body(0x2000, "line 1:7 no viable alternative at input 'WILL'"),
                ))
            }
            UNQUALIFIED_QUERY if self.keyspace.is_none() => {
                return Some((
                    opcode::ERROR,
                    error_body(0x2200, "No keyspace has been specified"),
                ))
            }
            _ => void_body(),
        };
        Some((opcode::RESULT, body))
    }
}

/// A request as read off the socket, body already decompressed.
struct Request {
    version: u8,
    flags: u8,
    stream: i16,
    opcode: u8,
    body: Vec<u8>,
}

async fn read_request(read_half: &mut OwnedReadHalf) -> Option<Request> {
    let mut first = [0u8; 1];
    read_half.read_exact(&mut first).await.ok()?;
    let version = first[0] & 0x7F;

    let mut header = vec![0u8; if version >= 3 { 8 } else { 7 }];
    read_half.read_exact(&mut header).await.ok()?;
    let flags = header[0];
    let (stream, opcode, length) = if version >= 3 {
        (
            i16::from_be_bytes([header[1], header[2]]),
            header[3],
            i32::from_be_bytes(header[4..8].try_into().unwrap()),
        )
    } else {
        (
            header[1] as i8 as i16,
            header[2],
            i32::from_be_bytes(header[3..7].try_into().unwrap()),
        )
    };
    let mut body = vec![0u8; length as usize];
    read_half.read_exact(&mut body).await.ok()?;
    if flags & FLAG_COMPRESSION != 0 {
        body = lz4_decompress(&body);
    }
    Some(Request {
        version,
        flags,
        stream,
        opcode,
        body,
    })
}

/// Frames a response, compressing RESULT bodies once lz4 is in use.
fn response_frame(
    version: u8,
    lz4: bool,
    mut flags: u8,
    stream: i16,
    response_opcode: u8,
    mut envelope: Vec<u8>,
) -> Vec<u8> {
    if lz4 && response_opcode == opcode::RESULT {
        flags |= FLAG_COMPRESSION;
        envelope = lz4_compress(&envelope);
    }
    frame(version, flags, stream, response_opcode, &envelope)
}

async fn serve_connection(
    socket: TcpStream,
    config: MockNodeConfig,
    state: Arc<MockState>,
    mut controls: broadcast::Receiver<Control>,
) {
    let (mut read_half, mut write_half) = socket.into_split();
    let (frame_sender, mut frame_receiver) = mpsc::unbounded_channel::<Vec<u8>>();
    let (request_sender, mut requests) = mpsc::unbounded_channel::<Request>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_receiver.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });
    let reader = {
        let state = state.clone();
        tokio::spawn(async move {
            while let Some(request) = read_request(&mut read_half).await {
                if request_sender.send(request).is_err() {
                    return;
                }
            }
            state.disconnections.fetch_add(1, Ordering::Relaxed);
        })
    };

    let mut script = ConnectionScript {
        config,
        state: state.clone(),
        keyspace: None,
        lz4: false,
        held: Vec::new(),
    };
    // Version of the last request; events and injected frames use it too.
    let mut version = 4;

    loop {
        tokio::select! {
            // Controls sent before a request was written must be handled first.
            biased;
            control = controls.recv() => {
                let control = match control {
                    Ok(control) => control,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                match control {
                    Control::Event(body) => {
                        let _ = frame_sender.send(frame(version, 0, -1, opcode::EVENT, &body));
                    }
                    Control::ReleaseHeld => {
                        for (stream, query) in script.held.drain(..).rev() {
                            let _ = frame_sender.send(response_frame(
                                version,
                                script.lz4,
                                0,
                                stream,
                                opcode::RESULT,
                                held_answer_body(&query),
                            ));
                        }
                    }
                    Control::AnswerStream(stream) => {
                        let _ = frame_sender.send(response_frame(
                            version,
                            script.lz4,
                            0,
                            stream,
                            opcode::RESULT,
                            void_body(),
                        ));
                    }
                    Control::Raw(bytes) => {
                        let _ = frame_sender.send(bytes.to_vec());
                    }
                }
            }
            request = requests.recv() => {
                let Some(request) = request else {
                    break;
                };
                version = request.version;
                if state.silent.load(Ordering::Relaxed) {
                    continue;
                }

                let Some((response_opcode, response_body)) = script.answer(
                    request.version,
                    request.stream,
                    request.opcode,
                    &request.body,
                ) else {
                    continue;
                };

                let mut response_flags = 0;
                let mut envelope = Vec::new();
                if request.flags & FLAG_TRACING != 0 {
                    response_flags |= FLAG_TRACING;
                    let trace_id = Uuid::from_u128(u128::from(request.stream as u16));
                    types::write_uuid(&trace_id, &mut envelope);
                }
                if request.opcode == opcode::QUERY
                    && response_opcode == opcode::RESULT
                    && request.version >= 4
                    && types::read_long_string(&mut &*request.body).ok() == Some(WARNING_QUERY)
                {
                    response_flags |= FLAG_WARNING;
                    types::write_string_list(&[WARNING][..], &mut envelope).unwrap();
                }
                envelope.extend_from_slice(&response_body);

                let _ = frame_sender.send(response_frame(
                    request.version,
                    script.lz4,
                    response_flags,
                    request.stream,
                    response_opcode,
                    envelope,
                ));
            }
        }
    }

    reader.abort();
    drop(frame_sender);
    let _ = writer.await;
}
