//! Stream id allocation and correlation of responses with pending requests.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::trace;

use crate::errors::RequestError;
use crate::response::QueryResponse;

pub(crate) type ResponseSender = oneshot::Sender<Result<QueryResponse, RequestError>>;

/// [StreamTable::acquire] could not hand out a stream id.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamAcquireError {
    /// Every stream id is taken.
    #[error("All stream ids are in use")]
    Busy,
    /// The table was drained and accepts no more requests.
    #[error("Stream table is closed")]
    Closed,
}

/// [StreamTable::register] refused a pending request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamRegisterError {
    /// Another request already waits on this stream id.
    #[error("Stream id {0} already has a pending request")]
    DuplicateStream(i16),
    /// The stream id was not handed out by [StreamTable::acquire].
    #[error("Stream id {0} was not acquired")]
    NotAcquired(i16),
    /// The table was drained and accepts no more requests.
    #[error("Stream table is closed")]
    Closed,
}

/// A request waiting for its response.
pub struct PendingRequest {
    stream_id: i16,
    request: Bytes,
    response_sender: ResponseSender,
}

impl PendingRequest {
    pub(crate) fn new(stream_id: i16, request: Bytes, response_sender: ResponseSender) -> Self {
        Self {
            stream_id,
            request,
            response_sender,
        }
    }

    /// Stream id the request was sent on.
    pub fn stream_id(&self) -> i16 {
        self.stream_id
    }

    /// The complete encoded frame, as written to the socket.
    pub fn request(&self) -> &Bytes {
        &self.request
    }

    fn complete(self, result: Result<QueryResponse, RequestError>) {
        // The receiver is gone if the caller stopped waiting.
        let _ = self.response_sender.send(result);
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("stream_id", &self.stream_id)
            .field("request_len", &self.request.len())
            .finish()
    }
}

/// Fixed-capacity table of in-flight requests, indexed by stream id.
///
/// A stream id is either free, acquired (reserved while the request is being
/// encoded) or pending (registered and waiting for a response). Free ids are
/// tracked in a bitmap and the lowest free id is always handed out first.
#[derive(Debug)]
pub struct StreamTable {
    used_bitmap: Box<[u64]>,
    slots: Box<[Option<PendingRequest>]>,
    capacity: usize,
    in_use: usize,
    closed: bool,
}

impl StreamTable {
    /// The largest capacity the protocol can address (v3 and newer).
    pub const MAX_CAPACITY: usize = i16::MAX as usize + 1;

    /// Creates a table handing out ids in `0..capacity`.
    /// The capacity is clamped to `1..=MAX_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Self::MAX_CAPACITY);
        Self {
            used_bitmap: vec![0; capacity.div_ceil(64)].into_boxed_slice(),
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            capacity,
            in_use: 0,
            closed: false,
        }
    }

    /// Number of stream ids the protocol version allows.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of acquired or pending stream ids.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Whether the table was drained; closed tables hand out no ids.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reserves the lowest free stream id.
    pub fn acquire(&mut self) -> Result<i16, StreamAcquireError> {
        if self.closed {
            return Err(StreamAcquireError::Closed);
        }
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones() as usize;
                let stream_id = block_id * 64 + off;
                if stream_id >= self.capacity {
                    break;
                }
                *block |= 1u64 << off;
                self.in_use += 1;
                return Ok(stream_id as i16);
            }
        }
        Err(StreamAcquireError::Busy)
    }

    /// Attaches a pending request to the acquired id it carries.
    pub fn register(&mut self, pending: PendingRequest) -> Result<(), StreamRegisterError> {
        if self.closed {
            return Err(StreamRegisterError::Closed);
        }
        let stream_id = pending.stream_id;
        if !self.is_acquired(stream_id) {
            return Err(StreamRegisterError::NotAcquired(stream_id));
        }
        let slot = &mut self.slots[stream_id as usize];
        if slot.is_some() {
            return Err(StreamRegisterError::DuplicateStream(stream_id));
        }
        *slot = Some(pending);
        Ok(())
    }

    /// Returns an acquired id that never got a pending request.
    /// Ids with a pending request are only freed by [Self::resolve] or [Self::drain_all].
    pub fn release(&mut self, stream_id: i16) -> bool {
        if !self.is_acquired(stream_id) || self.slots[stream_id as usize].is_some() {
            return false;
        }
        self.free(stream_id);
        true
    }

    /// Completes the request pending on `stream_id` and frees the id.
    ///
    /// Returns false if nothing is pending on that id, e.g. for a late
    /// or duplicated response. Such frames should be discarded.
    pub fn resolve(&mut self, stream_id: i16, result: Result<QueryResponse, RequestError>) -> bool {
        if stream_id < 0 || stream_id as usize >= self.capacity {
            return false;
        }
        let Some(pending) = self.slots[stream_id as usize].take() else {
            return false;
        };
        self.free(stream_id);
        trace!(
            stream_id,
            request_len = pending.request.len(),
            "Resolving pending request"
        );
        pending.complete(result);
        true
    }

    /// Fails every pending request with `error` and closes the table.
    /// Returns the number of requests that were failed.
    pub fn drain_all(&mut self, error: RequestError) -> usize {
        self.closed = true;
        let mut drained = 0;
        for pending in self.slots.iter_mut().filter_map(Option::take) {
            pending.complete(Err(error.clone()));
            drained += 1;
        }
        self.used_bitmap.fill(0);
        self.in_use = 0;
        drained
    }

    fn is_acquired(&self, stream_id: i16) -> bool {
        if stream_id < 0 || stream_id as usize >= self.capacity {
            return false;
        }
        let (block_id, off) = (stream_id as usize / 64, stream_id as usize % 64);
        self.used_bitmap[block_id] & (1u64 << off) != 0
    }

    fn free(&mut self, stream_id: i16) {
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1 << off);
        self.in_use -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::setup_tracing;
    use assert_matches::assert_matches;
    use dse_cql::frame::response::Response;

    fn pending(stream_id: i16) -> (PendingRequest, oneshot::Receiver<Result<QueryResponse, RequestError>>) {
        let (sender, receiver) = oneshot::channel();
        (
            PendingRequest::new(stream_id, Bytes::from_static(b"frame"), sender),
            receiver,
        )
    }

    #[test]
    fn acquires_lowest_free_id_up_to_capacity() {
        setup_tracing();
        let mut table = StreamTable::new(128);
        let ids: Vec<i16> = (0..128).map(|_| table.acquire().unwrap()).collect();
        assert_eq!(ids, (0..128).collect::<Vec<i16>>());
        assert_eq!(table.acquire(), Err(StreamAcquireError::Busy));

        assert!(table.release(70));
        assert!(!table.release(70));
        assert!(table.release(3));
        assert_eq!(table.acquire(), Ok(3));
        assert_eq!(table.acquire(), Ok(70));
        assert_eq!(table.in_use(), 128);
    }

    #[test]
    fn capacity_not_aligned_to_bitmap_blocks() {
        let mut table = StreamTable::new(100);
        for expected in 0..100 {
            assert_eq!(table.acquire(), Ok(expected));
        }
        assert_eq!(table.acquire(), Err(StreamAcquireError::Busy));
        assert_eq!(StreamTable::new(1 << 20).capacity(), StreamTable::MAX_CAPACITY);
    }

    #[tokio::test]
    async fn resolve_frees_id_and_completes_sink() {
        setup_tracing();
        let mut table = StreamTable::new(2);
        let id = table.acquire().unwrap();
        let (p, receiver) = pending(id);
        table.register(p).unwrap();

        // Pending ids cannot be released or handed out again.
        assert!(!table.release(id));
        assert_eq!(table.acquire(), Ok(1));
        assert_eq!(table.acquire(), Err(StreamAcquireError::Busy));

        assert!(table.resolve(id, Ok(QueryResponse::new(Response::Ready))));
        assert_matches!(receiver.await, Ok(Ok(QueryResponse { response: Response::Ready, .. })));
        assert_eq!(table.acquire(), Ok(id));

        // Late duplicate of the same response.
        assert!(!table.resolve(id, Ok(QueryResponse::new(Response::Ready))));
        assert!(!table.resolve(-1, Ok(QueryResponse::new(Response::Ready))));
        assert!(!table.resolve(500, Ok(QueryResponse::new(Response::Ready))));
    }

    #[test]
    fn register_checks_discipline() {
        let mut table = StreamTable::new(8);
        let (p, _r) = pending(5);
        assert_eq!(table.register(p), Err(StreamRegisterError::NotAcquired(5)));

        let id = table.acquire().unwrap();
        let (p1, _r1) = pending(id);
        let (p2, _r2) = pending(id);
        table.register(p1).unwrap();
        assert_eq!(table.register(p2), Err(StreamRegisterError::DuplicateStream(id)));
    }

    #[tokio::test]
    async fn drain_fails_everything_and_closes() {
        setup_tracing();
        let mut table = StreamTable::new(32);
        let mut receivers = Vec::new();
        for _ in 0..10 {
            let id = table.acquire().unwrap();
            let (p, r) = pending(id);
            table.register(p).unwrap();
            receivers.push(r);
        }
        let reserved = table.acquire().unwrap();

        assert_eq!(table.drain_all(RequestError::ConnectionClosed), 10);
        for r in receivers {
            assert_matches!(r.await, Ok(Err(RequestError::ConnectionClosed)));
        }
        assert!(table.is_closed());
        assert_eq!(table.in_use(), 0);
        assert_eq!(table.acquire(), Err(StreamAcquireError::Closed));
        let (p, _r) = pending(reserved);
        assert_eq!(table.register(p), Err(StreamRegisterError::Closed));
        assert_eq!(table.drain_all(RequestError::ConnectionClosed), 0);
    }
}
