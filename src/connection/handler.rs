//! Connection Handler Module
//!
//! This module handles individual client connections to the slave.
//! Each client gets its own handler task that runs one transaction at a
//! time: read a request frame, process it, write the response, repeat.
//!
//! ## Transaction Cycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Main Loop               │
//!    │                              │
//!    │  ┌─────────────────────────┐ │
//!    │  │ AwaitingHeader          │ │  read 6 bytes, 0 bytes = peer closed
//!    │  └───────────┬─────────────┘ │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ AwaitingPayload         │ │  read exactly `length` bytes
//!    │  └───────────┬─────────────┘ │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Processing              │ │  decode → apply → encode (sync)
//!    │  └───────────┬─────────────┘ │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ AwaitingWriteCompletion │ │  write + flush the response
//!    │  └───────────┬─────────────┘ │
//!    │              ▼               │
//!    │         [Loop back]          │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. Peer closes / I/O error / dispose
//!        │
//!        ▼
//! 5. Closed: close notification, handler task ends
//! ```
//!
//! Exactly one read or write is outstanding at any time, and two
//! transactions never overlap on the same connection.
//!
//! ## Failure Classification
//!
//! [`ConnectionHandler::run`] is the single place where the end of a
//! connection is classified:
//!
//! - zero-length header read: orderly close, notification, `Ok(())`
//! - `ConnectionReset`: the peer went away, notification, `Ok(())`
//! - any other I/O error: notification, then `Err`
//! - codec, processor and framing errors: logged and returned as `Err`
//!   without a notification

use crate::connection::registry::ConnectionRegistry;
use crate::processor::{ProcessorError, RequestProcessor};
use crate::protocol::header::MODBUS_PROTOCOL_ID;
use crate::protocol::{CodecError, FrameCodec, MbapHeader, MAX_PAYLOAD_LEN, MBAP_HEADER_LEN};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace, warn};

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total transactions answered
    pub transactions_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn transaction_processed(&self) {
        self.transactions_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Raised once when a connection ends by orderly close, I/O failure or
/// disposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClosed {
    /// Remote endpoint of the closed connection
    pub endpoint: String,
}

/// Where a connection is in its transaction cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHeader,
    AwaitingPayload,
    Processing,
    AwaitingWriteCompletion,
    Closed,
}

/// Tears down a running handler from outside its task.
///
/// Disposing is safe at any time, including before the handler starts or
/// while a read or write is pending: the pending I/O is abandoned and the
/// handler closes as if the peer had gone away.
#[derive(Debug, Clone, Default)]
pub struct DisposeHandle {
    notify: Arc<Notify>,
}

impl DisposeHandle {
    pub fn dispose(&self) {
        // notify_one keeps a permit when nobody is waiting yet
        self.notify.notify_one();
    }
}

/// How the transaction loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    PeerClosed,
    Disposed,
}

/// Handles a single client connection.
///
/// This struct owns the stream for one connected client and drives the
/// header → payload → process → write cycle on it.
pub struct ConnectionHandler<S> {
    /// The client stream; writes are buffered and flushed per response
    stream: BufWriter<S>,

    /// Remote endpoint (for logging and the close notification)
    endpoint: String,

    /// The request processor (shared across connections)
    processor: Arc<dyn RequestProcessor>,

    /// Payload decoder and response encoder (shared across connections)
    codec: Arc<dyn FrameCodec>,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,

    /// Close observer, taken on first use
    closed_tx: Option<mpsc::UnboundedSender<ConnectionClosed>>,

    dispose: DisposeHandle,

    state: ConnectionState,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new connection handler.
    ///
    /// Nothing is read from the stream until [`run`](Self::run) is awaited.
    ///
    /// # Arguments
    ///
    /// * `stream` - The client stream for this connection
    /// * `endpoint` - The client's address, used to identify the connection
    /// * `processor` - Applies decoded requests
    /// * `codec` - Decodes payloads and encodes responses
    /// * `stats` - Shared connection statistics
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidArgument`] if `endpoint` is empty.
    pub fn new(
        stream: S,
        endpoint: impl Into<String>,
        processor: Arc<dyn RequestProcessor>,
        codec: Arc<dyn FrameCodec>,
        stats: Arc<ConnectionStats>,
    ) -> Result<Self, ConnectionError> {
        let endpoint = endpoint.into();
        if endpoint.is_empty() {
            return Err(ConnectionError::InvalidArgument(
                "endpoint identifier must not be empty",
            ));
        }

        Ok(Self {
            stream: BufWriter::new(stream),
            endpoint,
            processor,
            codec,
            stats,
            closed_tx: None,
            dispose: DisposeHandle::default(),
            state: ConnectionState::AwaitingHeader,
        })
    }

    /// Registers the observer that receives the close notification.
    pub fn with_close_listener(mut self, listener: mpsc::UnboundedSender<ConnectionClosed>) -> Self {
        self.closed_tx = Some(listener);
        self
    }

    /// Returns a handle that can dispose this connection from another task.
    pub fn dispose_handle(&self) -> DisposeHandle {
        self.dispose.clone()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Runs the connection until it closes.
    ///
    /// Orderly closes, peer resets and disposal return `Ok(())`. Any other
    /// failure is returned to the caller, which is expected to log it and
    /// discard the connection.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.endpoint, "Client connected");
        self.stats.connection_opened();

        let dispose = Arc::clone(&self.dispose.notify);
        let outcome = tokio::select! {
            biased;
            _ = dispose.notified() => Ok(Exit::Disposed),
            result = self.transaction_loop() => result,
        };

        let phase = self.state;
        self.state = ConnectionState::Closed;
        let result = self.finish(outcome, phase);

        self.stats.connection_closed();
        result
    }

    /// The read-process-write loop.
    async fn transaction_loop(&mut self) -> Result<Exit, ConnectionError> {
        loop {
            self.state = ConnectionState::AwaitingHeader;
            let Some((header, mut frame)) = self.read_header().await? else {
                return Ok(Exit::PeerClosed);
            };

            self.state = ConnectionState::AwaitingPayload;
            self.read_payload(&header, &mut frame).await?;

            self.state = ConnectionState::Processing;
            let response = self.process(&header, &frame)?;

            self.state = ConnectionState::AwaitingWriteCompletion;
            self.send_response(&response).await?;
            self.stats.transaction_processed();
        }
    }

    /// Reads the 6-byte header.
    ///
    /// Returns `None` when the peer closed the connection before sending any
    /// byte of a new frame. On success the returned buffer holds the header
    /// bytes and has room for the payload.
    async fn read_header(&mut self) -> Result<Option<(MbapHeader, BytesMut)>, ConnectionError> {
        let mut raw = [0u8; MBAP_HEADER_LEN];

        let n = self.stream.get_mut().read(&mut raw).await?;
        if n == 0 {
            return Ok(None);
        }
        if n < MBAP_HEADER_LEN {
            // EOF from here on is a truncated frame, reported as UnexpectedEof
            self.stream.get_mut().read_exact(&mut raw[n..]).await?;
        }
        self.stats.bytes_read(MBAP_HEADER_LEN);

        let header = MbapHeader::from_bytes(&raw);
        trace!(
            client = %self.endpoint,
            transaction_id = header.transaction_id,
            length = header.length,
            "Read header"
        );

        if header.protocol_id != MODBUS_PROTOCOL_ID {
            trace!(
                client = %self.endpoint,
                protocol_id = header.protocol_id,
                "Ignoring non-Modbus protocol identifier"
            );
        }

        let payload_len = header.payload_len();
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ConnectionError::FrameTooLarge {
                length: payload_len,
                max: MAX_PAYLOAD_LEN,
            });
        }

        let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + payload_len);
        frame.extend_from_slice(&raw);
        Ok(Some((header, frame)))
    }

    /// Reads exactly the payload announced by `header` into `frame`, after
    /// the header bytes.
    async fn read_payload(
        &mut self,
        header: &MbapHeader,
        frame: &mut BytesMut,
    ) -> Result<(), ConnectionError> {
        let payload_len = header.payload_len();
        frame.resize(MBAP_HEADER_LEN + payload_len, 0);

        self.stream
            .get_mut()
            .read_exact(&mut frame[MBAP_HEADER_LEN..])
            .await?;
        self.stats.bytes_read(payload_len);

        trace!(client = %self.endpoint, bytes = payload_len, "Read payload");
        Ok(())
    }

    /// Decodes the frame, applies the request and encodes the response.
    fn process(&self, header: &MbapHeader, frame: &[u8]) -> Result<Bytes, ConnectionError> {
        let mut request = self.codec.decode(&frame[MBAP_HEADER_LEN..])?;
        // The codec never sees the header
        request.transaction_id = header.transaction_id;
        trace!(client = %self.endpoint, %request, "Decoded request");

        let mut response = self.processor.apply(&request)?;
        response.transaction_id = request.transaction_id;
        trace!(client = %self.endpoint, %response, "Built response");

        Ok(self.codec.encode(&response)?)
    }

    /// Sends a response to the client.
    async fn send_response(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_written(bytes.len());
        trace!(
            client = %self.endpoint,
            bytes = bytes.len(),
            "Sent response"
        );
        Ok(())
    }

    /// Classifies how the loop ended and raises the close notification.
    fn finish(
        &mut self,
        outcome: Result<Exit, ConnectionError>,
        phase: ConnectionState,
    ) -> Result<(), ConnectionError> {
        match outcome {
            Ok(Exit::PeerClosed) => {
                info!(client = %self.endpoint, "Client disconnected gracefully");
                self.notify_closed();
                Ok(())
            }
            Ok(Exit::Disposed) => {
                debug!(client = %self.endpoint, ?phase, "Connection disposed");
                self.notify_closed();
                Ok(())
            }
            Err(ConnectionError::Io(err)) => {
                self.notify_closed();
                if err.kind() == io::ErrorKind::ConnectionReset {
                    debug!(client = %self.endpoint, "Connection reset by client");
                    Ok(())
                } else {
                    warn!(client = %self.endpoint, error = %err, ?phase, "Connection error");
                    Err(ConnectionError::Io(err))
                }
            }
            Err(err) => {
                error!(client = %self.endpoint, error = %err, ?phase, "Transaction failed");
                Err(err)
            }
        }
    }

    fn notify_closed(&mut self) {
        if let Some(listener) = self.closed_tx.take() {
            // The listener may already be gone during shutdown
            let _ = listener.send(ConnectionClosed {
                endpoint: self.endpoint.clone(),
            });
        }
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed payload or unencodable response
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The processor failed to produce a response
    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    /// The header announced an implausible payload length
    #[error("Frame too large: {length} bytes (max: {max})")]
    FrameTooLarge { length: usize, max: usize },

    /// The handler was constructed with an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl ConnectionError {
    /// Returns true for transport failures. These are the only errors that
    /// raise a close notification.
    pub fn is_io(&self) -> bool {
        matches!(self, ConnectionError::Io(_))
    }

    /// Returns true if the peer reset the connection.
    pub fn is_expected_disconnect(&self) -> bool {
        matches!(self, ConnectionError::Io(err) if err.kind() == io::ErrorKind::ConnectionReset)
    }
}

/// Handles a client connection.
///
/// This is a convenience function that creates a ConnectionHandler,
/// registers it with the registry and runs it to completion.
///
/// # Arguments
///
/// * `stream` - The TCP stream for this connection
/// * `addr` - The client's socket address
/// * `processor` - Applies decoded requests
/// * `codec` - Decodes payloads and encodes responses
/// * `stats` - Shared connection statistics
/// * `registry` - Tracks live connections
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    processor: Arc<dyn RequestProcessor>,
    codec: Arc<dyn FrameCodec>,
    stats: Arc<ConnectionStats>,
    registry: Arc<ConnectionRegistry>,
) {
    let endpoint = addr.to_string();
    let handler = match ConnectionHandler::new(stream, endpoint.clone(), processor, codec, stats) {
        Ok(handler) => handler.with_close_listener(registry.close_listener()),
        Err(e) => {
            warn!(client = %addr, error = %e, "Rejected connection");
            return;
        }
    };

    registry.register(handler.endpoint(), handler.dispose_handle());

    if let Err(e) = handler.run().await {
        if !e.is_io() {
            // No close notification is raised for these
            registry.release(&endpoint);
        }
        debug!(client = %addr, error = %e, "Connection ended with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::SlaveProcessor;
    use crate::protocol::{ModbusCodec, Request, RequestPdu, Response, ResponsePdu};
    use crate::storage::{DataStore, StoreError};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_test::io::Builder;

    /// Decodes `[unit, function, ..]` without looking at the data and
    /// reports a bogus transaction id.
    struct OpaqueCodec;

    impl FrameCodec for OpaqueCodec {
        fn decode(&self, payload: &[u8]) -> Result<Request, CodecError> {
            if payload.len() < 2 {
                return Err(CodecError::EmptyPayload(payload.len()));
            }
            Ok(Request::new(
                0x7777,
                payload[0],
                RequestPdu::Unsupported {
                    function: payload[1],
                },
            ))
        }

        fn encode(&self, response: &Response) -> Result<Bytes, CodecError> {
            ModbusCodec::new().encode(response)
        }
    }

    /// Records every request and answers with a wrong transaction id.
    #[derive(Default)]
    struct RecordingProcessor {
        requests: Mutex<Vec<Request>>,
    }

    impl RecordingProcessor {
        fn seen(&self) -> Vec<Request> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl RequestProcessor for RecordingProcessor {
        fn apply(&self, request: &Request) -> Result<Response, ProcessorError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(Response {
                transaction_id: 0xDEAD,
                unit_id: request.unit_id,
                pdu: ResponsePdu::WriteSingleRegister {
                    address: 0,
                    value: 0,
                },
            })
        }
    }

    struct FailingProcessor;

    impl RequestProcessor for FailingProcessor {
        fn apply(&self, _request: &Request) -> Result<Response, ProcessorError> {
            Err(ProcessorError::Store(StoreError::Poisoned("holding registers")))
        }
    }

    /// The frame RecordingProcessor's answer encodes to.
    fn recorded_response(transaction_id: u16, unit_id: u8) -> Vec<u8> {
        let [hi, lo] = transaction_id.to_be_bytes();
        vec![hi, lo, 0x00, 0x00, 0x00, 0x06, unit_id, 0x06, 0x00, 0x00, 0x00, 0x00]
    }

    fn create_handler<S>(
        stream: S,
        processor: Arc<dyn RequestProcessor>,
        codec: Arc<dyn FrameCodec>,
    ) -> (
        ConnectionHandler<S>,
        mpsc::UnboundedReceiver<ConnectionClosed>,
        Arc<ConnectionStats>,
    )
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(ConnectionStats::new());
        let handler =
            ConnectionHandler::new(stream, "10.0.0.7:50200", processor, codec, Arc::clone(&stats))
                .unwrap()
                .with_close_listener(tx);
        (handler, rx, stats)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ConnectionClosed>) -> Vec<ConnectionClosed> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_single_transaction() {
        let mock = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02])
            .read(&[0x01, 0x02])
            .write(&recorded_response(1, 0x01))
            .build();
        let processor = Arc::new(RecordingProcessor::default());
        let (handler, mut rx, stats) = create_handler(mock, processor.clone(), Arc::new(OpaqueCodec));

        handler.run().await.unwrap();

        let seen = processor.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].transaction_id, 1);
        assert_eq!(seen[0].unit_id, 0x01);
        assert_eq!(seen[0].pdu, RequestPdu::Unsupported { function: 0x02 });

        assert_eq!(stats.bytes_read.load(Ordering::Relaxed), 8);
        assert_eq!(stats.bytes_written.load(Ordering::Relaxed), 12);
        assert_eq!(stats.transactions_processed.load(Ordering::Relaxed), 1);

        // The loop re-armed a header read and saw the peer close
        assert_eq!(
            drain(&mut rx),
            vec![ConnectionClosed {
                endpoint: "10.0.0.7:50200".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_transaction_id_comes_from_header() {
        let mock = Builder::new()
            .read(&[0xBE, 0xEF, 0x00, 0x00, 0x00, 0x02, 0x05, 0x41])
            .write(&recorded_response(0xBEEF, 0x05))
            .build();
        let processor = Arc::new(RecordingProcessor::default());
        let (handler, _rx, _) = create_handler(mock, processor.clone(), Arc::new(OpaqueCodec));

        handler.run().await.unwrap();

        assert_eq!(processor.seen()[0].transaction_id, 0xBEEF);
    }

    #[tokio::test]
    async fn test_reads_exactly_the_announced_length() {
        // Two frames arriving in one segment must be split at the header length
        let mock = Builder::new()
            .read(&[
                0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x02, 0xAA, 0x00, 0x02, 0x00, 0x00,
                0x00, 0x02, 0x03, 0x04,
            ])
            .write(&recorded_response(1, 0x01))
            .write(&recorded_response(2, 0x03))
            .build();
        let processor = Arc::new(RecordingProcessor::default());
        let (handler, mut rx, stats) =
            create_handler(mock, processor.clone(), Arc::new(OpaqueCodec));

        handler.run().await.unwrap();

        let seen = processor.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!((seen[0].transaction_id, seen[0].unit_id), (1, 0x01));
        assert_eq!((seen[1].transaction_id, seen[1].unit_id), (2, 0x03));
        assert_eq!(stats.bytes_read.load(Ordering::Relaxed), 17);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_sequential_transactions() {
        // Every write is followed by a fresh header read
        let mock = Builder::new()
            .read(&[0x00, 0x0A, 0x00, 0x00, 0x00, 0x02])
            .read(&[0x01, 0x02])
            .write(&recorded_response(10, 0x01))
            .read(&[0x00, 0x0B, 0x00, 0x00, 0x00, 0x02])
            .read(&[0x01, 0x02])
            .write(&recorded_response(11, 0x01))
            .build();
        let processor = Arc::new(RecordingProcessor::default());
        let (handler, _rx, stats) = create_handler(mock, processor.clone(), Arc::new(OpaqueCodec));

        handler.run().await.unwrap();

        let ids: Vec<u16> = processor.seen().iter().map(|r| r.transaction_id).collect();
        assert_eq!(ids, vec![10, 11]);
        assert_eq!(stats.transactions_processed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_header_split_across_reads() {
        let mock = Builder::new()
            .read(&[0x00, 0x01, 0x00])
            .read(&[0x00, 0x00, 0x02])
            .read(&[0x01, 0x02])
            .write(&recorded_response(1, 0x01))
            .build();
        let processor = Arc::new(RecordingProcessor::default());
        let (handler, _rx, _) = create_handler(mock, processor.clone(), Arc::new(OpaqueCodec));

        handler.run().await.unwrap();
        assert_eq!(processor.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_graceful_close() {
        let mock = Builder::new().build();
        let processor = Arc::new(RecordingProcessor::default());
        let (handler, mut rx, stats) =
            create_handler(mock, processor.clone(), Arc::new(OpaqueCodec));

        assert_eq!(handler.state(), ConnectionState::AwaitingHeader);
        handler.run().await.unwrap();

        assert_eq!(drain(&mut rx).len(), 1);
        assert!(processor.seen().is_empty());
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_peer_reset_is_swallowed() {
        let mock = Builder::new()
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();
        let (handler, mut rx, _) = create_handler(
            mock,
            Arc::new(RecordingProcessor::default()),
            Arc::new(OpaqueCodec),
        );

        assert!(handler.run().await.is_ok());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_other_io_error_is_returned() {
        let mock = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02])
            .read_error(io::Error::new(io::ErrorKind::Other, "link down"))
            .build();
        let (handler, mut rx, _) = create_handler(
            mock,
            Arc::new(RecordingProcessor::default()),
            Arc::new(OpaqueCodec),
        );

        let err = handler.run().await.unwrap_err();
        assert!(err.is_io());
        assert!(!err.is_expected_disconnect());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_truncated_header_is_an_io_error() {
        let mock = Builder::new().read(&[0x00, 0x01, 0x00]).build();
        let (handler, mut rx, _) = create_handler(
            mock,
            Arc::new(RecordingProcessor::default()),
            Arc::new(OpaqueCodec),
        );

        match handler.run().await {
            Err(ConnectionError::Io(err)) => {
                assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof)
            }
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_io_error() {
        let mock = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x01, 0x02])
            .build();
        let processor = Arc::new(RecordingProcessor::default());
        let (handler, mut rx, _) = create_handler(mock, processor.clone(), Arc::new(OpaqueCodec));

        let err = handler.run().await.unwrap_err();
        assert!(err.is_io());
        assert!(processor.seen().is_empty());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        // Length 0x0100 is past the limit; no payload read is attempted
        let mock = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00])
            .build();
        let (handler, mut rx, _) = create_handler(
            mock,
            Arc::new(RecordingProcessor::default()),
            Arc::new(OpaqueCodec),
        );

        let err = handler.run().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::FrameTooLarge {
                length: 256,
                max: MAX_PAYLOAD_LEN
            }
        ));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_protocol_id_is_ignored() {
        let mock = Builder::new()
            .read(&[0x00, 0x01, 0x12, 0x34, 0x00, 0x02, 0x01, 0x02])
            .write(&recorded_response(1, 0x01))
            .build();
        let processor = Arc::new(RecordingProcessor::default());
        let (handler, _rx, _) = create_handler(mock, processor.clone(), Arc::new(OpaqueCodec));

        handler.run().await.unwrap();
        assert_eq!(processor.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_decode_error_is_returned_without_notification() {
        let mock = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01])
            .build();
        let (handler, mut rx, _) = create_handler(
            mock,
            Arc::new(RecordingProcessor::default()),
            Arc::new(ModbusCodec::new()),
        );

        let err = handler.run().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Codec(CodecError::EmptyPayload(1))));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_processor_error_is_returned_without_notification() {
        let mock = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x02])
            .build();
        let (handler, mut rx, stats) =
            create_handler(mock, Arc::new(FailingProcessor), Arc::new(OpaqueCodec));

        let err = handler.run().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Processor(_)));
        assert!(!err.is_io());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_empty_endpoint_is_rejected() {
        let (_client, server) = tokio::io::duplex(64);
        let result = ConnectionHandler::new(
            server,
            "",
            Arc::new(RecordingProcessor::default()),
            Arc::new(OpaqueCodec),
            Arc::new(ConnectionStats::new()),
        );
        assert!(matches!(result, Err(ConnectionError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_dispose_before_run() {
        let (_client, server) = tokio::io::duplex(64);
        let (handler, mut rx, _) = create_handler(
            server,
            Arc::new(RecordingProcessor::default()),
            Arc::new(OpaqueCodec),
        );

        handler.dispose_handle().dispose();
        handler.run().await.unwrap();

        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_dispose_while_reading() {
        let (client, server) = tokio::io::duplex(64);
        let (handler, mut rx, _) = create_handler(
            server,
            Arc::new(RecordingProcessor::default()),
            Arc::new(OpaqueCodec),
        );
        let dispose = handler.dispose_handle();

        let task = tokio::spawn(handler.run());
        // Let the handler reach its pending header read
        tokio::task::yield_now().await;
        dispose.dispose();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("handler did not stop")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(drain(&mut rx).len(), 1);

        // Disposing again is harmless
        dispose.dispose();
        drop(client);
    }

    #[tokio::test]
    async fn test_peer_reset_during_write_is_swallowed() {
        let mock = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x02])
            .write_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();
        let processor = Arc::new(RecordingProcessor::default());
        let (handler, mut rx, stats) =
            create_handler(mock, processor.clone(), Arc::new(OpaqueCodec));

        assert!(handler.run().await.is_ok());
        assert_eq!(processor.seen().len(), 1);
        assert_eq!(stats.transactions_processed.load(Ordering::Relaxed), 0);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_other_write_error_is_returned() {
        let mock = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x02])
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();
        let (handler, mut rx, _) = create_handler(
            mock,
            Arc::new(RecordingProcessor::default()),
            Arc::new(OpaqueCodec),
        );

        let err = handler.run().await.unwrap_err();
        assert!(err.is_io());
        assert!(!err.is_expected_disconnect());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_dispose_while_writing() {
        // The 12-byte response cannot fit an 8-byte pipe the client never reads
        let (mut client, server) = tokio::io::duplex(8);
        let processor = Arc::new(RecordingProcessor::default());
        let (handler, mut rx, stats) =
            create_handler(server, processor.clone(), Arc::new(OpaqueCodec));
        let dispose = handler.dispose_handle();
        let task = tokio::spawn(handler.run());

        client
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x02])
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while processor.seen().is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("request was not processed");
        dispose.dispose();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("handler did not stop")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(stats.transactions_processed.load(Ordering::Relaxed), 0);
        drop(client);
    }

    /// Serves `handle_connection` on a loopback port.
    async fn spawn_server(
        registry: Arc<ConnectionRegistry>,
        stats: Arc<ConnectionStats>,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let processor: Arc<dyn RequestProcessor> =
            Arc::new(SlaveProcessor::new(Arc::new(DataStore::new())));
        let codec: Arc<dyn FrameCodec> = Arc::new(ModbusCodec::new());

        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    client_addr,
                    Arc::clone(&processor),
                    Arc::clone(&codec),
                    Arc::clone(&stats),
                    Arc::clone(&registry),
                ));
            }
        });
        addr
    }

    /// Waits until every connection is closed and released.
    async fn wait_for_teardown(registry: &ConnectionRegistry, stats: &ConnectionStats) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !registry.is_empty() || stats.active_connections.load(Ordering::Relaxed) != 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("connection was not torn down");
    }

    #[tokio::test]
    async fn test_modbus_over_tcp() {
        let (registry, events) = ConnectionRegistry::new();
        let registry = Arc::new(registry);
        let stats = Arc::new(ConnectionStats::new());

        let listener_registry = Arc::clone(&registry);
        tokio::spawn(async move { listener_registry.listen(events).await });
        let addr = spawn_server(Arc::clone(&registry), Arc::clone(&stats)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();

        // Write Multiple Registers: 2 registers at address 1
        client
            .write_all(&[
                0x00, 0x01, 0x00, 0x00, 0x00, 0x0B, 0x01, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04,
                0x00, 0x0A, 0x01, 0x02,
            ])
            .await
            .unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x10, 0x00, 0x01, 0x00, 0x02]
        );

        // Read Holding Registers: 2 registers at address 1
        client
            .write_all(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x01, 0x00, 0x02])
            .await
            .unwrap();
        let mut buf = [0u8; 13];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            [0x00, 0x02, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );

        assert_eq!(registry.len(), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);

        drop(client);
        wait_for_teardown(&registry, &stats).await;
        assert_eq!(stats.transactions_processed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_codec_error_releases_registry_entry() {
        // Close events are never consumed here, so only handle_connection
        // itself can release the entry
        let (registry, _events) = ConnectionRegistry::new();
        let registry = Arc::new(registry);
        let stats = Arc::new(ConnectionStats::new());
        let addr = spawn_server(Arc::clone(&registry), Arc::clone(&stats)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        // Write Single Coil with one data byte instead of four
        client
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x05, 0x00])
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        wait_for_teardown(&registry, &stats).await;
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.transactions_processed.load(Ordering::Relaxed), 0);
    }
}
