//! TCP framing: turns a connection's byte stream into [`Packet`] values and
//! serializes outbound writes (§4.2).
//!
//! Reads proceed in two phases: a fixed-size header (sized by the
//! configured [`HeaderLayout`]), then a payload whose length comes from the
//! decoded header's `length` field.
//!
//! Outbound writes funnel through a single background task draining an
//! mpsc channel, which is this crate's instance of §5's "internal write
//! lock (or single-writer goroutine)" — two callers enqueueing concurrently
//! can never interleave the bytes of two different frames on the wire.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use netframe_core::{ByteBufferPool, CoreError, SessionHandle};
use netframe_proto::{HeaderLayout, Packet, PacketHeader};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Why a connection's receive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the connection cleanly.
    Closed,
    /// Peer reset the connection (`ECONNRESET` or equivalent).
    Reset,
    /// Declared frame length exceeded the pool's maximum buffer size.
    PoolExceeded,
    /// The connection's cancellation token fired.
    Cancelled,
    /// Any other I/O or protocol error, carried as a display string.
    Error(String),
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Bound on how long the writer task keeps draining already-queued outbound
/// bytes after cancellation before it gives up and shuts the socket down.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Number of recently-sent fingerprints retained for higher-layer
/// duplicate-send detection.
const RECENTLY_SENT_CAPACITY: usize = 32;

/// Largest header any configured [`HeaderLayout`] produces, used to size a
/// stack buffer for the header read so only the payload needs a pooled
/// buffer.
const MAX_HEADER_SIZE: usize = 16;

/// A framed TCP connection: decodes inbound [`Packet`]s and serializes
/// outbound writes.
///
/// Cloning is cheap (it's an `Arc` internally via [`TransportStream::spawn`]
/// returning a shared handle); every clone enqueues onto the same writer
/// task, preserving per-connection write ordering.
pub struct TransportStream {
    outbound_tx: mpsc::UnboundedSender<Bytes>,
    state: Arc<AtomicU8>,
    recently_sent: Mutex<VecDeque<[u8; 8]>>,
    pool: Arc<ByteBufferPool>,
    cancel: CancellationToken,
    remote_address: SocketAddr,
}

impl TransportStream {
    /// Split `socket`, spawn the writer task and the receive loop, and
    /// return a handle plus the channel of decoded inbound packets.
    ///
    /// The receive loop's join handle resolves to the [`DisconnectReason`]
    /// once the connection ends; callers awaiting it know when to call
    /// [`Self::dispose`] and drop the session.
    #[must_use]
    pub fn spawn(
        socket: TcpStream,
        layout: HeaderLayout,
        pool: Arc<ByteBufferPool>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Packet>, JoinHandle<DisconnectReason>) {
        let remote_address = socket.peer_addr().unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read_half, write_half) = socket.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(OPEN));

        let stream = Arc::new(Self {
            outbound_tx,
            state: Arc::clone(&state),
            recently_sent: Mutex::new(VecDeque::with_capacity(RECENTLY_SENT_CAPACITY)),
            pool: Arc::clone(&pool),
            cancel: cancel.clone(),
            remote_address,
        });

        tokio::spawn(write_loop(write_half, outbound_rx, cancel.clone(), state));
        let recv_handle = tokio::spawn(receive_loop(read_half, pool, layout, inbound_tx, cancel));

        (stream, inbound_rx, recv_handle)
    }

    /// Peer address this stream is connected to.
    #[must_use]
    pub const fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// `true` once the stream has left `Open` (either `Closing` or `Closed`).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != OPEN
    }

    /// Enqueue `bytes` for a single serialized write. Returns `false` (and
    /// does nothing) once the stream is `Closing`/`Closed`.
    ///
    /// A failure to enqueue only means the writer task has already shut
    /// down; it does not itself close the stream (the receive loop's
    /// disconnect is what drives that).
    pub fn send(&self, bytes: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.remember_sent(bytes);
        self.outbound_tx.send(Bytes::copy_from_slice(bytes)).is_ok()
    }

    /// Async-call-site twin of [`Self::send`]. Both funnel through the same
    /// single writer task; this exists so call sites already in an async
    /// context don't need to special-case a sync method.
    pub async fn send_async(&self, bytes: &[u8]) -> bool {
        self.send(bytes)
    }

    /// Whether a byte string matching `bytes`' first-4/last-4 fingerprint was
    /// sent recently. For higher-layer duplicate-send detection only — this
    /// stream never consults it itself.
    #[must_use]
    pub fn was_recently_sent(&self, bytes: &[u8]) -> bool {
        let key = recently_sent_key(bytes);
        self.recently_sent.lock().unwrap_or_else(std::sync::PoisonError::into_inner).contains(&key)
    }

    fn remember_sent(&self, bytes: &[u8]) {
        let key = recently_sent_key(bytes);
        let mut cache = self.recently_sent.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if cache.len() >= RECENTLY_SENT_CAPACITY {
            cache.pop_front();
        }
        cache.push_back(key);
    }

    /// Move the stream from `Open` to `Closing`: stops new sends and signals
    /// the writer task to drain whatever is already queued (bounded by
    /// [`DRAIN_TIMEOUT`]) before it shuts the socket down and the stream
    /// reaches `Closed`. Idempotent: a second call is a no-op.
    pub fn dispose(&self) {
        if self.state.compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }
        self.cancel.cancel();
    }
}

impl SessionHandle for TransportStream {
    fn send(&self, bytes: &[u8]) -> Result<(), CoreError> {
        if Self::send(self, bytes) { Ok(()) } else { Err(CoreError::Transport("stream closed".to_string())) }
    }
}

fn recently_sent_key(bytes: &[u8]) -> [u8; 8] {
    let mut key = [0u8; 8];
    let first_n = bytes.len().min(4);
    key[..first_n].copy_from_slice(&bytes[..first_n]);
    let last_n = bytes.len().min(4);
    key[4..4 + last_n].copy_from_slice(&bytes[bytes.len() - last_n..]);
    key
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            maybe_bytes = outbound_rx.recv() => {
                match maybe_bytes {
                    Some(bytes) => {
                        if let Err(err) = write_half.write_all(&bytes).await {
                            tracing::warn!(error = %err, "write failed, closing connection");
                            break;
                        }
                    },
                    None => break,
                }
            },
        }
    }

    drain_outbound(&mut write_half, &mut outbound_rx).await;

    let _ = write_half.shutdown().await;
    state.store(CLOSED, Ordering::Release);
}

/// Best-effort, bounded drain of whatever is already sitting in
/// `outbound_rx` once the loop above has stopped accepting new writes.
/// `outbound_tx` may still be held by live `TransportStream` clones, so
/// `recv` alone would wait forever for the next send; [`DRAIN_TIMEOUT`]
/// caps the whole drain instead.
async fn drain_outbound(write_half: &mut OwnedWriteHalf, outbound_rx: &mut mpsc::UnboundedReceiver<Bytes>) {
    let drain = async {
        while let Some(bytes) = outbound_rx.recv().await {
            if let Err(err) = write_half.write_all(&bytes).await {
                tracing::warn!(error = %err, "drain write failed");
                break;
            }
        }
    };

    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::debug!("outbound drain timed out, remaining queued writes discarded");
    }
}

async fn receive_loop(
    mut read_half: OwnedReadHalf,
    pool: Arc<ByteBufferPool>,
    layout: HeaderLayout,
    inbound_tx: mpsc::UnboundedSender<Packet>,
    cancel: CancellationToken,
) -> DisconnectReason {
    let header_size = layout.header_size();
    let mut header_buf = [0u8; MAX_HEADER_SIZE];
    let mut payload_buf = pool.rent(pool.max_buffer_size().min(4096));

    loop {
        let read_result = tokio::select! {
            () = cancel.cancelled() => {
                pool.return_buffer(payload_buf);
                return DisconnectReason::Cancelled;
            },
            result = read_half.read_exact(&mut header_buf[..header_size]) => result,
        };

        match read_result {
            Ok(_) => {},
            Err(err) if matches!(err.kind(), std::io::ErrorKind::UnexpectedEof) => {
                pool.return_buffer(payload_buf);
                return DisconnectReason::Closed;
            },
            Err(err) if matches!(err.kind(), std::io::ErrorKind::ConnectionReset) => {
                pool.return_buffer(payload_buf);
                return DisconnectReason::Reset;
            },
            Err(err) => {
                tracing::warn!(error = %err, "receive loop I/O error, closing connection");
                pool.return_buffer(payload_buf);
                return DisconnectReason::Error(err.to_string());
            },
        }

        let header = match PacketHeader::from_bytes(&header_buf[..header_size], layout) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(error = %err, "invalid header, closing connection");
                pool.return_buffer(payload_buf);
                return DisconnectReason::Error(err.to_string());
            },
        };

        let total_len = header.length() as usize;
        if total_len > pool.max_buffer_size() {
            tracing::warn!(total_len, max = pool.max_buffer_size(), "declared length exceeds pool max, closing connection");
            pool.return_buffer(payload_buf);
            return DisconnectReason::PoolExceeded;
        }
        let Some(payload_len) = total_len.checked_sub(header_size) else {
            tracing::warn!(total_len, header_size, "length field smaller than header size, closing connection");
            pool.return_buffer(payload_buf);
            return DisconnectReason::Error("length field smaller than header size".to_string());
        };

        if payload_len > payload_buf.len() {
            pool.return_buffer(payload_buf);
            payload_buf = pool.rent(payload_len);
        }

        if payload_len > 0 {
            let read_result = tokio::select! {
                () = cancel.cancelled() => {
                    pool.return_buffer(payload_buf);
                    return DisconnectReason::Cancelled;
                },
                result = read_half.read_exact(&mut payload_buf[..payload_len]) => result,
            };
            if let Err(err) = read_result {
                tracing::warn!(error = %err, "payload read failed, closing connection");
                pool.return_buffer(payload_buf);
                return DisconnectReason::Error(err.to_string());
            }
        }

        let payload = Bytes::copy_from_slice(&payload_buf[..payload_len]);
        let packet = Packet { header, payload };
        if inbound_tx.send(packet).is_err() {
            pool.return_buffer(payload_buf);
            return DisconnectReason::Closed;
        }
    }
}
