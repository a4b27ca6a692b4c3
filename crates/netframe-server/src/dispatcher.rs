//! `PacketDispatcher`: opcode-routed handler table and middleware pipeline
//! (§4.3).
//!
//! The handler table is built once via [`PacketDispatcherBuilder`] and frozen
//! into a plain `HashMap` behind the returned [`PacketDispatcher`] — reads
//! during dispatch never take a lock, matching §5's "handler table immutable
//! after startup, lock-free reads". Rate limiting and concurrency limiting
//! are the two pieces of state that do change per request; both live behind
//! fine-grained locks scoped to one `(connection, opcode)` pair.
//!
//! The handler table is registered once at startup and frozen; dispatch
//! routes a decoded packet through rate limiting, concurrency limiting,
//! decompression, decryption, a permission check, and a timeout before
//! invoking the handler.

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use dashmap::DashMap;
use netframe_core::{Environment, SessionHandle, SessionRole};
use netframe_proto::{CipherAlgo, Flags, Opcode, Packet, PacketCodec};
use tokio::sync::Semaphore;

use crate::{server_error::ServerError, system_env::SystemEnv};

/// Per-`(connection, opcode)` token bucket limits, one token per packet.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub rps: u32,
    /// Maximum tokens held at once (burst size).
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { rps: 1000, burst: 1000 }
    }
}

/// Per-descriptor concurrency ceiling.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimitConfig {
    /// Maximum concurrently running invocations of this handler.
    pub max: usize,
    /// When the limit is reached: `true` waits (bounded by `queue_max`),
    /// `false` rejects immediately with `Overloaded`.
    pub queue: bool,
    /// Maximum number of callers allowed to wait when `queue` is set.
    pub queue_max: usize,
}

impl Default for ConcurrencyLimitConfig {
    fn default() -> Self {
        Self { max: 64, queue: false, queue_max: 0 }
    }
}

/// Per-request state handed to a handler: identity, transport capability,
/// nothing else. Handlers reach the network only through `handle`.
pub struct DispatchContext {
    /// Session this packet arrived on.
    pub session_id: u64,
    /// Peer address, for logging.
    pub remote_address: SocketAddr,
    /// Session's current privilege level.
    pub role: SessionRole,
    /// Negotiated session key, if any (required for encrypted opcodes).
    pub session_key: Option<Vec<u8>>,
    /// Send-only capability back to the connection.
    pub handle: Arc<dyn SessionHandle>,
}

/// What a handler produced, before it's translated into outbound bytes.
///
/// Rust's `Result`/enum return types stand in for §4.3's dynamic
/// `void`/`Packet`/`bytes`/`string`/`Task` handler return surface — every
/// handler here has one static signature, so the "unknown return type,
/// logged once" branch from the source material has no counterpart.
pub enum HandlerOutcome {
    /// No response.
    None,
    /// Raw bytes, written to the connection as-is.
    Bytes(Bytes),
    /// A packet, serialized then written.
    Packet(Packet),
    /// UTF-8 text, encoded then written.
    Text(String),
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<HandlerOutcome, ServerError>> + Send>>;

/// A registered opcode handler.
pub type Handler = Arc<dyn Fn(Packet, Arc<DispatchContext>) -> HandlerFuture + Send + Sync>;

/// Everything the dispatcher needs to know about one opcode before it will
/// route a frame to it.
pub struct HandlerDescriptor {
    handler: Handler,
    required_role: SessionRole,
    requires_encryption: Option<CipherAlgo>,
    rate_limit: RateLimitConfig,
    concurrency_limit: ConcurrencyLimitConfig,
    timeout: Option<Duration>,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
}

impl HandlerDescriptor {
    /// Start building a descriptor around `handler`, defaulting to the
    /// lowest privilege level, no encryption requirement, a generous rate
    /// limit, and bounded (non-queueing) concurrency.
    #[must_use]
    pub fn new(handler: Handler) -> Self {
        let concurrency_limit = ConcurrencyLimitConfig::default();
        Self {
            handler,
            required_role: SessionRole::Guest,
            requires_encryption: None,
            rate_limit: RateLimitConfig::default(),
            concurrency_limit,
            timeout: None,
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max)),
            queued: AtomicUsize::new(0),
        }
    }

    /// Require at least `role` to invoke this handler (`Admin` always
    /// bypasses this check).
    #[must_use]
    pub const fn required_role(mut self, role: SessionRole) -> Self {
        self.required_role = role;
        self
    }

    /// Require the frame be `Encrypted` under `algo` before the handler runs.
    #[must_use]
    pub const fn requires_encryption(mut self, algo: CipherAlgo) -> Self {
        self.requires_encryption = Some(algo);
        self
    }

    /// Override the default rate limit.
    #[must_use]
    pub const fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Override the default concurrency limit.
    #[must_use]
    pub fn concurrency_limit(mut self, concurrency_limit: ConcurrencyLimitConfig) -> Self {
        self.semaphore = Arc::new(Semaphore::new(concurrency_limit.max));
        self.concurrency_limit = concurrency_limit;
        self
    }

    /// Override the dispatcher-wide default timeout for this handler.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self { tokens: f64::from(config.burst), capacity: f64::from(config.burst), rate: f64::from(config.rps), last_refill: now }
    }

    fn try_consume_one(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_refill = now;
        }
    }
}

/// Builds an immutable opcode-to-handler table.
pub struct PacketDispatcherBuilder {
    handlers: HashMap<u16, HandlerDescriptor>,
    codec: PacketCodec,
    default_timeout: Duration,
    env: SystemEnv,
}

impl PacketDispatcherBuilder {
    /// Start a builder using `codec` for decompression and `default_timeout`
    /// for handlers that don't set their own.
    #[must_use]
    pub fn new(codec: PacketCodec, default_timeout: Duration) -> Self {
        Self { handlers: HashMap::new(), codec, default_timeout, env: SystemEnv::new() }
    }

    /// Register `descriptor` for `opcode`.
    ///
    /// # Errors
    ///
    /// `ServerError::Fatal` if `opcode` is already registered — two handlers
    /// for the same opcode is a startup configuration error (§4.3).
    pub fn register(mut self, opcode: Opcode, descriptor: HandlerDescriptor) -> Result<Self, ServerError> {
        if self.handlers.contains_key(&opcode.as_u16()) {
            return Err(ServerError::Fatal(format!("duplicate handler registration for opcode {opcode}")));
        }
        self.handlers.insert(opcode.as_u16(), descriptor);
        Ok(self)
    }

    /// Freeze the table into a dispatcher.
    #[must_use]
    pub fn build(self) -> PacketDispatcher {
        PacketDispatcher {
            handlers: self.handlers.into_iter().map(|(opcode, descriptor)| (opcode, Arc::new(descriptor))).collect(),
            codec: self.codec,
            default_timeout: self.default_timeout,
            buckets: DashMap::new(),
            env: self.env,
        }
    }
}

/// Routes decoded packets to registered handlers through the §4.3 middleware
/// pipeline: rate limit, concurrency limit, decompression, decryption,
/// permission, timeout.
pub struct PacketDispatcher {
    handlers: HashMap<u16, Arc<HandlerDescriptor>>,
    codec: PacketCodec,
    default_timeout: Duration,
    buckets: DashMap<(u64, u16), Mutex<TokenBucket>>,
    env: SystemEnv,
}

const fn role_rank(role: SessionRole) -> u8 {
    match role {
        SessionRole::Guest => 0,
        SessionRole::User => 1,
        SessionRole::Admin => 2,
    }
}

impl PacketDispatcher {
    /// Route `packet` through the middleware pipeline and, if it survives,
    /// to its registered handler.
    ///
    /// Every failure path is logged and returns without propagating an
    /// error — per §7's propagation policy, nothing above the per-connection
    /// task is allowed to see a dispatch failure.
    pub async fn dispatch(&self, packet: Packet, ctx: Arc<DispatchContext>) {
        let opcode = packet.header.opcode();
        tracing::debug!(%opcode, session_id = ctx.session_id, "received");

        let Some(descriptor) = self.handlers.get(&opcode.as_u16()).cloned() else {
            tracing::warn!(%opcode, remote = %ctx.remote_address, "no handler registered, dropping frame");
            return;
        };

        if !self.admit_rate_limit(ctx.session_id, opcode, descriptor.rate_limit) {
            tracing::debug!(%opcode, session_id = ctx.session_id, "rate limited");
            return;
        }

        let Some(permit) = Self::acquire_concurrency(&descriptor).await else {
            tracing::debug!(%opcode, session_id = ctx.session_id, "overloaded");
            return;
        };

        tracing::debug!(%opcode, session_id = ctx.session_id, "middleware accepted");

        let Some(packet) = self.decode_stages(packet, opcode, &ctx) else {
            return;
        };

        if ctx.role != SessionRole::Admin && role_rank(ctx.role) < role_rank(descriptor.required_role) {
            tracing::debug!(%opcode, session_id = ctx.session_id, "forbidden");
            return;
        }

        tracing::debug!(%opcode, session_id = ctx.session_id, "handler running");
        let timeout = descriptor.timeout.unwrap_or(self.default_timeout);
        let result = tokio::time::timeout(timeout, (descriptor.handler)(packet, Arc::clone(&ctx))).await;
        drop(permit);

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                tracing::warn!(%opcode, remote = %ctx.remote_address, error = %err, "handler exception");
                return;
            },
            Err(_) => {
                tracing::warn!(%opcode, remote = %ctx.remote_address, "handler timed out");
                return;
            },
        };

        tracing::debug!(%opcode, session_id = ctx.session_id, "handler returned");
        self.send_outcome(outcome, opcode, &ctx);
    }

    fn admit_rate_limit(&self, session_id: u64, opcode: Opcode, config: RateLimitConfig) -> bool {
        let now = self.env.now();
        let mut bucket = self
            .buckets
            .entry((session_id, opcode.as_u16()))
            .or_insert_with(|| Mutex::new(TokenBucket::new(config, now)))
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        bucket.try_consume_one(now)
    }

    /// Acquires a concurrency permit for `descriptor`, honoring
    /// `ConcurrencyLimitConfig::queue_max`: once `max` concurrent invocations
    /// are already running, at most `queue_max` additional callers are
    /// allowed to wait for a slot; any caller beyond that is rejected
    /// immediately rather than queueing unboundedly.
    async fn acquire_concurrency(descriptor: &Arc<HandlerDescriptor>) -> Option<tokio::sync::OwnedSemaphorePermit> {
        if !descriptor.concurrency_limit.queue {
            return Arc::clone(&descriptor.semaphore).try_acquire_owned().ok();
        }

        if let Ok(permit) = Arc::clone(&descriptor.semaphore).try_acquire_owned() {
            return Some(permit);
        }

        let queued = descriptor.queued.fetch_add(1, Ordering::AcqRel) + 1;
        if queued > descriptor.concurrency_limit.queue_max {
            descriptor.queued.fetch_sub(1, Ordering::AcqRel);
            return None;
        }

        let permit = Arc::clone(&descriptor.semaphore).acquire_owned().await.ok();
        descriptor.queued.fetch_sub(1, Ordering::AcqRel);
        permit
    }

    fn decode_stages(&self, mut packet: Packet, opcode: Opcode, ctx: &DispatchContext) -> Option<Packet> {
        if packet.header.flags().contains(Flags::COMPRESSED) {
            packet = match self.codec.decompress(packet) {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::warn!(%opcode, remote = %ctx.remote_address, error = %err, "decompression failed, dropping frame");
                    return None;
                },
            };
        }

        if let Some(algo) = self.handlers.get(&opcode.as_u16()).and_then(|d| d.requires_encryption) {
            if !packet.header.flags().contains(Flags::ENCRYPTED) {
                tracing::warn!(%opcode, remote = %ctx.remote_address, "expected encrypted frame, dropping");
                return None;
            }
            let Some(key) = ctx.session_key.as_deref() else {
                tracing::warn!(%opcode, remote = %ctx.remote_address, "no session key negotiated, dropping encrypted frame");
                return None;
            };
            packet = match PacketCodec::decrypt(packet, key, algo) {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::warn!(%opcode, remote = %ctx.remote_address, error = %err, "decryption failed, dropping frame");
                    return None;
                },
            };
        }

        Some(packet)
    }

    fn send_outcome(&self, outcome: HandlerOutcome, opcode: Opcode, ctx: &DispatchContext) {
        let bytes = match outcome {
            HandlerOutcome::None => return,
            HandlerOutcome::Bytes(bytes) => bytes,
            HandlerOutcome::Packet(response) => match response.encode() {
                Ok(bytes) => Bytes::from(bytes),
                Err(err) => {
                    tracing::warn!(%opcode, error = %err, "failed to encode response packet");
                    return;
                },
            },
            HandlerOutcome::Text(text) => Bytes::from(text.into_bytes()),
        };

        match ctx.handle.send(&bytes) {
            Ok(()) => tracing::debug!(%opcode, session_id = ctx.session_id, "response sent"),
            Err(err) => tracing::warn!(%opcode, session_id = ctx.session_id, error = %err, "failed to send response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::Mutex as StdMutex,
    };

    use netframe_core::CoreError;
    use netframe_proto::{Opcode, Priority, Transport};

    use super::*;

    struct RecordingHandle {
        sent: StdMutex<Vec<Vec<u8>>>,
    }

    impl SessionHandle for RecordingHandle {
        fn send(&self, bytes: &[u8]) -> Result<(), CoreError> {
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    fn echo_handler() -> Handler {
        Arc::new(|packet: Packet, _ctx: Arc<DispatchContext>| {
            Box::pin(async move { Ok(HandlerOutcome::Bytes(packet.payload)) })
        })
    }

    fn ctx(handle: Arc<RecordingHandle>) -> Arc<DispatchContext> {
        Arc::new(DispatchContext {
            session_id: 1,
            remote_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000),
            role: SessionRole::Guest,
            session_key: None,
            handle,
        })
    }

    fn packet(opcode: u16, payload: &[u8]) -> Packet {
        Packet::modern(Opcode::new(opcode), Flags::empty(), Priority::Normal, Transport::Tcp, payload.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn unregistered_opcode_is_dropped_silently() {
        let dispatcher = PacketDispatcherBuilder::new(PacketCodec::default(), Duration::from_secs(1)).build();
        let handle = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()) });
        dispatcher.dispatch(packet(0x9999, b"hi"), ctx(Arc::clone(&handle))).await;
        assert!(handle.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn registered_handler_echoes_payload() {
        let descriptor = HandlerDescriptor::new(echo_handler());
        let dispatcher =
            PacketDispatcherBuilder::new(PacketCodec::default(), Duration::from_secs(1)).register(Opcode::new(1), descriptor).unwrap().build();

        let handle = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()) });
        dispatcher.dispatch(packet(1, b"hello"), ctx(Arc::clone(&handle))).await;

        assert_eq!(handle.sent.lock().unwrap().as_slice(), [b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn duplicate_registration_is_fatal() {
        let builder = PacketDispatcherBuilder::new(PacketCodec::default(), Duration::from_secs(1))
            .register(Opcode::new(1), HandlerDescriptor::new(echo_handler()))
            .unwrap();
        let result = builder.register(Opcode::new(1), HandlerDescriptor::new(echo_handler()));
        assert!(matches!(result, Err(ServerError::Fatal(_))));
    }

    #[tokio::test]
    async fn second_call_within_burst_one_is_rate_limited() {
        // spec §8 scenario 4: rps=1, burst=1 -> exactly one immediate call
        // admitted, the next is rejected before the handler ever runs.
        let descriptor = HandlerDescriptor::new(echo_handler()).rate_limit(RateLimitConfig { rps: 1, burst: 1 });
        let dispatcher =
            PacketDispatcherBuilder::new(PacketCodec::default(), Duration::from_secs(1)).register(Opcode::new(1), descriptor).unwrap().build();

        let handle = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()) });
        dispatcher.dispatch(packet(1, b"a"), ctx(Arc::clone(&handle))).await;
        dispatcher.dispatch(packet(1, b"b"), ctx(Arc::clone(&handle))).await;

        assert_eq!(handle.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insufficient_role_is_forbidden() {
        let descriptor = HandlerDescriptor::new(echo_handler()).required_role(SessionRole::Admin);
        let dispatcher =
            PacketDispatcherBuilder::new(PacketCodec::default(), Duration::from_secs(1)).register(Opcode::new(1), descriptor).unwrap().build();

        let handle = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()) });
        dispatcher.dispatch(packet(1, b"hi"), ctx(Arc::clone(&handle))).await;

        assert!(handle.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_handler_times_out_and_sends_nothing() {
        let handler: Handler = Arc::new(|_packet, _ctx| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(HandlerOutcome::Bytes(Bytes::from_static(b"too late")))
            })
        });
        let descriptor = HandlerDescriptor::new(handler).timeout(Duration::from_millis(10));
        let dispatcher =
            PacketDispatcherBuilder::new(PacketCodec::default(), Duration::from_secs(5)).register(Opcode::new(1), descriptor).unwrap().build();

        let handle = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()) });
        dispatcher.dispatch(packet(1, b"hi"), ctx(Arc::clone(&handle))).await;

        assert!(handle.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_queueing_concurrency_limit_of_one_rejects_second_concurrent_call() {
        let handler: Handler = Arc::new(|_packet, _ctx| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(HandlerOutcome::Bytes(Bytes::from_static(b"done")))
            })
        });
        let descriptor = HandlerDescriptor::new(handler)
            .concurrency_limit(ConcurrencyLimitConfig { max: 1, queue: false, queue_max: 0 });
        let dispatcher = Arc::new(
            PacketDispatcherBuilder::new(PacketCodec::default(), Duration::from_secs(5))
                .register(Opcode::new(1), descriptor)
                .unwrap()
                .build(),
        );

        let handle = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()) });
        let d1 = Arc::clone(&dispatcher);
        let h1 = Arc::clone(&handle);
        let first = tokio::spawn(async move { d1.dispatch(packet(1, b"a"), ctx(h1)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        dispatcher.dispatch(packet(1, b"b"), ctx(Arc::clone(&handle))).await;
        first.await.unwrap();

        assert_eq!(handle.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn queueing_concurrency_limit_rejects_once_queue_is_full() {
        let handler: Handler = Arc::new(|_packet, _ctx| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(HandlerOutcome::Bytes(Bytes::from_static(b"done")))
            })
        });
        let descriptor = HandlerDescriptor::new(handler)
            .concurrency_limit(ConcurrencyLimitConfig { max: 1, queue: true, queue_max: 1 });
        let dispatcher = Arc::new(
            PacketDispatcherBuilder::new(PacketCodec::default(), Duration::from_secs(5))
                .register(Opcode::new(1), descriptor)
                .unwrap()
                .build(),
        );

        let handle = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()) });

        // First call occupies the one running slot.
        let d1 = Arc::clone(&dispatcher);
        let h1 = Arc::clone(&handle);
        let first = tokio::spawn(async move { d1.dispatch(packet(1, b"a"), ctx(h1)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Second call fills the one-deep queue.
        let d2 = Arc::clone(&dispatcher);
        let h2 = Arc::clone(&handle);
        let second = tokio::spawn(async move { d2.dispatch(packet(1, b"b"), ctx(h2)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Third call finds the queue already full and is rejected immediately.
        dispatcher.dispatch(packet(1, b"c"), ctx(Arc::clone(&handle))).await;

        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(handle.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn text_outcome_is_sent_as_utf8_bytes() {
        let handler: Handler =
            Arc::new(|_packet, _ctx| Box::pin(async move { Ok(HandlerOutcome::Text("pong".to_string())) }));
        let descriptor = HandlerDescriptor::new(handler);
        let dispatcher =
            PacketDispatcherBuilder::new(PacketCodec::default(), Duration::from_secs(1)).register(Opcode::new(1), descriptor).unwrap().build();

        let handle = Arc::new(RecordingHandle { sent: StdMutex::new(Vec::new()) });
        dispatcher.dispatch(packet(1, b"ping"), ctx(Arc::clone(&handle))).await;

        assert_eq!(handle.sent.lock().unwrap().as_slice(), [b"pong".to_vec()]);
    }
}
