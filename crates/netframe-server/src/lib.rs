//! netframe production server.
//!
//! Production server implementation using Tokio for async I/O and system
//! time with cryptographic RNG. Combines [`netframe_core`]'s pure session
//! and admission-control state machines with [`netframe_proto`]'s wire
//! codec, adding the real TCP listener, per-connection framing, and opcode
//! dispatch that turn them into a running service.
//!
//! # Components
//!
//! - [`transport::TransportStream`]: per-connection framing and the
//!   single-writer outbound path
//! - [`dispatcher::PacketDispatcher`]: opcode-routed handler table and
//!   middleware pipeline
//! - [`listener::Listener`]: accept loop wiring sessions to the dispatcher
//! - [`system_env::SystemEnv`]: production environment (real time, crypto RNG)
//! - [`config::ServerConfig`]: every configuration group the binary builds
//!   from CLI args

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dispatcher;
pub mod listener;
pub mod server_error;
pub mod system_env;
pub mod transport;

use std::{net::SocketAddr, sync::Arc};

pub use config::ServerConfig;
pub use dispatcher::{DispatchContext, Handler, HandlerDescriptor, HandlerOutcome, PacketDispatcher, PacketDispatcherBuilder};
use netframe_core::{ByteBufferPool, ConnectionLimiter, LimiterConfig, SessionManager, UniqueIdGenerator};
use netframe_proto::{HeaderLayout, PacketCodec};
pub use server_error::ServerError;
pub use system_env::SystemEnv;
pub use transport::{DisconnectReason, TransportStream};

pub use listener::Listener;

/// Assembles a [`Listener`] from a [`ServerConfig`] and an already-built
/// dispatcher, wiring together the buffer pool, connection limiter, session
/// manager, and id generator every listener needs.
///
/// # Errors
///
/// `ServerError::Fatal` if `config.unique_id` fails validation.
pub fn build_listener(
    bind_address: SocketAddr,
    layout: HeaderLayout,
    config: &ServerConfig,
    dispatcher: PacketDispatcher,
) -> Result<Arc<Listener>, ServerError> {
    let pool = Arc::new(ByteBufferPool::new(config.pool.clone()));
    let limiter = Arc::new(ConnectionLimiter::new(LimiterConfig {
        max_per_ip: config.network.max_per_ip_connections,
        max_total: config.network.max_connections,
    }));
    let sessions = Arc::new(SessionManager::new(limiter));
    let ids = Arc::new(
        UniqueIdGenerator::new(config.unique_id.clone())
            .map_err(|err| ServerError::Fatal(format!("invalid unique id config: {err}")))?,
    );

    Ok(Arc::new(Listener::new(bind_address, layout, pool, sessions, Arc::new(dispatcher), ids, SystemEnv::new())))
}

/// Default codec built from a [`config::DispatcherConfig`].
#[must_use]
pub fn codec_from_config(config: &config::DispatcherConfig) -> PacketCodec {
    PacketCodec::new(config.compression_algo, config.compression_threshold)
}
