//! TCP accept loop: binds a [`TcpListener`], admits connections through the
//! shared [`SessionManager`], and feeds each connection's decoded packets
//! into the [`PacketDispatcher`] (§4.1, §4.4).
//!
//! One task per accepted connection: frame it, register its session, drain
//! its inbound packet channel through the dispatcher until the receive loop
//! ends, then tear the session down.

use std::{net::SocketAddr, sync::Arc};

use netframe_core::{ByteBufferPool, Environment, SessionManager, SessionRole, UniqueIdGenerator};
use netframe_proto::HeaderLayout;
use tokio::net::TcpListener;

use crate::{
    dispatcher::{DispatchContext, PacketDispatcher},
    server_error::ServerError,
    system_env::SystemEnv,
    transport::TransportStream,
};

/// Accepts connections and drives them through the dispatcher until the
/// listener is dropped.
pub struct Listener {
    bind_address: SocketAddr,
    layout: HeaderLayout,
    pool: Arc<ByteBufferPool>,
    sessions: Arc<SessionManager<Arc<TransportStream>>>,
    dispatcher: Arc<PacketDispatcher>,
    ids: Arc<UniqueIdGenerator>,
    env: SystemEnv,
}

impl Listener {
    #[must_use]
    pub const fn new(
        bind_address: SocketAddr,
        layout: HeaderLayout,
        pool: Arc<ByteBufferPool>,
        sessions: Arc<SessionManager<Arc<TransportStream>>>,
        dispatcher: Arc<PacketDispatcher>,
        ids: Arc<UniqueIdGenerator>,
        env: SystemEnv,
    ) -> Self {
        Self { bind_address, layout, pool, sessions, dispatcher, ids, env }
    }

    /// Bind and serve forever. Returns only on a fatal bind error; a single
    /// connection's failure never propagates out of this loop.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Fatal` if the bind address can't be bound.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let tcp = TcpListener::bind(self.bind_address)
            .await
            .map_err(|err| ServerError::Fatal(format!("bind {}: {err}", self.bind_address)))?;
        tracing::info!(addr = %self.bind_address, "listening");

        loop {
            match tcp.accept().await {
                Ok((socket, remote_address)) => {
                    let listener = Arc::clone(&self);
                    tokio::spawn(async move {
                        listener.handle_connection(socket, remote_address).await;
                    });
                },
                Err(err) => tracing::warn!(error = %err, "accept failed"),
            }
        }
    }

    async fn handle_connection(&self, socket: tokio::net::TcpStream, remote_address: SocketAddr) {
        let session_id = match self.ids.next_id() {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(error = %err, "failed to allocate session id, dropping connection");
                return;
            },
        };

        let (stream, mut inbound, recv_handle) = TransportStream::spawn(socket, self.layout, Arc::clone(&self.pool));

        if let Err(err) = self.sessions.add(session_id, remote_address, SessionRole::Guest, self.env.now(), Arc::clone(&stream)) {
            tracing::warn!(session_id, remote = %remote_address, error = %err, "connection rejected");
            stream.dispose();
            return;
        }

        tracing::debug!(session_id, remote = %remote_address, "session established");

        while let Some(packet) = inbound.recv().await {
            let Some(session) = self.sessions.get(session_id) else { break };
            let ctx = Arc::new(DispatchContext {
                session_id,
                remote_address,
                role: session.role(),
                session_key: session.session_key().map(<[u8]>::to_vec),
                handle: Arc::clone(&stream) as Arc<dyn netframe_core::SessionHandle>,
            });
            self.dispatcher.dispatch(packet, ctx).await;
        }

        let reason = recv_handle.await.unwrap_or(crate::transport::DisconnectReason::Closed);
        tracing::debug!(session_id, remote = %remote_address, ?reason, "session closed");

        stream.dispose();
        self.sessions.remove(session_id);
    }
}
