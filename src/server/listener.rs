//! Native relay listener
//!
//! TCP accept loop that drives one connection actor per endpoint:
//! handshake → credential capture → attach → publish/read loop → close.
//! Every blocking step is guarded by the connection's token or a
//! deadline; connection errors never escape the connection task.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::conn::{ConnInfo, ConnPhase, ConnRegistry};
use crate::error::{RelayError, Result};
use crate::metrics::Metrics;
use crate::path::{Credentials, PathManagerHandle, Protocol, SessionIdent};
use crate::routine::RoutinePool;

use super::config::ServerConfig;
use super::proto::{self, Hello, Message, WireRole};

/// The native relay front-end.
pub struct RelayServer {
    config: ServerConfig,
    manager: PathManagerHandle,
    registry: ConnRegistry,
    metrics: Metrics,
    semaphore: Option<Arc<Semaphore>>,
}

impl RelayServer {
    pub fn new(
        config: ServerConfig,
        manager: PathManagerHandle,
        registry: ConnRegistry,
        metrics: Metrics,
    ) -> Self {
        let semaphore = (config.max_connections > 0)
            .then(|| Arc::new(Semaphore::new(config.max_connections)));
        Self {
            config,
            manager,
            registry,
            metrics,
            semaphore,
        }
    }

    /// Accept until the pool's token fires.
    pub async fn run(&self, pool: &RoutinePool) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener, pool).await
    }

    /// Accept on an already-bound listener (lets callers pick port 0).
    pub async fn run_with_listener(
        &self,
        listener: TcpListener,
        pool: &RoutinePool,
    ) -> anyhow::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "Relay server listening");

        let token = pool.token().clone();
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => self.handle_connection(socket, peer, pool),
                    Err(e) => tracing::error!(error = %e, "Accept failed"),
                },
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer: SocketAddr, pool: &RoutinePool) {
        let permit = match &self.semaphore {
            Some(sem) => match sem.clone().try_acquire_owned() {
                Ok(p) => Some(p),
                Err(_) => {
                    tracing::warn!(peer = %peer, "Connection rejected: limit reached");
                    return;
                }
            },
            None => None,
        };

        if self.config.tcp_nodelay {
            let _ = socket.set_nodelay(true);
        }

        let info = Arc::new(ConnInfo::new(peer, Protocol::Relay));
        self.metrics.inc(&self.metrics.conns_total);
        self.metrics.inc(&self.metrics.conns_current);
        tracing::debug!(conn = %info.id, peer = %peer, "New connection");

        let config = self.config.clone();
        let manager = self.manager.clone();
        let registry = self.registry.clone();
        let metrics = self.metrics.clone();

        pool.add(move |token| async move {
            registry.register(info.clone(), token.clone());

            if let Err(e) = run_conn(socket, &info, &config, &manager, &token).await {
                tracing::debug!(conn = %info.id, error = %e, "Connection error");
            }

            info.set_phase(ConnPhase::Closed);
            registry.unregister(info.id);
            metrics.dec(&metrics.conns_current);
            tracing::debug!(conn = %info.id, "Connection closed");
            drop(permit);
        });
    }
}

async fn run_conn(
    socket: TcpStream,
    info: &Arc<ConnInfo>,
    config: &ServerConfig,
    manager: &PathManagerHandle,
    token: &CancellationToken,
) -> Result<()> {
    let (mut rd, mut wr) = socket.into_split();

    let hello = match timeout(config.handshake_timeout, proto::read_message(&mut rd)).await {
        Err(_) => return Err(RelayError::Timeout),
        Ok(msg) => match msg? {
            Message::Hello(h) => h,
            _ => {
                return refuse(&mut wr, "expected hello").await;
            }
        },
    };

    let creds = Credentials {
        user: hello.user.clone(),
        pass: hello.pass.clone(),
        query: hello.query.clone(),
        ip: info.remote.ip(),
    };
    let ident = SessionIdent {
        id: info.id,
        protocol: Protocol::Relay,
        created: info.created,
    };

    match hello.role {
        WireRole::Publish => {
            run_publisher(&mut rd, &mut wr, &hello, ident, creds, info, config, manager, token)
                .await
        }
        WireRole::Read => {
            run_reader(&mut wr, &hello, ident, creds, info, config, manager, token).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_publisher(
    rd: &mut OwnedReadHalf,
    wr: &mut OwnedWriteHalf,
    hello: &Hello,
    ident: SessionIdent,
    creds: Credentials,
    info: &Arc<ConnInfo>,
    config: &ServerConfig,
    manager: &PathManagerHandle,
    token: &CancellationToken,
) -> Result<()> {
    let provided = creds.provided();
    let session = tokio::select! {
        _ = token.cancelled() => return Err(RelayError::Terminated),
        res = manager.attach_publisher(&hello.path, ident, creds) => match res {
            Ok(s) => s,
            Err(e) => return refuse(wr, &deny_reason(&e, provided)).await,
        },
    };
    info.set_phase(ConnPhase::Authorized);
    proto::write_message(wr, &Message::HelloOk).await?;

    // Track declaration must follow promptly.
    let tracks = match timeout(config.read_timeout, proto::read_message(rd)).await {
        Err(_) => {
            session.remove().await;
            return Err(RelayError::Timeout);
        }
        Ok(msg) => match msg {
            Ok(Message::Tracks(t)) => t,
            Ok(_) => {
                session.remove().await;
                return refuse(wr, "expected tracks").await;
            }
            Err(e) => {
                session.remove().await;
                return Err(e);
            }
        },
    };

    let stream = match session.record(tracks).await {
        Ok(s) => s,
        Err(e) => {
            let reason = e.to_string();
            session.remove().await;
            return refuse(wr, &reason).await;
        }
    };
    info.set_phase(ConnPhase::Publisher);
    proto::write_message(wr, &Message::TracksOk).await?;
    tracing::info!(conn = %info.id, path = %hello.path, "Publishing");

    let mut last_dts: Vec<Option<i64>> = vec![None; stream.tracks().len()];
    let result = loop {
        let msg = tokio::select! {
            _ = token.cancelled() => break Ok(()),
            read = timeout(config.read_timeout, proto::read_message(rd)) => match read {
                Err(_) => break Err(RelayError::Timeout),
                Ok(msg) => msg,
            },
        };
        match msg {
            Ok(Message::Frame(frame)) => {
                if frame.track >= last_dts.len() {
                    break Err(RelayError::Protocol(format!(
                        "frame for unknown track {}",
                        frame.track
                    )));
                }
                // Monotonically decreasing DTS is a publisher fault.
                if last_dts[frame.track].is_some_and(|last| frame.dts < last) {
                    break Err(RelayError::Protocol("non-monotonic DTS".into()));
                }
                last_dts[frame.track] = Some(frame.dts);
                info.add_bytes_received(frame.payload.len() as u64 + 19);
                stream.write_frame(frame);
            }
            Ok(Message::Terminate { .. }) => break Ok(()),
            Ok(_) => break Err(RelayError::Protocol("unexpected message".into())),
            Err(e) => break Err(e),
        }
    };

    if let Err(RelayError::Protocol(reason)) = &result {
        let _ = proto::write_message(wr, &Message::Error { error: reason.clone() }).await;
    }
    session.remove().await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_reader(
    wr: &mut OwnedWriteHalf,
    hello: &Hello,
    ident: SessionIdent,
    creds: Credentials,
    info: &Arc<ConnInfo>,
    config: &ServerConfig,
    manager: &PathManagerHandle,
    token: &CancellationToken,
) -> Result<()> {
    let provided = creds.provided();
    // May park on an on-demand path; bounded by the path's own startup
    // deadline and our token.
    let session = tokio::select! {
        _ = token.cancelled() => return Err(RelayError::Terminated),
        res = manager.attach_reader(&hello.path, ident, creds) => match res {
            Ok(s) => s,
            Err(e) => return refuse(wr, &deny_reason(&e, provided)).await,
        },
    };
    info.set_phase(ConnPhase::Reader);
    proto::write_message(wr, &Message::HelloOk).await?;
    proto::write_message(wr, &Message::Tracks(session.tracks().to_vec())).await?;
    tracing::info!(conn = %info.id, path = %hello.path, "Reading");

    let result = loop {
        let item = tokio::select! {
            _ = token.cancelled() => {
                let _ = proto::write_message(wr, &Message::Terminate {
                    reason: RelayError::Terminated.to_string(),
                }).await;
                break Ok(());
            }
            item = session.handle().next() => item,
        };
        match item {
            crate::stream::ReaderItem::Frame(frame) => {
                // A socket slower than the write deadline is cut loose;
                // slowness never propagates upstream.
                match timeout(
                    config.write_timeout,
                    proto::write_message(wr, &Message::Frame(frame)),
                )
                .await
                {
                    Err(_) => break Err(RelayError::Timeout),
                    Ok(Err(e)) => break Err(e),
                    Ok(Ok(n)) => info.add_bytes_sent(n),
                }
            }
            crate::stream::ReaderItem::Terminated(reason) => {
                let _ = proto::write_message(wr, &Message::Terminate {
                    reason: reason.to_string(),
                })
                .await;
                break Ok(());
            }
        }
    };

    session.detach().await;
    result
}

/// Map an attach failure to the reason sent on the wire. Denials with
/// credentials present are indistinguishable from a missing path.
fn deny_reason(err: &RelayError, creds_provided: bool) -> String {
    match err {
        RelayError::Authentication if !creds_provided => "authentication required".into(),
        RelayError::Authentication => RelayError::PathNotFound.to_string(),
        other => other.to_string(),
    }
}

async fn refuse(wr: &mut OwnedWriteHalf, reason: &str) -> Result<()> {
    let _ = proto::write_message(wr, &Message::Error { error: reason.into() }).await;
    Ok(())
}
