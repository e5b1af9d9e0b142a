use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{self, NICKNAME_PROMPT, ProtocolError},
    registry::{DEFAULT_DELIVERY_TIMEOUT, NicknameTaken, Registry, RouteReport},
};

pub type TcpRegistry = Registry<OwnedWriteHalf>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Connections served at once; `None` means no cap.
    pub max_connections: Option<usize>,
    pub delivery_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

pub struct ChatServer {
    listener: TcpListener,
    registry: Arc<TcpRegistry>,
    connection_limit: Option<Arc<Semaphore>>,
}

impl ChatServer {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new(config.delivery_timeout));
        Self::with_registry(listener, registry, config.max_connections)
    }

    /// Serves an existing registry, e.g. one shared with other components.
    pub fn with_registry(
        listener: TcpListener,
        registry: Arc<TcpRegistry>,
        max_connections: Option<usize>,
    ) -> Self {
        Self {
            listener,
            registry,
            connection_limit: max_connections.map(|limit| Arc::new(Semaphore::new(limit))),
        }
    }

    pub async fn bind(address: &str, config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<TcpRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer {
            listener,
            registry,
            connection_limit,
        } = self;
        tokio::pin!(shutdown);

        loop {
            let next_connection = async {
                let permit = acquire_slot(connection_limit.as_ref()).await;
                (listener.accept().await, permit)
            };

            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                (accept_result, permit) = next_connection => {
                    handle_accept_result(accept_result, &registry, permit);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn acquire_slot(limit: Option<&Arc<Semaphore>>) -> Option<OwnedSemaphorePermit> {
    match limit {
        // The semaphore is never closed, so acquiring only waits.
        Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
        None => None,
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<TcpRegistry>,
    permit: Option<OwnedSemaphorePermit>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, registry, permit),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<TcpRegistry>,
    permit: Option<OwnedSemaphorePermit>,
) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        let _permit = permit;
        if let Err(err) = handle_connection(stream, peer, registry).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<TcpRegistry>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let Some(nickname) = perform_handshake(registry.as_ref(), &mut reader, writer)
        .await
        .context("nickname handshake failed")?
    else {
        debug!(%peer, "connection closed before a nickname was registered");
        return Ok(());
    };
    info!(%peer, %nickname, "client joined");

    let result = serve_session(registry.as_ref(), &mut reader, &nickname).await;
    info!(%peer, %nickname, "client disconnected");

    result.with_context(|| format!("session for {nickname} failed"))
}

/// Prompts until the peer picks a free, non-empty nickname. On success the
/// writer belongs to the registry; `None` means the peer hung up first.
pub async fn perform_handshake<R, W>(
    registry: &Registry<W>,
    reader: &mut R,
    mut writer: W,
) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    loop {
        protocol::write_line(&mut writer, NICKNAME_PROMPT).await?;
        let Some(nickname) = protocol::read_line(reader).await? else {
            return Ok(None);
        };

        if nickname.is_empty() {
            let notice = ProtocolError::EmptyNickname.to_string();
            protocol::write_line(&mut writer, &notice).await?;
            continue;
        }

        match registry.register(&nickname, writer).await {
            Ok(()) => return Ok(Some(nickname)),
            Err(NicknameTaken { sink }) => {
                debug!(%nickname, "nickname already taken");
                writer = sink;
                let notice = ProtocolError::NicknameTaken.to_string();
                protocol::write_line(&mut writer, &notice).await?;
            }
        }
    }
}

/// Runs the session of a registered peer and deregisters it however the
/// session ends, read errors included.
pub async fn serve_session<R, W>(
    registry: &Registry<W>,
    reader: &mut R,
    nickname: &str,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let result = run_client_session(registry, reader, nickname).await;
    registry.deregister(nickname).await;
    result
}

/// Routes every line from a registered peer until it disconnects.
pub async fn run_client_session<R, W>(
    registry: &Registry<W>,
    reader: &mut R,
    nickname: &str,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    while let Some(line) = protocol::read_line(reader).await? {
        let report = registry.route(nickname, &line).await;
        log_delivery_failures(nickname, report);
    }
    Ok(())
}

fn log_delivery_failures(sender: &str, report: RouteReport) {
    for failure in report.failures {
        warn!(
            %sender,
            recipient = %failure.recipient,
            error = %failure.error,
            "failed to deliver message"
        );
    }
}
