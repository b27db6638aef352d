use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::client::Framing;
use crate::common::phys::Connector;
use crate::constants::defaults;
use crate::decode::DecodeLevel;
use crate::retry::RetryStrategy;
use crate::serial::server::RtuServerTask;
use crate::tcp::server::TcpServerTask;

/// server handling
pub(crate) mod handler;
pub(crate) mod task;

pub use handler::{ConnectionListener, ReplySink, RequestHandler};

/// Server configuration
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerConfig {
    /// Maximum number of concurrent TCP sessions. When exceeded, the oldest session is closed.
    pub max_sessions: usize,
    /// Protocol decoding
    pub decode: DecodeLevel,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: defaults::MAX_SESSIONS,
            decode: DecodeLevel::default(),
        }
    }
}

impl ServerConfig {
    /// Set the maximum number of concurrent TCP sessions
    pub fn with_max_sessions(self, max_sessions: usize) -> Self {
        Self {
            max_sessions,
            ..self
        }
    }

    /// Set the decode level
    pub fn with_decode_level(self, decode: DecodeLevel) -> Self {
        Self { decode, ..self }
    }
}

/// A handle to the server async task. The task is shutdown when the handle is dropped.
#[derive(Debug)]
pub struct ServerHandle {
    _tx: mpsc::Sender<()>,
    local_addr: Option<SocketAddr>,
}

impl ServerHandle {
    /// Address the TCP server is bound to, useful when binding port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// Spawns a TCP server task onto the runtime
///
/// Each incoming connection spawns a new session task that hands decoded
/// requests to `handler`.
pub async fn spawn_tcp_server<H>(
    addr: SocketAddr,
    handler: H,
    config: ServerConfig,
) -> Result<ServerHandle, std::io::Error>
where
    H: RequestHandler,
{
    spawn_tcp_server_impl(addr, Arc::new(handler), None, config).await
}

/// Spawns a TCP server task that reports connections to `listener`
///
/// The listener may veto a new connection by returning false from
/// [`ConnectionListener::on_connect`].
pub async fn spawn_tcp_server_with_listener<H, L>(
    addr: SocketAddr,
    handler: H,
    listener: L,
    config: ServerConfig,
) -> Result<ServerHandle, std::io::Error>
where
    H: RequestHandler,
    L: ConnectionListener,
{
    spawn_tcp_server_impl(addr, Arc::new(handler), Some(Arc::new(listener)), config).await
}

async fn spawn_tcp_server_impl(
    addr: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    connections: Option<Arc<dyn ConnectionListener>>,
    config: ServerConfig,
) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("listening on: {}", local_addr);

    let (tx, rx) = mpsc::channel(1);
    let mut task = TcpServerTask::new(
        config.max_sessions,
        listener,
        handler,
        connections,
        config.decode,
    );
    tokio::spawn(
        async move { task.run(rx).await }
            .instrument(tracing::info_span!("Modbus-Server-TCP", listen = ?local_addr)),
    );

    Ok(ServerHandle {
        _tx: tx,
        local_addr: Some(local_addr),
    })
}

/// Spawns an RTU server task onto the runtime
///
/// The line is opened with `connector` and re-opened according to `retry`
/// whenever it fails. This method can only be called from within the runtime context.
pub fn spawn_rtu_server<H, C>(
    connector: C,
    retry: Box<dyn RetryStrategy>,
    handler: H,
    config: ServerConfig,
) -> ServerHandle
where
    H: RequestHandler,
    C: Connector,
{
    let (tx, rx) = mpsc::channel(1);
    let mut task = RtuServerTask {
        connector: Arc::new(connector),
        retry,
        session: task::SessionTask::new(Framing::Rtu, Arc::new(handler), config.decode, rx),
    };
    tokio::spawn(
        async move {
            task.run().await;
        }
        .instrument(tracing::info_span!("Modbus-Server-RTU")),
    );

    ServerHandle {
        _tx: tx,
        local_addr: None,
    }
}

/// Spawns an RTU server on the serial port at `path`
#[cfg(feature = "serial")]
pub fn spawn_rtu_server_on_port<H>(
    path: &str,
    settings: crate::serial::SerialSettings,
    retry: Box<dyn RetryStrategy>,
    handler: H,
    config: ServerConfig,
) -> ServerHandle
where
    H: RequestHandler,
{
    spawn_rtu_server(
        crate::serial::SerialConnector::new(path, settings),
        retry,
        handler,
        config,
    )
}
