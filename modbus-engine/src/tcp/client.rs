use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::common::phys::{ConnectFuture, Connector, PhysLayer};

/// Connects to a Modbus/TCP server
#[derive(Clone, Debug)]
pub struct TcpConnector {
    addr: SocketAddr,
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Connector for the server at `addr`
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: None,
        }
    }

    /// Give up on a connection attempt after `timeout`
    pub fn with_connect_timeout(self, timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(timeout),
            ..self
        }
    }

    /// Address of the remote server
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn open(&self) -> std::io::Result<PhysLayer> {
        let socket = match self.connect_timeout {
            None => TcpStream::connect(self.addr).await?,
            Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect(self.addr))
                .await
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??,
        };

        if let Err(err) = socket.set_nodelay(true) {
            tracing::warn!("unable to enable TCP_NODELAY: {}", err);
        }

        tracing::info!("connected to: {}", self.addr);
        Ok(PhysLayer::new_tcp(socket))
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(self.open())
    }
}
