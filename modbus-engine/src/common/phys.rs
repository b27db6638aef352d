use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;

use crate::common::bytes::format_bytes;
use crate::decode::PhysDecodeLevel;

/// Any byte stream the protocol can run over
pub trait PhysStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> PhysStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

type BoxedStream = Box<dyn PhysStream>;

/// Future returned by [`Connector::connect`]
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = std::io::Result<PhysLayer>> + Send + 'a>>;

/// Opens the transport a client or server runs over
///
/// Called again every time the connection has to be re-established.
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection
    fn connect(&self) -> ConnectFuture<'_>;
}

/// Timing applied around every write on a serial line
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LineTiming {
    /// minimum silence between the end of one frame and the start of the next
    pub inter_frame: Duration,
    /// delay after asserting the transmitter and before writing (RS-485)
    pub before_send: Duration,
    /// delay after writing before releasing the transmitter (RS-485)
    pub after_send: Duration,
}

/// An established connection (TCP socket, serial port or any other byte stream)
///
/// This is what a [`Connector`](crate::Connector) produces. Closing the
/// connection is dropping it.
pub struct PhysLayer {
    kind: &'static str,
    stream: BoxedStream,
    timing: Option<LineTiming>,
}

pub(crate) struct PhysReader {
    inner: ReadHalf<BoxedStream>,
}

pub(crate) struct PhysWriter {
    inner: WriteHalf<BoxedStream>,
    timing: Option<LineTiming>,
    last_write: Option<Instant>,
}

impl std::fmt::Debug for PhysLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.kind)
    }
}

impl PhysLayer {
    /// Wrap any byte stream
    pub fn new<S>(stream: S) -> Self
    where
        S: PhysStream + 'static,
    {
        Self {
            kind: "Stream",
            stream: Box::new(stream),
            timing: None,
        }
    }

    /// Wrap a TCP socket
    pub fn new_tcp(socket: tokio::net::TcpStream) -> Self {
        Self {
            kind: "Tcp",
            ..Self::new(socket)
        }
    }

    /// Wrap a serial port, applying `timing` around every write
    #[cfg(feature = "serial")]
    pub fn new_serial(port: tokio_serial::SerialStream, timing: LineTiming) -> Self {
        Self {
            kind: "Serial",
            ..Self::new(port)
        }
        .with_timing(timing)
    }

    /// Apply serial line timing around every write
    pub fn with_timing(self, timing: LineTiming) -> Self {
        Self {
            timing: Some(timing),
            ..self
        }
    }

    pub(crate) fn split(self) -> (PhysReader, PhysWriter) {
        let (read, write) = tokio::io::split(self.stream);
        (
            PhysReader { inner: read },
            PhysWriter {
                inner: write,
                timing: self.timing,
                last_write: None,
            },
        )
    }
}

impl PhysReader {
    pub(crate) async fn read(
        &mut self,
        buffer: &mut [u8],
        decode_level: PhysDecodeLevel,
    ) -> Result<usize, std::io::Error> {
        let length = self.inner.read(buffer).await?;

        if decode_level.enabled() {
            if let Some(x) = buffer.get(0..length) {
                tracing::info!("PHYS RX - {}", PhysDisplay::new(decode_level, x))
            }
        }

        Ok(length)
    }
}

impl PhysWriter {
    pub(crate) async fn write(
        &mut self,
        data: &[u8],
        decode_level: PhysDecodeLevel,
    ) -> Result<(), std::io::Error> {
        if let Some(timing) = self.timing {
            if let Some(last) = self.last_write {
                tokio::time::sleep_until(last + timing.inter_frame).await;
            }
            if !timing.before_send.is_zero() {
                tokio::time::sleep(timing.before_send).await;
            }
        }

        if decode_level.enabled() {
            tracing::info!("PHYS TX - {}", PhysDisplay::new(decode_level, data));
        }

        self.inner.write_all(data).await?;
        self.inner.flush().await?;

        if let Some(timing) = self.timing {
            if !timing.after_send.is_zero() {
                tokio::time::sleep(timing.after_send).await;
            }
            self.last_write = Some(Instant::now());
        }

        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) {
        // the peer may already be gone
        let _ = self.inner.shutdown().await;
    }
}

/// Modbus RTU requires 3.5 character times of silence between frames
///
/// Above 19200 baud the silence is fixed at 1.75 ms.
pub(crate) fn inter_frame_delay(baud_rate: u32) -> Duration {
    // 1 start, 8 data, 1 parity or stop, 1 stop
    const NUM_BITS_IN_CHAR: u64 = 11;
    const MAX_BAUD_RATE: u32 = 19200;
    const MIN_DELAY: Duration = Duration::from_micros(1750);

    match baud_rate {
        0 => MIN_DELAY,
        x if x <= MAX_BAUD_RATE => {
            let character_time = Duration::from_secs(NUM_BITS_IN_CHAR) / x;
            35 * character_time / 10
        }
        _ => MIN_DELAY,
    }
}

pub(crate) struct PhysDisplay<'a> {
    level: PhysDecodeLevel,
    data: &'a [u8],
}

impl<'a> PhysDisplay<'a> {
    pub(crate) fn new(level: PhysDecodeLevel, data: &'a [u8]) -> Self {
        PhysDisplay { level, data }
    }
}

impl std::fmt::Display for PhysDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} bytes", self.data.len())?;
        if self.level.data_enabled() {
            format_bytes(f, self.data)?;
        }
        Ok(())
    }
}
