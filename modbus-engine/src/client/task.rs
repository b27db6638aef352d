use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::Instrument;

use crate::client::pending::{Received, ReplyReceiver};
use crate::client::{ClientConfig, ConnectionState, Framing, Shared};
use crate::common::frame::{Frame, FrameHeader, FramedReader};
use crate::common::phys::{Connector, PhysLayer, PhysWriter};
use crate::error::RequestError;
use crate::pdu::ModbusMessage;
use crate::retry::RetryStrategy;
use crate::serial::frame::format_rtu;
use crate::tcp::frame::format_mbap;

/// Requests queued ahead of the write task
const QUEUE_DEPTH: usize = 16;

pub(crate) type WrittenSender = oneshot::Sender<Result<Registered, RequestError>>;

/// A request waiting to be written, and where to report that it was
pub(crate) struct Queued {
    pub(crate) request: ModbusMessage,
    pub(crate) written: WrittenSender,
}

/// A request that is on the wire and has an entry in the pending table
pub(crate) struct Registered {
    pub(crate) key: u16,
    pub(crate) seq: u64,
    pub(crate) rx: ReplyReceiver,
}

enum Written {
    Sent(Registered),
    /// the frame could not be built, the connection is unaffected
    Rejected(RequestError),
    /// the caller went away before the frame was written
    Abandoned,
}

/// Owns the write half of a connection and writes queued requests one at a time
struct WriteTask {
    framing: Framing,
    config: ClientConfig,
    shared: Arc<Shared>,
    phys: PhysWriter,
    requests: mpsc::Receiver<Queued>,
    last_send: Option<Instant>,
}

impl WriteTask {
    /// Runs until told to close or a write fails, then fails everything still queued
    async fn run(mut self, mut closing: oneshot::Receiver<RequestError>) -> RequestError {
        let end = loop {
            let queued = tokio::select! {
                reason = &mut closing => break reason.unwrap_or(RequestError::Shutdown),
                queued = self.requests.recv() => match queued {
                    Some(queued) => queued,
                    None => break RequestError::Shutdown,
                },
            };
            if queued.written.is_closed() {
                continue;
            }

            let Queued { request, written } = queued;
            let result = tokio::select! {
                reason = &mut closing => Err(reason.unwrap_or(RequestError::Shutdown)),
                result = self.write(request, &written) => Ok(result),
            };

            match result {
                Err(reason) => {
                    let _ = written.send(Err(reason));
                    break reason;
                }
                Ok(Err(err)) => {
                    tracing::warn!("write failed: {}", err);
                    let err = RequestError::from(err);
                    let _ = written.send(Err(err));
                    break err;
                }
                Ok(Ok(Written::Sent(registered))) => {
                    if let Err(Ok(registered)) = written.send(Ok(registered)) {
                        self.shared.pending.remove(registered.key, registered.seq);
                    }
                }
                Ok(Ok(Written::Rejected(err))) => {
                    let _ = written.send(Err(err));
                }
                Ok(Ok(Written::Abandoned)) => {}
            }
        };

        self.requests.close();
        let reason = match end {
            RequestError::Shutdown => RequestError::Shutdown,
            _ => RequestError::ConnectionClosed,
        };
        while let Ok(queued) = self.requests.try_recv() {
            let _ = queued.written.send(Err(reason));
        }
        self.phys.shutdown().await;
        end
    }

    async fn write(
        &mut self,
        request: ModbusMessage,
        written: &WrittenSender,
    ) -> Result<Written, std::io::Error> {
        let slot = match self.framing {
            Framing::Tcp => None,
            Framing::Rtu => match self.shared.line.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return Ok(Written::Rejected(RequestError::Shutdown)),
            },
        };

        if let (Some(delay), Some(last)) = (self.config.min_send_delay, self.last_send) {
            tokio::time::sleep_until(last + delay).await;
        }
        if written.is_closed() {
            return Ok(Written::Abandoned);
        }

        let key = self.shared.tx_ids.next();
        let bytes = match self.framing {
            Framing::Tcp => format_mbap(key, &request, self.config.decode),
            Framing::Rtu => format_rtu(&request, self.config.decode),
        };
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(err) => return Ok(Written::Rejected(err)),
        };

        let (seq, rx) = self.shared.pending.insert(key, request, slot);
        if self.framing == Framing::Rtu {
            self.shared.pending.await_reply(key);
        }

        if let Err(err) = self.phys.write(&bytes, self.config.decode.physical).await {
            self.shared.pending.remove(key, seq);
            return Err(err);
        }
        self.last_send = Some(Instant::now());

        Ok(Written::Sent(Registered { key, seq, rx }))
    }
}

pub(crate) type Outcome = Option<Result<(), RequestError>>;

/// Why a connection ended
#[derive(Debug, PartialEq)]
enum SessionError {
    /// the stream errored or was closed by the peer
    IoError(RequestError),
    /// stop was requested
    Stopped,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SessionError::IoError(err) => write!(f, "{err}"),
            SessionError::Stopped => f.write_str("stop was requested"),
        }
    }
}

/// Connects, reads responses and reconnects until stopped
pub(crate) struct ClientTask {
    framing: Framing,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    retry: Box<dyn RetryStrategy>,
    stop: watch::Receiver<bool>,
    outcome: watch::Sender<Outcome>,
}

/// Resolves once stop is requested or the client owning the sender is gone
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

impl ClientTask {
    pub(crate) fn new(
        framing: Framing,
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        shared: Arc<Shared>,
        stop: watch::Receiver<bool>,
        outcome: watch::Sender<Outcome>,
    ) -> Self {
        let retry = config.retry_strategy();
        Self {
            framing,
            config,
            connector,
            shared,
            retry,
            stop,
            outcome,
        }
    }

    /// The first connection attempt decides what `start` returns
    fn report(&self, result: Result<(), RequestError>) {
        self.outcome.send_if_modified(|outcome| {
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(result);
            true
        });
    }

    pub(crate) async fn run(mut self) {
        self.shared.set_state(ConnectionState::Connecting);
        loop {
            let result = tokio::select! {
                _ = stopped(&mut self.stop) => break,
                result = self.connector.connect() => result,
            };

            let delay = match result {
                Err(err) => {
                    tracing::warn!("failed to connect: {}", err);
                    self.report(Err(err.into()));
                    if !self.config.auto_reconnect {
                        break;
                    }
                    self.retry.after_failed_connect()
                }
                Ok(phys) => {
                    self.retry.reset();
                    let end = self.run_connection(phys).await;
                    tracing::info!("connection ended: {}", end);
                    if end == SessionError::Stopped {
                        break;
                    }
                    if !self.config.auto_reconnect {
                        break;
                    }
                    self.retry.after_disconnect()
                }
            };

            self.shared.set_state(ConnectionState::Reconnecting);
            tracing::info!("waiting {} ms to reconnect", delay.as_millis());
            tokio::select! {
                _ = stopped(&mut self.stop) => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.shared.set_state(ConnectionState::Connecting);
        }
        // a stop may arrive before the first attempt completes
        self.report(Err(RequestError::Shutdown));
        self.shared.set_state(ConnectionState::Disconnected);
    }

    async fn run_connection(&mut self, phys: PhysLayer) -> SessionError {
        let (mut io, writer) = phys.split();
        let (requests, queue) = mpsc::channel(QUEUE_DEPTH);
        let (close, closing) = oneshot::channel();
        let writer = WriteTask {
            framing: self.framing,
            config: self.config,
            shared: self.shared.clone(),
            phys: writer,
            requests: queue,
            last_send: None,
        };
        let mut write_task = tokio::spawn(writer.run(closing).in_current_span());

        self.shared.set_requests(Some(requests));
        self.shared.set_state(ConnectionState::Connected);
        self.report(Ok(()));

        let mut reader = match self.framing {
            Framing::Tcp => FramedReader::tcp(),
            Framing::Rtu => FramedReader::rtu_response(),
        };

        let mut writer_done = false;
        let end = loop {
            let frame = tokio::select! {
                _ = stopped(&mut self.stop) => break SessionError::Stopped,
                result = &mut write_task => {
                    writer_done = true;
                    break SessionError::IoError(result.unwrap_or(RequestError::Shutdown));
                }
                frame = reader.next_frame(&mut io, self.config.decode) => frame,
            };
            match frame {
                Ok(frame) => self.handle_frame(frame),
                Err(err) => break SessionError::IoError(err),
            }
        };

        let leftover = reader.bytes_available();
        if leftover > 0 {
            tracing::debug!("discarding {} bytes of a partial frame", leftover);
        }

        self.shared.set_requests(None);
        let err = match end {
            SessionError::Stopped => RequestError::Shutdown,
            SessionError::IoError(_) => RequestError::ConnectionClosed,
        };
        if !writer_done {
            let _ = close.send(err);
            if let Err(err) = write_task.await {
                tracing::warn!("write task ended abnormally: {}", err);
            }
        }
        self.shared.pending.fail_all(err);
        self.shared.set_state(ConnectionState::Disconnected);
        end
    }

    fn handle_frame(&self, frame: Frame) {
        let pending = &self.shared.pending;
        let found = match frame.header {
            FrameHeader::Tcp { tx_id } => pending
                .peek(tx_id)
                .map(|(seq, request)| (tx_id, seq, request)),
            FrameHeader::Rtu { .. } => pending.peek_awaiting(frame.unit_id),
        };

        let (key, seq, request) = match found {
            Some(found) => found,
            None => {
                match frame.header {
                    FrameHeader::Tcp { tx_id } => tracing::warn!(
                        "discarding response with unknown transaction id: {:#06X}",
                        tx_id
                    ),
                    FrameHeader::Rtu { .. } => tracing::warn!(
                        "discarding unsolicited response from unit {}",
                        frame.unit_id
                    ),
                }
                return;
            }
        };

        let integrity = frame.integrity();
        if let Err(err) = integrity {
            tracing::warn!("response from unit {}: {}", frame.unit_id, err);
        }

        // the request stays pending, a valid frame may still follow
        let message = match frame.decode_response(&request, self.config.decode) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!("discarding bad response: {}", err);
                return;
            }
        };

        if let Some(entry) = pending.take_matching(key, seq) {
            entry.complete(Ok(Received { message, integrity }));
        }
    }
}
