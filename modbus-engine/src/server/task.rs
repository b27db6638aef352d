use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::client::Framing;
use crate::common::frame::{Frame, FrameHeader, FramedReader};
use crate::common::function::FunctionCode;
use crate::common::phys::{Connector, PhysLayer, PhysWriter};
use crate::decode::DecodeLevel;
use crate::error::{RequestError, Shutdown};
use crate::exception::ExceptionCode;
use crate::pdu::exception_response;
use crate::serial::frame::format_rtu;
use crate::server::handler::{Outgoing, ReplySink, RequestHandler};
use crate::tcp::frame::format_mbap;
use crate::types::UnitId;

/// Serves requests arriving on one connection (a TCP session or the serial line)
pub(crate) struct SessionTask {
    framing: Framing,
    handler: Arc<dyn RequestHandler>,
    decode: DecodeLevel,
    shutdown: mpsc::Receiver<()>,
}

impl SessionTask {
    pub(crate) fn new(
        framing: Framing,
        handler: Arc<dyn RequestHandler>,
        decode: DecodeLevel,
        shutdown: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            framing,
            handler,
            decode,
            shutdown,
        }
    }

    /// Open the line with `connector` unless shutdown is requested first
    pub(crate) async fn open(
        &mut self,
        connector: &dyn Connector,
    ) -> Result<std::io::Result<PhysLayer>, Shutdown> {
        tokio::select! {
            _ = self.shutdown.recv() => Err(Shutdown),
            result = connector.connect() => Ok(result),
        }
    }

    pub(crate) async fn sleep_for(&mut self, duration: Duration) -> Result<(), Shutdown> {
        tokio::select! {
            _ = self.shutdown.recv() => Err(Shutdown),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Run until the connection fails or shutdown is requested
    pub(crate) async fn run(&mut self, phys: PhysLayer) -> RequestError {
        let (mut io, mut writer) = phys.split();
        let mut reader = match self.framing {
            Framing::Tcp => FramedReader::tcp(),
            Framing::Rtu => FramedReader::rtu_request(),
        };
        let (tx, mut replies) = mpsc::unbounded_channel();

        let end = loop {
            tokio::select! {
                _ = self.shutdown.recv() => break RequestError::Shutdown,
                frame = reader.next_frame(&mut io, self.decode) => match frame {
                    Ok(frame) => self.dispatch(frame, &tx),
                    Err(err) => break err,
                },
                Some(outgoing) = replies.recv() => {
                    if let Err(err) = self.write(&mut writer, outgoing).await {
                        break err.into();
                    }
                }
            }
        };

        writer.shutdown().await;
        end
    }

    fn dispatch(&self, frame: Frame, tx: &mpsc::UnboundedSender<Outgoing>) {
        // delivered anyway, the handler sees the mismatch on its reply sink
        if let Err(err) = frame.integrity() {
            tracing::warn!("request from unit {}: {}", frame.unit_id, err);
        }

        let function = match frame.pdu().first() {
            Some(x) => *x,
            None => {
                tracing::warn!("ignoring request without a function code");
                return;
            }
        };

        if let Err(err) = FunctionCode::strict(function) {
            tracing::warn!("ignoring request: {}", err);
            return;
        }

        // nobody answers a broadcast on a serial line
        let replies = match self.framing {
            Framing::Rtu if frame.unit_id == UnitId::broadcast() => None,
            _ => Some(tx.clone()),
        };

        match frame.decode_request(self.decode) {
            Ok(request) => {
                let reply = ReplySink::new(&request, frame.header, replies);
                self.handler.handle(request, reply);
            }
            Err(err) => {
                tracing::warn!("malformed request: {}", err);
                if let Some(tx) = replies {
                    let _ = tx.send(Outgoing {
                        header: frame.header,
                        message: exception_response(
                            frame.unit_id,
                            FunctionCode::from(function),
                            ExceptionCode::IllegalDataValue,
                        ),
                    });
                }
            }
        }
    }

    async fn write(
        &self,
        writer: &mut PhysWriter,
        outgoing: Outgoing,
    ) -> Result<(), std::io::Error> {
        let bytes = match outgoing.header {
            FrameHeader::Tcp { tx_id } => format_mbap(tx_id, &outgoing.message, self.decode),
            FrameHeader::Rtu { .. } => format_rtu(&outgoing.message, self.decode),
        };

        match bytes {
            Ok(bytes) => writer.write(&bytes, self.decode.physical).await,
            Err(err) => {
                tracing::warn!("unable to send response: {}", err);
                Ok(())
            }
        }
    }
}
