use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::common::frame::FrameHeader;
use crate::common::function::FunctionCode;
use crate::error::InvalidRequest;
use crate::exception::ExceptionCode;
use crate::pdu::{exception_response, ModbusMessage};
use crate::types::UnitId;

/// Application callback invoked for every request a server decodes
///
/// The handler answers through the [`ReplySink`], either before returning or
/// later from any task or thread. Closures with the matching signature
/// implement this trait.
pub trait RequestHandler: Send + Sync + 'static {
    /// Process one request
    fn handle(&self, request: ModbusMessage, reply: ReplySink);
}

impl<F> RequestHandler for F
where
    F: Fn(ModbusMessage, ReplySink) + Send + Sync + 'static,
{
    fn handle(&self, request: ModbusMessage, reply: ReplySink) {
        self(request, reply)
    }
}

/// Told about TCP connections as they come and go
pub trait ConnectionListener: Send + Sync + 'static {
    /// A client connected from `addr`. Returning false closes the connection immediately.
    fn on_connect(&self, addr: SocketAddr) -> bool {
        let _ = addr;
        true
    }

    /// The session with `addr` ended
    fn on_disconnect(&self, addr: SocketAddr) {
        let _ = addr;
    }
}

/// A response waiting to be framed and written by the session
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub(crate) header: FrameHeader,
    pub(crate) message: ModbusMessage,
}

/// Single use channel back to the session that received a request
///
/// Dropping the sink without replying answers the request with a
/// [`ExceptionCode::ServerDeviceFailure`] exception.
///
/// RTU requests whose CRC does not match are still handed to the handler,
/// flagged through [`crc_valid`](Self::crc_valid).
#[derive(Debug)]
pub struct ReplySink {
    unit_id: UnitId,
    function: FunctionCode,
    header: FrameHeader,
    tx: Option<mpsc::UnboundedSender<Outgoing>>,
}

impl ReplySink {
    pub(crate) fn new(
        request: &ModbusMessage,
        header: FrameHeader,
        tx: Option<mpsc::UnboundedSender<Outgoing>>,
    ) -> Self {
        Self {
            unit_id: request.unit_id(),
            function: request.function(),
            header,
            tx,
        }
    }

    /// Unit the request was addressed to
    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    /// Function of the request
    pub fn function(&self) -> FunctionCode {
        self.function
    }

    /// False if the RTU frame carrying the request failed its CRC check
    pub fn crc_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// The CRC check of the frame carrying the request, always Ok on TCP
    pub fn validate(&self) -> Result<(), InvalidRequest> {
        self.header.integrity()
    }

    /// True if whatever is replied is discarded (RTU broadcast)
    pub fn is_discarded(&self) -> bool {
        self.tx.is_none()
    }

    /// Send `response` back to the client
    pub fn reply(mut self, response: ModbusMessage) {
        self.send(response);
    }

    /// Answer with an exception response
    pub fn exception(self, code: ExceptionCode) {
        let response = exception_response(self.unit_id, self.function, code);
        self.reply(response);
    }

    fn send(&mut self, message: ModbusMessage) {
        if let Some(tx) = self.tx.take() {
            let outgoing = Outgoing {
                header: self.header,
                message,
            };
            if tx.send(outgoing).is_err() {
                tracing::debug!("session closed before the reply was sent");
            }
        }
    }
}

impl Drop for ReplySink {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::warn!(
                "request {} for unit {} dropped without a reply",
                self.function,
                self.unit_id
            );
            let failure = exception_response(
                self.unit_id,
                self.function,
                ExceptionCode::ServerDeviceFailure,
            );
            self.send(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{read_coils_request, read_coils_response};

    fn sink(tx: &mpsc::UnboundedSender<Outgoing>) -> (ModbusMessage, ReplySink) {
        let request = read_coils_request(UnitId::new(3), 0, 2).unwrap();
        let sink = ReplySink::new(&request, FrameHeader::Tcp { tx_id: 9 }, Some(tx.clone()));
        (request, sink)
    }

    #[test]
    fn reply_carries_request_header() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_, sink) = sink(&tx);
        let response = read_coils_response(UnitId::new(3), 0, &[true, false]).unwrap();
        sink.reply(response.clone());

        let outgoing = rx.try_recv().unwrap();
        assert_eq!(outgoing.header, FrameHeader::Tcp { tx_id: 9 });
        assert_eq!(outgoing.message, response);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_sink_answers_with_device_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (request, sink) = sink(&tx);
        drop(sink);

        let outgoing = rx.try_recv().unwrap();
        assert_eq!(
            outgoing.message,
            request.to_exception(ExceptionCode::ServerDeviceFailure)
        );
    }

    #[test]
    fn broadcast_sink_discards_reply() {
        let request = read_coils_request(UnitId::broadcast(), 0, 1).unwrap();
        let sink = ReplySink::new(&request, FrameHeader::Rtu { crc: 0, expected: 0 }, None);
        assert!(sink.is_discarded());
        assert!(sink.crc_valid());
        sink.exception(ExceptionCode::IllegalFunction);
    }

    #[test]
    fn sink_reports_crc_mismatch() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let request = read_coils_request(UnitId::new(3), 0, 1).unwrap();
        let header = FrameHeader::Rtu {
            crc: 0xAAAA,
            expected: 0x5555,
        };
        let sink = ReplySink::new(&request, header, Some(tx));
        assert!(!sink.crc_valid());
        assert_eq!(
            sink.validate(),
            Err(InvalidRequest::CrcMismatch {
                received: 0xAAAA,
                expected: 0x5555
            })
        );
        sink.exception(ExceptionCode::IllegalFunction);
    }

    #[test]
    fn closures_are_handlers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = |request: ModbusMessage, reply: ReplySink| {
            reply.reply(request.to_exception(ExceptionCode::IllegalDataAddress))
        };
        let (request, sink) = sink(&tx);
        handler.handle(request.clone(), sink);
        assert_eq!(
            rx.try_recv().unwrap().message.error(),
            Some(ExceptionCode::IllegalDataAddress)
        );
    }
}
