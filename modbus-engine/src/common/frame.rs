use std::sync::atomic::{AtomicU16, Ordering};

use scursor::ReadCursor;

use crate::common::buffer::ReadBuffer;
use crate::common::function::FunctionCode;
use crate::common::phys::PhysReader;
use crate::decode::DecodeLevel;
use crate::error::{AduParseError, InvalidRequest, RequestError};
use crate::pdu::{decode_request, decode_response, raw_message, ModbusMessage, PduDisplay};
use crate::serial::frame::RtuParser;
use crate::tcp::frame::MbapParser;
use crate::types::UnitId;

pub(crate) mod constants {
    /// largest PDU (function code included) that fits in any ADU
    pub(crate) const MAX_ADU_LENGTH: usize = 253;
}

/// Hands out transaction ids for one client
///
/// Ids run from 1 to 65535 and then wrap back to 1; 0 is never issued.
#[derive(Debug)]
pub(crate) struct TxIdGenerator {
    next: AtomicU16,
}

impl TxIdGenerator {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU16::new(1),
        }
    }

    pub(crate) fn next(&self) -> u16 {
        let advance = |current: u16| {
            Some(if current == u16::MAX {
                1
            } else {
                current + 1
            })
        };
        // the closure never returns None, so both arms carry the previous value
        match self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, advance)
        {
            Ok(x) | Err(x) => x,
        }
    }
}

impl Default for TxIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// What the ADU carried besides the PDU
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FrameHeader {
    Tcp { tx_id: u16 },
    Rtu { crc: u16, expected: u16 },
}

impl FrameHeader {
    /// The CRC check of an RTU frame as a validation result, always Ok on TCP
    pub(crate) fn integrity(&self) -> Result<(), InvalidRequest> {
        match *self {
            FrameHeader::Rtu { crc, expected } if crc != expected => {
                Err(InvalidRequest::CrcMismatch {
                    received: crc,
                    expected,
                })
            }
            _ => Ok(()),
        }
    }
}

/// A complete ADU read off the stream whose PDU has not been interpreted yet
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) unit_id: UnitId,
    pub(crate) header: FrameHeader,
    pdu: Vec<u8>,
}

impl Frame {
    pub(crate) fn new(unit_id: UnitId, header: FrameHeader, pdu: &[u8]) -> Self {
        Self {
            unit_id,
            header,
            pdu: pdu.to_vec(),
        }
    }

    /// PDU bytes, function code included
    pub(crate) fn pdu(&self) -> &[u8] {
        &self.pdu
    }

    pub(crate) fn integrity(&self) -> Result<(), InvalidRequest> {
        self.header.integrity()
    }

    /// Interpret the PDU as a request
    ///
    /// Functions without a structured codec are carried as raw bytes.
    pub(crate) fn decode_request(&self, level: DecodeLevel) -> Result<ModbusMessage, AduParseError> {
        let mut cursor = ReadCursor::new(&self.pdu);
        let function = cursor.read_u8()?;
        let msg = match decode_request(self.unit_id, function, &mut cursor)? {
            Some(msg) => msg,
            None => self.raw(function),
        };
        log_rx(&msg, level);
        Ok(msg)
    }

    /// Interpret the PDU as the response to `request`
    pub(crate) fn decode_response(
        &self,
        request: &ModbusMessage,
        level: DecodeLevel,
    ) -> Result<ModbusMessage, AduParseError> {
        let mut cursor = ReadCursor::new(&self.pdu);
        let function = cursor.read_u8()?;
        let msg = match decode_response(self.unit_id, function, request, &mut cursor)? {
            Some(msg) => msg,
            None => self.raw(function),
        };
        log_rx(&msg, level);
        Ok(msg)
    }

    fn raw(&self, function: u8) -> ModbusMessage {
        let data = self.pdu.get(1..).unwrap_or_default().to_vec();
        raw_message(self.unit_id, FunctionCode::from(function), data)
    }
}

fn log_rx(msg: &ModbusMessage, level: DecodeLevel) {
    if level.pdu.enabled() {
        tracing::info!("PDU RX - {}", PduDisplay::new(level.pdu, msg));
    }
}

pub(crate) fn log_tx(msg: &ModbusMessage, level: DecodeLevel) {
    if level.pdu.enabled() {
        tracing::info!("PDU TX - {}", PduDisplay::new(level.pdu, msg));
    }
}

enum FrameParser {
    Tcp(MbapParser),
    Rtu(RtuParser),
}

impl FrameParser {
    fn max_frame_size(&self) -> usize {
        match self {
            FrameParser::Tcp(_) => crate::tcp::frame::constants::MAX_FRAME_LENGTH,
            FrameParser::Rtu(_) => crate::serial::frame::constants::MAX_FRAME_LENGTH,
        }
    }

    fn parse(
        &mut self,
        buffer: &mut ReadBuffer,
        level: DecodeLevel,
    ) -> Result<Option<Frame>, RequestError> {
        match self {
            FrameParser::Tcp(x) => x.parse(buffer, level.adu),
            FrameParser::Rtu(x) => x.parse(buffer, level.adu),
        }
    }
}

/// Reassembles frames from a stream, keeping partial frames across reads
pub(crate) struct FramedReader {
    parser: FrameParser,
    buffer: ReadBuffer,
}

impl FramedReader {
    pub(crate) fn tcp() -> Self {
        Self::new(FrameParser::Tcp(MbapParser::new()))
    }

    pub(crate) fn rtu_request() -> Self {
        Self::new(FrameParser::Rtu(RtuParser::new_request_parser()))
    }

    pub(crate) fn rtu_response() -> Self {
        Self::new(FrameParser::Rtu(RtuParser::new_response_parser()))
    }

    fn new(parser: FrameParser) -> Self {
        let size = parser.max_frame_size();
        Self {
            parser,
            buffer: ReadBuffer::new(size),
        }
    }

    /// Number of bytes received but not yet assembled into a frame
    pub(crate) fn bytes_available(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) async fn next_frame(
        &mut self,
        io: &mut PhysReader,
        level: DecodeLevel,
    ) -> Result<Frame, RequestError> {
        loop {
            match self.parser.parse(&mut self.buffer, level)? {
                Some(frame) => return Ok(frame),
                None => {
                    self.buffer.read_some(io, level.physical).await?;
                }
            }
        }
    }
}
