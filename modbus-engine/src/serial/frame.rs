use std::time::SystemTime;

use scursor::WriteCursor;

use crate::common::buffer::ReadBuffer;
use crate::common::bytes::format_bytes;
use crate::common::crc::frame_crc;
use crate::common::frame::{log_tx, Frame, FrameHeader};
use crate::common::function::{FunctionCode, EXCEPTION_BIT};
use crate::decode::{AduDecodeLevel, DecodeLevel};
use crate::error::{AduParseError, InternalError, InvalidRequest, RequestError};
use crate::pdu::{encode_pdu, ModbusMessage};
use crate::types::UnitId;

pub(crate) mod constants {
    pub(crate) const HEADER_LENGTH: usize = 1;
    pub(crate) const FUNCTION_CODE_LENGTH: usize = 1;
    pub(crate) const CRC_LENGTH: usize = 2;
    pub(crate) const MAX_FRAME_LENGTH: usize =
        HEADER_LENGTH + crate::common::frame::constants::MAX_ADU_LENGTH + CRC_LENGTH;
}

/// A Modbus/RTU ADU: unit id, PDU and CRC16
///
/// Frames received with a bad CRC are still delivered; [`RtuFrame::is_valid`]
/// reports whether the CRC matched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtuFrame {
    timestamp: SystemTime,
    crc: u16,
    expected: u16,
    message: ModbusMessage,
}

impl RtuFrame {
    /// Frame a message, computing its CRC
    pub fn new(message: ModbusMessage) -> Result<Self, RequestError> {
        let pdu = pdu_bytes(&message)?;
        let crc = frame_crc(message.unit_id().value, &pdu);
        Ok(Self {
            timestamp: SystemTime::now(),
            crc,
            expected: crc,
            message,
        })
    }

    fn received(frame: &Frame, message: ModbusMessage) -> Self {
        let (crc, expected) = match frame.header {
            FrameHeader::Rtu { crc, expected } => (crc, expected),
            FrameHeader::Tcp { .. } => (0, 0),
        };
        Self {
            timestamp: SystemTime::now(),
            crc,
            expected,
            message,
        }
    }

    /// When the frame was built or received
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// CRC carried by the frame
    pub fn crc(&self) -> u16 {
        self.crc
    }

    /// The unit id and PDU
    pub fn message(&self) -> &ModbusMessage {
        &self.message
    }

    /// Take the message out of the frame
    pub fn into_message(self) -> ModbusMessage {
        self.message
    }

    /// True if the CRC matches the unit id and PDU
    pub fn is_valid(&self) -> bool {
        self.crc == self.expected
    }

    /// Turn a CRC mismatch into an error
    pub fn validate(&self) -> Result<(), InvalidRequest> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(InvalidRequest::CrcMismatch {
                received: self.crc,
                expected: self.expected,
            })
        }
    }

    /// Serialize the frame to its wire representation
    pub fn encode(&self) -> Result<Vec<u8>, RequestError> {
        format_rtu(&self.message, DecodeLevel::nothing())
    }

    /// Parse a complete request frame
    pub fn decode_request(bytes: &[u8]) -> Result<Self, RequestError> {
        let frame = split_frame(bytes)?;
        let message = frame.decode_request(DecodeLevel::nothing())?;
        Ok(Self::received(&frame, message))
    }

    /// Parse a complete response frame, using `request` for the fields the response omits
    pub fn decode_response(bytes: &[u8], request: &ModbusMessage) -> Result<Self, RequestError> {
        let frame = split_frame(bytes)?;
        let message = frame.decode_response(request, DecodeLevel::nothing())?;
        Ok(Self::received(&frame, message))
    }
}

fn split_frame(bytes: &[u8]) -> Result<Frame, RequestError> {
    let min = constants::HEADER_LENGTH + constants::FUNCTION_CODE_LENGTH + constants::CRC_LENGTH;
    if bytes.len() < min {
        return Err(AduParseError::InsufficientBytes.into());
    }

    let crc_start = bytes.len() - constants::CRC_LENGTH;
    let (unit_id, pdu, crc) = match (bytes.first(), bytes.get(1..crc_start), bytes.get(crc_start..)) {
        (Some(unit), Some(pdu), Some(&[lo, hi])) => (*unit, pdu, u16::from_le_bytes([lo, hi])),
        _ => return Err(AduParseError::InsufficientBytes.into()),
    };

    Ok(Frame::new(
        UnitId::new(unit_id),
        FrameHeader::Rtu {
            crc,
            expected: frame_crc(unit_id, pdu),
        },
        pdu,
    ))
}

fn pdu_bytes(msg: &ModbusMessage) -> Result<Vec<u8>, RequestError> {
    let mut buffer = [0u8; crate::common::frame::constants::MAX_ADU_LENGTH];
    let length = {
        let mut cursor = WriteCursor::new(&mut buffer);
        encode_pdu(msg, &mut cursor)?;
        cursor.position()
    };
    buffer
        .get(..length)
        .map(|x| x.to_vec())
        .ok_or_else(|| InternalError::AduTooBig(length).into())
}

/// Serialize `msg` as unit id, PDU and little-endian CRC
pub(crate) fn format_rtu(msg: &ModbusMessage, decode_level: DecodeLevel) -> Result<Vec<u8>, RequestError> {
    let pdu = pdu_bytes(msg)?;
    let unit_id = msg.unit_id();
    let crc = frame_crc(unit_id.value, &pdu);

    let mut frame = Vec::with_capacity(constants::MAX_FRAME_LENGTH);
    frame.push(unit_id.value);
    frame.extend_from_slice(&pdu);
    frame.extend_from_slice(&crc.to_le_bytes());

    log_tx(msg, decode_level);
    if decode_level.adu.enabled() {
        tracing::info!(
            "RTU TX - {}",
            RtuDisplay::new(decode_level.adu, unit_id, &pdu, crc)
        );
    }

    Ok(frame)
}

#[derive(Clone, Copy)]
enum ParserType {
    Request,
    Response,
}

#[derive(Clone, Copy)]
enum ParseState {
    Start,
    ReadFullBody(UnitId, usize),    // unit_id, length of rest
    ReadToOffsetForLength(UnitId, LengthField), // unit_id, where the length is found
}

#[derive(Clone, Copy)]
enum LengthField {
    /// the byte at this position after the function code holds the number of bytes that follow
    Byte(usize),
    /// the two bytes ending at this position after the function code hold the number of bytes that follow
    Word(usize),
}

#[derive(Clone, Copy)]
enum LengthMode {
    /// The length is always the same (without function code)
    Fixed(usize),
    /// The length is found in a count field
    Counted(LengthField),
    /// Unknown function code, can't determine the size
    Unknown,
}

pub(crate) struct RtuParser {
    state: ParseState,
    parser_type: ParserType,
}

impl RtuParser {
    pub(crate) fn new_request_parser() -> Self {
        Self {
            state: ParseState::Start,
            parser_type: ParserType::Request,
        }
    }

    pub(crate) fn new_response_parser() -> Self {
        Self {
            state: ParseState::Start,
            parser_type: ParserType::Response,
        }
    }

    // Returns how to calculate the length of the body
    fn length_mode(&self, function_code: u8) -> LengthMode {
        // Check exception (only valid for responses)
        if matches!(self.parser_type, ParserType::Response) && function_code & EXCEPTION_BIT != 0 {
            return LengthMode::Fixed(1);
        }

        let function_code = FunctionCode::from(function_code);

        match self.parser_type {
            ParserType::Request => match function_code {
                FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
                | FunctionCode::WriteCoil
                | FunctionCode::WriteHoldingRegister => LengthMode::Fixed(4),
                FunctionCode::WriteCoils | FunctionCode::WriteHoldingRegisters => {
                    LengthMode::Counted(LengthField::Byte(5))
                }
                FunctionCode::MaskWriteHoldingRegister => LengthMode::Fixed(6),
                FunctionCode::ReadWriteHoldingRegisters => {
                    LengthMode::Counted(LengthField::Byte(9))
                }
                FunctionCode::ReadFifoQueue => LengthMode::Fixed(2),
                _ => LengthMode::Unknown,
            },
            ParserType::Response => match function_code {
                FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
                | FunctionCode::ReadWriteHoldingRegisters => {
                    LengthMode::Counted(LengthField::Byte(1))
                }
                FunctionCode::WriteCoil
                | FunctionCode::WriteHoldingRegister
                | FunctionCode::WriteCoils
                | FunctionCode::WriteHoldingRegisters => LengthMode::Fixed(4),
                FunctionCode::MaskWriteHoldingRegister => LengthMode::Fixed(6),
                FunctionCode::ReadFifoQueue => LengthMode::Counted(LengthField::Word(2)),
                _ => LengthMode::Unknown,
            },
        }
    }

    /// throw away everything buffered and wait for the next frame
    fn resync(&mut self, cursor: &mut ReadBuffer) -> Result<Option<Frame>, RequestError> {
        cursor.clear();
        self.state = ParseState::Start;
        Ok(None)
    }

    pub(crate) fn parse(
        &mut self,
        cursor: &mut ReadBuffer,
        decode_level: AduDecodeLevel,
    ) -> Result<Option<Frame>, RequestError> {
        match self.state {
            ParseState::Start => {
                if cursor.len() < constants::HEADER_LENGTH + constants::FUNCTION_CODE_LENGTH {
                    return Ok(None);
                }

                let unit_id = UnitId::new(cursor.read_u8()?);

                if unit_id.is_rtu_reserved() {
                    tracing::warn!("unit id {} is reserved on RTU, passing it through", unit_id);
                }

                // We don't consume the function code to avoid an unecessary copy of the receive buffer later on
                let raw_function_code = cursor.peek_at(0)?;

                self.state = match self.length_mode(raw_function_code) {
                    LengthMode::Fixed(length) => ParseState::ReadFullBody(unit_id, length),
                    LengthMode::Counted(field) => ParseState::ReadToOffsetForLength(unit_id, field),
                    LengthMode::Unknown => {
                        tracing::warn!(
                            "received unknown function code ({:#04X}), discarding buffered data",
                            raw_function_code
                        );
                        return self.resync(cursor);
                    }
                };

                self.parse(cursor, decode_level)
            }
            ParseState::ReadToOffsetForLength(unit_id, field) => {
                let (offset, extra_bytes_to_read) = match field {
                    LengthField::Byte(offset) => {
                        if cursor.len() < constants::FUNCTION_CODE_LENGTH + offset {
                            return Ok(None);
                        }
                        let count = cursor.peek_at(constants::FUNCTION_CODE_LENGTH + offset - 1)?;
                        (offset, count as usize)
                    }
                    LengthField::Word(offset) => {
                        if cursor.len() < constants::FUNCTION_CODE_LENGTH + offset {
                            return Ok(None);
                        }
                        let hi = cursor.peek_at(constants::FUNCTION_CODE_LENGTH + offset - 2)?;
                        let lo = cursor.peek_at(constants::FUNCTION_CODE_LENGTH + offset - 1)?;
                        (offset, u16::from_be_bytes([hi, lo]) as usize)
                    }
                };

                self.state = ParseState::ReadFullBody(unit_id, offset + extra_bytes_to_read);
                self.parse(cursor, decode_level)
            }
            ParseState::ReadFullBody(unit_id, length) => {
                let pdu_length = constants::FUNCTION_CODE_LENGTH + length;
                if pdu_length > crate::common::frame::constants::MAX_ADU_LENGTH {
                    tracing::warn!(
                        "received frame with length ({}) that exceeds max allowed size ({}), discarding buffered data",
                        pdu_length,
                        crate::common::frame::constants::MAX_ADU_LENGTH
                    );
                    return self.resync(cursor);
                }

                if cursor.len() < pdu_length + constants::CRC_LENGTH {
                    return Ok(None);
                }

                let pdu = cursor.read(pdu_length)?.to_vec();
                let received_crc = cursor.read_u16_le()?;
                let expected_crc = frame_crc(unit_id.value, &pdu);

                if received_crc != expected_crc {
                    tracing::warn!(
                        "CRC mismatch: received {:#06X}, computed {:#06X}",
                        received_crc,
                        expected_crc
                    );
                }

                if decode_level.enabled() {
                    tracing::info!(
                        "RTU RX - {}",
                        RtuDisplay::new(decode_level, unit_id, &pdu, received_crc)
                    );
                }

                self.state = ParseState::Start;
                Ok(Some(Frame::new(
                    unit_id,
                    FrameHeader::Rtu {
                        crc: received_crc,
                        expected: expected_crc,
                    },
                    &pdu,
                )))
            }
        }
    }
}

pub(crate) struct RtuDisplay<'a> {
    level: AduDecodeLevel,
    unit_id: UnitId,
    payload: &'a [u8],
    crc: u16,
}

impl<'a> RtuDisplay<'a> {
    pub(crate) fn new(level: AduDecodeLevel, unit_id: UnitId, payload: &'a [u8], crc: u16) -> Self {
        RtuDisplay {
            level,
            unit_id,
            payload,
            crc,
        }
    }
}

impl std::fmt::Display for RtuDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "unit: {} crc: {:#06X} (payload len = {})",
            self.unit_id,
            self.crc,
            self.payload.len(),
        )?;
        if self.level.payload_enabled() {
            format_bytes(f, self.payload)?;
        }
        Ok(())
    }
}
