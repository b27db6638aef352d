use scursor::{ReadCursor, WriteCursor};

use crate::common::buffer::ReadBuffer;
use crate::common::bytes::format_bytes;
use crate::common::frame::{log_tx, Frame, FrameHeader};
use crate::decode::{AduDecodeLevel, DecodeLevel};
use crate::error::{AduParseError, FrameParseError, InternalError, RequestError};
use crate::pdu::{encode_pdu, ModbusMessage};
use crate::types::UnitId;

pub(crate) mod constants {
    pub(crate) const HEADER_LENGTH: usize = 7;
    pub(crate) const MAX_FRAME_LENGTH: usize =
        HEADER_LENGTH + crate::common::frame::constants::MAX_ADU_LENGTH;
    // includes the 1 byte unit id
    pub(crate) const MAX_LENGTH_FIELD: usize = crate::common::frame::constants::MAX_ADU_LENGTH + 1;
}

/// A Modbus/TCP ADU: MBAP header plus PDU
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpFrame {
    /// correlates a response with its request
    pub transaction_id: u16,
    /// always 0 for Modbus
    pub protocol_id: u16,
    /// the PDU and the unit id it is addressed to
    pub message: ModbusMessage,
}

impl TcpFrame {
    /// Frame a message with the given transaction id
    pub fn new(transaction_id: u16, message: ModbusMessage) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            message,
        }
    }

    /// Serialize the frame to its wire representation
    pub fn encode(&self) -> Result<Vec<u8>, RequestError> {
        format_mbap(self.transaction_id, &self.message, DecodeLevel::nothing())
    }

    /// Parse a complete request frame
    ///
    /// Functions without a structured codec are carried as raw bytes.
    pub fn decode_request(bytes: &[u8]) -> Result<Self, RequestError> {
        let frame = split_frame(bytes)?;
        let message = frame.decode_request(DecodeLevel::nothing())?;
        Ok(Self::new(tx_id_of(&frame), message))
    }

    /// Parse a complete response frame, using `request` for the fields the response omits
    pub fn decode_response(bytes: &[u8], request: &ModbusMessage) -> Result<Self, RequestError> {
        let frame = split_frame(bytes)?;
        let message = frame.decode_response(request, DecodeLevel::nothing())?;
        Ok(Self::new(tx_id_of(&frame), message))
    }
}

fn tx_id_of(frame: &Frame) -> u16 {
    match frame.header {
        FrameHeader::Tcp { tx_id } => tx_id,
        FrameHeader::Rtu { .. } => 0,
    }
}

fn split_frame(bytes: &[u8]) -> Result<Frame, RequestError> {
    let mut cursor = ReadCursor::new(bytes);
    let tx_id = cursor.read_u16_be()?;
    let protocol_id = cursor.read_u16_be()?;
    let length = cursor.read_u16_be()? as usize;
    let unit_id = UnitId::new(cursor.read_u8()?);
    let header = MbapHeader::validate(tx_id, protocol_id, length, unit_id)?;

    let pdu = bytes
        .get(constants::HEADER_LENGTH..)
        .ok_or(AduParseError::InsufficientBytes)?;
    if pdu.len() < header.pdu_length {
        return Err(AduParseError::InsufficientBytes.into());
    }
    if pdu.len() > header.pdu_length {
        return Err(AduParseError::TrailingBytes(pdu.len() - header.pdu_length).into());
    }

    Ok(Frame::new(unit_id, FrameHeader::Tcp { tx_id }, pdu))
}

#[derive(Clone, Copy)]
struct MbapHeader {
    tx_id: u16,
    pdu_length: usize,
    unit_id: UnitId,
}

impl MbapHeader {
    fn validate(
        tx_id: u16,
        protocol_id: u16,
        length: usize,
        unit_id: UnitId,
    ) -> Result<Self, FrameParseError> {
        if protocol_id != 0 {
            return Err(FrameParseError::UnknownProtocolId(protocol_id));
        }

        if length > constants::MAX_LENGTH_FIELD {
            return Err(FrameParseError::MbapLengthTooBig(
                length,
                constants::MAX_LENGTH_FIELD,
            ));
        }

        // must be > 0 b/c the 1-byte unit identifier counts towards length
        if length == 0 {
            return Err(FrameParseError::MbapLengthZero);
        }

        Ok(Self {
            tx_id,
            pdu_length: length - 1,
            unit_id,
        })
    }
}

#[derive(Clone, Copy)]
enum ParseState {
    Begin,
    Header(MbapHeader),
    /// a malformed header was received; nothing on this connection can be trusted anymore
    BadMessage,
}

pub(crate) struct MbapParser {
    state: ParseState,
}

impl MbapParser {
    pub(crate) fn new() -> Self {
        Self {
            state: ParseState::Begin,
        }
    }

    pub(crate) fn parse(
        &mut self,
        cursor: &mut ReadBuffer,
        decode_level: AduDecodeLevel,
    ) -> Result<Option<Frame>, RequestError> {
        match self.state {
            ParseState::BadMessage => {
                cursor.clear();
                Ok(None)
            }
            ParseState::Header(header) => {
                if cursor.len() < header.pdu_length {
                    return Ok(None);
                }

                let frame = Frame::new(
                    header.unit_id,
                    FrameHeader::Tcp {
                        tx_id: header.tx_id,
                    },
                    cursor.read(header.pdu_length)?,
                );

                if decode_level.enabled() {
                    tracing::info!(
                        "MBAP RX - {}",
                        MbapDisplay::new(decode_level, header.tx_id, header.unit_id, frame.pdu())
                    );
                }

                self.state = ParseState::Begin;
                Ok(Some(frame))
            }
            ParseState::Begin => {
                if cursor.len() < constants::HEADER_LENGTH {
                    return Ok(None);
                }

                let tx_id = cursor.read_u16_be()?;
                let protocol_id = cursor.read_u16_be()?;
                let length = cursor.read_u16_be()? as usize;
                let unit_id = UnitId::new(cursor.read_u8()?);

                match MbapHeader::validate(tx_id, protocol_id, length, unit_id) {
                    Ok(header) => {
                        self.state = ParseState::Header(header);
                        self.parse(cursor, decode_level)
                    }
                    Err(err) => {
                        tracing::warn!("{}, discarding all data until the connection is reset", err);
                        cursor.clear();
                        self.state = ParseState::BadMessage;
                        Ok(None)
                    }
                }
            }
        }
    }
}

/// Serialize `msg` behind an MBAP header carrying `tx_id`
pub(crate) fn format_mbap(
    tx_id: u16,
    msg: &ModbusMessage,
    decode_level: DecodeLevel,
) -> Result<Vec<u8>, RequestError> {
    let mut buffer = [0u8; constants::MAX_FRAME_LENGTH];

    let pdu_length = {
        let body = buffer
            .get_mut(constants::HEADER_LENGTH..)
            .ok_or(InternalError::InsufficientWriteSpace)?;
        let mut cursor = WriteCursor::new(body);
        encode_pdu(msg, &mut cursor)?;
        cursor.position()
    };

    let length_field =
        u16::try_from(pdu_length + 1).map_err(|_| InternalError::AduTooBig(pdu_length))?;

    {
        let mut cursor = WriteCursor::new(&mut buffer);
        cursor.write_u16_be(tx_id)?;
        cursor.write_u16_be(0)?;
        cursor.write_u16_be(length_field)?;
        cursor.write_u8(msg.unit_id().value)?;
    }

    let frame = buffer
        .get(..constants::HEADER_LENGTH + pdu_length)
        .ok_or(InternalError::AduTooBig(pdu_length))?;

    log_tx(msg, decode_level);
    if decode_level.adu.enabled() {
        tracing::info!(
            "MBAP TX - {}",
            MbapDisplay::new(
                decode_level.adu,
                tx_id,
                msg.unit_id(),
                frame.get(constants::HEADER_LENGTH..).unwrap_or_default()
            )
        );
    }

    Ok(frame.to_vec())
}

struct MbapDisplay<'a> {
    level: AduDecodeLevel,
    tx_id: u16,
    unit_id: UnitId,
    pdu: &'a [u8],
}

impl<'a> MbapDisplay<'a> {
    fn new(level: AduDecodeLevel, tx_id: u16, unit_id: UnitId, pdu: &'a [u8]) -> Self {
        Self {
            level,
            tx_id,
            unit_id,
            pdu,
        }
    }
}

impl std::fmt::Display for MbapDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "tx_id: {:#06X} unit: {} len: {}",
            self.tx_id,
            self.unit_id,
            self.pdu.len()
        )?;
        if self.level.payload_enabled() {
            format_bytes(f, self.pdu)?;
        }
        Ok(())
    }
}
