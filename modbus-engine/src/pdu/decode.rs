use scursor::ReadCursor;

use crate::common::bits::num_bytes_for_bits;
use crate::common::function::{FunctionCode, EXCEPTION_BIT};
use crate::error::AduParseError;
use crate::exception::ExceptionCode;
use crate::pdu::*;
use crate::types::{coil_from_u16, BitField, UnitId};

/// Decode a request PDU whose function byte has already been read
///
/// Returns `None` for functions without a structured codec so the caller can
/// decide to drop the frame or carry it as raw bytes.
pub(crate) fn decode_request(
    unit_id: UnitId,
    function: u8,
    cursor: &mut ReadCursor,
) -> Result<Option<ModbusMessage>, AduParseError> {
    let function = FunctionCode::from(function);
    let msg = match function {
        FunctionCode::ReadCoils => {
            let (address, count) = read_range(cursor)?;
            read_coils_request(unit_id, address, count)?
        }
        FunctionCode::ReadDiscreteInputs => {
            let (address, count) = read_range(cursor)?;
            read_discrete_inputs_request(unit_id, address, count)?
        }
        FunctionCode::ReadHoldingRegisters => {
            let (address, count) = read_range(cursor)?;
            read_holding_registers_request(unit_id, address, count)?
        }
        FunctionCode::ReadInputRegisters => {
            let (address, count) = read_range(cursor)?;
            read_input_registers_request(unit_id, address, count)?
        }
        FunctionCode::WriteCoil => {
            let address = cursor.read_u16_be()?;
            let value = coil_from_u16(cursor.read_u16_be()?)?;
            write_coil_request(unit_id, address, value)
        }
        FunctionCode::WriteHoldingRegister => {
            let address = cursor.read_u16_be()?;
            let value = cursor.read_u16_be()?;
            write_register_request(unit_id, address, value)
        }
        FunctionCode::WriteCoils => {
            let (address, count) = read_range(cursor)?;
            let data = read_counted_bytes(cursor, num_bytes_for_bits(count))?;
            let values = BitField::from_packed(&data, count as usize).to_vec();
            write_coils_request(unit_id, address, &values)?
        }
        FunctionCode::WriteHoldingRegisters => {
            let (address, count) = read_range(cursor)?;
            let data = read_counted_bytes(cursor, 2 * count as usize)?;
            write_registers_request_from_bytes(unit_id, address, &data)?
        }
        FunctionCode::MaskWriteHoldingRegister => {
            let address = cursor.read_u16_be()?;
            let and_mask = cursor.read_u16_be()?;
            let or_mask = cursor.read_u16_be()?;
            mask_write_register_request(unit_id, address, and_mask, or_mask)
        }
        FunctionCode::ReadWriteHoldingRegisters => {
            let (read_address, read_count) = read_range(cursor)?;
            let (write_address, write_count) = read_range(cursor)?;
            let data = read_counted_bytes(cursor, 2 * write_count as usize)?;
            read_write_registers_request(
                unit_id,
                read_address,
                read_count,
                write_address,
                &crate::common::bytes::registers_from_be_bytes(&data),
            )?
        }
        FunctionCode::ReadFifoQueue => read_fifo_queue_request(unit_id, cursor.read_u16_be()?),
        _ => return Ok(None),
    };

    expect_empty(cursor)?;
    Ok(Some(msg))
}

/// Decode the response to `request` whose function byte has already been read
///
/// The request supplies the address/count the response omits. Returns `None` for
/// functions without a structured codec.
pub(crate) fn decode_response(
    unit_id: UnitId,
    function: u8,
    request: &ModbusMessage,
    cursor: &mut ReadCursor,
) -> Result<Option<ModbusMessage>, AduParseError> {
    let expected = request.function();

    if function & EXCEPTION_BIT != 0 {
        if function != expected.as_exception() {
            return Err(AduParseError::UnknownResponseFunction(
                function,
                expected.value(),
            ));
        }
        let code = ExceptionCode::from(cursor.read_u8()?);
        expect_empty(cursor)?;
        return Ok(Some(exception_response(unit_id, expected, code)));
    }

    if function != expected.value() {
        return Err(AduParseError::UnknownResponseFunction(
            function,
            expected.value(),
        ));
    }

    let (address, count) = match request.body() {
        MessageBody::Registers(x) => x.range(),
        MessageBody::Bits(x) => x.range(),
        _ => (0, 0),
    };

    let msg = match expected {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let data = read_counted_bytes(cursor, num_bytes_for_bits(count))?;
            let values = BitField::from_packed(&data, count as usize);
            ModbusMessage::new(
                unit_id,
                expected,
                MessageBody::Bits(BitsMessage::new(address, count, Some(values))),
            )
        }
        FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters
        | FunctionCode::ReadWriteHoldingRegisters => {
            let data = read_counted_bytes(cursor, 2 * count as usize)?;
            ModbusMessage::new(
                unit_id,
                expected,
                MessageBody::Registers(RegistersMessage::new(
                    address,
                    count,
                    Some(data),
                    RegisterLayout::Plain,
                )),
            )
        }
        FunctionCode::WriteCoil => {
            let address = cursor.read_u16_be()?;
            let value = coil_from_u16(cursor.read_u16_be()?)?;
            expect_echo(request, write_coil_response(unit_id, address, value))?
        }
        FunctionCode::WriteHoldingRegister => {
            let address = cursor.read_u16_be()?;
            let value = cursor.read_u16_be()?;
            expect_echo(request, write_register_response(unit_id, address, value))?
        }
        FunctionCode::MaskWriteHoldingRegister => {
            let address = cursor.read_u16_be()?;
            let and_mask = cursor.read_u16_be()?;
            let or_mask = cursor.read_u16_be()?;
            expect_echo(
                request,
                mask_write_register_response(unit_id, address, and_mask, or_mask),
            )?
        }
        FunctionCode::WriteCoils => {
            let (address, count) = read_range(cursor)?;
            let response = write_coils_response(unit_id, address, count)?;
            expect_range(request, response)?
        }
        FunctionCode::WriteHoldingRegisters => {
            let (address, count) = read_range(cursor)?;
            let response = write_registers_response(unit_id, address, count)?;
            expect_range(request, response)?
        }
        FunctionCode::ReadFifoQueue => {
            let byte_count = cursor.read_u16_be()? as usize;
            let fifo_count = cursor.read_u16_be()?;
            let expected_bytes = 2 + 2 * fifo_count as usize;
            if byte_count != expected_bytes {
                return Err(AduParseError::RequestByteCountMismatch(
                    expected_bytes,
                    byte_count,
                ));
            }
            let data = read_exact(cursor, 2 * fifo_count as usize)?;
            read_fifo_queue_response(
                unit_id,
                address,
                &crate::common::bytes::registers_from_be_bytes(&data),
            )?
        }
        _ => return Ok(None),
    };

    expect_empty(cursor)?;
    Ok(Some(msg))
}

fn read_range(cursor: &mut ReadCursor) -> Result<(u16, u16), AduParseError> {
    Ok((cursor.read_u16_be()?, cursor.read_u16_be()?))
}

fn read_exact(cursor: &mut ReadCursor, count: usize) -> Result<Vec<u8>, AduParseError> {
    let remaining = cursor.remaining();
    if remaining < count {
        return Err(AduParseError::InsufficientBytesForByteCount(
            count, remaining,
        ));
    }
    Ok(cursor.read_bytes(count)?.to_vec())
}

/// read a u8 byte count that must match what the addressed count implies, then the bytes
fn read_counted_bytes(cursor: &mut ReadCursor, expected: usize) -> Result<Vec<u8>, AduParseError> {
    let byte_count = cursor.read_u8()? as usize;
    if byte_count != expected {
        return Err(AduParseError::RequestByteCountMismatch(
            expected, byte_count,
        ));
    }
    read_exact(cursor, byte_count)
}

fn expect_empty(cursor: &ReadCursor) -> Result<(), AduParseError> {
    match cursor.remaining() {
        0 => Ok(()),
        x => Err(AduParseError::TrailingBytes(x)),
    }
}

fn expect_echo(
    request: &ModbusMessage,
    response: ModbusMessage,
) -> Result<ModbusMessage, AduParseError> {
    if request.body() != response.body() {
        return Err(AduParseError::ReplyEchoMismatch);
    }
    Ok(response)
}

fn expect_range(
    request: &ModbusMessage,
    response: ModbusMessage,
) -> Result<ModbusMessage, AduParseError> {
    let request_range = match request.body() {
        MessageBody::Registers(x) => Some(x.range()),
        MessageBody::Bits(x) => Some(x.range()),
        _ => None,
    };
    let response_range = match response.body() {
        MessageBody::Registers(x) => Some(x.range()),
        MessageBody::Bits(x) => Some(x.range()),
        _ => None,
    };
    if request_range != response_range {
        return Err(AduParseError::ReplyEchoMismatch);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use scursor::WriteCursor;

    use super::*;
    use crate::error::InvalidRequest;
    use crate::pdu::encode_pdu;

    const UNIT: UnitId = UnitId { value: 1 };

    fn encode(msg: &ModbusMessage) -> Vec<u8> {
        let mut buffer = [0u8; 260];
        let len = {
            let mut cursor = WriteCursor::new(&mut buffer);
            encode_pdu(msg, &mut cursor).unwrap();
            cursor.position()
        };
        buffer[..len].to_vec()
    }

    fn parse_request(bytes: &[u8]) -> Result<Option<ModbusMessage>, AduParseError> {
        let mut cursor = ReadCursor::new(&bytes[1..]);
        decode_request(UNIT, bytes[0], &mut cursor)
    }

    fn parse_response(
        request: &ModbusMessage,
        bytes: &[u8],
    ) -> Result<Option<ModbusMessage>, AduParseError> {
        let mut cursor = ReadCursor::new(&bytes[1..]);
        decode_response(UNIT, bytes[0], request, &mut cursor)
    }

    fn requests() -> Vec<ModbusMessage> {
        vec![
            read_coils_request(UNIT, 0x13, 0x25).unwrap(),
            read_discrete_inputs_request(UNIT, 0xC4, 0x16).unwrap(),
            read_holding_registers_request(UNIT, 0x6B, 3).unwrap(),
            read_input_registers_request(UNIT, 0x08, 1).unwrap(),
            write_coil_request(UNIT, 0xAC, true),
            write_register_request(UNIT, 0x01, 0x0003),
            write_coils_request(UNIT, 0x13, &[true, false, true, true, false, false, true, true, true, false])
                .unwrap(),
            write_registers_request(UNIT, 0x01, &[0x000A, 0x0102]).unwrap(),
            mask_write_register_request(UNIT, 4, 0x00F2, 0x0025),
            read_write_registers_request(UNIT, 0x03, 6, 0x0E, &[0x00FF, 0x00FF, 0x00FF]).unwrap(),
            read_fifo_queue_request(UNIT, 0x04DE),
        ]
    }

    fn responses() -> Vec<(ModbusMessage, ModbusMessage)> {
        vec![
            (
                read_coils_request(UNIT, 0x13, 3).unwrap(),
                read_coils_response(UNIT, 0x13, &[true, false, true]).unwrap(),
            ),
            (
                read_discrete_inputs_request(UNIT, 0xC4, 9).unwrap(),
                read_discrete_inputs_response(UNIT, 0xC4, &[false; 9]).unwrap(),
            ),
            (
                read_holding_registers_request(UNIT, 0x6B, 2).unwrap(),
                read_holding_registers_response(UNIT, 0x6B, &[0x022B, 0x0000]).unwrap(),
            ),
            (
                read_input_registers_request(UNIT, 1, 1).unwrap(),
                read_input_registers_response(UNIT, 1, &[0xFFFF]).unwrap(),
            ),
            (
                write_coil_request(UNIT, 0xAC, false),
                write_coil_response(UNIT, 0xAC, false),
            ),
            (
                write_register_request(UNIT, 0x01, 0x0003),
                write_register_response(UNIT, 0x01, 0x0003),
            ),
            (
                write_coils_request(UNIT, 0x13, &[true; 10]).unwrap(),
                write_coils_response(UNIT, 0x13, 10).unwrap(),
            ),
            (
                write_registers_request(UNIT, 0x01, &[0x000A, 0x0102]).unwrap(),
                write_registers_response(UNIT, 0x01, 2).unwrap(),
            ),
            (
                mask_write_register_request(UNIT, 4, 0x00F2, 0x0025),
                mask_write_register_response(UNIT, 4, 0x00F2, 0x0025),
            ),
            (
                read_write_registers_request(UNIT, 0x03, 2, 0x0E, &[0xFFFF]).unwrap(),
                read_write_registers_response(UNIT, 0x03, &[0x00FE, 0x0ACD]).unwrap(),
            ),
            (
                read_fifo_queue_request(UNIT, 0x04DE),
                read_fifo_queue_response(UNIT, 0x04DE, &[0x01B8, 0x1284]).unwrap(),
            ),
            (
                read_fifo_queue_request(UNIT, 0x04DE),
                read_fifo_queue_response(UNIT, 0x04DE, &[]).unwrap(),
            ),
        ]
    }

    #[test]
    fn requests_survive_encoding() {
        for request in requests() {
            let bytes = encode(&request);
            assert_eq!(parse_request(&bytes), Ok(Some(request)));
        }
    }

    #[test]
    fn responses_survive_encoding() {
        for (request, response) in responses() {
            let bytes = encode(&response);
            assert_eq!(parse_response(&request, &bytes), Ok(Some(response)));
        }
    }

    #[test]
    fn exception_responses_survive_encoding() {
        let request = read_holding_registers_request(UNIT, 0, 1).unwrap();
        let response = request.to_exception(ExceptionCode::Other(0x42));
        assert_eq!(
            parse_response(&request, &encode(&response)),
            Ok(Some(response))
        );
    }

    #[test]
    fn unknown_functions_are_not_decoded() {
        assert_eq!(parse_request(&[0x41, 0x01, 0x02]), Ok(None));
        let request = raw_message(UNIT, FunctionCode::Diagnostics, vec![0x00, 0x00]);
        assert_eq!(parse_response(&request, &[0x08, 0x00, 0x00]), Ok(None));
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert_eq!(
            parse_request(&[0x03, 0x00, 0x01, 0x00, 0x01, 0xFF]),
            Err(AduParseError::TrailingBytes(1))
        );
    }

    #[test]
    fn rejects_short_requests() {
        assert_eq!(
            parse_request(&[0x03, 0x00, 0x01, 0x00]),
            Err(AduParseError::InsufficientBytes)
        );
    }

    #[test]
    fn rejects_requests_that_violate_limits() {
        assert_eq!(
            parse_request(&[0x03, 0x00, 0x00, 0x00, 0x7E]),
            Err(AduParseError::InvalidRequest(
                InvalidRequest::CountTooLargeForType(126, 125)
            ))
        );
    }

    #[test]
    fn rejects_bad_coil_value() {
        assert_eq!(
            parse_request(&[0x05, 0x00, 0x01, 0x12, 0x34]),
            Err(AduParseError::UnknownCoilState(0x1234))
        );
    }

    #[test]
    fn rejects_byte_count_that_does_not_match_request() {
        let request = read_holding_registers_request(UNIT, 0, 2).unwrap();
        assert_eq!(
            parse_response(&request, &[0x03, 0x02, 0x00, 0x01]),
            Err(AduParseError::RequestByteCountMismatch(4, 2))
        );
        assert_eq!(
            parse_response(&request, &[0x03, 0x04, 0x00, 0x01]),
            Err(AduParseError::InsufficientBytesForByteCount(4, 2))
        );
    }

    #[test]
    fn rejects_write_echo_mismatch() {
        let request = write_register_request(UNIT, 1, 0x0003);
        assert_eq!(
            parse_response(&request, &[0x06, 0x00, 0x01, 0x00, 0x04]),
            Err(AduParseError::ReplyEchoMismatch)
        );
    }

    #[test]
    fn rejects_mismatched_function() {
        let request = read_coils_request(UNIT, 0, 1).unwrap();
        assert_eq!(
            parse_response(&request, &[0x02, 0x01, 0x00]),
            Err(AduParseError::UnknownResponseFunction(0x02, 0x01))
        );
        assert_eq!(
            parse_response(&request, &[0x83, 0x02]),
            Err(AduParseError::UnknownResponseFunction(0x83, 0x01))
        );
    }
}
