use scursor::WriteCursor;

use crate::common::function::FunctionCode;
use crate::error::{InternalError, RequestError};
use crate::pdu::{BitsMessage, MessageBody, ModbusMessage, RegisterLayout, RegistersMessage};
use crate::types::coil_to_u16;

fn write_bytes(cursor: &mut WriteCursor, data: &[u8]) -> Result<(), scursor::WriteError> {
    for byte in data {
        cursor.write_u8(*byte)?;
    }
    Ok(())
}

fn byte_count(len: usize) -> Result<u8, InternalError> {
    u8::try_from(len).map_err(|_| InternalError::BadByteCount(len))
}

/// Write the PDU (function code and body) into the cursor
pub(crate) fn encode_pdu(msg: &ModbusMessage, cursor: &mut WriteCursor) -> Result<(), RequestError> {
    if let Some(ex) = msg.error() {
        cursor.write_u8(msg.function().as_exception())?;
        cursor.write_u8(ex.into())?;
        return Ok(());
    }

    cursor.write_u8(msg.function().value())?;

    match msg.body() {
        MessageBody::Empty => Ok(()),
        MessageBody::Raw(data) => {
            write_bytes(cursor, data)?;
            Ok(())
        }
        MessageBody::Registers(body) => encode_registers(msg.function(), body, cursor),
        MessageBody::Bits(body) => encode_bits(msg.function(), body, cursor),
    }
}

fn encode_registers(
    function: FunctionCode,
    body: &RegistersMessage,
    cursor: &mut WriteCursor,
) -> Result<(), RequestError> {
    match function {
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            match body.data() {
                None => {
                    cursor.write_u16_be(body.address())?;
                    cursor.write_u16_be(body.count())?;
                }
                Some(data) => {
                    cursor.write_u8(byte_count(data.len())?)?;
                    write_bytes(cursor, data)?;
                }
            }
        }
        FunctionCode::WriteHoldingRegister | FunctionCode::MaskWriteHoldingRegister => {
            cursor.write_u16_be(body.address())?;
            write_bytes(cursor, body.data().unwrap_or_default())?;
        }
        FunctionCode::ReadWriteHoldingRegisters => {
            let data = body.data().unwrap_or_default();
            match body.layout() {
                RegisterLayout::ReadWrite { write_address } => {
                    cursor.write_u16_be(body.address())?;
                    cursor.write_u16_be(body.count())?;
                    cursor.write_u16_be(write_address)?;
                    cursor.write_u16_be((data.len() / 2) as u16)?;
                    cursor.write_u8(byte_count(data.len())?)?;
                    write_bytes(cursor, data)?;
                }
                RegisterLayout::Plain => {
                    cursor.write_u8(byte_count(data.len())?)?;
                    write_bytes(cursor, data)?;
                }
            }
        }
        FunctionCode::ReadFifoQueue => match body.data() {
            None => {
                cursor.write_u16_be(body.address())?;
            }
            Some(data) => {
                // the byte count includes the 2 bytes of the FIFO count
                cursor.write_u16_be((data.len() + 2) as u16)?;
                cursor.write_u16_be(body.count())?;
                write_bytes(cursor, data)?;
            }
        },
        _ => {
            cursor.write_u16_be(body.address())?;
            cursor.write_u16_be(body.count())?;
            if let Some(data) = body.data() {
                cursor.write_u8(byte_count(data.len())?)?;
                write_bytes(cursor, data)?;
            }
        }
    }
    Ok(())
}

fn encode_bits(
    function: FunctionCode,
    body: &BitsMessage,
    cursor: &mut WriteCursor,
) -> Result<(), RequestError> {
    match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => match body.bits() {
            None => {
                cursor.write_u16_be(body.address())?;
                cursor.write_u16_be(body.count())?;
            }
            Some(bits) => {
                cursor.write_u8(byte_count(bits.as_bytes().len())?)?;
                write_bytes(cursor, bits.as_bytes())?;
            }
        },
        FunctionCode::WriteCoil => {
            let value = body.bits().and_then(|x| x.get(0)).unwrap_or(false);
            cursor.write_u16_be(body.address())?;
            cursor.write_u16_be(coil_to_u16(value))?;
        }
        _ => {
            cursor.write_u16_be(body.address())?;
            cursor.write_u16_be(body.count())?;
            if let Some(bits) = body.bits() {
                cursor.write_u8(byte_count(bits.as_bytes().len())?)?;
                write_bytes(cursor, bits.as_bytes())?;
            }
        }
    }
    Ok(())
}
