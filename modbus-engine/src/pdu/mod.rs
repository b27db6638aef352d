//! Modbus PDU message model and the factories that build valid messages
//!
//! Messages are immutable once built. Whether a message is a request or a
//! response is implied by its function code and the presence of a data payload,
//! exactly as on the wire.

mod decode;
mod display;
mod encode;

pub(crate) use decode::{decode_request, decode_response};
pub(crate) use display::PduDisplay;
pub(crate) use encode::encode_pdu;

use crate::common::bytes;
use crate::common::function::FunctionCode;
use crate::constants::limits;
use crate::error::InvalidRequest;
use crate::exception::ExceptionCode;
use crate::types::{AddressRange, BitField, UnitId};

/// A Modbus PDU addressed to (or answered by) a unit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModbusMessage {
    unit_id: UnitId,
    function: FunctionCode,
    error: Option<ExceptionCode>,
    body: MessageBody,
}

/// Function specific part of a [`ModbusMessage`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageBody {
    /// 16-bit register operations
    Registers(RegistersMessage),
    /// coil and discrete input operations
    Bits(BitsMessage),
    /// bytes following the function code of diagnostic and user-defined functions
    Raw(Vec<u8>),
    /// exception responses carry nothing but the exception code
    Empty,
}

/// How the fields of a [`RegistersMessage`] map onto the wire
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegisterLayout {
    /// `address`/`count` describe the registers read or written
    Plain,
    /// request of a read/write multiple registers operation: `address`/`count` is
    /// the read range and `data` is written starting at `write_address`
    ReadWrite {
        /// first register written
        write_address: u16,
    },
}

/// Register oriented PDU body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistersMessage {
    address: u16,
    count: u16,
    data: Option<Vec<u8>>,
    layout: RegisterLayout,
}

/// Bit oriented PDU body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitsMessage {
    address: u16,
    count: u16,
    bits: Option<BitField>,
}

impl ModbusMessage {
    pub(crate) fn new(unit_id: UnitId, function: FunctionCode, body: MessageBody) -> Self {
        Self {
            unit_id,
            function,
            error: None,
            body,
        }
    }

    /// Unit the message is addressed to or was answered by
    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    /// Function code, without the exception bit
    pub fn function(&self) -> FunctionCode {
        self.function
    }

    /// Exception code, present only on exception responses
    pub fn error(&self) -> Option<ExceptionCode> {
        self.error
    }

    /// Returns true if this is an exception response
    pub fn is_exception(&self) -> bool {
        self.error.is_some()
    }

    /// Function specific body
    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Register body, if any
    pub fn registers(&self) -> Option<&RegistersMessage> {
        match &self.body {
            MessageBody::Registers(x) => Some(x),
            _ => None,
        }
    }

    /// Bit body, if any
    pub fn bits(&self) -> Option<&BitsMessage> {
        match &self.body {
            MessageBody::Bits(x) => Some(x),
            _ => None,
        }
    }

    /// Raw body of diagnostic and user-defined functions, if any
    pub fn raw(&self) -> Option<&[u8]> {
        match &self.body {
            MessageBody::Raw(x) => Some(x),
            _ => None,
        }
    }

    /// Build the exception response to this message
    pub fn to_exception(&self, code: ExceptionCode) -> ModbusMessage {
        exception_response(self.unit_id, self.function, code)
    }

    /// Number of bytes the PDU occupies on the wire, including the function code
    pub fn payload_length(&self) -> usize {
        if self.error.is_some() {
            return 2;
        }

        match &self.body {
            MessageBody::Empty => 1,
            MessageBody::Raw(data) => 1 + data.len(),
            MessageBody::Registers(msg) => match self.function {
                FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                    match &msg.data {
                        None => 5,
                        Some(data) => 2 + data.len(),
                    }
                }
                FunctionCode::WriteHoldingRegister => 5,
                FunctionCode::MaskWriteHoldingRegister => 7,
                FunctionCode::ReadWriteHoldingRegisters => match msg.layout {
                    RegisterLayout::ReadWrite { .. } => 10 + msg.data_len(),
                    RegisterLayout::Plain => 2 + msg.data_len(),
                },
                FunctionCode::ReadFifoQueue => match &msg.data {
                    None => 3,
                    Some(data) => 5 + data.len(),
                },
                _ => match &msg.data {
                    None => 5,
                    Some(data) => 6 + data.len(),
                },
            },
            MessageBody::Bits(msg) => match self.function {
                FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => match &msg.bits {
                    None => 5,
                    Some(bits) => 2 + bits.as_bytes().len(),
                },
                FunctionCode::WriteCoil => 5,
                _ => match &msg.bits {
                    None => 5,
                    Some(bits) => 6 + bits.as_bytes().len(),
                },
            },
        }
    }
}

impl RegistersMessage {
    pub(crate) fn new(
        address: u16,
        count: u16,
        data: Option<Vec<u8>>,
        layout: RegisterLayout,
    ) -> Self {
        Self {
            address,
            count,
            data,
            layout,
        }
    }

    /// First register addressed (the read range for read/write requests)
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Number of registers addressed (the read count for read/write requests)
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Register data as big-endian bytes, always of even length
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Register data decoded as values
    pub fn values(&self) -> Option<Vec<u16>> {
        self.data.as_deref().map(bytes::registers_from_be_bytes)
    }

    /// Wire layout of the message
    pub fn layout(&self) -> RegisterLayout {
        self.layout
    }

    /// Address written by a read/write multiple registers request
    pub fn write_address(&self) -> Option<u16> {
        match self.layout {
            RegisterLayout::ReadWrite { write_address } => Some(write_address),
            RegisterLayout::Plain => None,
        }
    }

    /// Count written by a read/write multiple registers request
    pub fn write_count(&self) -> Option<u16> {
        match self.layout {
            RegisterLayout::ReadWrite { .. } => Some((self.data_len() / 2) as u16),
            RegisterLayout::Plain => None,
        }
    }

    /// AND and OR masks of a mask write message
    pub fn masks(&self) -> Option<(u16, u16)> {
        match self.data.as_deref() {
            Some([a1, a2, o1, o2]) => Some((
                u16::from_be_bytes([*a1, *a2]),
                u16::from_be_bytes([*o1, *o2]),
            )),
            _ => None,
        }
    }

    pub(crate) fn range(&self) -> (u16, u16) {
        (self.address, self.count)
    }

    fn data_len(&self) -> usize {
        self.data.as_ref().map(|x| x.len()).unwrap_or(0)
    }
}

impl BitsMessage {
    pub(crate) fn new(address: u16, count: u16, bits: Option<BitField>) -> Self {
        Self {
            address,
            count,
            bits,
        }
    }

    /// First coil or discrete input addressed
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Number of coils or discrete inputs addressed
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Bit values, if the message carries any
    pub fn bits(&self) -> Option<&BitField> {
        self.bits.as_ref()
    }

    pub(crate) fn range(&self) -> (u16, u16) {
        (self.address, self.count)
    }
}

fn count_of(len: usize) -> Result<u16, InvalidRequest> {
    u16::try_from(len).map_err(|_| InvalidRequest::CountTooBigForU16(len))
}

fn registers(
    unit_id: UnitId,
    function: FunctionCode,
    range: AddressRange,
    data: Option<Vec<u8>>,
) -> ModbusMessage {
    ModbusMessage::new(
        unit_id,
        function,
        MessageBody::Registers(RegistersMessage::new(
            range.start,
            range.count,
            data,
            RegisterLayout::Plain,
        )),
    )
}

fn bits(
    unit_id: UnitId,
    function: FunctionCode,
    range: AddressRange,
    bits: Option<BitField>,
) -> ModbusMessage {
    ModbusMessage::new(
        unit_id,
        function,
        MessageBody::Bits(BitsMessage::new(range.start, range.count, bits)),
    )
}

fn read_bits_request(
    function: FunctionCode,
    unit_id: UnitId,
    address: u16,
    count: u16,
) -> Result<ModbusMessage, InvalidRequest> {
    let range = AddressRange::with_limit(address, count, limits::MAX_READ_COILS_COUNT)?;
    Ok(bits(unit_id, function, range, None))
}

fn read_bits_response(
    function: FunctionCode,
    unit_id: UnitId,
    address: u16,
    values: &[bool],
) -> Result<ModbusMessage, InvalidRequest> {
    let range = AddressRange::with_limit(
        address,
        count_of(values.len())?,
        limits::MAX_READ_COILS_COUNT,
    )?;
    Ok(bits(
        unit_id,
        function,
        range,
        Some(BitField::from_bools(values)),
    ))
}

fn read_registers_request(
    function: FunctionCode,
    unit_id: UnitId,
    address: u16,
    count: u16,
) -> Result<ModbusMessage, InvalidRequest> {
    let range = AddressRange::with_limit(address, count, limits::MAX_READ_REGISTERS_COUNT)?;
    Ok(registers(unit_id, function, range, None))
}

fn read_registers_response(
    function: FunctionCode,
    unit_id: UnitId,
    address: u16,
    values: &[u16],
) -> Result<ModbusMessage, InvalidRequest> {
    let range = AddressRange::with_limit(
        address,
        count_of(values.len())?,
        limits::MAX_READ_REGISTERS_COUNT,
    )?;
    Ok(registers(
        unit_id,
        function,
        range,
        Some(bytes::registers_to_be_bytes(values)),
    ))
}

/// Read coils request
pub fn read_coils_request(
    unit_id: UnitId,
    address: u16,
    count: u16,
) -> Result<ModbusMessage, InvalidRequest> {
    read_bits_request(FunctionCode::ReadCoils, unit_id, address, count)
}

/// Read coils response carrying `values` starting at `address`
pub fn read_coils_response(
    unit_id: UnitId,
    address: u16,
    values: &[bool],
) -> Result<ModbusMessage, InvalidRequest> {
    read_bits_response(FunctionCode::ReadCoils, unit_id, address, values)
}

/// Read discrete inputs request
pub fn read_discrete_inputs_request(
    unit_id: UnitId,
    address: u16,
    count: u16,
) -> Result<ModbusMessage, InvalidRequest> {
    read_bits_request(FunctionCode::ReadDiscreteInputs, unit_id, address, count)
}

/// Read discrete inputs response carrying `values` starting at `address`
pub fn read_discrete_inputs_response(
    unit_id: UnitId,
    address: u16,
    values: &[bool],
) -> Result<ModbusMessage, InvalidRequest> {
    read_bits_response(FunctionCode::ReadDiscreteInputs, unit_id, address, values)
}

/// Read holding registers request, at most 125 registers
pub fn read_holding_registers_request(
    unit_id: UnitId,
    address: u16,
    count: u16,
) -> Result<ModbusMessage, InvalidRequest> {
    read_registers_request(FunctionCode::ReadHoldingRegisters, unit_id, address, count)
}

/// Read holding registers response carrying `values` starting at `address`
pub fn read_holding_registers_response(
    unit_id: UnitId,
    address: u16,
    values: &[u16],
) -> Result<ModbusMessage, InvalidRequest> {
    read_registers_response(FunctionCode::ReadHoldingRegisters, unit_id, address, values)
}

/// Read input registers request, at most 125 registers
pub fn read_input_registers_request(
    unit_id: UnitId,
    address: u16,
    count: u16,
) -> Result<ModbusMessage, InvalidRequest> {
    read_registers_request(FunctionCode::ReadInputRegisters, unit_id, address, count)
}

/// Read input registers response carrying `values` starting at `address`
pub fn read_input_registers_response(
    unit_id: UnitId,
    address: u16,
    values: &[u16],
) -> Result<ModbusMessage, InvalidRequest> {
    read_registers_response(FunctionCode::ReadInputRegisters, unit_id, address, values)
}

/// Write single coil request; the response is an identical echo
pub fn write_coil_request(unit_id: UnitId, address: u16, value: bool) -> ModbusMessage {
    ModbusMessage::new(
        unit_id,
        FunctionCode::WriteCoil,
        MessageBody::Bits(BitsMessage::new(
            address,
            1,
            Some(BitField::from_bools(&[value])),
        )),
    )
}

/// Write single coil response
pub fn write_coil_response(unit_id: UnitId, address: u16, value: bool) -> ModbusMessage {
    write_coil_request(unit_id, address, value)
}

/// Write single holding register request; the response is an identical echo
pub fn write_register_request(unit_id: UnitId, address: u16, value: u16) -> ModbusMessage {
    ModbusMessage::new(
        unit_id,
        FunctionCode::WriteHoldingRegister,
        MessageBody::Registers(RegistersMessage::new(
            address,
            1,
            Some(value.to_be_bytes().to_vec()),
            RegisterLayout::Plain,
        )),
    )
}

/// Write single holding register response
pub fn write_register_response(unit_id: UnitId, address: u16, value: u16) -> ModbusMessage {
    write_register_request(unit_id, address, value)
}

/// Write multiple coils request, at most 1968 coils
pub fn write_coils_request(
    unit_id: UnitId,
    address: u16,
    values: &[bool],
) -> Result<ModbusMessage, InvalidRequest> {
    let range = AddressRange::with_limit(
        address,
        count_of(values.len())?,
        limits::MAX_WRITE_COILS_COUNT,
    )?;
    Ok(bits(
        unit_id,
        FunctionCode::WriteCoils,
        range,
        Some(BitField::from_bools(values)),
    ))
}

/// Write multiple coils response
pub fn write_coils_response(
    unit_id: UnitId,
    address: u16,
    count: u16,
) -> Result<ModbusMessage, InvalidRequest> {
    let range = AddressRange::with_limit(address, count, limits::MAX_WRITE_COILS_COUNT)?;
    Ok(bits(unit_id, FunctionCode::WriteCoils, range, None))
}

/// Write multiple holding registers request, at most 121 registers
pub fn write_registers_request(
    unit_id: UnitId,
    address: u16,
    values: &[u16],
) -> Result<ModbusMessage, InvalidRequest> {
    write_registers_request_from_bytes(unit_id, address, &bytes::registers_to_be_bytes(values))
}

/// Write multiple holding registers request from raw big-endian register bytes
pub fn write_registers_request_from_bytes(
    unit_id: UnitId,
    address: u16,
    data: &[u8],
) -> Result<ModbusMessage, InvalidRequest> {
    if data.len() % 2 != 0 {
        return Err(InvalidRequest::OddRegisterData(data.len()));
    }
    let range = AddressRange::with_limit(
        address,
        count_of(data.len() / 2)?,
        limits::MAX_WRITE_REGISTERS_COUNT,
    )?;
    Ok(registers(
        unit_id,
        FunctionCode::WriteHoldingRegisters,
        range,
        Some(data.to_vec()),
    ))
}

/// Write multiple holding registers response
pub fn write_registers_response(
    unit_id: UnitId,
    address: u16,
    count: u16,
) -> Result<ModbusMessage, InvalidRequest> {
    let range = AddressRange::with_limit(address, count, limits::MAX_WRITE_REGISTERS_COUNT)?;
    Ok(registers(
        unit_id,
        FunctionCode::WriteHoldingRegisters,
        range,
        None,
    ))
}

/// Mask write register request: `(current AND and_mask) OR (or_mask AND NOT and_mask)`
pub fn mask_write_register_request(
    unit_id: UnitId,
    address: u16,
    and_mask: u16,
    or_mask: u16,
) -> ModbusMessage {
    let mut data = and_mask.to_be_bytes().to_vec();
    data.extend_from_slice(&or_mask.to_be_bytes());
    ModbusMessage::new(
        unit_id,
        FunctionCode::MaskWriteHoldingRegister,
        MessageBody::Registers(RegistersMessage::new(
            address,
            1,
            Some(data),
            RegisterLayout::Plain,
        )),
    )
}

/// Mask write register response, an echo of the request
pub fn mask_write_register_response(
    unit_id: UnitId,
    address: u16,
    and_mask: u16,
    or_mask: u16,
) -> ModbusMessage {
    mask_write_register_request(unit_id, address, and_mask, or_mask)
}

/// Read/write multiple registers request
///
/// The write is performed before the read. At most 125 registers are read and 121 written.
pub fn read_write_registers_request(
    unit_id: UnitId,
    read_address: u16,
    read_count: u16,
    write_address: u16,
    values: &[u16],
) -> Result<ModbusMessage, InvalidRequest> {
    let read = AddressRange::with_limit(read_address, read_count, limits::MAX_READ_REGISTERS_COUNT)?;
    AddressRange::with_limit(
        write_address,
        count_of(values.len())?,
        limits::MAX_WRITE_REGISTERS_COUNT,
    )?;
    Ok(ModbusMessage::new(
        unit_id,
        FunctionCode::ReadWriteHoldingRegisters,
        MessageBody::Registers(RegistersMessage::new(
            read.start,
            read.count,
            Some(bytes::registers_to_be_bytes(values)),
            RegisterLayout::ReadWrite { write_address },
        )),
    ))
}

/// Read/write multiple registers response carrying the registers read
pub fn read_write_registers_response(
    unit_id: UnitId,
    read_address: u16,
    values: &[u16],
) -> Result<ModbusMessage, InvalidRequest> {
    read_registers_response(
        FunctionCode::ReadWriteHoldingRegisters,
        unit_id,
        read_address,
        values,
    )
}

/// Read FIFO queue request
pub fn read_fifo_queue_request(unit_id: UnitId, address: u16) -> ModbusMessage {
    ModbusMessage::new(
        unit_id,
        FunctionCode::ReadFifoQueue,
        MessageBody::Registers(RegistersMessage::new(
            address,
            0,
            None,
            RegisterLayout::Plain,
        )),
    )
}

/// Read FIFO queue response, at most 49 queued registers (an empty queue is allowed)
pub fn read_fifo_queue_response(
    unit_id: UnitId,
    address: u16,
    values: &[u16],
) -> Result<ModbusMessage, InvalidRequest> {
    let count = count_of(values.len())?;
    if count > limits::MAX_FIFO_COUNT {
        return Err(InvalidRequest::CountTooLargeForType(
            count,
            limits::MAX_FIFO_COUNT,
        ));
    }
    Ok(ModbusMessage::new(
        unit_id,
        FunctionCode::ReadFifoQueue,
        MessageBody::Registers(RegistersMessage::new(
            address,
            count,
            Some(bytes::registers_to_be_bytes(values)),
            RegisterLayout::Plain,
        )),
    ))
}

/// Message for diagnostic and user-defined functions carrying the bytes after the function code
///
/// Only Modbus/TCP can frame these in both directions since RTU framing needs
/// to know the length of every function in advance.
pub fn raw_message(unit_id: UnitId, function: FunctionCode, data: Vec<u8>) -> ModbusMessage {
    ModbusMessage::new(unit_id, function, MessageBody::Raw(data))
}

/// Exception response for `function`
pub fn exception_response(
    unit_id: UnitId,
    function: FunctionCode,
    code: ExceptionCode,
) -> ModbusMessage {
    ModbusMessage {
        unit_id,
        function,
        error: Some(code),
        body: MessageBody::Empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: UnitId = UnitId { value: 1 };

    #[test]
    fn read_holding_registers_count_is_bounded() {
        assert!(read_holding_registers_request(UNIT, 0, 125).is_ok());
        assert_eq!(
            read_holding_registers_request(UNIT, 0, 126),
            Err(InvalidRequest::CountTooLargeForType(126, 125))
        );
    }

    #[test]
    fn write_register_count_is_bounded() {
        assert!(write_registers_request(UNIT, 0, &[0; 121]).is_ok());
        assert_eq!(
            write_registers_request(UNIT, 0, &[0; 122]),
            Err(InvalidRequest::CountTooLargeForType(122, 121))
        );
        assert_eq!(
            read_write_registers_request(UNIT, 0, 1, 0, &[0; 122]),
            Err(InvalidRequest::CountTooLargeForType(122, 121))
        );
    }

    #[test]
    fn fifo_count_is_bounded() {
        assert!(read_fifo_queue_response(UNIT, 0, &[0; 49]).is_ok());
        assert!(read_fifo_queue_response(UNIT, 0, &[]).is_ok());
        assert_eq!(
            read_fifo_queue_response(UNIT, 0, &[0; 50]),
            Err(InvalidRequest::CountTooLargeForType(50, 49))
        );
    }

    #[test]
    fn coil_counts_are_bounded() {
        assert!(read_coils_request(UNIT, 0, 2000).is_ok());
        assert_eq!(
            read_discrete_inputs_request(UNIT, 0, 2001),
            Err(InvalidRequest::CountTooLargeForType(2001, 2000))
        );
        assert_eq!(
            write_coils_request(UNIT, 0, &[true; 1969]),
            Err(InvalidRequest::CountTooLargeForType(1969, 1968))
        );
    }

    #[test]
    fn rejects_zero_count_and_overflow() {
        assert_eq!(
            read_input_registers_request(UNIT, 0, 0),
            Err(InvalidRequest::CountOfZero)
        );
        assert_eq!(
            read_coils_request(UNIT, 0xFFFF, 2),
            Err(InvalidRequest::AddressOverflow(0xFFFF, 2))
        );
    }

    #[test]
    fn rejects_odd_register_data() {
        assert_eq!(
            write_registers_request_from_bytes(UNIT, 0, &[0x01, 0x02, 0x03]),
            Err(InvalidRequest::OddRegisterData(3))
        );
    }

    #[test]
    fn payload_length_follows_function_and_data() {
        assert_eq!(
            mask_write_register_request(UNIT, 4, 0x00F2, 0x0025).payload_length(),
            7
        );
        assert_eq!(
            read_holding_registers_request(UNIT, 0, 3)
                .unwrap()
                .payload_length(),
            5
        );
        assert_eq!(
            read_holding_registers_response(UNIT, 0, &[1, 2, 3])
                .unwrap()
                .payload_length(),
            8
        );
        assert_eq!(
            read_write_registers_request(UNIT, 0, 2, 10, &[1, 2])
                .unwrap()
                .payload_length(),
            14
        );
        assert_eq!(
            read_fifo_queue_response(UNIT, 0, &[1, 2])
                .unwrap()
                .payload_length(),
            9
        );
        assert_eq!(read_fifo_queue_request(UNIT, 0).payload_length(), 3);
        assert_eq!(
            write_coils_request(UNIT, 0, &[true; 10])
                .unwrap()
                .payload_length(),
            8
        );
        assert_eq!(
            exception_response(
                UNIT,
                FunctionCode::ReadCoils,
                ExceptionCode::IllegalDataAddress
            )
            .payload_length(),
            2
        );
    }

    #[test]
    fn read_write_request_carries_explicit_layout() {
        let request = read_write_registers_request(UNIT, 1, 2, 0xFFFF, &[0xFFFF]).unwrap();
        let body = request.registers().unwrap();
        assert_eq!(body.write_address(), Some(0xFFFF));
        assert_eq!(body.write_count(), Some(1));

        let response = read_write_registers_response(UNIT, 1, &[0xFFFF, 0xFFFF]).unwrap();
        assert_eq!(response.registers().unwrap().layout(), RegisterLayout::Plain);
    }

    #[test]
    fn exposes_masks_and_values() {
        let msg = mask_write_register_request(UNIT, 4, 0x00F2, 0x0025);
        assert_eq!(msg.registers().unwrap().masks(), Some((0x00F2, 0x0025)));

        let msg = read_input_registers_response(UNIT, 1, &[0xFFFF, 0x1234]).unwrap();
        assert_eq!(msg.registers().unwrap().values(), Some(vec![0xFFFF, 0x1234]));
    }

    #[test]
    fn exception_keeps_unit_and_function() {
        let request = read_coils_request(UNIT, 0, 1).unwrap();
        let ex = request.to_exception(ExceptionCode::IllegalFunction);
        assert_eq!(ex.unit_id(), UNIT);
        assert_eq!(ex.function(), FunctionCode::ReadCoils);
        assert_eq!(ex.error(), Some(ExceptionCode::IllegalFunction));
        assert!(ex.is_exception());
    }
}
