use std::fmt::{Display, Formatter};

use crate::error::FrameParseError;

mod constants {
    pub(crate) const READ_COILS: u8 = 0x01;
    pub(crate) const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub(crate) const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub(crate) const READ_INPUT_REGISTERS: u8 = 0x04;
    pub(crate) const WRITE_COIL: u8 = 0x05;
    pub(crate) const WRITE_HOLDING_REGISTER: u8 = 0x06;
    pub(crate) const READ_EXCEPTION_STATUS: u8 = 0x07;
    pub(crate) const DIAGNOSTICS: u8 = 0x08;
    pub(crate) const GET_COMM_EVENT_COUNTER: u8 = 0x0B;
    pub(crate) const GET_COMM_EVENT_LOG: u8 = 0x0C;
    pub(crate) const WRITE_COILS: u8 = 0x0F;
    pub(crate) const WRITE_HOLDING_REGISTERS: u8 = 0x10;
    pub(crate) const REPORT_SERVER_ID: u8 = 0x11;
    pub(crate) const READ_FILE_RECORD: u8 = 0x14;
    pub(crate) const WRITE_FILE_RECORD: u8 = 0x15;
    pub(crate) const MASK_WRITE_HOLDING_REGISTER: u8 = 0x16;
    pub(crate) const READ_WRITE_HOLDING_REGISTERS: u8 = 0x17;
    pub(crate) const READ_FIFO_QUEUE: u8 = 0x18;
    pub(crate) const ENCAPSULATED_INTERFACE: u8 = 0x2B;
}

/// Bit set in the function byte of an exception response
pub(crate) const EXCEPTION_BIT: u8 = 0x80;

/// Data table a function code operates on
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockType {
    /// Single-bit read-write values
    Coil,
    /// Single-bit read-only values
    Discrete,
    /// 16-bit read-write registers
    Holding,
    /// 16-bit read-only registers
    Input,
    /// Diagnostic, file and user-defined functions
    Diagnostic,
}

/// Modbus function codes
///
/// Conversion from `u8` never fails: bytes outside the table are carried
/// as [`FunctionCode::Other`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum FunctionCode {
    /// 0x01
    ReadCoils,
    /// 0x02
    ReadDiscreteInputs,
    /// 0x03
    ReadHoldingRegisters,
    /// 0x04
    ReadInputRegisters,
    /// 0x05
    WriteCoil,
    /// 0x06
    WriteHoldingRegister,
    /// 0x07
    ReadExceptionStatus,
    /// 0x08
    Diagnostics,
    /// 0x0B
    GetCommEventCounter,
    /// 0x0C
    GetCommEventLog,
    /// 0x0F
    WriteCoils,
    /// 0x10
    WriteHoldingRegisters,
    /// 0x11
    ReportServerId,
    /// 0x14
    ReadFileRecord,
    /// 0x15
    WriteFileRecord,
    /// 0x16
    MaskWriteHoldingRegister,
    /// 0x17
    ReadWriteHoldingRegisters,
    /// 0x18
    ReadFifoQueue,
    /// 0x2B
    EncapsulatedInterface,
    /// Any other function code, including user-defined ones
    Other(u8),
}

impl FunctionCode {
    /// Raw wire value
    pub const fn value(self) -> u8 {
        match self {
            FunctionCode::ReadCoils => constants::READ_COILS,
            FunctionCode::ReadDiscreteInputs => constants::READ_DISCRETE_INPUTS,
            FunctionCode::ReadHoldingRegisters => constants::READ_HOLDING_REGISTERS,
            FunctionCode::ReadInputRegisters => constants::READ_INPUT_REGISTERS,
            FunctionCode::WriteCoil => constants::WRITE_COIL,
            FunctionCode::WriteHoldingRegister => constants::WRITE_HOLDING_REGISTER,
            FunctionCode::ReadExceptionStatus => constants::READ_EXCEPTION_STATUS,
            FunctionCode::Diagnostics => constants::DIAGNOSTICS,
            FunctionCode::GetCommEventCounter => constants::GET_COMM_EVENT_COUNTER,
            FunctionCode::GetCommEventLog => constants::GET_COMM_EVENT_LOG,
            FunctionCode::WriteCoils => constants::WRITE_COILS,
            FunctionCode::WriteHoldingRegisters => constants::WRITE_HOLDING_REGISTERS,
            FunctionCode::ReportServerId => constants::REPORT_SERVER_ID,
            FunctionCode::ReadFileRecord => constants::READ_FILE_RECORD,
            FunctionCode::WriteFileRecord => constants::WRITE_FILE_RECORD,
            FunctionCode::MaskWriteHoldingRegister => constants::MASK_WRITE_HOLDING_REGISTER,
            FunctionCode::ReadWriteHoldingRegisters => constants::READ_WRITE_HOLDING_REGISTERS,
            FunctionCode::ReadFifoQueue => constants::READ_FIFO_QUEUE,
            FunctionCode::EncapsulatedInterface => constants::ENCAPSULATED_INTERFACE,
            FunctionCode::Other(x) => x,
        }
    }

    /// Wire value with the exception bit set
    pub const fn as_exception(self) -> u8 {
        self.value() | EXCEPTION_BIT
    }

    /// Strict lookup for parsing requests
    ///
    /// Unknown codes still map to [`FunctionCode::Other`], but 0x00 and bytes with the
    /// exception bit set can never start a request and are rejected.
    pub fn strict(value: u8) -> Result<Self, FrameParseError> {
        if value == 0 || value & EXCEPTION_BIT != 0 {
            return Err(FrameParseError::InvalidFunctionCode(value));
        }
        Ok(Self::from(value))
    }

    /// Returns true if the code is one of the named codes of the registry
    pub fn is_standard(self) -> bool {
        !matches!(self, FunctionCode::Other(_))
    }

    /// The data table this function operates on
    pub fn block_type(self) -> BlockType {
        match self {
            FunctionCode::ReadCoils | FunctionCode::WriteCoil | FunctionCode::WriteCoils => {
                BlockType::Coil
            }
            FunctionCode::ReadDiscreteInputs => BlockType::Discrete,
            FunctionCode::ReadHoldingRegisters
            | FunctionCode::WriteHoldingRegister
            | FunctionCode::WriteHoldingRegisters
            | FunctionCode::MaskWriteHoldingRegister
            | FunctionCode::ReadWriteHoldingRegisters
            | FunctionCode::ReadFifoQueue => BlockType::Holding,
            FunctionCode::ReadInputRegisters => BlockType::Input,
            FunctionCode::ReadExceptionStatus
            | FunctionCode::Diagnostics
            | FunctionCode::GetCommEventCounter
            | FunctionCode::GetCommEventLog
            | FunctionCode::ReportServerId
            | FunctionCode::ReadFileRecord
            | FunctionCode::WriteFileRecord
            | FunctionCode::EncapsulatedInterface
            | FunctionCode::Other(_) => BlockType::Diagnostic,
        }
    }

    /// Returns true if the function reads data from the server
    pub fn is_read(self) -> bool {
        match self {
            FunctionCode::ReadCoils
            | FunctionCode::ReadDiscreteInputs
            | FunctionCode::ReadHoldingRegisters
            | FunctionCode::ReadInputRegisters
            | FunctionCode::ReadExceptionStatus
            | FunctionCode::Diagnostics
            | FunctionCode::GetCommEventCounter
            | FunctionCode::GetCommEventLog
            | FunctionCode::ReportServerId
            | FunctionCode::ReadFileRecord
            | FunctionCode::ReadWriteHoldingRegisters
            | FunctionCode::ReadFifoQueue
            | FunctionCode::EncapsulatedInterface => true,
            FunctionCode::WriteCoil
            | FunctionCode::WriteHoldingRegister
            | FunctionCode::WriteCoils
            | FunctionCode::WriteHoldingRegisters
            | FunctionCode::WriteFileRecord
            | FunctionCode::MaskWriteHoldingRegister
            | FunctionCode::Other(_) => false,
        }
    }

    /// The function that reads back what this function writes, or writes what it reads
    pub fn opposite(self) -> Option<FunctionCode> {
        match self {
            FunctionCode::ReadCoils => Some(FunctionCode::WriteCoils),
            FunctionCode::ReadHoldingRegisters => Some(FunctionCode::WriteHoldingRegisters),
            FunctionCode::WriteCoil | FunctionCode::WriteCoils => Some(FunctionCode::ReadCoils),
            FunctionCode::WriteHoldingRegister
            | FunctionCode::WriteHoldingRegisters
            | FunctionCode::MaskWriteHoldingRegister => Some(FunctionCode::ReadHoldingRegisters),
            FunctionCode::ReadFileRecord => Some(FunctionCode::WriteFileRecord),
            FunctionCode::WriteFileRecord => Some(FunctionCode::ReadFileRecord),
            _ => None,
        }
    }
}

impl From<u8> for FunctionCode {
    fn from(value: u8) -> Self {
        match value {
            constants::READ_COILS => FunctionCode::ReadCoils,
            constants::READ_DISCRETE_INPUTS => FunctionCode::ReadDiscreteInputs,
            constants::READ_HOLDING_REGISTERS => FunctionCode::ReadHoldingRegisters,
            constants::READ_INPUT_REGISTERS => FunctionCode::ReadInputRegisters,
            constants::WRITE_COIL => FunctionCode::WriteCoil,
            constants::WRITE_HOLDING_REGISTER => FunctionCode::WriteHoldingRegister,
            constants::READ_EXCEPTION_STATUS => FunctionCode::ReadExceptionStatus,
            constants::DIAGNOSTICS => FunctionCode::Diagnostics,
            constants::GET_COMM_EVENT_COUNTER => FunctionCode::GetCommEventCounter,
            constants::GET_COMM_EVENT_LOG => FunctionCode::GetCommEventLog,
            constants::WRITE_COILS => FunctionCode::WriteCoils,
            constants::WRITE_HOLDING_REGISTERS => FunctionCode::WriteHoldingRegisters,
            constants::REPORT_SERVER_ID => FunctionCode::ReportServerId,
            constants::READ_FILE_RECORD => FunctionCode::ReadFileRecord,
            constants::WRITE_FILE_RECORD => FunctionCode::WriteFileRecord,
            constants::MASK_WRITE_HOLDING_REGISTER => FunctionCode::MaskWriteHoldingRegister,
            constants::READ_WRITE_HOLDING_REGISTERS => FunctionCode::ReadWriteHoldingRegisters,
            constants::READ_FIFO_QUEUE => FunctionCode::ReadFifoQueue,
            constants::ENCAPSULATED_INTERFACE => FunctionCode::EncapsulatedInterface,
            _ => FunctionCode::Other(value),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(value: FunctionCode) -> Self {
        value.value()
    }
}

impl Display for FunctionCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let name = match self {
            FunctionCode::ReadCoils => "READ COILS",
            FunctionCode::ReadDiscreteInputs => "READ DISCRETE INPUTS",
            FunctionCode::ReadHoldingRegisters => "READ HOLDING REGISTERS",
            FunctionCode::ReadInputRegisters => "READ INPUT REGISTERS",
            FunctionCode::WriteCoil => "WRITE SINGLE COIL",
            FunctionCode::WriteHoldingRegister => "WRITE SINGLE REGISTER",
            FunctionCode::ReadExceptionStatus => "READ EXCEPTION STATUS",
            FunctionCode::Diagnostics => "DIAGNOSTICS",
            FunctionCode::GetCommEventCounter => "GET COMM EVENT COUNTER",
            FunctionCode::GetCommEventLog => "GET COMM EVENT LOG",
            FunctionCode::WriteCoils => "WRITE MULTIPLE COILS",
            FunctionCode::WriteHoldingRegisters => "WRITE MULTIPLE REGISTERS",
            FunctionCode::ReportServerId => "REPORT SERVER ID",
            FunctionCode::ReadFileRecord => "READ FILE RECORD",
            FunctionCode::WriteFileRecord => "WRITE FILE RECORD",
            FunctionCode::MaskWriteHoldingRegister => "MASK WRITE REGISTER",
            FunctionCode::ReadWriteHoldingRegisters => "READ/WRITE MULTIPLE REGISTERS",
            FunctionCode::ReadFifoQueue => "READ FIFO QUEUE",
            FunctionCode::EncapsulatedInterface => "ENCAPSULATED INTERFACE TRANSPORT",
            FunctionCode::Other(_) => "OTHER FUNCTION CODE",
        };
        write!(f, "{} ({:#04X})", name, self.value())
    }
}
