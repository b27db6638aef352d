use crate::common::bytes::format_bytes;
use crate::decode::PduDecodeLevel;
use crate::pdu::{MessageBody, ModbusMessage, RegisterLayout};
use crate::types::ValuesDisplay;

/// Formats a PDU for the `PDU TX`/`PDU RX` log lines according to the decode level
pub(crate) struct PduDisplay<'a> {
    level: PduDecodeLevel,
    msg: &'a ModbusMessage,
}

impl<'a> PduDisplay<'a> {
    pub(crate) fn new(level: PduDecodeLevel, msg: &'a ModbusMessage) -> Self {
        Self { level, msg }
    }
}

impl std::fmt::Display for PduDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(ex) = self.msg.error() {
            return write!(
                f,
                "{} exception: {:?} ({:#04X})",
                self.msg.function(),
                ex,
                u8::from(ex)
            );
        }

        write!(f, "{}", self.msg.function())?;

        if !self.level.data_headers() {
            return Ok(());
        }

        match self.msg.body() {
            MessageBody::Empty => Ok(()),
            MessageBody::Raw(data) => {
                write!(f, " ({} bytes)", data.len())?;
                if self.level.data_values() {
                    format_bytes(f, data)?;
                }
                Ok(())
            }
            MessageBody::Bits(body) => {
                write!(f, " start: {:#06X} qty: {}", body.address(), body.count())?;
                if let Some(bits) = body.bits() {
                    let values = bits.to_vec();
                    write!(
                        f,
                        "{}",
                        ValuesDisplay::new(self.level, body.address(), &values)
                    )?;
                }
                Ok(())
            }
            MessageBody::Registers(body) => {
                write!(f, " start: {:#06X} qty: {}", body.address(), body.count())?;
                let start = match body.layout() {
                    RegisterLayout::ReadWrite { write_address } => {
                        write!(f, " write start: {write_address:#06X}")?;
                        write_address
                    }
                    RegisterLayout::Plain => body.address(),
                };
                if let Some(values) = body.values() {
                    write!(f, "{}", ValuesDisplay::new(self.level, start, &values))?;
                }
                Ok(())
            }
        }
    }
}
