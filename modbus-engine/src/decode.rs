/// Controls the protocol tracing of transmitted and received data at every layer
///
/// All decoding is logged at the INFO level. Nothing is decoded by default.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct DecodeLevel {
    /// Controls the protocol data unit decoding
    pub pdu: PduDecodeLevel,
    /// Controls the application data unit decoding
    ///
    /// On TCP, this is the MBAP header. On serial, this is the unit id and CRC.
    pub adu: AduDecodeLevel,
    /// Controls the logging of physical layer read/write
    pub physical: PhysDecodeLevel,
}

/// Controls how transmitted and received PDUs are decoded
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum PduDecodeLevel {
    /// Decode nothing
    #[default]
    Nothing,
    /// Decode the function code only
    FunctionCode,
    /// Decode the function code and the address/count header
    DataHeaders,
    /// Decode the function code, the header and the actual data values
    DataValues,
}

/// Controls how transmitted and received ADUs are decoded
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum AduDecodeLevel {
    /// Decode nothing
    #[default]
    Nothing,
    /// Decode the header
    Header,
    /// Decode the header and the raw payload as hexadecimal
    Payload,
}

/// Controls how data transmitted at the physical layer (TCP, serial) is logged
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum PhysDecodeLevel {
    /// Log nothing
    #[default]
    Nothing,
    /// Log only the length of data that is sent and received
    Length,
    /// Log the length and the actual data that is sent and received
    Data,
}

impl DecodeLevel {
    /// construct a `DecodeLevel` with nothing enabled
    pub fn nothing() -> Self {
        Self::default()
    }

    /// construct a `DecodeLevel` with every layer at its most verbose setting
    pub fn everything() -> Self {
        Self::new(
            PduDecodeLevel::DataValues,
            AduDecodeLevel::Payload,
            PhysDecodeLevel::Data,
        )
    }

    /// construct a `DecodeLevel` from its fields
    pub fn new(pdu: PduDecodeLevel, adu: AduDecodeLevel, physical: PhysDecodeLevel) -> Self {
        DecodeLevel { pdu, adu, physical }
    }

    /// change the PDU decode level
    pub fn with_pdu(self, pdu: PduDecodeLevel) -> Self {
        Self { pdu, ..self }
    }

    /// change the ADU decode level
    pub fn with_adu(self, adu: AduDecodeLevel) -> Self {
        Self { adu, ..self }
    }

    /// change the physical layer decode level
    pub fn with_physical(self, physical: PhysDecodeLevel) -> Self {
        Self { physical, ..self }
    }
}

impl From<PduDecodeLevel> for DecodeLevel {
    fn from(pdu: PduDecodeLevel) -> Self {
        Self::default().with_pdu(pdu)
    }
}

impl PduDecodeLevel {
    pub(crate) fn enabled(self) -> bool {
        self != PduDecodeLevel::Nothing
    }

    pub(crate) fn data_headers(self) -> bool {
        matches!(
            self,
            PduDecodeLevel::DataHeaders | PduDecodeLevel::DataValues
        )
    }

    pub(crate) fn data_values(self) -> bool {
        self == PduDecodeLevel::DataValues
    }
}

impl AduDecodeLevel {
    pub(crate) fn enabled(self) -> bool {
        self != AduDecodeLevel::Nothing
    }

    pub(crate) fn payload_enabled(self) -> bool {
        self == AduDecodeLevel::Payload
    }
}

impl PhysDecodeLevel {
    pub(crate) fn enabled(self) -> bool {
        self != PhysDecodeLevel::Nothing
    }

    pub(crate) fn data_enabled(self) -> bool {
        self == PhysDecodeLevel::Data
    }
}
