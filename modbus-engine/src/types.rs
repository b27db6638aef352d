use crate::common::bits;
use crate::decode::PduDecodeLevel;
use crate::error::{AduParseError, InvalidRequest};

/// Modbus unit identifier, just a type-safe wrapper around `u8`
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Ord, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct UnitId {
    /// underlying raw value
    pub value: u8,
}

/// Start and count tuple used when making various requests
/// Cannot be constructed with invalid start/count
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressRange {
    /// Starting address of the range
    pub start: u16,
    /// Count of elements in the range
    pub count: u16,
}

/// Value and its address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Indexed<T> {
    /// Address of the value
    pub index: u16,
    /// Associated value
    pub value: T,
}

/// Fixed length field of bits stored packed LSB-first, the way coils travel on the wire
///
/// Unused high bits of the last byte are always zero so two fields with the
/// same values compare equal regardless of how they were built.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct BitField {
    bytes: Vec<u8>,
    len: usize,
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04X}", self.value)
    }
}

impl UnitId {
    /// Create a new UnitId
    pub fn new(value: u8) -> Self {
        Self { value }
    }

    /// Broadcast address (only in RTU)
    pub fn broadcast() -> Self {
        Self { value: 0x00 }
    }

    /// Returns true if the address is reserved in RTU mode
    ///
    /// Users should *not* use reserved addresses in RTU mode.
    pub fn is_rtu_reserved(&self) -> bool {
        self.value >= 248
    }
}

/// Create the default UnitId of `0xFF`
impl Default for UnitId {
    fn default() -> Self {
        Self { value: 0xFF }
    }
}

impl From<u8> for UnitId {
    fn from(value: u8) -> Self {
        Self::new(value)
    }
}

impl AddressRange {
    /// Create a new address range
    pub fn try_from(start: u16, count: u16) -> Result<Self, InvalidRequest> {
        if count == 0 {
            return Err(InvalidRequest::CountOfZero);
        }

        let max_start = u16::MAX - (count - 1);

        if start > max_start {
            return Err(InvalidRequest::AddressOverflow(start, count));
        }

        Ok(Self { start, count })
    }

    /// Create a new address range whose count may not exceed `limit`
    pub fn with_limit(start: u16, count: u16, limit: u16) -> Result<Self, InvalidRequest> {
        let range = Self::try_from(start, count)?;
        if range.count > limit {
            return Err(InvalidRequest::CountTooLargeForType(range.count, limit));
        }
        Ok(range)
    }

    /// Converts to std::ops::Range
    pub fn to_std_range(self) -> std::ops::Range<usize> {
        let start = self.start as usize;
        let end = start + (self.count as usize);
        start..end
    }

    /// Iterate over every address in the range
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        let start = self.start;
        (0..self.count).map(move |offset| start + offset)
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "start: {:#06X} qty: {}", self.start, self.count)
    }
}

impl<T> Indexed<T> {
    /// Create a new indexed value
    pub fn new(index: u16, value: T) -> Self {
        Indexed { index, value }
    }
}

impl<T> From<(u16, T)> for Indexed<T> {
    fn from(tuple: (u16, T)) -> Self {
        let (index, value) = tuple;
        Self::new(index, value)
    }
}

impl std::fmt::Display for Indexed<bool> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "idx: {:#06X} value: {}", self.index, self.value as i32)
    }
}

impl std::fmt::Display for Indexed<u16> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "idx: {:#06X} value: {:#06X}", self.index, self.value)
    }
}

impl BitField {
    /// Create a field from individual values, the first value is bit 0
    pub fn from_bools(values: &[bool]) -> Self {
        Self {
            bytes: bits::pack(values.iter().copied()),
            len: values.len(),
        }
    }

    /// Create a field of `len` bits from packed bytes, ignoring any excess bytes or bits
    pub fn from_packed(bytes: &[u8], len: usize) -> Self {
        Self::from_bools(
            &(0..len)
                .map(|i| bits::get(bytes, i).unwrap_or(false))
                .collect::<Vec<bool>>(),
        )
    }

    /// Number of bits in the field
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the field holds no bits
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Value of the bit at `index`
    pub fn get(&self, index: usize) -> Option<bool> {
        if index >= self.len {
            return None;
        }
        bits::get(&self.bytes, index)
    }

    /// Packed wire representation
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Iterate over the values in order
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).filter_map(move |i| bits::get(&self.bytes, i))
    }

    /// Copy the values into a vector
    pub fn to_vec(&self) -> Vec<bool> {
        self.iter().collect()
    }
}

impl From<&[bool]> for BitField {
    fn from(values: &[bool]) -> Self {
        Self::from_bools(values)
    }
}

/// Formats bit or register values together with their addresses
pub(crate) struct ValuesDisplay<'a, T> {
    level: PduDecodeLevel,
    start: u16,
    values: &'a [T],
}

impl<'a, T> ValuesDisplay<'a, T> {
    pub(crate) fn new(level: PduDecodeLevel, start: u16, values: &'a [T]) -> Self {
        Self {
            level,
            start,
            values,
        }
    }
}

impl<T> std::fmt::Display for ValuesDisplay<'_, T>
where
    T: Copy,
    Indexed<T>: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.level.data_values() {
            for (offset, value) in self.values.iter().enumerate() {
                let index = self.start.wrapping_add(offset as u16);
                write!(f, "\n{}", Indexed::new(index, *value))?;
            }
        }
        Ok(())
    }
}

pub(crate) fn coil_from_u16(value: u16) -> Result<bool, AduParseError> {
    match value {
        crate::constants::coil::ON => Ok(true),
        crate::constants::coil::OFF => Ok(false),
        _ => Err(AduParseError::UnknownCoilState(value)),
    }
}

pub(crate) fn coil_to_u16(value: bool) -> u16 {
    if value {
        crate::constants::coil::ON
    } else {
        crate::constants::coil::OFF
    }
}
