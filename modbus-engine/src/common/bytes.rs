//! Register packing and hex helpers shared by the codec and the protocol decoders

use std::fmt::Write;

const BYTES_PER_DECODE_LINE: usize = 18;

/// Pack registers into big-endian bytes (the Modbus wire order)
pub fn registers_to_be_bytes(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|x| x.to_be_bytes()).collect()
}

/// Unpack big-endian bytes into registers, ignoring a trailing odd byte
pub fn registers_from_be_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|x| u16::from_be_bytes([x[0], x[1]]))
        .collect()
}

/// Pack registers into little-endian bytes
pub fn registers_to_le_bytes(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Unpack little-endian bytes into registers, ignoring a trailing odd byte
pub fn registers_from_le_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|x| u16::from_le_bytes([x[0], x[1]]))
        .collect()
}

/// Return a copy of `bytes` in reverse order
pub fn reversed(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}

/// Encode bytes as space separated upper case hex, e.g. `01 04 02`
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i != 0 {
            out.push(' ');
        }
        // writing to a String cannot fail
        let _ = write!(out, "{byte:02X}");
    }
    out
}

/// write `bytes` as hex lines of at most 18 bytes, each preceded by a newline
pub(crate) fn format_bytes(f: &mut std::fmt::Formatter, bytes: &[u8]) -> std::fmt::Result {
    for chunk in bytes.chunks(BYTES_PER_DECODE_LINE) {
        writeln!(f)?;
        f.write_str(&to_hex(chunk))?;
    }
    Ok(())
}
