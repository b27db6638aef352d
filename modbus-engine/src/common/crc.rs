/// precomputes the CRC table as a constant!
const CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS);

/// Compute the Modbus CRC16 (reflected polynomial 0xA001, initial value 0xFFFF) of `bytes`
///
/// On the wire the CRC is transmitted little-endian.
pub fn compute_crc(bytes: &[u8]) -> u16 {
    CRC.checksum(bytes)
}

/// CRC of an RTU frame: the unit id followed by the PDU
pub(crate) fn frame_crc(unit_id: u8, pdu: &[u8]) -> u16 {
    let mut digest = CRC.digest();
    digest.update(&[unit_id]);
    digest.update(pdu);
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_vector() {
        assert_eq!(compute_crc(&[0x01, 0x04, 0x02, 0xFF, 0xFF]), 0x80B8);
    }

    #[test]
    fn works_over_sub_slices() {
        let data = [0xAA, 0x01, 0x04, 0x02, 0xFF, 0xFF, 0xBB];
        assert_eq!(compute_crc(&data[1..6]), 0x80B8);
    }

    #[test]
    fn frame_crc_covers_unit_id_and_pdu() {
        assert_eq!(frame_crc(0x01, &[0x04, 0x02, 0xFF, 0xFF]), 0x80B8);
        // read coils request to unit 0x2A
        assert_eq!(frame_crc(0x2A, &[0x01, 0x00, 0x10, 0x00, 0x13]), 0x197A);
    }
}
