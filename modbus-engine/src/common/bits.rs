/// number of bytes required to hold `count` packed bits
pub(crate) fn num_bytes_for_bits(count: u16) -> usize {
    (count as usize + 7) / 8
}

/// pack bits LSB-first: bit 0 of byte 0 is the first value
pub(crate) fn pack(bits: impl IntoIterator<Item = bool>) -> Vec<u8> {
    let mut bytes = Vec::new();
    for (index, bit) in bits.into_iter().enumerate() {
        if index % 8 == 0 {
            bytes.push(0);
        }
        if bit {
            if let Some(last) = bytes.last_mut() {
                *last |= 1 << (index % 8);
            }
        }
    }
    bytes
}

/// read the bit at `index` from an LSB-first packed slice
pub(crate) fn get(bytes: &[u8], index: usize) -> Option<bool> {
    bytes
        .get(index / 8)
        .map(|byte| byte & (1 << (index % 8)) != 0)
}
