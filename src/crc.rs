//! CRC7 protects command and response frames, CRC16 (CCITT, XMODEM flavour)
//! protects every data block travelling over the DAT lines.

/// CRC7 with polynomial x⁷ + x³ + 1, MSB first. The result occupies the low 7 bits,
/// on the wire it is sent as `crc7 << 1 | 1`.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &b in data.iter() {
        for i in 0..8 {
            crc <<= 1;
            if (((b << i) & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
        }
    }
    crc & 0x7F
}

/// CRC16 with polynomial x¹⁶ + x¹² + x⁵ + 1, initial value zero, MSB first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &b in data.iter() {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            crc = match crc & 0x8000 {
                0 => crc << 1,
                _ => (crc << 1) ^ 0x1021,
            };
        }
    }
    crc
}
