use bitfield::bitfield;

use super::{Generation, BLOCK_SIZE};

bitfield! {
    #[derive(Copy, Clone)]
    pub struct CSDv1(u128);
    pub version, _: 127, 126;
    pub max_read_data_block_length, _: 83, 80;
    pub device_size, _: 73, 62;
    pub device_size_multiplier, _: 49, 47;
}

impl CSDv1 {
    pub fn num_blocks(&self) -> u64 {
        let shift = self.device_size_multiplier() + 2 + self.max_read_data_block_length();
        let bytes = (self.device_size() as u64 + 1) << shift;
        bytes / BLOCK_SIZE as u64
    }
}

bitfield! {
    #[derive(Copy, Clone)]
    pub struct CSDv2(u128);
    pub device_size, _: 69, 48;
}

impl CSDv2 {
    /// Up to 2^32 blocks for a maximum C_SIZE, which is why block counts are u64
    pub fn num_blocks(&self) -> u64 {
        (self.device_size() as u64 + 1) * 1024
    }
}

#[derive(Copy, Clone)]
pub enum CSD {
    V1(CSDv1),
    V2(CSDv2),
}

impl CSD {
    pub fn try_from(value: u128) -> Option<CSD> {
        let csd = match CSDv1(value).version() {
            0 => Self::V1(CSDv1(value)),
            1 => Self::V2(CSDv2(value)),
            _ => return None,
        };
        Some(csd)
    }

    pub fn num_blocks(&self) -> u64 {
        match self {
            Self::V1(csd) => csd.num_blocks(),
            Self::V2(csd) => csd.num_blocks(),
        }
    }

    /// CSD 1.0 describes byte addressed cards, CSD 2.0 block addressed ones
    pub fn block_addressed(&self) -> bool {
        matches!(self, Self::V2(_))
    }
}

impl core::fmt::Debug for CSD {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::V1(_) => write!(f, "CSDv1(num_blocks={})", self.num_blocks()),
            Self::V2(_) => write!(f, "CSDv2(num_blocks={})", self.num_blocks()),
        }
    }
}

bitfield! {
    /// SD configuration register, bits in the order they appear on the bus
    #[derive(Copy, Clone, Default, PartialEq)]
    pub struct SCR(u64);
    impl Debug;
    pub u8, structure, _: 63, 60;
    pub u8, sd_spec, _: 59, 56;
    pub data_stat_after_erase, _: 55;
    pub u8, sd_security, _: 54, 52;
    pub u8, sd_bus_widths, _: 51, 48;
}

impl SCR {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Security version 1.01 is encoded as 2, 2.00 as 3, 3.xx as 4
    pub fn security_version(self) -> u8 {
        self.sd_security().saturating_sub(1)
    }

    pub fn generation(self) -> Option<Generation> {
        match self.security_version() {
            1 => Some(Generation::SDSC),
            2 => Some(Generation::SDHC),
            3 => Some(Generation::SDXC),
            _ => None,
        }
    }

    pub fn bus_width_four(self) -> bool {
        self.sd_bus_widths() & 0b0100 != 0
    }
}

#[cfg(test)]
mod test {
    use hex_literal::hex;

    use super::{CSD, SCR};
    use crate::sd::Generation;

    fn csd_v1(c_size: u128, c_size_mult: u128, read_bl_len: u128) -> u128 {
        read_bl_len << 80 | c_size << 62 | c_size_mult << 47
    }

    fn csd_v2(c_size: u128) -> u128 {
        1 << 126 | c_size << 48
    }

    #[test]
    fn test_csd_v1() {
        let csd = CSD::try_from(csd_v1(0xFFF, 7, 9)).unwrap();
        assert!(!csd.block_addressed());
        assert_eq!(csd.num_blocks(), 2_097_152);

        // Read from a 1GB card
        let csd = CSD::try_from(u128::from_be_bytes(hex!(
            "00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5"
        )))
        .unwrap();
        assert_eq!(csd.num_blocks(), 1_984_000);
    }

    #[test]
    fn test_csd_v1_short_read_block() {
        // READ_BL_LEN below 512 bytes still counts in 512-byte sectors
        let csd = CSD::try_from(csd_v1(0x3FF, 0, 8)).unwrap();
        assert_eq!(csd.num_blocks(), 1024 * 4 * 256 / 512);
    }

    #[test]
    fn test_csd_v2() {
        let csd = CSD::try_from(csd_v2(0x0EF)).unwrap();
        assert!(csd.block_addressed());
        assert_eq!(csd.num_blocks(), 245_760);

        let csd = CSD::try_from(u128::from_be_bytes(hex!(
            "40 0E 00 32 5B 59 00 00 3B 37 7F 80 0A 40 40 00"
        )))
        .unwrap();
        assert_eq!(csd.num_blocks(), 15_523_840);
    }

    #[test]
    fn test_csd_v2_maximum_does_not_wrap() {
        let csd = CSD::try_from(csd_v2(0x3F_FFFF)).unwrap();
        assert_eq!(csd.num_blocks(), 4_294_967_296);
        assert!(csd.num_blocks() > u32::MAX as u64);
    }

    #[test]
    fn test_csd_unknown_structure() {
        assert!(CSD::try_from(2 << 126).is_none());
        assert!(CSD::try_from(3 << 126).is_none());
    }

    #[test]
    fn test_scr() {
        // SDHC card, spec 2.00, security 2.00, 1 and 4 bit bus
        let scr = SCR::from_bytes(hex!("02 35 80 00 00 00 00 00"));
        assert_eq!(scr.sd_spec(), 2);
        assert_eq!(scr.security_version(), 2);
        assert_eq!(scr.generation(), Some(Generation::SDHC));
        assert!(scr.bus_width_four());

        let scr = SCR::from_bytes(hex!("02 25 00 00 00 00 00 00"));
        assert_eq!(scr.generation(), Some(Generation::SDSC));

        let scr = SCR::from_bytes(hex!("02 45 84 43 00 00 00 00"));
        assert_eq!(scr.generation(), Some(Generation::SDXC));

        let scr = SCR::from_bytes(hex!("02 01 00 00 00 00 00 00"));
        assert_eq!(scr.generation(), None);
        assert!(!scr.bus_width_four());
    }
}
