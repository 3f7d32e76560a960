pub mod command;
pub mod registers;
pub mod response;

pub const BLOCK_SIZE: usize = 512;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Generation {
    /// Byte addressed, up to 2GB
    SDSC,
    /// Block addressed, up to 32GB
    SDHC,
    /// Block addressed, up to 2TB
    SDXC,
}

impl Generation {
    pub fn high_capacity(self) -> bool {
        !matches!(self, Self::SDSC)
    }

    /// SCR may tell SDXC apart from SDHC, but never changes the addressing mode
    pub fn refine(self, scr: registers::SCR) -> Self {
        match (self, scr.generation()) {
            (Self::SDHC, Some(Self::SDXC)) => Self::SDXC,
            _ => self,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BusWidth {
    One,
    Four,
}

/// Card properties discovered during reset
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CardInfo {
    pub generation: Generation,
    pub relative_address: command::RCA,
    pub sector_count: u64,
    pub sector_size: u32,
    /// Always a single sector, SSR allocation unit sizes are not consulted
    pub erase_granularity: u32,
}

impl CardInfo {
    pub fn capacity(&self) -> u64 {
        self.sector_count * self.sector_size as u64
    }

    /// Argument of a data command addressing `sector`
    pub fn address(&self, sector: u32) -> Option<command::Address> {
        match self.generation.high_capacity() {
            true => Some(sector),
            false => sector.checked_mul(BLOCK_SIZE as u32),
        }
    }
}
