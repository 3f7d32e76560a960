//! # sdcard
//!
//! > An SD/SDHC/SDXC card driver for embedded systems, `no_std` and blocking
//!
//! The same protocol engine runs over any [`bus::Transport`]: a bit-clocked SD bus
//! on GPIO pins ([`bus::bitbang::BitBang`]) or an SD host controller
//! ([`bus::sdio::Sdio`]), with FIFO or DMA block transfers.
//!
//! ## Using this crate
//!
//! With the `std` feature, against the simulated card
//!
//! ```ignore
//! use sdcard::{sim::SimCard, Config, Generation, SD};
//!
//! let card = SimCard::new(Generation::SDHC, 245_760);
//! let mut sd = SD::new(card, Config::default());
//! sd.init().unwrap();
//! sd.reset().unwrap();
//! let info = sd.card_info().unwrap();
//! assert_eq!(info.generation, Generation::SDHC);
//! assert_eq!(info.sector_count, 245_760);
//!
//! let mut buffer = [0u8; 512];
//! sd.read(0, core::slice::from_mut(&mut buffer).iter_mut()).unwrap();
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

pub mod bus;
mod config;
pub mod crc;
mod init;
mod io;
pub mod retry;
pub mod sd;
#[cfg(any(test, feature = "std"))]
pub mod sim;

use bus::{Error, Speed, Transport};
pub use config::{Config, OP_COND_ATTEMPTS};
pub use sd::{BusWidth, CardInfo, Generation, BLOCK_SIZE};

/// Sector number, independent of the card addressing mode
pub type LBA = u32;

/// One card slot: a transport and what was learned about the card behind it
pub struct SD<BUS> {
    bus: BUS,
    config: Config,
    card: Option<CardInfo>,
    speed: Speed,
}

impl<E, BUS: Transport<Error = E>> SD<BUS> {
    pub fn new(bus: BUS, config: Config) -> Self {
        Self { bus, config, card: None, speed: Speed::Init }
    }

    /// Prepares the transport, safe to call more than once
    pub fn init(&mut self) -> Result<(), Error<E>> {
        self.bus.init()?;
        self.set_speed(Speed::Init)
    }

    /// `None` until a reset succeeded
    pub fn card_info(&self) -> Option<&CardInfo> {
        self.card.as_ref()
    }

    pub fn num_blocks(&self) -> u64 {
        self.card.map(|card| card.sector_count).unwrap_or(0)
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn config(&self) -> Config {
        self.config
    }

    pub fn bus<R>(&mut self, f: impl Fn(&mut BUS) -> R) -> R {
        f(&mut self.bus)
    }

    pub fn release(self) -> BUS {
        self.bus
    }

    fn set_speed(&mut self, speed: Speed) -> Result<(), Error<E>> {
        self.bus.set_speed(speed)?;
        self.speed = speed;
        Ok(())
    }
}
