//! SD bus driven by a host controller peripheral, CRCs and framing are done in silicon.
//!
//! The register model follows the STM32 SDIO block: a command path state machine
//! signalling through a static status register, four response registers, and a
//! data path fed through a 32-bit FIFO either by the CPU or by a DMA stream.

pub mod dma;

use core::convert::Infallible;

use bitfield::bitfield;

use crate::bus::{self, Direction, Speed, Transport};
use crate::sd::command::{Command, ResponseType};
use crate::sd::response::Response;
use crate::sd::BusWidth;

pub use dma::{Dma, Stream};

pub type BUSError = bus::Error<Infallible>;

/// Status register polls before the command path is considered stuck
pub const COMMAND_POLL_LIMIT: u32 = 0x0010_0000;
/// Status register polls while waiting for FIFO room, data or the end of busy
pub const DATA_POLL_LIMIT: u32 = 0x0100_0000;

bitfield! {
    #[derive(Copy, Clone, Default, PartialEq)]
    pub struct Status(u32);
    impl Debug;
    pub ccrcfail, _: 0;
    pub dcrcfail, _: 1;
    pub ctimeout, _: 2;
    pub dtimeout, _: 3;
    pub txunderr, _: 4;
    pub rxoverr, _: 5;
    pub cmdrend, _: 6;
    pub cmdsent, _: 7;
    pub dataend, _: 8;
    pub stbiterr, _: 9;
    pub dbckend, _: 10;
    pub cmdact, _: 11;
    pub txact, _: 12;
    pub rxact, _: 13;
    pub txfifohe, _: 14;
    pub rxfifohf, _: 15;
    pub txfifof, _: 16;
    pub rxfifof, _: 17;
    pub txfifoe, _: 18;
    pub rxfifoe, _: 19;
    pub txdavl, _: 20;
    pub rxdavl, _: 21;
}

impl From<u32> for Status {
    fn from(bits: u32) -> Self {
        Self(bits)
    }
}

impl Status {
    pub fn data_error(self) -> Option<BUSError> {
        let error = if self.dcrcfail() {
            BUSError::DataCrcFail
        } else if self.dtimeout() {
            BUSError::DataTimeout
        } else if self.rxoverr() {
            BUSError::ReceiveOverrun
        } else if self.txunderr() {
            BUSError::TransmitUnderrun
        } else if self.stbiterr() {
            BUSError::BusProtocolError
        } else {
            return None;
        };
        Some(error)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum WaitResponse {
    None,
    Short,
    Long,
}

/// Register level access to an SD host controller
pub trait Controller {
    fn power_on(&mut self);
    fn set_clock(&mut self, speed: Speed);
    fn max_bus_width(&self) -> BusWidth;
    fn set_bus_width(&mut self, width: BusWidth);
    /// Loads the argument and enables the command path state machine
    fn start_command(&mut self, index: u8, argument: u32, wait: WaitResponse);
    fn status(&self) -> Status;
    /// Clears every static flag of the status register
    fn clear_status(&mut self);
    /// Command index of the last response
    fn response_command(&self) -> u8;
    /// RESP1 to RESP4, RESP1 holding the most significant bits of a long response
    fn response(&self, index: usize) -> u32;
    /// Loads data length, block size and direction and enables the data path state machine
    fn start_data(&mut self, length: u32, block_size_shift: u8, direction: Direction, dma: bool);
    fn read_fifo(&mut self) -> u32;
    fn write_fifo(&mut self, word: u32);
    /// DAT0 held low by the card
    fn card_busy(&self) -> bool;
}

/// Moves data blocks between memory and the controller FIFO
pub trait DataPath<C: Controller> {
    fn uses_dma(&self) -> bool;
    fn read(&mut self, controller: &mut C, block: &mut [u8]) -> Result<(), BUSError>;
    fn write(&mut self, controller: &mut C, block: &[u8]) -> Result<(), BUSError>;
}

fn wait_status<C: Controller>(
    controller: &C,
    limit: u32,
    done: impl Fn(Status) -> bool,
) -> Result<Status, BUSError> {
    for _ in 0..limit {
        let status = controller.status();
        if let Some(error) = status.data_error() {
            return Err(error);
        }
        if done(status) {
            return Ok(status);
        }
    }
    Err(BUSError::DataTimeout)
}

fn wait_not_busy<C: Controller>(controller: &C) -> Result<(), BUSError> {
    match (0..DATA_POLL_LIMIT).any(|_| !controller.card_busy()) {
        true => Ok(()),
        false => Err(BUSError::DataTimeout),
    }
}

/// CPU copies every word through the FIFO
#[derive(Copy, Clone, Debug, Default)]
pub struct Fifo;

impl<C: Controller> DataPath<C> for Fifo {
    fn uses_dma(&self) -> bool {
        false
    }

    fn read(&mut self, controller: &mut C, block: &mut [u8]) -> Result<(), BUSError> {
        for chunk in block.chunks_mut(4) {
            wait_status(controller, DATA_POLL_LIMIT, |status| status.rxdavl())?;
            let bytes = controller.read_fifo().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
        Ok(())
    }

    fn write(&mut self, controller: &mut C, block: &[u8]) -> Result<(), BUSError> {
        for chunk in block.chunks(4) {
            wait_status(controller, DATA_POLL_LIMIT, |status| !status.txfifof())?;
            let mut bytes = [0u8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            controller.write_fifo(u32::from_le_bytes(bytes));
        }
        Ok(())
    }
}

pub struct Sdio<C, P = Fifo> {
    controller: C,
    data_path: P,
}

impl<C: Controller> Sdio<C, Fifo> {
    pub fn new(controller: C) -> Self {
        Self { controller, data_path: Fifo }
    }
}

impl<C: Controller, S, T> Sdio<C, Dma<S, T>> {
    pub fn with_dma(controller: C, dma: Dma<S, T>) -> Self {
        Self { controller, data_path: dma }
    }
}

impl<C: Controller, P> Sdio<C, P> {
    pub fn controller<R>(&mut self, f: impl Fn(&mut C) -> R) -> R {
        f(&mut self.controller)
    }

    pub fn release(self) -> (C, P) {
        (self.controller, self.data_path)
    }
}

impl<C: Controller, P: DataPath<C>> Transport for Sdio<C, P> {
    type Error = Infallible;

    fn init(&mut self) -> Result<(), BUSError> {
        self.controller.power_on();
        self.controller.set_bus_width(BusWidth::One);
        self.controller.set_clock(Speed::Init);
        Ok(())
    }

    fn send_command(&mut self, cmd: Command) -> Result<Response, BUSError> {
        let response_type = cmd.response_type();
        let wait = match response_type {
            ResponseType::None => WaitResponse::None,
            ResponseType::Long => WaitResponse::Long,
            _ => WaitResponse::Short,
        };
        trace!("CMD{} {:08X}", cmd.index(), cmd.argument());
        self.controller.clear_status();
        self.controller.start_command(cmd.index(), cmd.argument(), wait);

        let mut polls = 0;
        let status = loop {
            let status = self.controller.status();
            let done = match wait {
                WaitResponse::None => status.ctimeout() || status.cmdsent(),
                _ => status.ctimeout() || status.cmdrend() || status.ccrcfail(),
            };
            if done {
                break status;
            }
            polls += 1;
            if polls >= COMMAND_POLL_LIMIT {
                return Err(BUSError::CommandTimeout);
            }
        };
        self.controller.clear_status();

        if status.ctimeout() {
            return Err(BUSError::CommandTimeout);
        }
        // OCR responses carry no valid CRC, CCRCFAIL is raised for them regardless
        if status.ccrcfail() && response_type.has_crc() {
            return Err(BUSError::CommandCrcFail);
        }
        if response_type.echoes_index() && self.controller.response_command() != cmd.index() {
            return Err(BUSError::UnexpectedCommandEcho);
        }
        let response = match wait {
            WaitResponse::None => Response::None,
            WaitResponse::Short => Response::Short(self.controller.response(0)),
            WaitResponse::Long => {
                let value = (0..4).fold(0u128, |value, index| {
                    value << 32 | self.controller.response(index) as u128
                });
                Response::Long(value)
            }
        };
        if response_type == ResponseType::ShortBusy {
            wait_not_busy(&self.controller)?;
        }
        Ok(response)
    }

    fn prepare_transfer(
        &mut self,
        direction: Direction,
        block_size: usize,
        num_blocks: usize,
    ) -> Result<(), BUSError> {
        let length = (block_size * num_blocks) as u32;
        let shift = block_size.trailing_zeros() as u8;
        self.controller.clear_status();
        self.controller.start_data(length, shift, direction, self.data_path.uses_dma());
        Ok(())
    }

    fn transfer_block_in(&mut self, block: &mut [u8]) -> Result<(), BUSError> {
        self.data_path.read(&mut self.controller, block)
    }

    fn transfer_block_out(&mut self, block: &[u8]) -> Result<(), BUSError> {
        self.data_path.write(&mut self.controller, block)
    }

    fn finish_transfer(&mut self) -> Result<(), BUSError> {
        let result = wait_status(&self.controller, DATA_POLL_LIMIT, |status| status.dataend());
        self.controller.clear_status();
        result.map(|_| ())
    }

    fn set_speed(&mut self, speed: Speed) -> Result<(), BUSError> {
        self.controller.set_clock(speed);
        Ok(())
    }

    fn supports_bus_width(&self, width: BusWidth) -> bool {
        width == BusWidth::One || self.controller.max_bus_width() == BusWidth::Four
    }

    fn set_bus_width(&mut self, width: BusWidth) -> Result<(), BUSError> {
        self.controller.set_bus_width(width);
        Ok(())
    }
}
