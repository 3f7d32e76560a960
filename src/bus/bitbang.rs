//! SD bus clocked in software over three GPIO lines: CLK, CMD and DAT0.
//!
//! CMD and DAT0 must be open-drain with pull-ups, `set_high` releases the line so
//! the card may drive it. Every frame is protected by CRCs computed on the host.

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::digital::v2::{InputPin, OutputPin};

use crate::bus::{self, Speed, Transport};
use crate::crc::crc16;
use crate::sd::command::{Command, ResponseType};
use crate::sd::response::{self, Response};

pub type BUSError<E> = bus::Error<E>;

/// Clock periods and wait bounds, bounds are counted in clock cycles
#[derive(Copy, Clone, Debug)]
pub struct Timing {
    pub init_half_period_us: u32,
    pub transfer_half_period_us: u32,
    /// Ncr, clocks between command end bit and response start bit
    pub response_clocks: u32,
    /// Nac, clocks before a read data block starts
    pub data_start_clocks: u32,
    /// Clocks the card may hold DAT0 low while programming
    pub busy_clocks: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            init_half_period_us: 2,
            transfer_half_period_us: 0,
            response_clocks: 64,
            data_start_clocks: 100_000,
            busy_clocks: 500_000,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Line {
    CMD,
    DAT,
}

pub struct BitBang<CLK, CMD, DAT, D> {
    clk: CLK,
    cmd: CMD,
    dat: DAT,
    delay: D,
    timing: Timing,
    half_period_us: u32,
}

impl<E, CLK, CMD, DAT, D> BitBang<CLK, CMD, DAT, D>
where
    CLK: OutputPin<Error = E>,
    CMD: OutputPin<Error = E> + InputPin<Error = E>,
    DAT: OutputPin<Error = E> + InputPin<Error = E>,
    D: DelayUs<u32>,
{
    pub fn new(clk: CLK, cmd: CMD, dat: DAT, delay: D, timing: Timing) -> Self {
        let half_period_us = timing.init_half_period_us;
        Self { clk, cmd, dat, delay, timing, half_period_us }
    }

    pub fn release(self) -> (CLK, CMD, DAT, D) {
        (self.clk, self.cmd, self.dat, self.delay)
    }

    fn pause(&mut self) {
        if self.half_period_us > 0 {
            self.delay.delay_us(self.half_period_us);
        }
    }

    fn drive(&mut self, line: Line, high: bool) -> Result<(), BUSError<E>> {
        let result = match (line, high) {
            (Line::CMD, true) => self.cmd.set_high(),
            (Line::CMD, false) => self.cmd.set_low(),
            (Line::DAT, true) => self.dat.set_high(),
            (Line::DAT, false) => self.dat.set_low(),
        };
        result.map_err(BUSError::BUS)
    }

    /// Host changes its output while CLK is low, the card latches on the rising edge
    fn tx_bit(&mut self, line: Line, bit: bool) -> Result<(), BUSError<E>> {
        self.clk.set_low().map_err(BUSError::BUS)?;
        self.drive(line, bit)?;
        self.pause();
        self.clk.set_high().map_err(BUSError::BUS)?;
        self.pause();
        Ok(())
    }

    fn rx_bit(&mut self, line: Line) -> Result<bool, BUSError<E>> {
        self.clk.set_low().map_err(BUSError::BUS)?;
        self.pause();
        self.clk.set_high().map_err(BUSError::BUS)?;
        let bit = match line {
            Line::CMD => self.cmd.is_high(),
            Line::DAT => self.dat.is_high(),
        };
        self.pause();
        bit.map_err(BUSError::BUS)
    }

    fn tx(&mut self, line: Line, bytes: &[u8]) -> Result<(), BUSError<E>> {
        for &byte in bytes.iter() {
            for i in (0..8).rev() {
                self.tx_bit(line, (byte >> i) & 1 != 0)?;
            }
        }
        Ok(())
    }

    fn rx_byte(&mut self, line: Line) -> Result<u8, BUSError<E>> {
        let mut byte = 0u8;
        for _ in 0..8 {
            byte = byte << 1 | self.rx_bit(line)? as u8;
        }
        Ok(byte)
    }

    fn clocks(&mut self, count: usize) -> Result<(), BUSError<E>> {
        for _ in 0..count {
            self.rx_bit(Line::CMD)?;
        }
        Ok(())
    }

    /// Clocks until `line` goes low, which is the start bit of a frame
    fn wait_start_bit(&mut self, line: Line, clocks: u32) -> Result<bool, BUSError<E>> {
        for _ in 0..clocks {
            if !self.rx_bit(line)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn wait_not_busy(&mut self) -> Result<(), BUSError<E>> {
        for _ in 0..self.timing.busy_clocks {
            if self.rx_bit(Line::DAT)? {
                return Ok(());
            }
        }
        Err(BUSError::DataTimeout)
    }

    /// Receives a response frame, its start bit included as the first bit
    fn rx_response(&mut self, frame: &mut [u8]) -> Result<(), BUSError<E>> {
        if !self.wait_start_bit(Line::CMD, self.timing.response_clocks)? {
            return Err(BUSError::CommandTimeout);
        }
        frame.iter_mut().for_each(|byte| *byte = 0);
        for bit in 1..frame.len() * 8 {
            if self.rx_bit(Line::CMD)? {
                frame[bit / 8] |= 0x80 >> (bit % 8);
            }
        }
        Ok(())
    }
}

impl<E, CLK, CMD, DAT, D> Transport for BitBang<CLK, CMD, DAT, D>
where
    CLK: OutputPin<Error = E>,
    CMD: OutputPin<Error = E> + InputPin<Error = E>,
    DAT: OutputPin<Error = E> + InputPin<Error = E>,
    D: DelayUs<u32>,
{
    type Error = E;

    fn init(&mut self) -> Result<(), BUSError<E>> {
        self.drive(Line::CMD, true)?;
        self.drive(Line::DAT, true)?;
        self.half_period_us = self.timing.init_half_period_us;
        // Supply minimum of 74 clock cycles before the first command
        self.clocks(80)
    }

    fn requires_go_idle(&self) -> bool {
        true
    }

    fn send_command(&mut self, cmd: Command) -> Result<Response, BUSError<E>> {
        let bytes: [u8; 6] = cmd.into();
        trace!("CMD{} {:08X}", cmd.index(), cmd.argument());
        self.tx(Line::CMD, &bytes)?;
        self.drive(Line::CMD, true)?;

        let response_type = cmd.response_type();
        let response = match response_type {
            ResponseType::None => Response::None,
            ResponseType::Long => {
                let mut frame = [0u8; 17];
                self.rx_response(&mut frame)?;
                Response::Long(response::parse_long(&frame)?)
            }
            _ => {
                let mut frame = [0u8; 6];
                self.rx_response(&mut frame)?;
                Response::Short(response::parse_short(&frame, cmd)?)
            }
        };
        if response_type == ResponseType::ShortBusy {
            self.wait_not_busy()?;
        }
        self.clocks(8)?; // Ncc
        Ok(response)
    }

    fn transfer_block_in(&mut self, block: &mut [u8]) -> Result<(), BUSError<E>> {
        if !self.wait_start_bit(Line::DAT, self.timing.data_start_clocks)? {
            return Err(BUSError::DataTimeout);
        }
        for byte in block.iter_mut() {
            *byte = self.rx_byte(Line::DAT)?;
        }
        let crc = u16::from_be_bytes([self.rx_byte(Line::DAT)?, self.rx_byte(Line::DAT)?]);
        if !self.rx_bit(Line::DAT)? {
            return Err(BUSError::BusProtocolError);
        }
        if crc != crc16(block) {
            return Err(BUSError::DataCrcFail);
        }
        Ok(())
    }

    fn transfer_block_out(&mut self, block: &[u8]) -> Result<(), BUSError<E>> {
        self.clocks(2)?; // Nwr
        self.tx_bit(Line::DAT, false)?;
        self.tx(Line::DAT, block)?;
        self.tx(Line::DAT, &crc16(block).to_be_bytes())?;
        self.tx_bit(Line::DAT, true)?;
        self.drive(Line::DAT, true)?;

        if !self.wait_start_bit(Line::DAT, 8)? {
            return Err(BUSError::DataTimeout);
        }
        let mut status = 0u8;
        for _ in 0..3 {
            status = status << 1 | self.rx_bit(Line::DAT)? as u8;
        }
        self.rx_bit(Line::DAT)?; // End bit
        match status {
            0b010 => (),
            0b101 => return Err(BUSError::DataCrcFail),
            _ => return Err(BUSError::WriteRejected),
        }
        self.wait_not_busy()
    }

    fn set_speed(&mut self, speed: Speed) -> Result<(), BUSError<E>> {
        self.half_period_us = match speed {
            Speed::Init => self.timing.init_half_period_us,
            Speed::Transfer => self.timing.transfer_half_period_us,
        };
        Ok(())
    }
}
