//! An in-memory card answering at the command level.
//!
//! `SimCard` implements [`Transport`] by following the card state diagram of the
//! physical layer: identification, data transfer and programming states, CMD55
//! prefixed application commands, byte or block addressing depending on the
//! card generation. Sectors never written read as zeros.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::convert::Infallible;

use crate::bus::{Direction, Error, Speed, Transport};
use crate::sd::command::{AppCommand, Command, OCR_VOLTAGE_WINDOW, RCA};
use crate::sd::response::{CurrentState, Response};
use crate::sd::{BusWidth, Generation, BLOCK_SIZE};

type BUSError = Error<Infallible>;

const ILLEGAL_COMMAND: u32 = 1 << 22;
const OUT_OF_RANGE: u32 = 1 << 31;
const ADDRESS_ERROR: u32 = 1 << 30;

/// A command as seen by the card
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Issued {
    pub index: u8,
    pub argument: u32,
    /// Sent as an application command
    pub app: bool,
}

/// Data path arming requested by the host
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Transfer {
    pub direction: Direction,
    pub block_size: usize,
    pub num_blocks: usize,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Pending {
    Idle,
    Scr,
    Read { sector: u64, multiple: bool },
    Write { sector: u64, multiple: bool },
}

pub struct SimCard {
    generation: Generation,
    legacy: bool,
    sector_count: u64,
    csd: u128,
    cid: u128,
    scr: [u8; 8],
    rca: RCA,
    interface_condition: Option<u32>,
    ready_after: Option<u32>,
    op_cond_polls: u32,
    program_polls: u32,
    busy_polls: u32,
    state: CurrentState,
    app: bool,
    pending: Pending,
    sectors: BTreeMap<u64, [u8; BLOCK_SIZE]>,
    go_idle: bool,
    four_bit_host: bool,
    locked: bool,
    /// Commands in the order they arrived
    pub history: Vec<Issued>,
    pub transfers: Vec<Transfer>,
    pub blocks_moved: usize,
    /// Width the card drives, switched by ACMD6
    pub bus_width: BusWidth,
    /// Width the host samples, data is garbled while the two differ
    pub host_width: BusWidth,
    pub speed: Option<Speed>,
    pub block_length: u32,
    pub pre_erase: Option<u32>,
}

fn csd_v1(sector_count: u64) -> u128 {
    // READ_BL_LEN 512 and C_SIZE_MULT 7, each C_SIZE unit is 512 sectors
    let c_size = (sector_count / 512).saturating_sub(1).min(0xFFF) as u128;
    9 << 80 | c_size << 62 | 7 << 47 | 1
}

fn csd_v2(sector_count: u64) -> u128 {
    let c_size = (sector_count / 1024).saturating_sub(1).min(0x3F_FFFF) as u128;
    1 << 126 | 9 << 80 | c_size << 48 | 1
}

impl SimCard {
    /// A card reporting `generation` with the closest capacity the CSD can describe
    pub fn new(generation: Generation, sector_count: u64) -> Self {
        let (csd, security) = match generation {
            Generation::SDSC => (csd_v1(sector_count), 2),
            Generation::SDHC => (csd_v2(sector_count), 3),
            Generation::SDXC => (csd_v2(sector_count), 4),
        };
        let mut card = Self {
            generation,
            legacy: false,
            sector_count: 0,
            csd: 0,
            cid: 0x0353_4453_5530_3847_8012_3456_7800_C701,
            scr: [0x02, security << 4 | 0b0101, 0, 0, 0, 0, 0, 0],
            rca: 0xB368,
            interface_condition: None,
            ready_after: Some(2),
            op_cond_polls: 0,
            program_polls: 0,
            busy_polls: 0,
            state: CurrentState::Idle,
            app: false,
            pending: Pending::Idle,
            sectors: BTreeMap::new(),
            go_idle: true,
            four_bit_host: true,
            locked: false,
            history: Vec::new(),
            transfers: Vec::new(),
            blocks_moved: 0,
            bus_width: BusWidth::One,
            host_width: BusWidth::One,
            speed: None,
            block_length: BLOCK_SIZE as u32,
            pre_erase: None,
        };
        card.set_csd(csd);
        card
    }

    /// PLSS 1.x card, never answers CMD8 and is always standard capacity
    pub fn legacy(mut self) -> Self {
        self.legacy = true;
        self.generation = Generation::SDSC;
        self
    }

    pub fn csd(mut self, csd: u128) -> Self {
        self.set_csd(csd);
        self
    }

    pub fn scr(mut self, scr: [u8; 8]) -> Self {
        self.scr = scr;
        self
    }

    /// Answers CMD8 with `value` instead of echoing the argument
    pub fn interface_condition(mut self, value: u32) -> Self {
        self.interface_condition = Some(value);
        self
    }

    /// ACMD41 polls answered busy before power up completes, `None` for never
    pub fn ready_after(mut self, polls: Option<u32>) -> Self {
        self.ready_after = polls;
        self
    }

    /// CMD13 polls reporting the programming state after each write
    pub fn program_polls(mut self, polls: u32) -> Self {
        self.program_polls = polls;
        self
    }

    /// Password protected, reported through CARD_IS_LOCKED in every status
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    /// Host side without CMD0 and with a 1-bit bus only
    pub fn minimal_host(mut self) -> Self {
        self.go_idle = false;
        self.four_bit_host = false;
        self
    }

    /// Stores `data` starting at `sector`, a partial last sector is zero padded
    pub fn load(&mut self, sector: u64, data: &[u8]) {
        for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            if chunk.iter().all(|&byte| byte == 0) {
                continue;
            }
            let mut block = [0u8; BLOCK_SIZE];
            block[..chunk.len()].copy_from_slice(chunk);
            self.sectors.insert(sector + i as u64, block);
        }
    }

    pub fn sector(&self, sector: u64) -> [u8; BLOCK_SIZE] {
        self.sectors.get(&sector).copied().unwrap_or([0u8; BLOCK_SIZE])
    }

    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    pub fn state(&self) -> CurrentState {
        self.state
    }

    /// Indices of application commands are reported as is, see `Issued::app`
    pub fn indices(&self) -> Vec<u8> {
        self.history.iter().map(|issued| issued.index).collect()
    }

    fn set_csd(&mut self, csd: u128) {
        self.csd = csd;
        if let Some(csd) = crate::sd::registers::CSD::try_from(csd) {
            self.sector_count = csd.num_blocks();
        }
    }

    fn high_capacity(&self) -> bool {
        self.generation.high_capacity()
    }

    fn status(&self) -> u32 {
        let state = match self.busy_polls {
            0 => self.state,
            _ => CurrentState::Program,
        };
        let ready_for_data = self.state == CurrentState::Transfer && self.busy_polls == 0;
        (self.locked as u32) << 25 | (state as u32) << 9 | (ready_for_data as u32) << 8
    }

    fn short(&self) -> Result<Response, BUSError> {
        Ok(Response::Short(self.status()))
    }

    fn addressed(&self, rca: RCA) -> Result<(), BUSError> {
        match rca == self.rca {
            true => Ok(()),
            false => Err(Error::CommandTimeout),
        }
    }

    fn sector_of(&self, address: u32) -> Result<u64, u32> {
        let sector = match self.high_capacity() {
            true => address as u64,
            false if address as usize % BLOCK_SIZE != 0 => return Err(ADDRESS_ERROR),
            false => (address as usize / BLOCK_SIZE) as u64,
        };
        match sector < self.sector_count {
            true => Ok(sector),
            false => Err(OUT_OF_RANGE),
        }
    }

    fn start_data(
        &mut self,
        address: u32,
        write: bool,
        multiple: bool,
    ) -> Result<Response, BUSError> {
        if self.state != CurrentState::Transfer {
            return Ok(Response::Short(self.status() | ILLEGAL_COMMAND));
        }
        let status = self.status();
        let sector = match self.sector_of(address) {
            Ok(sector) => sector,
            Err(error) => return Ok(Response::Short(status | error)),
        };
        (self.state, self.pending) = match write {
            true => (CurrentState::Receive, Pending::Write { sector, multiple }),
            false => (CurrentState::Data, Pending::Read { sector, multiple }),
        };
        Ok(Response::Short(status))
    }

    fn app_command(&mut self, cmd: AppCommand) -> Result<Response, BUSError> {
        match cmd {
            AppCommand::SDSendOpCond(hcs) => {
                if self.state != CurrentState::Idle && self.state != CurrentState::Ready {
                    return Err(Error::CommandTimeout);
                }
                self.op_cond_polls += 1;
                let accepts = hcs || !self.high_capacity();
                let polls = self.op_cond_polls;
                let ready = accepts && self.ready_after.map(|n| polls > n).unwrap_or(false);
                if !ready {
                    return Ok(Response::Short(OCR_VOLTAGE_WINDOW));
                }
                self.state = CurrentState::Ready;
                let ccs = (self.high_capacity() as u32) << 30;
                Ok(Response::Short(1 << 31 | ccs | OCR_VOLTAGE_WINDOW))
            }
            AppCommand::SendSCR => {
                let response = self.short();
                self.state = CurrentState::Data;
                self.pending = Pending::Scr;
                response
            }
            AppCommand::SetBusWidth(width) => {
                self.bus_width = width;
                self.short()
            }
            AppCommand::SetWriteBlockEraseCount(count) => {
                self.pre_erase = Some(count);
                self.short()
            }
        }
    }
}

impl Transport for SimCard {
    type Error = Infallible;

    fn requires_go_idle(&self) -> bool {
        self.go_idle
    }

    fn send_command(&mut self, cmd: Command) -> Result<Response, BUSError> {
        let app = core::mem::replace(&mut self.app, false);
        let (index, argument) = (cmd.index(), cmd.argument());
        self.history.push(Issued { index, argument, app: matches!(cmd, Command::App(_)) });
        match cmd {
            Command::GoIdleState => {
                self.state = CurrentState::Idle;
                self.pending = Pending::Idle;
                self.op_cond_polls = 0;
                self.bus_width = BusWidth::One;
                Ok(Response::None)
            }
            Command::SendIfCond(_) if self.legacy => Err(Error::CommandTimeout),
            Command::SendIfCond(_) => {
                let echo = self.interface_condition.unwrap_or(cmd.argument());
                Ok(Response::Short(echo))
            }
            Command::AppCommand(rca) => {
                let identifying = matches!(self.state, CurrentState::Idle | CurrentState::Ready);
                if !identifying {
                    self.addressed(rca)?;
                }
                self.app = true;
                Ok(Response::Short(self.status() | 1 << 5))
            }
            Command::App(cmd) if app => self.app_command(cmd),
            Command::App(_) => Ok(Response::Short(self.status() | ILLEGAL_COMMAND)),
            Command::AllSendCID if self.state == CurrentState::Ready => {
                self.state = CurrentState::Ident;
                Ok(Response::Long(self.cid))
            }
            Command::SendRelativeAddress if self.state == CurrentState::Ident => {
                let status = self.status();
                self.state = CurrentState::Standby;
                Ok(Response::Short((self.rca as u32) << 16 | status & 0x1FFF))
            }
            Command::AllSendCID | Command::SendRelativeAddress => Err(Error::CommandTimeout),
            Command::SendCSD(rca) => {
                self.addressed(rca)?;
                Ok(Response::Long(self.csd))
            }
            Command::SelectCard(rca) => {
                self.addressed(rca)?;
                let response = self.short();
                self.state = CurrentState::Transfer;
                response
            }
            Command::SendStatus(rca) => {
                self.addressed(rca)?;
                let response = self.short();
                self.busy_polls = self.busy_polls.saturating_sub(1);
                response
            }
            Command::SetBlockLength(length) => {
                self.block_length = length;
                self.short()
            }
            Command::ReadSingleBlock(address) => self.start_data(address, false, false),
            Command::ReadMultipleBlock(address) => self.start_data(address, false, true),
            Command::WriteBlock(address) => self.start_data(address, true, false),
            Command::WriteMultipleBlock(address) => self.start_data(address, true, true),
            Command::StopTransmission => {
                let response = self.short();
                if matches!(self.pending, Pending::Write { .. }) {
                    self.busy_polls = self.program_polls;
                }
                self.state = CurrentState::Transfer;
                self.pending = Pending::Idle;
                response
            }
            // SPI mode only
            Command::ReadOCR => Err(Error::CommandTimeout),
        }
    }

    fn prepare_transfer(
        &mut self,
        direction: Direction,
        block_size: usize,
        num_blocks: usize,
    ) -> Result<(), BUSError> {
        self.transfers.push(Transfer { direction, block_size, num_blocks });
        Ok(())
    }

    fn transfer_block_in(&mut self, block: &mut [u8]) -> Result<(), BUSError> {
        if self.host_width != self.bus_width {
            return Err(Error::DataCrcFail);
        }
        match self.pending {
            Pending::Scr if block.len() == self.scr.len() => {
                block.copy_from_slice(&self.scr);
                self.state = CurrentState::Transfer;
                self.pending = Pending::Idle;
            }
            Pending::Read { sector, multiple } if block.len() == BLOCK_SIZE => {
                if sector >= self.sector_count {
                    return Err(Error::DataTimeout);
                }
                block.copy_from_slice(&self.sector(sector));
                self.pending = match multiple {
                    true => Pending::Read { sector: sector + 1, multiple },
                    false => {
                        self.state = CurrentState::Transfer;
                        Pending::Idle
                    }
                };
            }
            Pending::Idle => return Err(Error::DataTimeout),
            _ => return Err(Error::BusProtocolError),
        }
        self.blocks_moved += 1;
        Ok(())
    }

    fn transfer_block_out(&mut self, block: &[u8]) -> Result<(), BUSError> {
        let (sector, multiple) = match self.pending {
            Pending::Write { sector, multiple } => (sector, multiple),
            _ => return Err(Error::DataTimeout),
        };
        if self.host_width != self.bus_width {
            return Err(Error::DataCrcFail);
        }
        if sector >= self.sector_count {
            return Err(Error::WriteRejected);
        }
        if block.len() != BLOCK_SIZE {
            return Err(Error::DataCrcFail);
        }
        self.load(sector, block);
        if block.iter().all(|&byte| byte == 0) {
            self.sectors.remove(&sector);
        }
        self.blocks_moved += 1;
        self.pending = match multiple {
            true => Pending::Write { sector: sector + 1, multiple },
            false => {
                self.state = CurrentState::Transfer;
                self.busy_polls = self.program_polls;
                Pending::Idle
            }
        };
        Ok(())
    }

    fn set_speed(&mut self, speed: Speed) -> Result<(), BUSError> {
        self.speed = Some(speed);
        Ok(())
    }

    fn supports_bus_width(&self, width: BusWidth) -> bool {
        width == BusWidth::One || self.four_bit_host
    }

    fn set_bus_width(&mut self, width: BusWidth) -> Result<(), BUSError> {
        self.host_width = width;
        Ok(())
    }
}
