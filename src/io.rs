use crate::bus::{Direction, Error, Transport};
use crate::sd::command::{Address, AppCommand, Command};
use crate::sd::response::CurrentState;
use crate::sd::{CardInfo, BLOCK_SIZE};
use crate::{LBA, SD};

impl<E, BUS: Transport<Error = E>> SD<BUS> {
    pub fn read<'a, B>(&mut self, sector: LBA, blocks: B) -> Result<(), Error<E>>
    where
        B: core::iter::ExactSizeIterator<Item = &'a mut [u8; BLOCK_SIZE]>,
    {
        let num_blocks = blocks.len();
        if num_blocks == 0 {
            return Ok(());
        }
        let (_, address) = self.check_transfer_state(sector, num_blocks)?;

        self.bus.prepare_transfer(Direction::CardToHost, BLOCK_SIZE, num_blocks)?;
        let cmd = match num_blocks {
            1 => Command::ReadSingleBlock(address),
            _ => Command::ReadMultipleBlock(address),
        };
        self.command(cmd)?;
        let mut result = Ok(());
        for block in blocks {
            result = self.bus.transfer_block_in(block);
            if result.is_err() {
                break;
            }
        }
        let result = result.and_then(|_| self.bus.finish_transfer());
        self.stop_transmission(num_blocks, result)
    }

    pub fn write<'a, B>(&mut self, sector: LBA, blocks: B) -> Result<(), Error<E>>
    where
        B: core::iter::ExactSizeIterator<Item = &'a [u8; BLOCK_SIZE]>,
    {
        let num_blocks = blocks.len();
        if num_blocks == 0 {
            return Ok(());
        }
        let (card, address) = self.check_transfer_state(sector, num_blocks)?;

        if num_blocks > 1 {
            // Pre-erase hint, makes the multiple block write faster
            self.bus.send_command(Command::AppCommand(card.relative_address))?;
            self.command(Command::App(AppCommand::SetWriteBlockEraseCount(num_blocks as u32)))?;
        }

        self.bus.prepare_transfer(Direction::HostToCard, BLOCK_SIZE, num_blocks)?;
        let cmd = match num_blocks {
            1 => Command::WriteBlock(address),
            _ => Command::WriteMultipleBlock(address),
        };
        self.command(cmd)?;
        let mut result = Ok(());
        for block in blocks {
            result = self.bus.transfer_block_out(block);
            if result.is_err() {
                break;
            }
        }
        let result = result.and_then(|_| self.bus.finish_transfer());
        self.stop_transmission(num_blocks, result)
    }

    /// Range and card state checks shared by reads and writes, returns the command address
    fn check_transfer_state(
        &mut self,
        sector: LBA,
        num_blocks: usize,
    ) -> Result<(CardInfo, Address), Error<E>> {
        let card = self.card.ok_or(Error::Uninitialized)?;
        if sector as u64 + num_blocks as u64 > card.sector_count {
            return Err(Error::OutOfRange);
        }
        let address = card.address(sector).ok_or(Error::OutOfRange)?;

        let status = self.command(Command::SendStatus(card.relative_address))?;
        if status.current_state() != CurrentState::Transfer {
            debug!("Card in {:?} state", status.current_state());
            return Err(Error::WrongStatus);
        }
        Ok((card, address))
    }

    /// Ends an open ended transfer even when a block failed, the block error wins
    fn stop_transmission(
        &mut self,
        num_blocks: usize,
        result: Result<(), Error<E>>,
    ) -> Result<(), Error<E>> {
        if num_blocks == 1 {
            return result;
        }
        // Status reports OUT_OF_RANGE after reading the last sectors, not worth checking
        let stop = self.bus.send_command(Command::StopTransmission).map(|_| ());
        result.and(stop)
    }
}
