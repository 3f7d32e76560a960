use crate::sd::command::Command;
use crate::sd::response::Response;
use crate::sd::BusWidth;

#[derive(Debug)]
pub enum Error<BUS> {
    BUS(BUS),                // Underlying pin or peripheral error
    CommandTimeout,          // No response, probably no card or unsupported command
    CommandCrcFail,          // Response CRC mismatch, or card reported a command CRC error
    DataTimeout,             // No data start bit or card kept busy too long
    DataCrcFail,             // Data block CRC mismatch on either side
    ReceiveOverrun,          // Host FIFO overflowed during a read
    TransmitUnderrun,        // Host FIFO ran empty during a write
    BusProtocolError,        // Malformed frame or generic card error
    WriteRejected,           // Card refused the written data
    UnexpectedCommandEcho,   // Response carries another command index
    NotSupported,            // Voltage or generation negotiation failed
    WrongStatus,             // Card not in transfer state, retry later
    OutOfRange,              // Sector beyond the card capacity
    Uninitialized,           // No card info, reset first
}

impl<BUS> Error<BUS> {
    /// Only a card still busy with a previous operation is worth retrying as is
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WrongStatus)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Speed {
    /// Identification rate, 100KHz to 400KHz
    Init,
    /// Transfer rate, up to 25MHz
    Transfer,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Direction {
    CardToHost,
    HostToCard,
}

/// Moves commands and data blocks between host and card.
///
/// Data bytes are always handed over in bus order, first byte on the wire first.
pub trait Transport {
    type Error;

    fn init(&mut self) -> Result<(), Error<Self::Error>> {
        Ok(())
    }

    /// Whether the card must be sent to idle state with CMD0 before negotiation
    fn requires_go_idle(&self) -> bool {
        false
    }

    fn send_command(&mut self, cmd: Command) -> Result<Response, Error<Self::Error>>;

    /// Arms the data path before the data command is issued
    fn prepare_transfer(
        &mut self,
        _direction: Direction,
        _block_size: usize,
        _num_blocks: usize,
    ) -> Result<(), Error<Self::Error>> {
        Ok(())
    }

    fn transfer_block_in(&mut self, block: &mut [u8]) -> Result<(), Error<Self::Error>>;

    fn transfer_block_out(&mut self, block: &[u8]) -> Result<(), Error<Self::Error>>;

    /// Checks the outcome of the whole transfer once the last block has moved
    fn finish_transfer(&mut self) -> Result<(), Error<Self::Error>> {
        Ok(())
    }

    fn set_speed(&mut self, speed: Speed) -> Result<(), Error<Self::Error>>;

    fn supports_bus_width(&self, width: BusWidth) -> bool {
        width == BusWidth::One
    }

    /// Switches the host side, back to 1-bit before identification and to 4-bit
    /// once the card accepted ACMD6
    fn set_bus_width(&mut self, _width: BusWidth) -> Result<(), Error<Self::Error>> {
        Ok(())
    }
}

pub mod bitbang;
pub mod sdio;
