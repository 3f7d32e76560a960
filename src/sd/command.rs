use crate::crc::crc7;

use super::BusWidth;

/// Interface condition argument of CMD8, 2.7-3.6V with check pattern 0xAA
pub const INTERFACE_CONDITION: u32 = 0x1AA;
/// Host capacity support bit of ACMD41
pub const HIGH_CAPACITY_SUPPORT: u32 = 0x4000_0000;
/// OCR voltage window 2.7-3.6V
pub const OCR_VOLTAGE_WINDOW: u32 = 0x00FF_8000;

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SendInterfaceCondition {
    pub pcie_1_2v_suppport: bool, // PCIe 1.2V
    pub pcie_availability: bool,
    pub voltage_supplied: bool,
    pub check_pattern: u8,
}

impl SendInterfaceCondition {
    pub fn standard() -> Self {
        Self { voltage_supplied: true, check_pattern: 0xAA, ..Default::default() }
    }
}

impl From<SendInterfaceCondition> for u32 {
    fn from(cond: SendInterfaceCondition) -> u32 {
        (cond.pcie_1_2v_suppport as u32) << 15
            | (cond.pcie_availability as u32) << 14
            | (cond.voltage_supplied as u32) << 8
            | cond.check_pattern as u32
    }
}

pub type RCA = u16;
pub type Address = u32;

/// Shape of the response a command expects
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ResponseType {
    None,
    /// R1
    Short,
    /// R1b, card may hold DAT0 low afterwards
    ShortBusy,
    /// R2, 136 bits
    Long,
    /// OCR, carries no valid CRC
    R3,
    /// Published RCA
    R6,
    /// Card interface condition
    R7,
}

impl ResponseType {
    /// Whether the response echoes the command index
    pub fn echoes_index(self) -> bool {
        !matches!(self, Self::None | Self::Long | Self::R3)
    }

    /// Whether the transport must validate the CRC7 of the response
    pub fn has_crc(self) -> bool {
        !matches!(self, Self::None | Self::R3)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AppCommand {
    SetBusWidth(BusWidth),
    SetWriteBlockEraseCount(u32),
    SDSendOpCond(bool), // host-capacity-support
    SendSCR,
}

impl AppCommand {
    pub fn index(self) -> u8 {
        match self {
            Self::SetBusWidth(_) => 6,
            Self::SetWriteBlockEraseCount(_) => 23,
            Self::SDSendOpCond(_) => 41,
            Self::SendSCR => 51,
        }
    }

    pub fn argument(self) -> u32 {
        match self {
            Self::SetBusWidth(BusWidth::One) => 0,
            Self::SetBusWidth(BusWidth::Four) => 2,
            Self::SetWriteBlockEraseCount(count) => count.min(0x7F_FFFF),
            Self::SDSendOpCond(hcs) => (hcs as u32) << 30 | OCR_VOLTAGE_WINDOW,
            Self::SendSCR => 0,
        }
    }

    pub fn response_type(self) -> ResponseType {
        match self {
            Self::SDSendOpCond(_) => ResponseType::R3,
            _ => ResponseType::Short,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    GoIdleState,
    AllSendCID,
    SendRelativeAddress,
    SelectCard(RCA),
    SendIfCond(SendInterfaceCondition),
    SendCSD(RCA),
    StopTransmission,
    SendStatus(RCA),
    SetBlockLength(u32),
    ReadSingleBlock(Address),
    ReadMultipleBlock(Address),
    WriteBlock(Address),
    WriteMultipleBlock(Address),
    AppCommand(RCA),
    ReadOCR,
    App(AppCommand),
}

impl Command {
    pub fn index(self) -> u8 {
        match self {
            Self::GoIdleState => 0,
            Self::AllSendCID => 2,
            Self::SendRelativeAddress => 3,
            Self::SelectCard(_) => 7,
            Self::SendIfCond(_) => 8,
            Self::SendCSD(_) => 9,
            Self::StopTransmission => 12,
            Self::SendStatus(_) => 13,
            Self::SetBlockLength(_) => 16,
            Self::ReadSingleBlock(_) => 17,
            Self::ReadMultipleBlock(_) => 18,
            Self::WriteBlock(_) => 24,
            Self::WriteMultipleBlock(_) => 25,
            Self::AppCommand(_) => 55,
            Self::ReadOCR => 58,
            Self::App(command) => command.index(),
        }
    }

    pub fn argument(self) -> u32 {
        match self {
            Self::GoIdleState
            | Self::AllSendCID
            | Self::SendRelativeAddress
            | Self::StopTransmission
            | Self::ReadOCR => 0,
            Self::SendIfCond(cond) => cond.into(),
            Self::SelectCard(rca)
            | Self::SendCSD(rca)
            | Self::SendStatus(rca)
            | Self::AppCommand(rca) => (rca as u32) << 16,
            Self::SetBlockLength(length) => length,
            Self::ReadSingleBlock(address)
            | Self::ReadMultipleBlock(address)
            | Self::WriteBlock(address)
            | Self::WriteMultipleBlock(address) => address,
            Self::App(command) => command.argument(),
        }
    }

    pub fn response_type(self) -> ResponseType {
        match self {
            Self::GoIdleState => ResponseType::None,
            Self::AllSendCID | Self::SendCSD(_) => ResponseType::Long,
            Self::SendRelativeAddress => ResponseType::R6,
            Self::SelectCard(_) | Self::StopTransmission => ResponseType::ShortBusy,
            Self::SendIfCond(_) => ResponseType::R7,
            Self::ReadOCR => ResponseType::R3,
            Self::App(command) => command.response_type(),
            _ => ResponseType::Short,
        }
    }
}

/// 48-bit command frame: start bit, transmission bit, index, argument, CRC7 and end bit
impl From<Command> for [u8; 6] {
    fn from(cmd: Command) -> [u8; 6] {
        let bytes = u32::to_be_bytes(cmd.argument());
        let mut buffer = [0x40 | cmd.index(), bytes[0], bytes[1], bytes[2], bytes[3], 0];
        buffer[5] = crc7(&buffer[..5]) << 1 | 1;
        buffer
    }
}
