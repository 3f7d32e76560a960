use bitfield::{bitfield, Bit};

use crate::bus::Error;
use crate::crc::crc7;

use super::command::{Command, RCA, INTERFACE_CONDITION};

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum Response {
    #[default]
    None,
    Short(u32),
    Long(u128),
}

impl Response {
    pub fn short<E>(self) -> Result<u32, Error<E>> {
        match self {
            Self::Short(value) => Ok(value),
            _ => Err(Error::BusProtocolError),
        }
    }

    pub fn long<E>(self) -> Result<u128, Error<E>> {
        match self {
            Self::Long(value) => Ok(value),
            _ => Err(Error::BusProtocolError),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum CurrentState {
    Idle = 0,
    Ready,
    Ident,
    Standby,
    Transfer,
    Data,
    Receive,
    Program,
    Disabled,
    Reserved,
}

impl From<u8> for CurrentState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Ready,
            2 => Self::Ident,
            3 => Self::Standby,
            4 => Self::Transfer,
            5 => Self::Data,
            6 => Self::Receive,
            7 => Self::Program,
            8 => Self::Disabled,
            _ => Self::Reserved,
        }
    }
}

bitfield! {
    /// Card status carried by R1 responses
    #[derive(Copy, Clone, Default, PartialEq)]
    pub struct CardStatus(u32);
    impl Debug;
    pub out_of_range, _: 31;
    pub address_error, _: 30;
    pub block_len_error, _: 29;
    pub wp_violation, _: 26;
    pub card_is_locked, _: 25;
    pub com_crc_error, _: 23;
    pub illegal_command, _: 22;
    pub card_ecc_failed, _: 21;
    pub error, _: 19;
    pub u8, state, _: 12, 9;
    pub ready_for_data, _: 8;
    pub app_cmd, _: 5;
}

const ERROR_MASK: u32 = 0xFDF9_8008;

impl From<u32> for CardStatus {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl CardStatus {
    pub fn current_state(self) -> CurrentState {
        self.state().into()
    }

    pub fn any_error(self) -> bool {
        self.0 & ERROR_MASK != 0
    }

    /// Error reported by the card, most specific first
    pub fn to_error<E>(self) -> Option<Error<E>> {
        if !self.any_error() {
            return None;
        }
        let error = if self.com_crc_error() {
            Error::CommandCrcFail
        } else if self.wp_violation() {
            Error::WriteRejected
        } else if self.out_of_range() || self.address_error() {
            Error::OutOfRange
        } else {
            Error::BusProtocolError
        };
        Some(error)
    }
}

/// Operation conditions register
#[derive(Copy, Clone, Default, Debug)]
pub struct R3(pub u32);

impl R3 {
    /// Busy bit, set once the card finished its power up routine
    pub fn power_up_complete(self) -> bool {
        self.0.bit(31)
    }

    pub fn card_capacity_status(self) -> bool {
        self.0.bit(30)
    }
}

/// Published RCA response
#[derive(Copy, Clone, Default, Debug)]
pub struct R6(pub u32);

impl R6 {
    pub fn rca(self) -> RCA {
        (self.0 >> 16) as RCA
    }

    /// Status bits 23, 22, 19 and 12:0 of the card status, compressed into the low half
    pub fn card_status(self) -> CardStatus {
        let value = self.0 & 0x1FFF
            | ((self.0 >> 15) & 1) << 23
            | ((self.0 >> 14) & 1) << 22
            | ((self.0 >> 13) & 1) << 19;
        CardStatus(value)
    }
}

#[derive(Copy, Clone, Default, Debug)]
pub struct R7(pub u32);

impl R7 {
    pub fn voltage_accepted(self) -> bool {
        self.0.bit(8) // only bit 8 meaningful, for now
    }

    pub fn echo_back_check_pattern(self) -> u8 {
        self.0 as u8
    }

    pub fn matches_interface_condition(self) -> bool {
        self.0 & 0xFFF == INTERFACE_CONDITION
    }
}

/// Validates a raw 48-bit response frame received for `cmd` and extracts its payload
pub fn parse_short<E>(frame: &[u8; 6], cmd: Command) -> Result<u32, Error<E>> {
    if frame[0] & 0xC0 != 0 || frame[5] & 1 == 0 {
        return Err(Error::BusProtocolError);
    }
    let response_type = cmd.response_type();
    if response_type.echoes_index() && frame[0] & 0x3F != cmd.index() {
        return Err(Error::UnexpectedCommandEcho);
    }
    if response_type.has_crc() && crc7(&frame[..5]) != frame[5] >> 1 {
        return Err(Error::CommandCrcFail);
    }
    Ok(u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]))
}

/// Validates a raw 136-bit response frame, returning register bits 127:0.
/// The register CRC7 lives in its own last byte and covers the preceding 15 bytes.
pub fn parse_long<E>(frame: &[u8; 17]) -> Result<u128, Error<E>> {
    if frame[0] != 0x3F || frame[16] & 1 == 0 {
        return Err(Error::BusProtocolError);
    }
    if crc7(&frame[1..16]) != frame[16] >> 1 {
        return Err(Error::CommandCrcFail);
    }
    let mut register = [0u8; 16];
    register.copy_from_slice(&frame[1..]);
    Ok(u128::from_be_bytes(register))
}

#[cfg(test)]
mod test {
    use core::convert::Infallible;

    use hex_literal::hex;

    use super::{parse_long, parse_short, CardStatus, CurrentState, R3, R6, R7};
    use crate::bus::Error;
    use crate::sd::command::{AppCommand, Command, SendInterfaceCondition};

    type Result<T> = core::result::Result<T, Error<Infallible>>;

    #[test]
    fn test_card_status() {
        let status = CardStatus(0x0000_0900);
        assert_eq!(status.current_state(), CurrentState::Transfer);
        assert!(status.ready_for_data());
        assert!(status.to_error::<Infallible>().is_none());

        let status = CardStatus(0x0000_0E00);
        assert_eq!(status.current_state(), CurrentState::Program);

        let error = |bits: u32| CardStatus(bits).to_error::<Infallible>();
        // Locked is a state, not an error
        let locked = CardStatus(1 << 25 | 0x900);
        assert!(locked.card_is_locked());
        assert!(error(locked.0).is_none());
        assert!(matches!(error(1 << 23), Some(Error::CommandCrcFail)));
        assert!(matches!(error(1 << 26), Some(Error::WriteRejected)));
        assert!(matches!(error(1 << 31), Some(Error::OutOfRange)));
        assert!(matches!(error(1 << 30), Some(Error::OutOfRange)));
        assert!(matches!(error(1 << 19), Some(Error::BusProtocolError)));
        // APP_CMD is informational
        assert!(CardStatus(1 << 5).to_error::<Infallible>().is_none());
    }

    #[test]
    fn test_ocr() {
        let ocr = R3(0xC0FF_8000);
        assert!(ocr.power_up_complete());
        assert!(ocr.card_capacity_status());
        assert!(!R3(0x00FF_8000).power_up_complete());
    }

    #[test]
    fn test_r6() {
        let r6 = R6(0xB368_0500);
        assert_eq!(r6.rca(), 0xB368);
        assert_eq!(r6.card_status().current_state(), CurrentState::Ident);
        assert!(r6.card_status().to_error::<Infallible>().is_none());
        let r6 = R6(0x0001_8000);
        assert!(r6.card_status().com_crc_error());
    }

    #[test]
    fn test_r7() {
        let r7 = R7(0x1AA);
        assert!(r7.voltage_accepted());
        assert_eq!(r7.echo_back_check_pattern(), 0xAA);
        assert!(r7.matches_interface_condition());
        assert!(!R7(0x1A5).matches_interface_condition());
    }

    #[test]
    fn test_parse_short() {
        let cmd = Command::SendIfCond(SendInterfaceCondition::standard());
        let value: Result<u32> = parse_short(&hex!("08 00 00 01 AA 13"), cmd);
        assert_eq!(value.ok(), Some(0x1AA));

        let echo: Result<u32> = parse_short(&hex!("09 00 00 01 AA 13"), cmd);
        assert!(matches!(echo, Err(Error::UnexpectedCommandEcho)));

        let crc: Result<u32> = parse_short(&hex!("08 00 00 01 AA 15"), cmd);
        assert!(matches!(crc, Err(Error::CommandCrcFail)));

        // OCR responses carry 0x3F as index and all-ones CRC
        let cmd = Command::App(AppCommand::SDSendOpCond(true));
        let ocr: Result<u32> = parse_short(&hex!("3F C0 FF 80 00 FF"), cmd);
        assert_eq!(ocr.ok(), Some(0xC0FF_8000));

        let end_bit: Result<u32> = parse_short(&hex!("3F C0 FF 80 00 FE"), cmd);
        assert!(matches!(end_bit, Err(Error::BusProtocolError)));
    }

    #[test]
    fn test_parse_long() {
        let frame = hex!("3F 00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");
        let csd: Result<u128> = parse_long(&frame);
        assert_eq!(csd.ok(), Some(0x0026_0032_5F59_83C8_ADDB_CFFF_D240_40A5));

        let frame = hex!("3F 00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 41 A5");
        let csd: Result<u128> = parse_long(&frame);
        assert!(matches!(csd, Err(Error::CommandCrcFail)));
    }
}
