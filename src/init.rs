use crate::bus::{Direction, Error, Speed, Transport};
use crate::retry;
use crate::sd::command::{AppCommand, Command, SendInterfaceCondition, RCA};
use crate::sd::registers::{CSD, SCR};
use crate::sd::response::{CardStatus, Response, R3, R6, R7};
use crate::sd::{BusWidth, CardInfo, Generation, BLOCK_SIZE};
use crate::SD;

impl<E, BUS: Transport<Error = E>> SD<BUS> {
    /// Brings the card from power up to transfer state and learns its properties.
    ///
    /// Card info of a previous reset stays in place when this one fails.
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        let card = self.identify()?;
        debug!("Card: {:?}", card);
        self.card = Some(card);
        Ok(())
    }

    fn identify(&mut self) -> Result<CardInfo, Error<E>> {
        self.set_speed(Speed::Init)?;
        self.bus.set_bus_width(BusWidth::One)?;
        if self.bus.requires_go_idle() {
            self.bus.send_command(Command::GoIdleState)?;
        }

        let generation = self.negotiate()?;

        self.bus.send_command(Command::AllSendCID)?;

        let r6 = R6(self.bus.send_command(Command::SendRelativeAddress)?.short()?);
        if let Some(error) = r6.card_status().to_error() {
            warn!("CMD3 rejected, status {:?}", r6.card_status());
            return Err(error);
        }
        let rca = r6.rca();

        let csd = self.bus.send_command(Command::SendCSD(rca))?.long()?;
        let csd = CSD::try_from(csd).ok_or(Error::NotSupported)?;
        debug!("CSD: {:?}", csd);
        if csd.block_addressed() != generation.high_capacity() {
            warn!("{:?} card reports {:?}", generation, csd);
            return Err(Error::NotSupported);
        }

        self.command(Command::SelectCard(rca))?;

        let scr = self.read_scr(rca)?;
        debug!("SCR: {:?}", scr);
        let generation = generation.refine(scr);

        let width = BusWidth::Four;
        if self.config.wide_bus && scr.bus_width_four() && self.bus.supports_bus_width(width) {
            self.send_app_command(rca, AppCommand::SetBusWidth(width))?;
            self.bus.set_bus_width(width)?;
        }

        self.set_speed(Speed::Transfer)?;

        Ok(CardInfo {
            generation,
            relative_address: rca,
            sector_count: csd.num_blocks(),
            sector_size: BLOCK_SIZE as u32,
            erase_granularity: 1,
        })
    }

    /// Voltage and capacity negotiation, ends with the card in ready state
    fn negotiate(&mut self) -> Result<Generation, Error<E>> {
        let cmd = Command::SendIfCond(SendInterfaceCondition::standard());
        let version2 = match self.bus.send_command(cmd) {
            Ok(response) => {
                let r7 = R7(response.short()?);
                if !r7.matches_interface_condition() {
                    warn!("Interface condition not accepted, echo {:#x}", r7.0);
                    return Err(Error::NotSupported);
                }
                true
            }
            Err(Error::CommandTimeout | Error::UnexpectedCommandEcho) => {
                debug!("No interface condition, version 1.x card");
                false
            }
            Err(e) => return Err(e),
        };

        let attempts = self.config.op_cond_attempts;
        let ocr = retry::poll(attempts, || {
            let cmd = AppCommand::SDSendOpCond(version2);
            let response = self.send_app_command(0, cmd).map_err(nb::Error::Other)?;
            let ocr = R3(response.short().map_err(nb::Error::Other)?);
            match ocr.power_up_complete() {
                true => Ok(ocr),
                false => Err(nb::Error::WouldBlock),
            }
        })?;

        match version2 && ocr.card_capacity_status() {
            true => Ok(Generation::SDHC),
            false => Ok(Generation::SDSC),
        }
    }

    fn read_scr(&mut self, rca: RCA) -> Result<SCR, Error<E>> {
        let mut bytes = [0u8; 8];
        self.command(Command::SetBlockLength(bytes.len() as u32))?;
        self.bus.send_command(Command::AppCommand(rca))?;
        self.bus.prepare_transfer(Direction::CardToHost, bytes.len(), 1)?;
        self.command(Command::App(AppCommand::SendSCR))?;
        self.bus.transfer_block_in(&mut bytes)?;
        self.bus.finish_transfer()?;
        self.command(Command::SetBlockLength(BLOCK_SIZE as u32))?;
        Ok(SCR::from_bytes(bytes))
    }

    /// Status of the CMD55 response is not checked, a version 1.x card still
    /// reports the illegal CMD8 in it
    pub(crate) fn send_app_command(
        &mut self,
        rca: RCA,
        cmd: AppCommand,
    ) -> Result<Response, Error<E>> {
        self.bus.send_command(Command::AppCommand(rca))?;
        self.bus.send_command(Command::App(cmd))
    }

    /// Sends a command answered with card status, failing on any error it reports
    pub(crate) fn command(&mut self, cmd: Command) -> Result<CardStatus, Error<E>> {
        let status = CardStatus::from(self.bus.send_command(cmd)?.short()?);
        match status.to_error() {
            Some(error) => {
                warn!("CMD{} status {:?}", cmd.index(), status);
                Err(error)
            }
            None => Ok(status),
        }
    }
}

#[cfg(test)]
mod test {
    use core::convert::Infallible;

    use crate::bus::{Error, Speed};
    use crate::sd::{BusWidth, Generation};
    use crate::sim::SimCard;
    use crate::{Config, SD};

    fn reset(card: SimCard, config: Config) -> (SD<SimCard>, Result<(), Error<Infallible>>) {
        let mut sd = SD::new(card, config);
        sd.init().unwrap();
        let result = sd.reset();
        (sd, result)
    }

    fn op_cond_polls(sd: &mut SD<SimCard>) -> usize {
        sd.bus(|card| card.history.iter().filter(|c| c.app && c.index == 41).count())
    }

    #[test]
    fn test_reset_sdhc() {
        let (mut sd, result) = reset(SimCard::new(Generation::SDHC, 245_760), Config::default());
        assert!(result.is_ok());
        let card = *sd.card_info().unwrap();
        assert_eq!(card.generation, Generation::SDHC);
        assert_eq!(card.sector_count, 245_760);
        assert_eq!(card.sector_size, 512);
        assert_eq!(card.erase_granularity, 1);
        assert_eq!(card.relative_address, 0xB368);
        assert_eq!(sd.speed(), Speed::Transfer);

        let indices = sd.bus(|card| card.indices());
        let expected = [0, 8, 55, 41, 55, 41, 55, 41, 2, 3, 9, 7, 16, 55, 51, 16, 55, 6];
        assert_eq!(indices, expected);
        let op_cond = sd.bus(|card| card.history[3]);
        assert_eq!(op_cond.argument, 0x40FF_8000);
        assert_eq!(sd.bus(|card| card.bus_width), BusWidth::Four);
        assert_eq!(sd.bus(|card| card.block_length), 512);
    }

    #[test]
    fn test_reset_sdsc() {
        let (sd, result) = reset(SimCard::new(Generation::SDSC, 1024 * 1024), Config::default());
        assert!(result.is_ok());
        let card = sd.card_info().unwrap();
        assert_eq!(card.generation, Generation::SDSC);
        assert_eq!(card.sector_count, 1024 * 1024);
    }

    #[test]
    fn test_reset_legacy_card() {
        let card = SimCard::new(Generation::SDSC, 4096).legacy();
        let (mut sd, result) = reset(card, Config::default());
        assert!(result.is_ok());
        assert_eq!(sd.card_info().unwrap().generation, Generation::SDSC);
        let op_cond = sd.bus(|card| card.history.iter().find(|c| c.index == 41).copied());
        assert_eq!(op_cond.unwrap().argument, 0x00FF_8000);
    }

    #[test]
    fn test_reset_sdxc() {
        let sectors = 64 * 1024 * 1024 * 2;
        let (sd, result) = reset(SimCard::new(Generation::SDXC, sectors), Config::default());
        assert!(result.is_ok());
        let card = sd.card_info().unwrap();
        assert_eq!(card.generation, Generation::SDXC);
        assert_eq!(card.capacity(), 64 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_scr_never_downgrades_addressing() {
        // Block addressed card reporting SDSC security
        let card = SimCard::new(Generation::SDHC, 245_760).scr([0x02, 0x25, 0, 0, 0, 0, 0, 0]);
        let (sd, result) = reset(card, Config::default());
        assert!(result.is_ok());
        assert_eq!(sd.card_info().unwrap().generation, Generation::SDHC);
    }

    #[test]
    fn test_interface_condition_mismatch() {
        let card = SimCard::new(Generation::SDHC, 245_760).interface_condition(0x1A5);
        let (mut sd, result) = reset(card, Config::default());
        assert!(matches!(result, Err(Error::NotSupported)));
        assert!(sd.card_info().is_none());
        assert_eq!(op_cond_polls(&mut sd), 0);
    }

    #[test]
    fn test_never_ready() {
        let card = SimCard::new(Generation::SDHC, 245_760).ready_after(None);
        let (mut sd, result) = reset(card, Config::default().op_cond_attempts(20));
        assert!(matches!(result, Err(Error::NotSupported)));
        assert!(sd.card_info().is_none());
        assert_eq!(op_cond_polls(&mut sd), 20);
    }

    #[test]
    fn test_op_cond_bound() {
        let card = SimCard::new(Generation::SDHC, 245_760).ready_after(Some(5));
        let (mut sd, result) = reset(card, Config::default().op_cond_attempts(5));
        assert!(matches!(result, Err(Error::NotSupported)));
        assert_eq!(op_cond_polls(&mut sd), 5);

        let card = SimCard::new(Generation::SDHC, 245_760).ready_after(Some(5));
        let (mut sd, result) = reset(card, Config::default().op_cond_attempts(6));
        assert!(result.is_ok());
        assert_eq!(op_cond_polls(&mut sd), 6);
    }

    #[test]
    fn test_failed_reset_keeps_card_info() {
        let (sd, result) = reset(SimCard::new(Generation::SDHC, 245_760), Config::default());
        assert!(result.is_ok());
        let before = *sd.card_info().unwrap();

        let card = SimCard::new(Generation::SDHC, 245_760).ready_after(None);
        let mut sd = SD { bus: card, card: Some(before), ..sd };
        assert!(matches!(sd.reset(), Err(Error::NotSupported)));
        assert_eq!(sd.card_info(), Some(&before));
    }

    #[test]
    fn test_reset_after_card_swap() {
        let (mut sd, result) = reset(SimCard::new(Generation::SDHC, 245_760), Config::default());
        assert!(result.is_ok());
        assert_eq!(sd.bus(|card| card.host_width), BusWidth::Four);

        // Fresh card starts on a 1-bit bus
        sd.bus(|card| *card = SimCard::new(Generation::SDXC, 64 * 1024 * 1024 * 2));
        assert!(sd.reset().is_ok());
        assert_eq!(sd.card_info().unwrap().generation, Generation::SDXC);
        let widths = sd.bus(|card| (card.bus_width, card.host_width));
        assert_eq!(widths, (BusWidth::Four, BusWidth::Four));

        // Same card again, CMD0 brings it back to 1-bit
        assert!(sd.reset().is_ok());
        assert_eq!(sd.bus(|card| card.host_width), BusWidth::Four);
    }

    #[test]
    fn test_reset_locked_card() {
        let card = SimCard::new(Generation::SDHC, 245_760).locked();
        let (mut sd, result) = reset(card, Config::default());
        assert!(result.is_ok());
        assert_eq!(sd.bus(|card| card.indices()).last(), Some(&6));
    }

    #[test]
    fn test_csd_disagrees_with_ocr() {
        // High capacity OCR, CSD version 1.0
        let csd = 9 << 80 | 0xFFF << 62 | 7 << 47;
        let card = SimCard::new(Generation::SDHC, 245_760).csd(csd);
        let (sd, result) = reset(card, Config::default());
        assert!(matches!(result, Err(Error::NotSupported)));
        assert!(sd.card_info().is_none());
    }

    #[test]
    fn test_minimal_host() {
        let card = SimCard::new(Generation::SDHC, 245_760).minimal_host();
        let (mut sd, result) = reset(card, Config::default());
        assert!(result.is_ok());
        let indices = sd.bus(|card| card.indices());
        assert_eq!(indices.first(), Some(&8));
        assert!(!indices.contains(&6));
        assert_eq!(sd.bus(|card| card.bus_width), BusWidth::One);
    }

    #[test]
    fn test_narrow_bus_by_config() {
        let card = SimCard::new(Generation::SDHC, 245_760);
        let (mut sd, result) = reset(card, Config::default().wide_bus(false));
        assert!(result.is_ok());
        assert!(!sd.bus(|card| card.indices()).contains(&6));
    }
}
