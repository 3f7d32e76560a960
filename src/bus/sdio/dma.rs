use core::time::Duration;

use embedded_hal::timer::CountDown;

use super::{BUSError, Controller, DataPath};

/// A DMA stream wired to the controller FIFO
pub trait Stream {
    /// Starts moving `len` bytes from the FIFO into `buffer`.
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid and must not be accessed until `is_complete` returns
    /// true or `abort` returns.
    unsafe fn start_read(&mut self, buffer: *mut u8, len: usize);
    /// Starts moving `len` bytes from `buffer` into the FIFO.
    ///
    /// # Safety
    ///
    /// `buffer` must stay valid and must not be written until `is_complete` returns
    /// true or `abort` returns.
    unsafe fn start_write(&mut self, buffer: *const u8, len: usize);
    fn is_complete(&self) -> bool;
    /// Disables the stream, it no longer touches memory afterwards
    fn abort(&mut self);
}

/// Block transfers handed to a DMA stream, each bounded by a wall-clock timeout
pub struct Dma<S, T> {
    stream: S,
    timer: T,
    timeout: Duration,
}

impl<S, T> Dma<S, T>
where
    S: Stream,
    T: CountDown<Time = Duration>,
{
    pub fn new(stream: S, timer: T, timeout: Duration) -> Self {
        Self { stream, timer, timeout }
    }

    pub fn release(self) -> (S, T) {
        (self.stream, self.timer)
    }

    fn wait<C: Controller>(&mut self, controller: &C) -> Result<(), BUSError> {
        self.timer.start(self.timeout);
        loop {
            if let Some(error) = controller.status().data_error() {
                self.stream.abort();
                return Err(error);
            }
            if self.stream.is_complete() {
                return Ok(());
            }
            if self.timer.wait().is_ok() {
                warn!("DMA transfer not complete within {:?}, aborted", self.timeout);
                self.stream.abort();
                return Err(BUSError::DataTimeout);
            }
        }
    }
}

impl<C, S, T> DataPath<C> for Dma<S, T>
where
    C: Controller,
    S: Stream,
    T: CountDown<Time = Duration>,
{
    fn uses_dma(&self) -> bool {
        true
    }

    fn read(&mut self, controller: &mut C, block: &mut [u8]) -> Result<(), BUSError> {
        // SAFETY: block outlives the transfer, `wait` only returns once the stream
        // completed or was aborted
        unsafe { self.stream.start_read(block.as_mut_ptr(), block.len()) };
        self.wait(controller)
    }

    fn write(&mut self, controller: &mut C, block: &[u8]) -> Result<(), BUSError> {
        // SAFETY: same as above
        unsafe { self.stream.start_write(block.as_ptr(), block.len()) };
        self.wait(controller)
    }
}

#[cfg(test)]
mod test {
    use alloc::vec::Vec;
    use core::time::Duration;

    use hex_literal::hex;

    use super::{Dma, Stream};
    use crate::bus::sdio::test::{MockController, DATAEND, DCRCFAIL};
    use crate::bus::sdio::Sdio;
    use crate::bus::{Direction, Error, Transport};

    #[derive(Default)]
    struct MockStream {
        complete_after: Option<u32>,
        polls: core::cell::Cell<u32>,
        started: Option<(Direction, usize)>,
        source: Vec<u8>,
        aborted: bool,
    }

    impl Stream for MockStream {
        unsafe fn start_read(&mut self, buffer: *mut u8, len: usize) {
            core::ptr::write_bytes(buffer, 0x5A, len);
            self.started = Some((Direction::CardToHost, len));
        }

        unsafe fn start_write(&mut self, buffer: *const u8, len: usize) {
            self.source = core::slice::from_raw_parts(buffer, len).to_vec();
            self.started = Some((Direction::HostToCard, len));
        }

        fn is_complete(&self) -> bool {
            self.polls.set(self.polls.get() + 1);
            self.complete_after.map(|n| self.polls.get() > n).unwrap_or(false)
        }

        fn abort(&mut self) {
            self.aborted = true;
        }
    }

    /// Expires after a fixed number of polls
    struct MockTimer {
        remaining: u32,
        ticks: u32,
    }

    impl embedded_hal::timer::CountDown for MockTimer {
        type Time = Duration;

        fn start<T: Into<Duration>>(&mut self, _count: T) {
            self.remaining = self.ticks;
        }

        fn wait(&mut self) -> nb::Result<(), void::Void> {
            match self.remaining {
                0 => Ok(()),
                _ => {
                    self.remaining -= 1;
                    Err(nb::Error::WouldBlock)
                }
            }
        }
    }

    fn sdio(stream: MockStream) -> Sdio<MockController, Dma<MockStream, MockTimer>> {
        let timer = MockTimer { remaining: 0, ticks: 10 };
        let dma = Dma::new(stream, timer, Duration::from_millis(100));
        Sdio::with_dma(MockController::default(), dma)
    }

    #[test]
    fn test_dma_read() {
        let mut sdio = sdio(MockStream { complete_after: Some(3), ..Default::default() });
        sdio.controller(|c| c.data_flags = DATAEND);
        assert!(sdio.prepare_transfer(Direction::CardToHost, 512, 1).is_ok());
        let mut block = [0u8; 512];
        assert!(sdio.transfer_block_in(&mut block).is_ok());
        assert!(sdio.finish_transfer().is_ok());
        assert!(block.iter().all(|&byte| byte == 0x5A));
        assert_eq!(sdio.controller(|c| c.data), Some((512, 9, Direction::CardToHost, true)));
        let (_, dma) = sdio.release();
        let (stream, _) = dma.release();
        assert_eq!(stream.started, Some((Direction::CardToHost, 512)));
        assert!(!stream.aborted);
    }

    #[test]
    fn test_dma_write() {
        let mut sdio = sdio(MockStream { complete_after: Some(2), ..Default::default() });
        sdio.controller(|c| c.data_flags = DATAEND);
        assert!(sdio.prepare_transfer(Direction::HostToCard, 512, 1).is_ok());
        let mut block = [0u8; 512];
        block[..4].copy_from_slice(&hex!("DEADBEEF"));
        assert!(sdio.transfer_block_out(&block).is_ok());
        assert!(sdio.finish_transfer().is_ok());
        let (_, dma) = sdio.release();
        let (stream, _) = dma.release();
        assert_eq!(stream.started, Some((Direction::HostToCard, 512)));
        assert_eq!(stream.source[..], block[..]);
        assert!(!stream.aborted);
    }

    #[test]
    fn test_dma_timeout_aborts() {
        let mut sdio = sdio(MockStream::default());
        let block = [0u8; 512];
        assert!(matches!(sdio.transfer_block_out(&block), Err(Error::DataTimeout)));
        let (_, dma) = sdio.release();
        let (stream, _) = dma.release();
        assert_eq!(stream.started, Some((Direction::HostToCard, 512)));
        assert!(stream.aborted);
    }

    #[test]
    fn test_dma_error_aborts() {
        let mut sdio = sdio(MockStream::default());
        sdio.controller(|c| c.data_flags = DCRCFAIL);
        let mut block = [0u8; 512];
        assert!(matches!(sdio.transfer_block_in(&mut block), Err(Error::DataCrcFail)));
        let (_, dma) = sdio.release();
        assert!(dma.release().0.aborted);
    }
}
