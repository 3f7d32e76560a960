use crate::bus::Error;

/// Calls `f` until it stops returning `WouldBlock`, at most `attempts` times.
///
/// A condition that never settles means the card cannot operate with this host,
/// so running out of attempts yields `NotSupported`.
pub fn poll<T, E, F>(attempts: u32, mut f: F) -> Result<T, Error<E>>
where
    F: FnMut() -> nb::Result<T, Error<E>>,
{
    for attempt in 0..attempts {
        match f() {
            Ok(value) => {
                trace!("Settled after {} attempts", attempt + 1);
                return Ok(value);
            }
            Err(nb::Error::WouldBlock) => continue,
            Err(nb::Error::Other(error)) => return Err(error),
        }
    }
    Err(Error::NotSupported)
}
