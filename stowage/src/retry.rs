use crate::warn;
use std::fmt::Display;
use std::thread;
use std::time::Duration;

/// Runs `op` until it succeeds, sleeping `delay` between attempts for as long as `running()` holds.
/// The first attempt is always made. Returns the last error once `running()` turns false.
pub fn retry_while<T, E, F>(what: &str, delay: Duration, running: &dyn Fn() -> bool, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: Display,
{
    let mut attempt = 1usize;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if running() => {
                warn!("{} failed on attempt {}, retrying in {} ms: {}", what, attempt, delay.as_millis(), e);
                attempt += 1;
                thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}
