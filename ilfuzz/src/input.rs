//! Where iteration inputs come from, and how a harness is run against one.

use std::any::Any;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::fault::Fault;

/// A source of test inputs, read once per iteration.
pub trait InputSource {
    fn read_input(&mut self) -> io::Result<Vec<u8>>;
}

/// Reads each input as everything available on standard input.
///
/// The driver rewinds and truncates the stdin file between iterations, so
/// reading to the end yields exactly one input.
#[derive(Debug, Default)]
pub struct StdinInput;

impl InputSource for StdinInput {
    fn read_input(&mut self) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        io::stdin().lock().read_to_end(&mut data)?;
        Ok(data)
    }
}

/// Inputs queued in memory. Once drained every further read is empty.
impl InputSource for VecDeque<Vec<u8>> {
    fn read_input(&mut self) -> io::Result<Vec<u8>> {
        Ok(self.pop_front().unwrap_or_default())
    }
}

/// Runs `harness` on `data`, turning a panic into [`Fault::Crash`].
pub fn execute<H>(harness: &mut H, data: &[u8]) -> Fault
where
    H: FnMut(&[u8]),
{
    match catch_unwind(AssertUnwindSafe(|| harness(data))) {
        Ok(()) => Fault::None,
        Err(payload) => {
            log::debug!("Harness panicked: {}", panic_message(&*payload));
            Fault::Crash
        }
    }
}

/// The message carried by a panic payload, when it is a string.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
