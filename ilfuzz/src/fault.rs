use std::fmt;

/// Outcome of a single execution, as reported to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Fault {
    None = 0,
    /// Reserved for the driver; never produced by this crate.
    Timeout = 1,
    Crash = 2,
}

impl Fault {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decodes a fault received from a remote peer. Unknown codes are
    /// treated as crashes.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Fault::None,
            1 => Fault::Timeout,
            _ => Fault::Crash,
        }
    }

    pub fn is_fault(self) -> bool {
        self != Fault::None
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Fault::None => "none",
            Fault::Timeout => "timeout",
            Fault::Crash => "crash",
        };
        f.write_str(name)
    }
}
