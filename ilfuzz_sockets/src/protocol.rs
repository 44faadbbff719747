//! The agent wire protocol.
//!
//! Every integer is 4 bytes, little endian.
//!
//! ```text
//!   controller -> agent   command       0 stop, 1 start and collect locations, 2 start
//!   agent -> controller   pid           (after a start)
//!   controller -> agent   0             status request
//!   agent -> controller   fault, coverage[65536], len, utf8 locations[len]
//! ```

use std::io::{self, Read, Write};
use std::string::FromUtf8Error;

use ilfuzz::constants::MAP_SIZE;
use thiserror::Error;

pub const STATUS_REQUEST: i32 = 0;

/// Refuse location payloads larger than this.
pub const MAX_LOCATIONS_LEN: usize = 64 << 20;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection failed: {0}")]
    Io(#[from] io::Error),

    #[error("unknown command {0}")]
    UnknownCommand(i32),

    #[error("coverage map holds {actual} bytes, expected {expected}")]
    CoverageSize { expected: usize, actual: usize },

    #[error("invalid location payload length {0}")]
    InvalidLocationLength(i64),

    #[error("location payload is not UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    StartWithLocations,
    Start,
}

impl Command {
    pub fn start(collect_locations: bool) -> Self {
        if collect_locations {
            Command::StartWithLocations
        } else {
            Command::Start
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Command::Stop => 0,
            Command::StartWithLocations => 1,
            Command::Start => 2,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Command::Stop),
            1 => Ok(Command::StartWithLocations),
            2 => Ok(Command::Start),
            _ => Err(ProtocolError::UnknownCommand(code)),
        }
    }

    pub fn collects_locations(self) -> bool {
        self == Command::StartWithLocations
    }
}

/// The agent's answer to a status request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Raw fault code, see [`ilfuzz::fault::Fault::from_code`].
    pub fault: i32,
    pub coverage: Vec<u8>,
    /// `label;count` lines, one per label hit.
    pub locations: String,
}

impl StatusReport {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        if self.coverage.len() != MAP_SIZE {
            return Err(ProtocolError::CoverageSize {
                expected: MAP_SIZE,
                actual: self.coverage.len(),
            });
        }
        let locations = self.locations.as_bytes();
        let len = i32::try_from(locations.len())
            .map_err(|_| ProtocolError::InvalidLocationLength(locations.len() as i64))?;

        let mut message = Vec::with_capacity(8 + MAP_SIZE + locations.len());
        message.extend_from_slice(&self.fault.to_le_bytes());
        message.extend_from_slice(&self.coverage);
        message.extend_from_slice(&len.to_le_bytes());
        message.extend_from_slice(locations);
        writer.write_all(&message)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a report. A non-positive location length means no locations.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, ProtocolError> {
        let fault = read_i32(reader)?;
        let mut coverage = vec![0u8; MAP_SIZE];
        reader.read_exact(&mut coverage)?;

        let len = read_i32(reader)?;
        let locations = if len <= 0 {
            String::new()
        } else if len as usize > MAX_LOCATIONS_LEN {
            return Err(ProtocolError::InvalidLocationLength(len as i64));
        } else {
            let mut buf = vec![0u8; len as usize];
            reader.read_exact(&mut buf)?;
            String::from_utf8(buf)?
        };

        Ok(Self {
            fault,
            coverage,
            locations,
        })
    }
}

pub fn read_i32<R: Read>(reader: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn write_i32<W: Write>(writer: &mut W, value: i32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    writer.flush()
}

/// Adds `remote` into `local` byte by byte, as if the remote hits had been
/// recorded locally. Counters wrap.
pub fn merge_coverage(local: &mut [u8], remote: &[u8]) -> Result<(), ProtocolError> {
    if local.len() != remote.len() {
        return Err(ProtocolError::CoverageSize {
            expected: local.len(),
            actual: remote.len(),
        });
    }
    for (l, r) in local.iter_mut().zip(remote) {
        *l = l.wrapping_add(*r);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn report(locations: &str) -> StatusReport {
        let mut coverage = vec![0u8; MAP_SIZE];
        coverage[3] = 9;
        StatusReport {
            fault: 2,
            coverage,
            locations: locations.to_string(),
        }
    }

    #[test]
    fn merge_adds_and_wraps() {
        let mut local = [1u8, 0, 255];
        merge_coverage(&mut local, &[1, 2, 3]).unwrap();
        assert_eq!(local, [2, 2, 2]);
    }

    #[test]
    fn merge_rejects_mismatched_maps() {
        let mut local = [0u8; 4];
        assert_matches!(
            merge_coverage(&mut local, &[0; 3]),
            Err(ProtocolError::CoverageSize {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn report_layout_matches_the_wire_format() {
        let mut wire = Vec::new();
        report("M;2").write_to(&mut wire).unwrap();

        assert_eq!(wire.len(), 4 + MAP_SIZE + 4 + 3);
        assert_eq!(&wire[..4], &2i32.to_le_bytes());
        assert_eq!(wire[4 + 3], 9);
        assert_eq!(&wire[4 + MAP_SIZE..8 + MAP_SIZE], &3i32.to_le_bytes());
        assert_eq!(&wire[8 + MAP_SIZE..], b"M;2");

        let decoded = StatusReport::read_from(&mut Cursor::new(wire)).unwrap();
        assert_eq!(decoded, report("M;2"));
    }

    #[test]
    fn negative_location_length_means_empty() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&0i32.to_le_bytes());
        wire.extend_from_slice(&vec![0u8; MAP_SIZE]);
        wire.extend_from_slice(&(-1i32).to_le_bytes());

        let decoded = StatusReport::read_from(&mut Cursor::new(wire)).unwrap();
        assert!(decoded.locations.is_empty());
    }

    #[test]
    fn short_coverage_is_an_error() {
        let bad = StatusReport {
            coverage: vec![0; 16],
            ..report("")
        };
        assert_matches!(
            bad.write_to(&mut Vec::new()),
            Err(ProtocolError::CoverageSize { actual: 16, .. })
        );

        let mut wire = 0i32.to_le_bytes().to_vec();
        wire.extend_from_slice(&[0u8; 100]);
        assert_matches!(
            StatusReport::read_from(&mut Cursor::new(wire)),
            Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn commands_round_trip_through_codes() {
        assert_eq!(Command::from_code(1).unwrap(), Command::start(true));
        assert_eq!(Command::from_code(2).unwrap(), Command::start(false));
        assert!(Command::StartWithLocations.collects_locations());
        assert_matches!(Command::from_code(3), Err(ProtocolError::UnknownCommand(3)));
    }
}
