//! An AFL fork server that never forks.
//!
//! Instead of forking a child per input, the instrumented program stays alive
//! and runs the harness in a loop, reporting to the driver over the usual
//! two pipes:
//!
//! ```text
//!   status <- 0                      ready
//!   (warm-up run on the first input, then the map is cleared)
//!   loop:
//!     control -> 4 bytes             run the next input
//!     status  <- pid
//!     status  <- fault code          0 none, 2 crash
//! ```
//!
//! The loop ends when the driver closes the control pipe.

use std::fs::File;
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::FromRawFd;

use anyhow::{Context, Result, bail, ensure};
use libafl_bolts::shmem::{ShMemId, ShMemProvider, StdShMem, StdShMemProvider};

use crate::constants::{DEFAULT_BUFFER_SIZE, FORKSRV_FD, MAP_SIZE, SHM_ENV_VAR};
use crate::fault::Fault;
use crate::input::{InputSource, StdinInput, execute};
use crate::trace::TraceContext;

/// The driver's coverage segment, attached for the lifetime of the process.
///
/// The segment belongs to the driver, so it is never detached or removed
/// from here.
pub struct SharedMap {
    shmem: ManuallyDrop<StdShMem>,
}

impl SharedMap {
    pub fn attach(id: i32) -> Result<Self> {
        let mut provider = StdShMemProvider::new()?;
        let shmem = provider
            .shmem_from_id_and_size(ShMemId::from_string(&id.to_string()), MAP_SIZE)
            .with_context(|| format!("Failed to attach shared memory segment {id}"))?;
        ensure!(
            shmem.len() >= MAP_SIZE,
            "Shared memory segment {id} holds {} bytes, expected {MAP_SIZE}",
            shmem.len()
        );
        Ok(Self {
            shmem: ManuallyDrop::new(shmem),
        })
    }

    /// Attaches the segment named by `__AFL_SHM_ID`, if the variable is set
    /// and holds a valid identifier.
    pub fn from_env() -> Result<Option<Self>> {
        shm_id_from_env().map(Self::attach).transpose()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.shmem[..MAP_SIZE]
    }
}

/// Reads `__AFL_SHM_ID`. A missing or unparsable value means there is no driver.
pub fn shm_id_from_env() -> Option<i32> {
    parse_shm_id(std::env::var(SHM_ENV_VAR).ok().as_deref())
}

fn parse_shm_id(value: Option<&str>) -> Option<i32> {
    value?.trim().parse().ok()
}

/// Opens the control (198) and status (199) pipes inherited from the driver.
pub fn driver_pipes() -> (File, File) {
    // The driver dup2()s both ends onto these descriptors before exec, and
    // nothing else in the process owns them.
    unsafe {
        (
            File::from_raw_fd(FORKSRV_FD),
            File::from_raw_fd(FORKSRV_FD + 1),
        )
    }
}

/// The persistent loop, over any pair of pipes.
pub struct ForkServer<C, S> {
    control: C,
    status: S,
    pid: i32,
}

impl<C: Read, S: Write> ForkServer<C, S> {
    pub fn new(control: C, status: S) -> Self {
        Self {
            control,
            status,
            pid: std::process::id() as i32,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn into_inner(self) -> (C, S) {
        (self.control, self.status)
    }

    /// Serves the driver until it closes the control pipe. Returns the number
    /// of reported iterations.
    ///
    /// The first input is consumed twice: once by a warm-up run whose
    /// coverage is thrown away, since one-time initialization would make it
    /// differ from every later run, and again by the first reported run.
    pub fn serve<I, H>(&mut self, map: &mut [u8], input: &mut I, mut harness: H) -> Result<u64>
    where
        I: InputSource,
        H: FnMut(&[u8]),
    {
        let context = TraceContext::install(map);
        self.write_i32(0)?;

        let warm_up = input.read_input().context("Failed to read the first input")?;
        context.reset_prev_location();
        let fault = execute(&mut harness, &warm_up);
        log::debug!("Warm-up run finished with fault {fault}");
        context.clear();

        let mut pending = Some(warm_up);
        let mut iterations = 0;
        while self.await_ping()? {
            self.write_i32(self.pid)?;

            let data = match pending.take() {
                Some(data) => data,
                None => input.read_input().context("Failed to read input")?,
            };
            context.reset_prev_location();
            let fault = execute(&mut harness, &data);
            self.write_i32(fault.code())?;
            iterations += 1;
        }

        log::info!("Driver closed the control pipe after {iterations} iteration(s)");
        Ok(iterations)
    }

    fn await_ping(&mut self) -> Result<bool> {
        let mut ping = [0u8; 4];
        match self.control.read_exact(&mut ping) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e).context("Failed to read from the control pipe"),
        }
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.status
            .write_all(&value.to_le_bytes())
            .and_then(|()| self.status.flush())
            .context("Failed to write to the status pipe")
    }
}

/// Runs `harness` under the driver, or exactly once on stdin when there is
/// no driver.
///
/// Without a driver the harness runs against a private map and panics are
/// not caught.
pub fn run<H>(mut harness: H) -> Result<()>
where
    H: FnMut(&[u8]),
{
    let mut input = StdinInput;
    let Some(mut shared) = SharedMap::from_env()? else {
        log::debug!("{SHM_ENV_VAR} is not set, running once");
        let mut map = vec![0u8; MAP_SIZE];
        let _context = TraceContext::install(&mut map);
        let data = input.read_input()?;
        harness(&data);
        return Ok(());
    };

    let (control, status) = driver_pipes();
    let mut server = ForkServer::new(control, status);
    log::info!("Fork server {} attached to the driver", server.pid());
    server.serve(shared.as_mut_slice(), &mut input, harness)?;
    Ok(())
}

/// Like [`run`], with the input decoded as (lossy) UTF-8.
pub fn run_str<H>(harness: H) -> Result<()>
where
    H: FnMut(&str),
{
    run(wrap_str(harness, DEFAULT_BUFFER_SIZE))
}

/// Like [`run_str`] with a larger input limit. Limits below the default are
/// raised to it.
pub fn run_str_with_buffer<H>(harness: H, buffer_size: usize) -> Result<()>
where
    H: FnMut(&str),
{
    run(wrap_str(harness, buffer_size))
}

/// Runs `harness` once against the driver's map. Only valid under the driver.
pub fn run_once<H>(mut harness: H) -> Result<Fault>
where
    H: FnMut(&[u8]),
{
    let Some(mut shared) = SharedMap::from_env()? else {
        bail!("This program can only be run under afl-fuzz");
    };
    let context = TraceContext::install(shared.as_mut_slice());
    context.reset_prev_location();
    let data = StdinInput.read_input()?;
    Ok(execute(&mut harness, &data))
}

/// Adapts a string harness. Inputs that fill the whole buffer fail the
/// iteration.
pub fn wrap_str<H>(mut harness: H, buffer_size: usize) -> impl FnMut(&[u8])
where
    H: FnMut(&str),
{
    let limit = buffer_size.max(DEFAULT_BUFFER_SIZE);
    move |data: &[u8]| {
        if data.len() >= limit {
            panic!("Input data size must not exceed {limit} bytes");
        }
        harness(&String::from_utf8_lossy(data));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Cursor;

    use super::*;
    use crate::trace::{on_branch_call, serial};

    fn pings(count: usize) -> Cursor<Vec<u8>> {
        Cursor::new(vec![0u8; 4 * count])
    }

    fn words(bytes: &[u8]) -> Vec<i32> {
        bytes
            .chunks(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn harness(data: &[u8]) {
        on_branch_call(7, "Harness::Run");
        if data == b"boom" {
            panic!("boom");
        }
    }

    #[test]
    fn closed_control_pipe_ends_after_warm_up() {
        let _serial = serial();
        let mut map = vec![0u8; MAP_SIZE];
        let mut inputs = VecDeque::from(vec![b"ok".to_vec()]);
        let mut server = ForkServer::new(pings(0), Vec::new());

        let iterations = server.serve(&mut map, &mut inputs, harness).unwrap();
        assert_eq!(iterations, 0);

        let (_, status) = server.into_inner();
        assert_eq!(status, vec![0, 0, 0, 0]);
        assert!(map.iter().all(|&b| b == 0));
    }

    #[test]
    fn reports_pid_and_fault_per_iteration() {
        let _serial = serial();
        let mut map = vec![0u8; MAP_SIZE];
        let mut inputs = VecDeque::from(vec![b"ok".to_vec(), b"boom".to_vec()]);
        let mut server = ForkServer::new(pings(2), Vec::new());
        let pid = server.pid();

        assert_eq!(server.serve(&mut map, &mut inputs, harness).unwrap(), 2);

        let (_, status) = server.into_inner();
        assert_eq!(words(&status), vec![0, pid, 0, pid, 2]);
        // Two reported runs; the warm-up hit was cleared.
        assert_eq!(map[7], 2);
        assert!(inputs.is_empty());
    }

    #[test]
    fn crashes_do_not_stop_the_loop() {
        let _serial = serial();
        let mut map = vec![0u8; MAP_SIZE];
        let mut inputs = VecDeque::from(vec![
            b"boom".to_vec(),
            b"boom".to_vec(),
            b"fine".to_vec(),
        ]);
        let mut server = ForkServer::new(pings(3), Vec::new());
        let pid = server.pid();
        server.serve(&mut map, &mut inputs, harness).unwrap();

        let (_, status) = server.into_inner();
        assert_eq!(words(&status), vec![0, pid, 2, pid, 2, pid, 0]);
    }

    #[test]
    fn shm_id_must_be_an_integer() {
        assert_eq!(parse_shm_id(None), None);
        assert_eq!(parse_shm_id(Some("abc")), None);
        assert_eq!(parse_shm_id(Some("")), None);
        assert_eq!(parse_shm_id(Some("4242")), Some(4242));
    }

    #[test]
    fn string_harness_decodes_lossily_and_enforces_the_limit() {
        let mut seen = Vec::new();
        {
            let mut wrapped = wrap_str(|s: &str| seen.push(s.to_string()), 1);
            assert_eq!(execute(&mut wrapped, b"\xffa"), Fault::None);
            assert_eq!(
                execute(&mut wrapped, &vec![b'a'; DEFAULT_BUFFER_SIZE]),
                Fault::Crash
            );
            assert_eq!(
                execute(&mut wrapped, &vec![b'a'; DEFAULT_BUFFER_SIZE - 1]),
                Fault::None
            );
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], "\u{fffd}a");
    }
}
