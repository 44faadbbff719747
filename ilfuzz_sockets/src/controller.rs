//! The driver side: speaks the fork server protocol to the driver and the
//! agent protocol to the process under test.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use anyhow::{Context, Result};
use ilfuzz::fault::Fault;
use ilfuzz::forkserver::{SharedMap, driver_pipes};
use ilfuzz::input::{InputSource, StdinInput, execute};

use crate::protocol::{
    Command, ProtocolError, STATUS_REQUEST, StatusReport, merge_coverage, read_i32, write_i32,
};

/// A connection to an [`crate::agent::Agent`].
pub struct AgentClient<S> {
    stream: S,
}

impl AgentClient<TcpStream> {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        log::info!("Connecting to agent at {host}:{port}");
        let stream = TcpStream::connect((host, port))
            .with_context(|| format!("Failed to connect to agent at {host}:{port}"))?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S: Read + Write> AgentClient<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Starts a test and returns the agent's pid.
    pub fn start_test(&mut self, collect_locations: bool) -> Result<i32, ProtocolError> {
        write_i32(&mut self.stream, Command::start(collect_locations).code())?;
        Ok(read_i32(&mut self.stream)?)
    }

    pub fn get_status(&mut self) -> Result<StatusReport, ProtocolError> {
        write_i32(&mut self.stream, STATUS_REQUEST)?;
        StatusReport::read_from(&mut self.stream)
    }

    pub fn stop(&mut self) -> Result<(), ProtocolError> {
        write_i32(&mut self.stream, Command::Stop.code())?;
        Ok(())
    }
}

pub struct Controller {
    host: String,
    port: u16,
    collect_locations: bool,
}

impl Controller {
    pub fn new(host: &str, port: u16, collect_locations: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            collect_locations,
        }
    }

    /// Runs under the driver, or once on stdin without contacting the agent
    /// when there is no driver.
    ///
    /// `accept` sees the run number and the location report of every test;
    /// returning `false` repeats the test.
    pub fn run<H, A>(&self, mut harness: H, accept: A) -> Result<()>
    where
        H: FnMut(&[u8]),
        A: FnMut(u64, &str) -> bool,
    {
        let mut input = StdinInput;
        let Some(mut shared) = SharedMap::from_env()? else {
            log::info!("No driver detected, dry run");
            let data = input.read_input()?;
            harness(&data);
            return Ok(());
        };

        let mut agent = AgentClient::connect(&self.host, self.port)?;
        self.serve(
            &mut agent,
            driver_pipes(),
            shared.as_mut_slice(),
            &mut input,
            harness,
            accept,
        )?;
        Ok(())
    }

    /// The controller loop over arbitrary pipes and agent connection.
    /// Returns the number of tests reported to the driver.
    pub fn serve<S, C, W, I, H, A>(
        &self,
        agent: &mut AgentClient<S>,
        (mut control, mut status): (C, W),
        map: &mut [u8],
        input: &mut I,
        mut harness: H,
        mut accept: A,
    ) -> Result<u64>
    where
        S: Read + Write,
        C: Read,
        W: Write,
        I: InputSource,
        H: FnMut(&[u8]),
        A: FnMut(u64, &str) -> bool,
    {
        write_i32(&mut status, 0).context("Failed to greet the driver")?;

        let mut initial = true;
        let mut run = 0;
        loop {
            run += 1;
            let pid = agent.start_test(self.collect_locations)?;
            log::debug!("Agent {pid} ready for run {run}");

            if !await_ping(&mut control)? {
                agent.get_status()?;
                agent.stop()?;
                log::info!("Driver closed the control pipe after {} run(s)", run - 1);
                return Ok(run - 1);
            }
            write_i32(&mut status, pid)?;

            let data = input.read_input().context("Failed to read input")?;
            let fault = loop {
                let mut fault = execute(&mut harness, &data);
                if initial {
                    // The first run warms up both processes; its results are
                    // discarded and the test repeated.
                    initial = false;
                    agent.get_status()?;
                    agent.start_test(self.collect_locations)?;
                    fault = execute(&mut harness, &data);
                }

                let report = agent.get_status()?;
                let remote = Fault::from_code(report.fault);
                if remote.is_fault() {
                    fault = remote;
                }

                if !accept(run, &report.locations) {
                    log::info!("Results of run {run} were not accepted, repeating it");
                    agent.start_test(self.collect_locations)?;
                    continue;
                }

                merge_coverage(map, &report.coverage)?;
                break fault;
            };

            log::debug!("Run {run} finished with fault {fault}");
            write_i32(&mut status, fault.code())?;
        }
    }
}

fn await_ping<C: Read>(control: &mut C) -> io::Result<bool> {
    match read_i32(control) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
