//! The server side: owns the coverage map of the process under test.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use ilfuzz::constants::MAP_SIZE;
use ilfuzz::fault::Fault;
use ilfuzz::input::panic_message;
use ilfuzz::trace::TraceContext;

use crate::locations::LocationTable;
use crate::protocol::{
    Command, ProtocolError, STATUS_REQUEST, StatusReport, read_i32, write_i32,
};

#[derive(Default)]
struct Collector {
    enabled: AtomicBool,
    locations: LocationTable,
}

/// Accepts controller connections and serves one test after another on each.
pub struct Agent {
    listener: TcpListener,
}

impl Agent {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).context("Failed to bind the agent socket")?;
        log::info!("Agent listening on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves controllers until accepting a connection fails. `status` is
    /// asked for the fault of every finished test.
    pub fn run<F>(&self, status: F) -> Result<()>
    where
        F: FnMut() -> Fault,
    {
        self.serve_connections(None, status, || {})
    }

    /// Like [`Agent::run`], with `guard` called before each status is taken.
    /// It can block until the work started by a test has settled.
    pub fn run_with_guard<F, G>(&self, status: F, guard: G) -> Result<()>
    where
        F: FnMut() -> Fault,
        G: FnMut(),
    {
        self.serve_connections(None, status, guard)
    }

    /// Serves at most `limit` connections, one at a time. An error on a
    /// connection, or a panic in `status` or `guard` while serving it, only
    /// drops that connection.
    pub fn serve_connections<F, G>(
        &self,
        limit: Option<usize>,
        mut status: F,
        mut guard: G,
    ) -> Result<()>
    where
        F: FnMut() -> Fault,
        G: FnMut(),
    {
        let collector = Arc::new(Collector::default());
        let observer = {
            let collector = collector.clone();
            Arc::new(move |id: u32, label: &str| {
                if collector.enabled.load(Ordering::Relaxed) {
                    collector.locations.record(id, label);
                }
            })
        };

        let mut map = vec![0u8; MAP_SIZE];
        let context = TraceContext::with_observer(&mut map, observer);

        let mut served = 0;
        while limit.is_none_or(|limit| served < limit) {
            let (stream, peer) = self
                .listener
                .accept()
                .context("Failed to accept a controller")?;
            served += 1;
            log::info!("Controller connected from {peer}");

            let mut session = Session {
                stream,
                context: &context,
                collector: &collector,
                pid: std::process::id() as i32,
            };
            match catch_unwind(AssertUnwindSafe(|| session.serve(&mut status, &mut guard))) {
                Ok(Ok(tests)) => log::info!("Controller {peer} left after {tests} test(s)"),
                Ok(Err(e)) => log::warn!("Dropping controller {peer}: {e}"),
                Err(payload) => log::error!(
                    "Dropping controller {peer}: status callback panicked: {}",
                    panic_message(&*payload)
                ),
            }
        }
        Ok(())
    }
}

struct Session<'a, 'm> {
    stream: TcpStream,
    context: &'a TraceContext<'m>,
    collector: &'a Collector,
    pid: i32,
}

impl Session<'_, '_> {
    fn serve<F, G>(&mut self, status: &mut F, guard: &mut G) -> Result<u64, ProtocolError>
    where
        F: FnMut() -> Fault,
        G: FnMut(),
    {
        let mut tests = 0;
        loop {
            let command = match read_i32(&mut self.stream) {
                Ok(code) => Command::from_code(code)?,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(tests),
                Err(e) => return Err(e.into()),
            };
            if command == Command::Stop {
                return Ok(tests);
            }

            self.collector
                .enabled
                .store(command.collects_locations(), Ordering::Relaxed);
            self.collector.locations.clear();
            self.context.reset_prev_location();
            self.context.clear();
            write_i32(&mut self.stream, self.pid)?;
            log::debug!("Test started, collecting locations: {}", command.collects_locations());

            let request = read_i32(&mut self.stream)?;
            if request != STATUS_REQUEST {
                return Err(ProtocolError::UnknownCommand(request));
            }

            guard();
            let fault = status();
            let report = StatusReport {
                fault: fault.code(),
                coverage: self.context.snapshot(),
                locations: self.collector.locations.render(),
            };
            report.write_to(&mut self.stream)?;
            log::debug!("Reported fault {fault}");
            tests += 1;
        }
    }
}
