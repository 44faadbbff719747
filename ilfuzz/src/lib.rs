//! AFL-style coverage-guided fuzzing for managed bytecode modules.
//!
//! The crate has two halves. The offline half rewrites a module so that every
//! branch site reports to a trace type ([`instrumentation`]). The runtime half
//! is what those probes report to ([`trace`]) and the loop that feeds inputs
//! from the driver to a harness and reports the outcome ([`forkserver`]).
//!
//! ## Getting Started
//!
//! Instrument the library under test:
//!
//! ```no_run
//! use ilfuzz::instrumentation::instrument;
//! use ilfuzz::options::Options;
//! use std::path::Path;
//!
//! let types = instrument(
//!     Path::new("Acme.Parser.dll"),
//!     |name| name.starts_with("Acme."),
//!     &Options::from_env(),
//! )?;
//! for ty in types {
//!     println!("{ty}");
//! }
//! # Ok::<(), ilfuzz::error::InstrumentationError>(())
//! ```
//!
//! Then hand the harness to the fork server and start the driver with
//! `afl-fuzz -i corpus -o findings -- ./harness`:
//!
//! ```no_run
//! fn main() -> anyhow::Result<()> {
//!     ilfuzz::logging::init();
//!     ilfuzz::forkserver::run_str(|text| {
//!         let _ = text.parse::<i64>();
//!     })
//! }
//! ```
pub mod bytecode;
pub mod error;
pub mod fault;
pub mod forkserver;
pub mod id_generator;
pub mod input;
pub mod instrumentation;
pub mod logging;
pub mod options;
pub mod trace;

pub mod constants;

// re-export libAFL_bolts
pub use libafl_bolts;
