//! Fuzzing code that runs inside a long-lived server process.
//!
//! The instrumented code lives in an [`agent::Agent`], which owns the
//! coverage map and reports it on request. The driver starts a
//! [`controller::Controller`] instead of the server. The controller speaks
//! the fork server protocol to the driver, runs the local half of each test
//! and merges the coverage the agent reports into the driver's map.
//!
//! Both sides speak the little binary protocol in [`protocol`].
pub mod agent;
pub mod controller;
pub mod locations;
pub mod protocol;
