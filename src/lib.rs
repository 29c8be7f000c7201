//! Core library for the `lockstep` CLI.
//!
//! A room relay fans session messages out to every participant; each
//! participant runs the session state machine, schedules synchronized
//! transitions against a shared clock, and fetches replay artifacts from
//! HTTP servers. The `lockstep` binary wires these pieces to the command
//! line.
pub mod args;
pub mod clock;
pub mod config;
pub mod download;
pub mod entry;
pub mod error;
pub mod logger;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod shutdown;
pub mod transport;
