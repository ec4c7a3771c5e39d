//! dune-poll - run saved Dune Analytics queries and collect their results.
//!
//! This library exposes the core modules for use by the binary and by
//! integration tests.

pub mod cli;
pub mod config;
pub mod dune;
pub mod error;
pub mod logging;
pub mod output;
pub mod poller;
