//! driftwatch-cli -- argument parsing, process plumbing and the
//! orchestrator for the batch runner.

pub mod cli;
pub mod lock;
pub mod logging;
pub mod runner;
