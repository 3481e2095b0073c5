//! Command-line front end for the strata migration engine.

pub mod cli;
pub mod logging;

pub use strata_core as core;
pub use strata_runtime as runtime;
