//! Small process-startup utilities shared by every binary and test in the
//! workspace: environment variable parsing and `tracing` setup.
pub mod env;
