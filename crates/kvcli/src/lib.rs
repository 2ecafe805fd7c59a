#![warn(missing_docs)]

//! kvcli: command-line client for NVMe key-value devices

pub mod cli;
pub mod config;

pub use cli::{report, Cli, Command};
pub use config::{DriverKind, KvcliConfig};
