//! I/O helpers: configuration, workflow files and worker transports.

pub mod config;
pub mod definition;
pub mod process;
pub mod worker;
