//! Side-effecting parts of a run: filesystem, child process, configuration.

pub mod config;
pub mod process;
pub mod readiness;
pub mod sandbox;
pub mod watcher;
