//! Command-line interface for dialer-orchestrator.
//!
//! Provides the master and worker process entry points plus operator
//! commands for the queue and the control channel.

mod commands;
mod signals;
mod status;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
pub use signals::cancel_on_shutdown_signal;
pub use status::{build_status, MasterStatus, QueueStatus, StatusReport, WorkersStatus};
