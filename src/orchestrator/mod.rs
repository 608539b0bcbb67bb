//! Master orchestrator: singleton election, the control loop and its
//! operator-facing surfaces (control commands, statistics, activity log).

pub mod activity;
pub mod command;
pub mod master;
pub mod state;
pub mod stats;

pub use activity::{ActivityLog, Level};
pub use command::ControlCommand;
pub use master::{MasterDeps, MasterOrchestrator, OrchestratorError};
pub use state::{ExitReason, MasterRegistration, MasterState};
pub use stats::{ProcessSampler, StatsSnapshot};
