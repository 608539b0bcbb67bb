//! External control commands.
//!
//! An admin UI or the CLI writes at most one pending command into the
//! `{prefix}:command` key; the master drains it on its next tick. The wire
//! format is a flat JSON object tagged by `action`:
//!
//! ```json
//! {"action": "restart_worker", "worker_id": "campaign-1a2b3c4d"}
//! {"action": "add_worker", "type": "campaign"}
//! {"action": "stop"}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pool::WorkerType;

/// A control command for the master orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Begin shutting down.
    Stop,
    /// Terminate a worker and respawn one of the same type.
    RestartWorker { worker_id: String },
    /// Spawn one extra worker of the given type.
    AddWorker {
        #[serde(rename = "type")]
        worker_type: WorkerType,
    },
    /// Terminate a worker without respawning it.
    RemoveWorker { worker_id: String },
    /// Drop every pending and claimed task.
    ClearQueue,
    /// Re-read runtime tunables.
    ReloadConfig,
}

impl ControlCommand {
    /// The action name as it appears on the wire.
    pub fn action(&self) -> &'static str {
        match self {
            ControlCommand::Stop => "stop",
            ControlCommand::RestartWorker { .. } => "restart_worker",
            ControlCommand::AddWorker { .. } => "add_worker",
            ControlCommand::RemoveWorker { .. } => "remove_worker",
            ControlCommand::ClearQueue => "clear_queue",
            ControlCommand::ReloadConfig => "reload_config",
        }
    }

    /// Builds a command from an action name and its optional parameters.
    ///
    /// Used by the CLI, where parameters arrive as separate flags.
    pub fn from_parts(
        action: &str,
        worker_id: Option<&str>,
        worker_type: Option<WorkerType>,
    ) -> Result<Self, String> {
        let require_id = || {
            worker_id
                .map(str::to_string)
                .ok_or_else(|| format!("action '{}' requires --worker-id", action))
        };

        match action {
            "stop" => Ok(ControlCommand::Stop),
            "restart_worker" => Ok(ControlCommand::RestartWorker {
                worker_id: require_id()?,
            }),
            "add_worker" => Ok(ControlCommand::AddWorker {
                worker_type: worker_type
                    .ok_or_else(|| "action 'add_worker' requires --type".to_string())?,
            }),
            "remove_worker" => Ok(ControlCommand::RemoveWorker {
                worker_id: require_id()?,
            }),
            "clear_queue" => Ok(ControlCommand::ClearQueue),
            "reload_config" => Ok(ControlCommand::ReloadConfig),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::RestartWorker { worker_id } | ControlCommand::RemoveWorker { worker_id } => {
                write!(f, "{}({})", self.action(), worker_id)
            }
            ControlCommand::AddWorker { worker_type } => write!(f, "add_worker({})", worker_type),
            _ => f.write_str(self.action()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(ControlCommand::AddWorker {
            worker_type: WorkerType::Campaign,
        })
        .expect("serialize");
        assert_eq!(json, serde_json::json!({"action": "add_worker", "type": "campaign"}));

        let json = serde_json::to_value(ControlCommand::Stop).expect("serialize");
        assert_eq!(json, serde_json::json!({"action": "stop"}));
    }

    #[test]
    fn test_parse_from_admin_ui() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"action":"restart_worker","worker_id":"campaign-1"}"#)
                .expect("should parse");
        assert_eq!(
            cmd,
            ControlCommand::RestartWorker {
                worker_id: "campaign-1".to_string()
            }
        );
    }

    #[test]
    fn test_missing_param_is_rejected() {
        assert!(serde_json::from_str::<ControlCommand>(r#"{"action":"remove_worker"}"#).is_err());
        assert!(serde_json::from_str::<ControlCommand>(r#"{"action":"reboot"}"#).is_err());
    }

    #[test]
    fn test_from_parts() {
        assert_eq!(
            ControlCommand::from_parts("clear_queue", None, None),
            Ok(ControlCommand::ClearQueue)
        );
        assert_eq!(
            ControlCommand::from_parts("add_worker", None, Some(WorkerType::Monitoring)),
            Ok(ControlCommand::AddWorker {
                worker_type: WorkerType::Monitoring
            })
        );
        assert!(ControlCommand::from_parts("restart_worker", None, None).is_err());
        assert!(ControlCommand::from_parts("explode", None, None).is_err());
    }

    #[test]
    fn test_display() {
        let cmd = ControlCommand::RemoveWorker {
            worker_id: "statistics-ab".to_string(),
        };
        assert_eq!(cmd.to_string(), "remove_worker(statistics-ab)");
        assert_eq!(ControlCommand::ReloadConfig.to_string(), "reload_config");
    }
}
