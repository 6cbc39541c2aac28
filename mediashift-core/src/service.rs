//! Start/stop control of the managed application's service.
//!
//! Callers that stop the service own its state for the duration and must
//! restart it on every exit path; the engine enforces that discipline, this
//! module only issues the commands.

use crate::config::ServiceConfig;
use crate::error::{Result, ToolkitError};
use std::process::Command;
use tracing::debug;

pub trait ServiceController: Send + Sync {
    /// Whether the managed service is currently running.
    fn is_running(&self) -> bool;

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;
}

/// Controller driving the configured shell commands, `systemctl` by default.
pub struct CommandServiceController {
    config: ServiceConfig,
}

impl CommandServiceController {
    pub fn new(config: ServiceConfig) -> Self {
        CommandServiceController { config }
    }

    fn run(&self, command: &[String], action: &str) -> Result<()> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ToolkitError::Configuration(format!("empty {action} command")))?;
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|e| ToolkitError::ServiceControl(format!("{action}: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(ToolkitError::ServiceControl(format!(
                "{action} exited with {status}"
            )))
        }
    }
}

impl ServiceController for CommandServiceController {
    fn is_running(&self) -> bool {
        let Some((program, args)) = self.config.status_command.split_first() else {
            return false;
        };
        match Command::new(program).args(args).status() {
            Ok(status) => status.success(),
            Err(e) => {
                debug!("service status probe failed: {e}");
                false
            }
        }
    }

    fn start(&self) -> Result<()> {
        self.run(&self.config.start_command, "service start")
    }

    fn stop(&self) -> Result<()> {
        self.run(&self.config.stop_command, "service stop")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(status: &[&str], start: &[&str], stop: &[&str]) -> ServiceConfig {
        let to_vec = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        ServiceConfig {
            status_command: to_vec(status),
            start_command: to_vec(start),
            stop_command: to_vec(stop),
        }
    }

    #[test]
    fn test_is_running_true_on_zero_exit() {
        let ctl = CommandServiceController::new(config_with(&["true"], &["true"], &["true"]));
        assert!(ctl.is_running());
    }

    #[test]
    fn test_is_running_false_on_nonzero_exit() {
        let ctl = CommandServiceController::new(config_with(&["false"], &["true"], &["true"]));
        assert!(!ctl.is_running());
    }

    #[test]
    fn test_is_running_false_on_missing_binary() {
        let ctl = CommandServiceController::new(config_with(
            &["mediashift-no-such-binary"],
            &["true"],
            &["true"],
        ));
        assert!(!ctl.is_running());
    }

    #[test]
    fn test_stop_failure_is_service_control_error() {
        let ctl = CommandServiceController::new(config_with(&["true"], &["true"], &["false"]));
        let err = ctl.stop().unwrap_err();
        assert!(matches!(err, ToolkitError::ServiceControl(_)));
    }

    #[test]
    fn test_empty_command_is_configuration_error() {
        let ctl = CommandServiceController::new(config_with(&["true"], &[], &["true"]));
        let err = ctl.start().unwrap_err();
        assert!(matches!(err, ToolkitError::Configuration(_)));
    }
}
