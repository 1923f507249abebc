use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{duration_ms, duration_secs, ConfigError};
use crate::service::{ServiceAction, ServiceFailureActions, ServiceFailureResetPeriod};

/// Restart-on-failure behaviour installed on a service.
///
/// The service control manager restarts the service `restart_count` times, waiting
/// `restart_delay` before each attempt. The failure count goes back to zero once the service
/// has run for `reset_period` without failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryPolicy {
    pub restart_count: u32,

    #[serde(rename = "restart_delay_ms", with = "duration_ms")]
    pub restart_delay: Duration,

    #[serde(rename = "reset_period_secs", with = "duration_secs")]
    pub reset_period: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        RecoveryPolicy {
            restart_count: 3,
            restart_delay: Duration::from_secs(15),
            reset_period: Duration::from_secs(60),
        }
    }
}

impl RecoveryPolicy {
    pub fn failure_actions(&self) -> ServiceFailureActions {
        let actions = (0..self.restart_count)
            .map(|_| ServiceAction::restart_after(self.restart_delay))
            .collect();

        ServiceFailureActions {
            reset_period: ServiceFailureResetPeriod::After(self.reset_period),
            reboot_msg: None,
            command: None,
            actions: Some(actions),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if u32::try_from(self.restart_delay.as_millis()).is_err() {
            return Err(ConfigError::Invalid(
                "recovery.restart_delay_ms does not fit in 32 bits".into(),
            ));
        }
        // u32::MAX seconds means "never reset" to the service control manager.
        if self.reset_period.as_secs() >= u64::from(u32::MAX) {
            return Err(ConfigError::Invalid(
                "recovery.reset_period_secs is too large".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceActionType;

    #[test]
    fn test_default_policy_restarts_three_times() {
        let actions = RecoveryPolicy::default().failure_actions();

        assert_eq!(
            actions.reset_period,
            ServiceFailureResetPeriod::After(Duration::from_secs(60))
        );
        assert_eq!(actions.reboot_msg, None);
        assert_eq!(actions.command, None);

        let restarts = actions.actions.unwrap();
        assert_eq!(restarts.len(), 3);
        for action in restarts {
            assert_eq!(action.action_type, ServiceActionType::Restart);
            assert_eq!(action.delay_millis(), 15_000);
        }
    }

    #[test]
    fn test_oversized_delay_is_invalid() {
        let policy = RecoveryPolicy {
            restart_delay: Duration::from_secs(u64::from(u32::MAX)),
            ..RecoveryPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = RecoveryPolicy {
            reset_period: Duration::from_secs(u64::from(u32::MAX)),
            ..RecoveryPolicy::default()
        };
        assert!(policy.validate().is_err());
    }
}
