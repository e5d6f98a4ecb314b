use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Uninitialized,
    Initialized,
    Running,
    Paused,
    Stopped,
    Terminated,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppStatus::Uninitialized => write!(f, "uninitialized"),
            AppStatus::Initialized => write!(f, "initialized"),
            AppStatus::Running => write!(f, "running"),
            AppStatus::Paused => write!(f, "paused"),
            AppStatus::Stopped => write!(f, "stopped"),
            AppStatus::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Initialize,
    Start,
    Pause,
    Unpause,
    Stop,
    Cleanup,
}

impl Transition {
    pub fn target(self) -> AppStatus {
        match self {
            Transition::Initialize => AppStatus::Initialized,
            Transition::Start | Transition::Unpause => AppStatus::Running,
            Transition::Pause => AppStatus::Paused,
            Transition::Stop => AppStatus::Stopped,
            Transition::Cleanup => AppStatus::Terminated,
        }
    }

    /// Transitions that silently do nothing from `from` instead of failing.
    pub fn is_noop_from(self, from: AppStatus) -> bool {
        matches!(
            (self, from),
            (
                Transition::Cleanup,
                AppStatus::Uninitialized | AppStatus::Terminated
            )
        )
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Initialize => write!(f, "initialize"),
            Transition::Start => write!(f, "start"),
            Transition::Pause => write!(f, "pause"),
            Transition::Unpause => write!(f, "unpause"),
            Transition::Stop => write!(f, "stop"),
            Transition::Cleanup => write!(f, "cleanup"),
        }
    }
}

pub fn validate_transition(from: AppStatus, transition: Transition) -> Result<(), CoreError> {
    let valid = matches!(
        (from, transition),
        (AppStatus::Uninitialized, Transition::Initialize)
            | (
                AppStatus::Initialized | AppStatus::Stopped,
                Transition::Start
            )
            | (AppStatus::Running, Transition::Pause)
            | (AppStatus::Paused, Transition::Unpause)
            | (AppStatus::Running | AppStatus::Paused, Transition::Stop)
            | (
                AppStatus::Initialized
                    | AppStatus::Running
                    | AppStatus::Paused
                    | AppStatus::Stopped,
                Transition::Cleanup
            )
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: transition.target().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(AppStatus::Uninitialized, Transition::Initialize).is_ok());
        assert!(validate_transition(AppStatus::Initialized, Transition::Start).is_ok());
        assert!(validate_transition(AppStatus::Stopped, Transition::Start).is_ok()); // restart
        assert!(validate_transition(AppStatus::Running, Transition::Pause).is_ok());
        assert!(validate_transition(AppStatus::Paused, Transition::Unpause).is_ok());
        assert!(validate_transition(AppStatus::Running, Transition::Stop).is_ok());
        assert!(validate_transition(AppStatus::Paused, Transition::Stop).is_ok());
        assert!(validate_transition(AppStatus::Initialized, Transition::Cleanup).is_ok());
        assert!(validate_transition(AppStatus::Running, Transition::Cleanup).is_ok());
        assert!(validate_transition(AppStatus::Stopped, Transition::Cleanup).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(AppStatus::Running, Transition::Start).is_err());
        assert!(validate_transition(AppStatus::Initialized, Transition::Initialize).is_err());
        assert!(validate_transition(AppStatus::Uninitialized, Transition::Start).is_err());
        assert!(validate_transition(AppStatus::Paused, Transition::Pause).is_err());
        assert!(validate_transition(AppStatus::Running, Transition::Unpause).is_err());
        assert!(validate_transition(AppStatus::Stopped, Transition::Stop).is_err());
        assert!(validate_transition(AppStatus::Terminated, Transition::Start).is_err());
        assert!(validate_transition(AppStatus::Terminated, Transition::Cleanup).is_err());
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = validate_transition(AppStatus::Running, Transition::Start).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid state transition: running -> running"
        );
    }

    #[test]
    fn cleanup_is_a_noop_before_init_and_after_termination() {
        assert!(Transition::Cleanup.is_noop_from(AppStatus::Uninitialized));
        assert!(Transition::Cleanup.is_noop_from(AppStatus::Terminated));
        assert!(!Transition::Cleanup.is_noop_from(AppStatus::Stopped));
        assert!(!Transition::Start.is_noop_from(AppStatus::Terminated));
    }
}
