use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    #[default]
    Unknown,
    CheckingStatus,
    Stopped,
    Starting,
    Running,
    RunningNearTimeout,
    Stopping,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::CheckingStatus => "checkingStatus",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::RunningNearTimeout => "runningNearTimeout",
            Self::Stopping => "stopping",
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::RunningNearTimeout)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleInput {
    CheckRequested,
    StatusReported { running: bool },
    StatusFailed,
    StartRequested,
    StopRequested,
    /// A start or stop call returned, successfully or not.
    MutationCompleted,
    EstimateUpdated { near_timeout: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionRejected {
    #[error("instance is already {0}")]
    InFlight(LifecycleState),
    #[error("{input:?} is not allowed while {from}")]
    Invalid {
        from: LifecycleState,
        input: LifecycleInput,
    },
}

pub fn next_state(
    current: LifecycleState,
    input: LifecycleInput,
) -> Result<LifecycleState, TransitionRejected> {
    use LifecycleInput as In;
    use LifecycleState as St;

    let invalid = TransitionRejected::Invalid {
        from: current,
        input,
    };
    match (current, input) {
        (St::Starting | St::Stopping, In::CheckRequested) => {
            Err(TransitionRejected::InFlight(current))
        }
        (_, In::CheckRequested) => Ok(St::CheckingStatus),

        (St::CheckingStatus, In::StatusReported { running: true }) => Ok(St::Running),
        (St::CheckingStatus, In::StatusReported { running: false }) => Ok(St::Stopped),
        (St::CheckingStatus, In::StatusFailed) => Ok(St::CheckingStatus),
        (_, In::StatusReported { .. } | In::StatusFailed) => Err(invalid),

        (St::Stopped, In::StartRequested) => Ok(St::Starting),
        (St::Running | St::RunningNearTimeout, In::StopRequested) => Ok(St::Stopping),
        (St::Starting | St::Stopping, In::StartRequested | In::StopRequested) => {
            Err(TransitionRejected::InFlight(current))
        }
        (_, In::StartRequested | In::StopRequested) => Err(invalid),

        (St::Starting | St::Stopping, In::MutationCompleted) => Ok(St::CheckingStatus),
        (_, In::MutationCompleted) => Err(invalid),

        (St::Running, In::EstimateUpdated { near_timeout: true }) => Ok(St::RunningNearTimeout),
        (St::RunningNearTimeout, In::EstimateUpdated { near_timeout: false }) => Ok(St::Running),
        (_, In::EstimateUpdated { .. }) => Ok(current),
    }
}
