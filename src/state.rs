//! The pipeline state machine.
//!
//! A job moves through one of two shapes:
//!
//! - non-interactive: `Pending -> Running -> {Complete | Error}`
//! - interactive: `Idle -> [AwaitingInput ->] Analyzing -> [AwaitingConfirm ->]
//!   Executing -> {Complete | Error}`
//!
//! `Error` is reachable from every non-terminal state. Terminal states have
//! no outgoing transitions. All transitions are checked through
//! [`PipelineShape::can_transition`]; nothing assigns a job state without
//! going through that guard.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::JoblineError;

/// The lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Non-interactive job created, runner not yet started.
    Pending,
    /// Non-interactive job executing its stages.
    Running,
    /// Interactive job created, runner not yet started.
    Idle,
    /// Interactive job waiting for a client-supplied artifact.
    AwaitingInput,
    /// Interactive job executing the stages up to the checkpoint.
    Analyzing,
    /// Interactive job paused at the checkpoint for confirmation.
    AwaitingConfirm,
    /// Interactive job executing the stages after the checkpoint.
    Executing,
    /// All stages finished without a fatal failure.
    Complete,
    /// A fatal failure terminated the job.
    Error,
}

impl JobState {
    /// Returns true for `Complete` and `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Returns true while the job is waiting on an external call.
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::AwaitingInput | Self::AwaitingConfirm)
    }

    /// Position along the forward direction of the machine.
    ///
    /// Every legal transition other than into `Error` strictly increases the
    /// rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending | Self::Idle => 0,
            Self::AwaitingInput => 1,
            Self::Running | Self::Analyzing => 2,
            Self::AwaitingConfirm => 3,
            Self::Executing => 4,
            Self::Complete => 5,
            Self::Error => 6,
        }
    }

    /// The snake_case name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::AwaitingInput => "awaiting_input",
            Self::Analyzing => "analyzing",
            Self::AwaitingConfirm => "awaiting_confirm",
            Self::Executing => "executing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// All states, in rank order.
    pub const ALL: [JobState; 9] = [
        Self::Pending,
        Self::Idle,
        Self::AwaitingInput,
        Self::Running,
        Self::Analyzing,
        Self::AwaitingConfirm,
        Self::Executing,
        Self::Complete,
        Self::Error,
    ];
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JoblineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| JoblineError::Validation(format!("unknown job state: {s}")))
    }
}

/// Which of the two supported machine shapes a pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "shape")]
pub enum PipelineShape {
    /// `Pending -> Running -> {Complete | Error}`.
    NonInteractive,
    /// Confirmation-gated shape with an optional input step.
    Interactive {
        /// Whether the job waits in `AwaitingInput` before analysis.
        requires_input: bool,
    },
}

impl PipelineShape {
    /// The state a freshly created job starts in.
    pub fn initial_state(self) -> JobState {
        match self {
            Self::NonInteractive => JobState::Pending,
            Self::Interactive { .. } => JobState::Idle,
        }
    }

    /// The state the runner moves to when it starts executing.
    pub fn start_state(self) -> JobState {
        match self {
            Self::NonInteractive => JobState::Running,
            Self::Interactive {
                requires_input: true,
            } => JobState::AwaitingInput,
            Self::Interactive {
                requires_input: false,
            } => JobState::Analyzing,
        }
    }

    /// Returns true if `from -> to` is a legal transition for this shape.
    pub fn can_transition(self, from: JobState, to: JobState) -> bool {
        use JobState::*;

        if from.is_terminal() {
            return false;
        }
        if to == Error {
            return self.owns(from);
        }

        match self {
            Self::NonInteractive => matches!((from, to), (Pending, Running) | (Running, Complete)),
            Self::Interactive { requires_input } => match (from, to) {
                (Idle, AwaitingInput) => requires_input,
                (Idle, Analyzing) => !requires_input,
                (AwaitingInput, Analyzing) => requires_input,
                (Analyzing, AwaitingConfirm)
                | (Analyzing, Executing)
                | (AwaitingConfirm, Executing)
                | (Executing, Complete) => true,
                _ => false,
            },
        }
    }

    /// Returns true if `state` belongs to this shape.
    pub fn owns(self, state: JobState) -> bool {
        use JobState::*;

        match self {
            Self::NonInteractive => matches!(state, Pending | Running | Complete | Error),
            Self::Interactive { requires_input } => match state {
                AwaitingInput => requires_input,
                Idle | Analyzing | AwaitingConfirm | Executing | Complete | Error => true,
                Pending | Running => false,
            },
        }
    }
}
