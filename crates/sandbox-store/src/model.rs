//! The canonical `Sandbox` record and its state machine.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque sandbox identifier, stable for the sandbox's lifetime.
pub type SandboxId = String;

/// Sandbox lifecycle state. Transitions are constrained by [`allowed_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Running,
    Pausing,
    Paused,
    Killing,
    Killed,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Running => "running",
            SandboxState::Pausing => "pausing",
            SandboxState::Paused => "paused",
            SandboxState::Killing => "killing",
            SandboxState::Killed => "killed",
        }
    }
}

/// Requested removal action passed to `StartRemoving`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalAction {
    Pause,
    Kill,
}

impl RemovalAction {
    /// The state this action drives a sandbox towards.
    pub fn target_state(self) -> SandboxState {
        match self {
            RemovalAction::Pause => SandboxState::Pausing,
            RemovalAction::Kill => SandboxState::Killing,
        }
    }
}

/// The sandbox lifecycle's allowed-transition table. `from == to` is
/// handled separately by callers as the idempotent no-op case.
pub fn allowed_transition(from: SandboxState, to: SandboxState) -> bool {
    use SandboxState::*;
    matches!(
        (from, to),
        (Running, Pausing)
            | (Pausing, Paused)
            | (Paused, Running)
            | (Running, Killing)
            | (Pausing, Killing)
            | (Paused, Killing)
            | (Killing, Killed)
    )
}

/// The canonical sandbox record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    pub sandbox_id: SandboxId,
    pub team_id: Uuid,
    pub template_id: String,
    pub execution_id: Uuid,
    pub build_id: Uuid,
    pub cluster_id: Uuid,
    pub client_id: String,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub max_instance_length: ChronoDuration,

    pub state: SandboxState,
    pub auto_pause: bool,
}

impl Sandbox {
    /// Clamps `end_time` so `end_time - start_time <= max_instance_length`.
    /// Called on insert; `update` deliberately does not re-clamp (see
    /// DESIGN.md Open Question 1).
    pub fn clamp_end_time(&mut self) {
        let max_end = self.start_time + self.max_instance_length;
        if self.end_time > max_end {
            self.end_time = max_end;
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }

    /// Sets `end_time = now` iff the sandbox is not already expired, so an
    /// already-expired end time is never pushed later.
    pub fn mark_ending_now(&mut self, now: DateTime<Utc>) {
        if !self.is_expired_at(now) {
            self.end_time = now;
        }
    }
}
