//! Sandbox session state machine.
//!
//! ```text
//! STOPPED → SPAWNING → ALIVE → {EXITED | CRASHED} → RESPAWNING → ALIVE …
//!                         └──────── close ────────→ CLOSING → CLOSED
//! ```
//!
//! `Closing` is the "do not respawn" guard: a process exit observed while
//! closing never leads back to `Respawning`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Stopped,
    Spawning,
    Alive,
    /// The process exited cleanly without being asked to.
    Exited,
    /// The process died abnormally or the transport broke.
    Crashed,
    Respawning,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Spawn,
    SpawnSucceeded,
    SpawnFailed,
    ProcessExited { clean: bool },
    Close,
    CloseCompleted,
}

impl SandboxState {
    /// Next state after `transition`. Transitions that make no sense in the
    /// current state leave it unchanged.
    pub fn apply(self, transition: Transition) -> SandboxState {
        use SandboxState::*;
        use Transition::*;

        match (self, transition) {
            (Closed, _) => Closed,
            (Closing, CloseCompleted) => Closed,
            (Closing, _) => Closing,
            (_, Close) => Closing,

            (Stopped, Spawn) => Spawning,
            (Exited | Crashed, Spawn) => Respawning,
            (Spawning | Respawning, SpawnSucceeded) => Alive,
            (Spawning, SpawnFailed) => Stopped,
            (Respawning, SpawnFailed) => Crashed,
            (Alive, ProcessExited { clean: true }) => Exited,
            (Alive, ProcessExited { clean: false }) => Crashed,

            (state, _) => state,
        }
    }

    /// Dead but allowed to come back.
    pub fn should_respawn(self) -> bool {
        matches!(self, SandboxState::Exited | SandboxState::Crashed)
    }

    pub fn is_closing(self) -> bool {
        matches!(self, SandboxState::Closing | SandboxState::Closed)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxState::Stopped => "STOPPED",
            SandboxState::Spawning => "SPAWNING",
            SandboxState::Alive => "ALIVE",
            SandboxState::Exited => "EXITED",
            SandboxState::Crashed => "CRASHED",
            SandboxState::Respawning => "RESPAWNING",
            SandboxState::Closing => "CLOSING",
            SandboxState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}
