//! Per-VM lifecycle states and the transitions allowed between them.
//!
//! ```text
//! Absent ──► Provisioning ──► Running ──► Stopping ──► Stopped
//!                 │              ▲                        │
//!                 ▼              └────────── restart ─────┘
//!               Failed
//! ```
//!
//! The state is never persisted. It is derived from liveness probes
//! ([`VmState::observe`]) and advanced by the orchestrator as it works.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::vm::VmRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Absent,
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl VmState {
    /// Current state of a VM as seen from its record (or lack of one).
    pub fn observe(record: Option<&VmRecord>) -> Self {
        match record {
            None => VmState::Absent,
            Some(r) if r.is_running() => VmState::Running,
            Some(_) => VmState::Stopped,
        }
    }

    pub fn can_transition_to(self, next: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, next),
            (Absent, Provisioning)
                | (Stopped, Provisioning)
                | (Failed, Provisioning)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                | (Stopped, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                // Stop on an already-stopped VM is a no-op, not an error.
                | (Stopped, Stopping)
                | (Failed, Stopping)
        )
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Absent => "absent",
            VmState::Provisioning => "provisioning",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Failed => "failed",
        };
        f.pad(s)
    }
}

/// Tracks one VM through a single operation and logs every step.
#[derive(Debug)]
pub struct Transitions {
    name: String,
    current: VmState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: VmState,
    pub to: VmState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal VM state transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

impl Transitions {
    pub fn new(name: impl Into<String>, initial: VmState) -> Self {
        Self {
            name: name.into(),
            current: initial,
        }
    }

    pub fn current(&self) -> VmState {
        self.current
    }

    pub fn advance(&mut self, next: VmState) -> Result<(), IllegalTransition> {
        if !self.current.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.current,
                to: next,
            });
        }
        debug!(vm = %self.name, from = %self.current, to = %next, "state transition");
        self.current = next;
        Ok(())
    }
}
