//! VM lifecycle state machine.
//!
//! The legal transitions live in one table keyed by (current state, action).
//! The dispatcher consults it before every lifecycle call; a client's
//! action menu is only a hint and is always re-validated here.
//!
//! ```text
//!              start                pause
//!   inactive ─────────▶ running ─────────▶ paused
//!      ▲  │   ◀───────── │  ▲   ◀───────── │
//!      │  │     stop     │  │     resume   │
//!      │  │              └──┘ restart      │
//!      │  ▼ delete                         │
//!  (removed)        ◀──────── stop ────────┘
//! ```

use serde::Serialize;
use std::fmt;
use virtpilot_hypervisor::VmState;

use crate::error::{ControlError, Result};

/// Lifecycle actions subject to the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
    Pause,
    Resume,
    Restart,
    Delete,
    Console,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Start,
        Action::Stop,
        Action::Pause,
        Action::Resume,
        Action::Restart,
        Action::Delete,
        Action::Console,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::Restart => "restart",
            Action::Delete => "delete",
            Action::Console => "console",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of validating an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Perform the action; the VM ends up in this state.
    Next(VmState),
    /// Perform the action; the VM leaves the model.
    Removed,
    /// Perform the action; the state does not change.
    Unchanged,
    /// Nothing to do, report success.
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Go(Outcome),
    Already,
    Illegal,
}

fn rule(state: VmState, action: Action) -> Rule {
    use Action::*;
    use VmState::*;

    match (state, action) {
        (Inactive, Start) => Rule::Go(Outcome::Next(Running)),
        (Inactive, Stop) => Rule::Go(Outcome::Noop),
        (Inactive, Delete) => Rule::Go(Outcome::Removed),

        (Running, Start) | (Running, Resume) => Rule::Already,
        (Running, Stop) => Rule::Go(Outcome::Next(Inactive)),
        (Running, Pause) => Rule::Go(Outcome::Next(Paused)),
        (Running, Restart) => Rule::Go(Outcome::Next(Running)),
        (Running, Console) => Rule::Go(Outcome::Unchanged),

        (Paused, Pause) => Rule::Already,
        (Paused, Stop) => Rule::Go(Outcome::Next(Inactive)),
        (Paused, Resume) => Rule::Go(Outcome::Next(Running)),
        (Paused, Console) => Rule::Go(Outcome::Unchanged),

        _ => Rule::Illegal,
    }
}

/// Validate `action` against the current state of VM `name`.
pub fn validate(name: &str, state: VmState, action: Action) -> Result<Outcome> {
    match rule(state, action) {
        Rule::Go(outcome) => Ok(outcome),
        Rule::Already => Err(ControlError::AlreadyInTargetState {
            name: name.to_string(),
            state,
        }),
        Rule::Illegal => Err(ControlError::InvalidTransition { state, action }),
    }
}

/// Actions a client may offer for a VM in `state`.
pub fn allowed_actions(state: VmState) -> Vec<Action> {
    Action::ALL
        .into_iter()
        .filter(|a| matches!(rule(state, *a), Rule::Go(o) if o != Outcome::Noop))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert_eq!(
            validate("vm", VmState::Inactive, Action::Start).unwrap(),
            Outcome::Next(VmState::Running)
        );
        assert_eq!(
            validate("vm", VmState::Running, Action::Pause).unwrap(),
            Outcome::Next(VmState::Paused)
        );
        assert_eq!(
            validate("vm", VmState::Paused, Action::Resume).unwrap(),
            Outcome::Next(VmState::Running)
        );
        assert_eq!(
            validate("vm", VmState::Paused, Action::Stop).unwrap(),
            Outcome::Next(VmState::Inactive)
        );
        assert_eq!(
            validate("vm", VmState::Running, Action::Restart).unwrap(),
            Outcome::Next(VmState::Running)
        );
        assert_eq!(
            validate("vm", VmState::Inactive, Action::Delete).unwrap(),
            Outcome::Removed
        );
    }

    #[test]
    fn test_stop_inactive_is_noop() {
        assert_eq!(
            validate("vm", VmState::Inactive, Action::Stop).unwrap(),
            Outcome::Noop
        );
    }

    #[test]
    fn test_pause_inactive_is_invalid_transition() {
        let err = validate("vm", VmState::Inactive, Action::Pause).unwrap_err();
        assert_eq!(
            err,
            ControlError::InvalidTransition {
                state: VmState::Inactive,
                action: Action::Pause
            }
        );
    }

    #[test]
    fn test_already_in_target_state() {
        for (state, action) in [
            (VmState::Running, Action::Start),
            (VmState::Running, Action::Resume),
            (VmState::Paused, Action::Pause),
        ] {
            let err = validate("vm", state, action).unwrap_err();
            assert_eq!(err.kind(), "already_in_target_state", "{:?} {:?}", state, action);
        }
    }

    #[test]
    fn test_every_pair_is_decided() {
        for state in [VmState::Inactive, VmState::Running, VmState::Paused] {
            for action in Action::ALL {
                // Either an outcome or one of the two transition errors
                if let Err(e) = validate("vm", state, action) {
                    assert!(matches!(
                        e,
                        ControlError::InvalidTransition { .. } | ControlError::AlreadyInTargetState { .. }
                    ));
                }
            }
        }
    }

    #[test]
    fn test_active_vm_cannot_be_deleted() {
        assert!(validate("vm", VmState::Running, Action::Delete).is_err());
        assert!(validate("vm", VmState::Paused, Action::Delete).is_err());
    }

    #[test]
    fn test_allowed_actions_menu() {
        assert_eq!(
            allowed_actions(VmState::Inactive),
            vec![Action::Start, Action::Delete]
        );
        assert_eq!(
            allowed_actions(VmState::Paused),
            vec![Action::Stop, Action::Resume, Action::Console]
        );
        assert!(allowed_actions(VmState::Running).contains(&Action::Restart));
    }
}
