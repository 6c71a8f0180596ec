//! Completion states and the transition rules between them.
//!
//! Step progress moves forward only: NotDone → JustDone → Done. The
//! transient JustDone state exists so a renderer can acknowledge a completion
//! exactly once; the first render that observes it consolidates it to Done.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Completion state of a single step for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    NotDone,
    JustDone,
    Done,
}

impl StepState {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: StepState) -> bool {
        use StepState::*;
        matches!((self, target), (NotDone, JustDone) | (JustDone, Done))
    }

    /// Whether the step counts as completed for the aggregate.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::JustDone | Self::Done)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotDone => "not_done",
            Self::JustDone => "just_done",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_done" => Ok(Self::NotDone),
            "just_done" => Ok(Self::JustDone),
            "done" => Ok(Self::Done),
            other => Err(format!("Unknown step state: {other}")),
        }
    }
}

/// Aggregate completion of an onboarding for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingState {
    #[default]
    NotDone,
    Done,
}

impl OnboardingState {
    /// An onboarding is done when every member step has a completed record.
    ///
    /// An onboarding without steps is never done.
    pub fn from_counts(completed: usize, member_steps: usize) -> Self {
        if member_steps > 0 && completed == member_steps {
            Self::Done
        } else {
            Self::NotDone
        }
    }
}

impl std::fmt::Display for OnboardingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotDone => write!(f, "not_done"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// The `onboarding_state` key reported alongside the step states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelState {
    /// The user dismissed the panel; takes precedence over completion.
    Closed,
    /// Completed by this very read.
    JustDone,
    Done,
}

impl PanelState {
    /// Decide the reported panel state after consolidation.
    ///
    /// `consolidated` is the number of step records this read flipped from
    /// JustDone to Done.
    pub fn report(closed: bool, aggregate: OnboardingState, consolidated: usize) -> Option<Self> {
        if closed {
            return Some(Self::Closed);
        }
        match aggregate {
            OnboardingState::Done if consolidated > 0 => Some(Self::JustDone),
            OnboardingState::Done => Some(Self::Done),
            OnboardingState::NotDone => None,
        }
    }
}

/// Result of one read-and-advance of an onboarding progress.
///
/// Serializes flat: one key per step id plus an optional `onboarding_state`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateMap {
    #[serde(flatten)]
    pub steps: BTreeMap<Uuid, StepState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onboarding_state: Option<PanelState>,
}

impl StateMap {
    /// State recorded for `step_id`, or NotDone when the step is not a member.
    pub fn step(&self, step_id: Uuid) -> StepState {
        self.steps.get(&step_id).copied().unwrap_or_default()
    }
}

/// Outcome of validating a step by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepValidation {
    JustDone,
    WasDone,
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_transitions_only_move_forward() {
        use StepState::*;
        assert!(NotDone.can_transition_to(JustDone));
        assert!(JustDone.can_transition_to(Done));

        assert!(!NotDone.can_transition_to(Done));
        assert!(!Done.can_transition_to(JustDone));
        assert!(!Done.can_transition_to(NotDone));
        assert!(!JustDone.can_transition_to(JustDone));
    }

    #[test]
    fn completed_states() {
        assert!(!StepState::NotDone.is_completed());
        assert!(StepState::JustDone.is_completed());
        assert!(StepState::Done.is_completed());
    }

    #[test]
    fn display_matches_serde_and_parse() {
        for state in [StepState::NotDone, StepState::JustDone, StepState::Done] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
            assert_eq!(state.as_str().parse::<StepState>().unwrap(), state);
        }
        assert!("finished".parse::<StepState>().is_err());
    }

    #[test]
    fn aggregate_from_counts() {
        assert_eq!(OnboardingState::from_counts(2, 2), OnboardingState::Done);
        assert_eq!(OnboardingState::from_counts(1, 2), OnboardingState::NotDone);
        assert_eq!(OnboardingState::from_counts(0, 0), OnboardingState::NotDone);
    }

    #[test]
    fn panel_report_precedence() {
        use OnboardingState::*;
        assert_eq!(PanelState::report(true, NotDone, 0), Some(PanelState::Closed));
        assert_eq!(PanelState::report(true, Done, 3), Some(PanelState::Closed));
        assert_eq!(PanelState::report(false, Done, 1), Some(PanelState::JustDone));
        assert_eq!(PanelState::report(false, Done, 0), Some(PanelState::Done));
        assert_eq!(PanelState::report(false, NotDone, 1), None);
    }

    #[test]
    fn state_map_serializes_flat() {
        let a = Uuid::new_v4();
        let mut map = StateMap::default();
        map.steps.insert(a, StepState::JustDone);

        let value = serde_json::to_value(&map).unwrap();
        assert_eq!(value[a.to_string()], "just_done");
        assert!(value.get("onboarding_state").is_none());

        map.onboarding_state = Some(PanelState::JustDone);
        let value = serde_json::to_value(&map).unwrap();
        assert_eq!(value["onboarding_state"], "just_done");
    }

    #[test]
    fn validation_outcome_serde() {
        let json = serde_json::to_string(&StepValidation::WasDone).unwrap();
        assert_eq!(json, "\"WAS_DONE\"");
    }
}
