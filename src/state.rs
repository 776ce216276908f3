use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    Draft,
    Generating,
    Generated,
    HitlReview,
    ReadyForQa,
    Approved,
    Correctable,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal attempt transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: AttemptState,
    pub to: AttemptState,
}

const TRANSITIONS: &[(AttemptState, AttemptState)] = {
    use AttemptState::*;
    &[
        (Draft, Generating),
        (Generating, Generated),
        (Generating, Blocked),
        (Generated, Generating),
        (Generated, HitlReview),
        (HitlReview, Generating),
        (HitlReview, ReadyForQa),
        (ReadyForQa, Approved),
        (ReadyForQa, Correctable),
        (ReadyForQa, Blocked),
        (Correctable, HitlReview),
        (Correctable, Generating),
    ]
};

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Blocked)
    }

    pub fn can_transition_to(self, to: AttemptState) -> bool {
        if to == Self::Draft {
            // Full restart is allowed from anywhere that is not final.
            return !self.is_terminal();
        }
        TRANSITIONS.contains(&(self, to))
    }

    pub fn transition(self, to: AttemptState) -> Result<AttemptState, TransitionError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(TransitionError { from: self, to })
        }
    }

    /// States in which a reviewer can still ask for a second generation attempt.
    pub fn is_reviewable(self) -> bool {
        matches!(self, Self::Generated | Self::HitlReview | Self::Correctable)
    }
}
