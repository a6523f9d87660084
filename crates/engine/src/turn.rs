use std::fmt;

/// Identifies one submitted turn. Issued monotonically by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "turn-{}", self.0)
    }
}

/// Lifecycle of a turn. Active states carry the owning turn id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    Sending(TurnId),
    Streaming {
        turn: TurnId,
        segment: usize,
        total: usize,
    },
    Committed(TurnId),
    Cancelled(TurnId),
    Failed {
        turn: TurnId,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnTransition {
    Send(TurnId),
    BeginSegment {
        turn: TurnId,
        segment: usize,
        total: usize,
    },
    Commit(TurnId),
    Cancel(TurnId),
    Fail {
        turn: TurnId,
        message: String,
    },
    ResetToIdle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnTransitionRejection {
    AlreadyActive { active: TurnId, attempted: TurnId },
    NoActiveTurn,
    TurnMismatch { active: TurnId, attempted: TurnId },
    SegmentOutOfOrder { expected: usize, attempted: usize },
}

pub type TurnTransitionResult = Result<TurnState, TurnTransitionRejection>;

impl TurnState {
    /// Owning turn while `Sending` or `Streaming`.
    pub fn active_turn(&self) -> Option<TurnId> {
        match self {
            Self::Sending(turn) | Self::Streaming { turn, .. } => Some(*turn),
            Self::Idle | Self::Committed(_) | Self::Cancelled(_) | Self::Failed { .. } => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_turn().is_some()
    }

    /// Applies one transition deterministically.
    ///
    /// Only inactive states accept `Send`, so a second turn can never start
    /// while one is in flight. Segments advance strictly one at a time and
    /// every terminal transition must name the active turn.
    pub fn apply(&self, transition: TurnTransition) -> TurnTransitionResult {
        match transition {
            TurnTransition::Send(turn) => self.apply_send(turn),
            TurnTransition::BeginSegment {
                turn,
                segment,
                total,
            } => self.apply_begin_segment(turn, segment, total),
            TurnTransition::Commit(turn) => self.apply_terminal(turn, Self::Committed),
            TurnTransition::Cancel(turn) => self.apply_terminal(turn, Self::Cancelled),
            TurnTransition::Fail { turn, message } => {
                self.apply_terminal(turn, |turn| Self::Failed { turn, message })
            }
            TurnTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_send(&self, turn: TurnId) -> TurnTransitionResult {
        match self.active_turn() {
            Some(active) => Err(TurnTransitionRejection::AlreadyActive {
                active,
                attempted: turn,
            }),
            None => Ok(Self::Sending(turn)),
        }
    }

    fn apply_begin_segment(
        &self,
        turn: TurnId,
        segment: usize,
        total: usize,
    ) -> TurnTransitionResult {
        let expected = match self {
            Self::Sending(active) if *active == turn => 0,
            Self::Streaming {
                turn: active,
                segment: current,
                ..
            } if *active == turn => current + 1,
            Self::Sending(active) | Self::Streaming { turn: active, .. } => {
                return Err(TurnTransitionRejection::TurnMismatch {
                    active: *active,
                    attempted: turn,
                });
            }
            Self::Idle | Self::Committed(_) | Self::Cancelled(_) | Self::Failed { .. } => {
                return Err(TurnTransitionRejection::NoActiveTurn);
            }
        };

        if segment != expected || segment >= total {
            return Err(TurnTransitionRejection::SegmentOutOfOrder {
                expected,
                attempted: segment,
            });
        }

        Ok(Self::Streaming {
            turn,
            segment,
            total,
        })
    }

    fn apply_terminal(
        &self,
        turn: TurnId,
        next: impl FnOnce(TurnId) -> TurnState,
    ) -> TurnTransitionResult {
        match self.active_turn() {
            Some(active) if active == turn => Ok(next(turn)),
            Some(active) => Err(TurnTransitionRejection::TurnMismatch {
                active,
                attempted: turn,
            }),
            None => Err(TurnTransitionRejection::NoActiveTurn),
        }
    }
}
