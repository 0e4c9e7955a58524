//! Participant call-state machine.
//!
//! Each session participant carries a call state and the last event applied
//! to it. State changes are only ever produced by the guarded transition
//! functions below; a signal whose guard does not match the current state
//! produces no change. The session manager records the returned event on
//! the participant right after applying the state.

use crate::signal::SignalKind;

/// Call state of one participant. The numeric values appear in the
/// member-state fan-out payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ParticipantState {
    Idle = 0,
    Calling = 1,
    Called = 2,
    Incall = 3,
}

/// Last event applied to a participant, mirrored in the member-state
/// fan-out payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ParticipantEvent {
    None = 0,
    Invite = 1,
    RecvInvite = 2,
    Cancel = 3,
    RecvCancel = 4,
    Accept = 5,
    RecvAccept = 6,
    Reject = 7,
    RecvReject = 8,
    Busy = 9,
    RecvBusy = 10,
    End = 11,
    RecvEnd = 12,
}

/// A guarded transition result: the state to enter and the event to record.
pub type StateChange = (ParticipantState, ParticipantEvent);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    pub uid: u64,
    pub state: ParticipantState,
    pub event: ParticipantEvent,
}

impl Participant {
    pub fn new(uid: u64) -> Self {
        Self {
            uid,
            state: ParticipantState::Idle,
            event: ParticipantEvent::None,
        }
    }

    pub fn in_state(&self, state: ParticipantState) -> bool {
        self.state == state
    }

    pub fn apply(&mut self, change: StateChange) {
        self.state = change.0;
        self.event = change.1;
    }
}

/// Transition table for direct (1-1) call signals. Returns the change for
/// the originator and for the peer, or `None` when the originator's state
/// does not match the guard.
pub fn direct_transition(
    kind: SignalKind,
    caller: ParticipantState,
) -> Option<(StateChange, StateChange)> {
    use ParticipantEvent as E;
    use ParticipantState as S;

    match kind {
        SignalKind::Invite if caller == S::Idle => {
            Some(((S::Calling, E::Invite), (S::Called, E::RecvInvite)))
        }
        SignalKind::Cancel if matches!(caller, S::Calling | S::Incall) => {
            Some(((S::Idle, E::Cancel), (S::Idle, E::RecvCancel)))
        }
        SignalKind::Accept if caller == S::Called => {
            Some(((S::Incall, E::Accept), (S::Incall, E::RecvAccept)))
        }
        SignalKind::Reject if caller == S::Called => {
            Some(((S::Idle, E::Reject), (S::Idle, E::RecvReject)))
        }
        SignalKind::Busy if caller == S::Called => {
            Some(((S::Idle, E::Busy), (S::Idle, E::RecvBusy)))
        }
        // Hanging up is allowed from any state.
        SignalKind::End => Some(((S::Idle, E::End), (S::Idle, E::RecvEnd))),
        _ => None,
    }
}

/// Transition table for multi-party call signals other than Invite and
/// MemberOp (those two involve outbound traffic and are orchestrated by
/// the session manager).
pub fn group_transition(kind: SignalKind, state: ParticipantState) -> Option<StateChange> {
    use ParticipantEvent as E;
    use ParticipantState as S;

    match kind {
        SignalKind::Cancel if matches!(state, S::Calling | S::Incall) => Some((S::Idle, E::Cancel)),
        SignalKind::Accept if state == S::Called => Some((S::Incall, E::Accept)),
        SignalKind::Reject if state == S::Called => Some((S::Idle, E::Reject)),
        SignalKind::Busy if state == S::Called => Some((S::Idle, E::Busy)),
        SignalKind::End => Some((S::Idle, E::End)),
        _ => None,
    }
}

/// Guarded transition for a member targeted by an invite operation.
pub fn member_invite_transition(state: ParticipantState) -> Option<StateChange> {
    (state == ParticipantState::Idle)
        .then_some((ParticipantState::Called, ParticipantEvent::RecvInvite))
}

/// Guarded transition for a member targeted by a kick operation.
pub fn member_kick_transition(state: ParticipantState) -> Option<StateChange> {
    (state == ParticipantState::Incall)
        .then_some((ParticipantState::Idle, ParticipantEvent::RecvEnd))
}
