use std::fmt;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::CallFlow;
use crate::dial::Digit;

/// The digit that arms sound selection in [`CallFlow::DialActivated`].
const ACTIVATION_DIGIT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandsetState {
    Down,
    Lifted,
}

/// Exists only while the handset is lifted. Whether dialing is activated is carried by
/// the [`CallState`] variant holding the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub id: SessionId,
    pub last_digit: Option<Digit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Down,
    LiftedIdle(CallSession),
    LiftedActivated(CallSession),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    /// The handset was lifted and a new session opened.
    BeginCall(SessionId),
    /// The activation digit arrived; the next digit selects a sound.
    Activated(SessionId),
    /// The one routing digit for this call.
    SelectSound(SessionId, Digit),
    /// The handset went down; everything the session started must stop.
    EndCall(SessionId),
}

pub struct CallStateMachine {
    flow: CallFlow,
    state: CallState,
}

impl CallStateMachine {
    pub fn new(flow: CallFlow) -> Self {
        Self {
            flow,
            state: CallState::Down,
        }
    }

    pub fn handset(&self) -> HandsetState {
        match self.state {
            CallState::Down => HandsetState::Down,
            _ => HandsetState::Lifted,
        }
    }

    pub fn session(&self) -> Option<&CallSession> {
        match &self.state {
            CallState::Down => None,
            CallState::LiftedIdle(session) | CallState::LiftedActivated(session) => Some(session),
        }
    }

    /// True while `id` is the session of a lifted handset.
    pub fn is_live(&self, id: SessionId) -> bool {
        self.session().is_some_and(|session| session.id == id)
    }

    pub fn handset_lifted(&mut self) -> Option<CallEvent> {
        if self.handset() == HandsetState::Lifted {
            debug!("handset already lifted");
            return None;
        }

        let session = CallSession {
            id: SessionId::new(),
            last_digit: None,
        };
        let id = session.id;

        info!(session = %id, "handset lifted");
        self.state = CallState::LiftedIdle(session);

        Some(CallEvent::BeginCall(id))
    }

    pub fn handset_down(&mut self) -> Option<CallEvent> {
        match std::mem::replace(&mut self.state, CallState::Down) {
            CallState::Down => {
                debug!("handset already down");
                None
            }
            CallState::LiftedIdle(session) | CallState::LiftedActivated(session) => {
                info!(session = %session.id, "handset down");
                Some(CallEvent::EndCall(session.id))
            }
        }
    }

    pub fn digit(&mut self, digit: Digit) -> Option<CallEvent> {
        let flow = self.flow;

        match &mut self.state {
            CallState::Down => {
                debug!(%digit, "digit with handset down, ignoring");
                None
            }
            CallState::LiftedIdle(session) => {
                if flow != CallFlow::DialActivated || digit.value() != ACTIVATION_DIGIT {
                    debug!(session = %session.id, %digit, "digit ignored");
                    return None;
                }

                let session = session.clone();
                let id = session.id;

                info!(session = %id, "dialing activated");
                self.state = CallState::LiftedActivated(session);

                Some(CallEvent::Activated(id))
            }
            CallState::LiftedActivated(session) => {
                if session.last_digit.is_some() {
                    debug!(session = %session.id, %digit, "sound already selected, ignoring");
                    return None;
                }

                session.last_digit = Some(digit);
                info!(session = %session.id, %digit, "sound selected");

                Some(CallEvent::SelectSound(session.id, digit))
            }
        }
    }
}
