use crate::model::{HostId, Instance, State};

use super::Event;

/// One transition as seen by listeners: the row before and the row that is
/// about to be (or was) written.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRecord<'a> {
    pub event: Event,
    pub before: &'a Instance,
    pub after: &'a Instance,
}

impl TransitionRecord<'_> {
    pub fn from_state(&self) -> State {
        self.before.state
    }

    pub fn to_state(&self) -> State {
        self.after.state
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ListenerError {
    #[error("insufficient capacity on {host}: {detail}")]
    InsufficientCapacity { host: HostId, detail: String },
    #[error("{0}")]
    Failed(String),
}

/// Hooks run around every state transition.
///
/// A `pre_transition` error blocks the transition. `post_transition` runs for
/// every listener whose pre hook succeeded, with `committed` telling whether
/// the row was actually written; its errors are only logged.
pub trait StateListener: Send + Sync {
    fn name(&self) -> &'static str;

    fn pre_transition(&self, _change: &TransitionRecord<'_>) -> Result<(), ListenerError> {
        Ok(())
    }

    fn post_transition(
        &self,
        change: &TransitionRecord<'_>,
        committed: bool,
    ) -> Result<(), ListenerError>;
}
