use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;

use crate::error::BoardError;

/// Lifecycle state of the Board as a whole. Distinct from a single
/// processor's internal state; a processor failing moves the Board to
/// `Degraded` or `Stopping` depending on policy (see `PropagationPolicy`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardState {
    Initializing,
    Running,
    /// One or more processors reported an error but the Board chose to
    /// continue with the remaining processors.
    Degraded { reason: String },
    Stopping,
    Stopped,
}

pub struct StateManager {
    state: Arc<RwLock<BoardState>>,
    state_tx: Sender<BoardState>,
    state_rx: Receiver<BoardState>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        let (state_tx, state_rx) = crossbeam_channel::unbounded();
        Self {
            state: Arc::new(RwLock::new(BoardState::Initializing)),
            state_tx,
            state_rx,
        }
    }

    pub fn current(&self) -> BoardState {
        self.state.read().clone()
    }

    pub fn subscribe(&self) -> Receiver<BoardState> {
        self.state_rx.clone()
    }

    pub fn transition(&self, new_state: BoardState) -> Result<(), BoardError> {
        let mut current = self.state.write();

        let valid = matches!(
            (&*current, &new_state),
            (BoardState::Initializing, BoardState::Running)
                | (BoardState::Running, BoardState::Degraded { .. })
                | (BoardState::Running, BoardState::Stopping)
                | (BoardState::Degraded { .. }, BoardState::Running)
                | (BoardState::Degraded { .. }, BoardState::Stopping)
                | (BoardState::Stopping, BoardState::Stopped)
        );

        if !valid {
            return Err(BoardError::Fatal(format!(
                "invalid board state transition: {:?} -> {:?}",
                *current, new_state
            )));
        }

        *current = new_state.clone();
        let _ = self.state_tx.send(new_state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_lifecycle_transitions_succeed() {
        let sm = StateManager::new();
        sm.transition(BoardState::Running).unwrap();
        sm.transition(BoardState::Stopping).unwrap();
        sm.transition(BoardState::Stopped).unwrap();
        assert_eq!(sm.current(), BoardState::Stopped);
    }

    #[test]
    fn skipping_stopping_is_rejected() {
        let sm = StateManager::new();
        sm.transition(BoardState::Running).unwrap();
        assert!(sm.transition(BoardState::Stopped).is_err());
    }
}
