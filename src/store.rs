//! The conversation log.
//!
//! [`MessageStore`] is an append-only sequence of [`Turn`]s.  The remote model needs the whole
//! conversation replayed on every request, so history is linear: turns are never edited,
//! reordered or removed one at a time.  The only way back is [`MessageStore::reset`], which
//! returns to the system preamble.

use crate::error::{Error, Result};
use crate::types::{Role, Turn};

/// Ordered, append-only log of conversation turns.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    preamble: Option<Turn>,
    turns: Vec<Turn>,
}

impl MessageStore {
    /// Create a store, seeded with a system turn when a preamble is given.
    pub fn new(preamble: Option<String>) -> Self {
        let preamble = preamble.map(Turn::system);
        let turns = preamble.iter().cloned().collect();
        Self { preamble, turns }
    }

    /// Append a turn to the end of the log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRoleSequence`] when the turn has the same role as the latest
    /// non-system turn, or when it is a system turn (the preamble is the only system turn).
    pub fn append(&mut self, turn: Turn) -> Result<()> {
        let previous = self.last_conversational_role();
        if turn.role() == Role::System || previous == Some(turn.role()) {
            return Err(Error::invalid_role_sequence(previous, turn.role()));
        }
        self.turns.push(turn);
        Ok(())
    }

    /// A read-only view of every turn, oldest first.
    pub fn snapshot(&self) -> &[Turn] {
        &self.turns
    }

    /// Drop every turn except the system preamble.
    pub fn reset(&mut self) {
        self.turns.clear();
        if let Some(preamble) = &self.preamble {
            self.turns.push(preamble.clone());
        }
    }

    /// The system preamble, if one was configured.
    pub fn preamble(&self) -> Option<&Turn> {
        self.preamble.as_ref()
    }

    /// The most recent turn.
    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// The latest turn when it is a user turn still waiting for a reply.
    pub fn pending_user(&self) -> Option<&Turn> {
        self.turns.last().filter(|turn| turn.role() == Role::User)
    }

    /// Number of turns, including the preamble.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// True when the log holds no turns at all.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn last_conversational_role(&self) -> Option<Role> {
        self.turns
            .iter()
            .rev()
            .map(Turn::role)
            .find(|role| *role != Role::System)
    }
}
