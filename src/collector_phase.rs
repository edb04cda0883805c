//! Collector phase tracking.
//!
//! A collection always runs Mark, Plan, Rewrite and Move in that order with no
//! interleaving. The phase machine rejects any other transition.

use crate::error::{HeapError, HeapResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectorPhase {
    #[default]
    Idle,
    Marking,
    Planning,
    Rewriting,
    Moving,
}

impl CollectorPhase {
    fn successor(self) -> CollectorPhase {
        match self {
            CollectorPhase::Idle => CollectorPhase::Marking,
            CollectorPhase::Marking => CollectorPhase::Planning,
            CollectorPhase::Planning => CollectorPhase::Rewriting,
            CollectorPhase::Rewriting => CollectorPhase::Moving,
            CollectorPhase::Moving => CollectorPhase::Idle,
        }
    }
}

#[derive(Debug, Default)]
pub struct CollectorState {
    phase: CollectorPhase,
}

impl CollectorState {
    pub fn phase(&self) -> CollectorPhase {
        self.phase
    }

    pub fn is_collecting(&self) -> bool {
        self.phase != CollectorPhase::Idle
    }

    pub fn begin(&mut self) -> HeapResult<()> {
        if self.is_collecting() {
            return Err(HeapError::ReentrantCollection);
        }
        self.phase = CollectorPhase::Marking;
        Ok(())
    }

    pub fn advance(&mut self, to: CollectorPhase) -> HeapResult<()> {
        if self.phase.successor() != to || to == CollectorPhase::Marking {
            return Err(HeapError::HeapCorruption(format!(
                "collector phase {:?} cannot follow {:?}",
                to, self.phase
            )));
        }
        self.phase = to;
        Ok(())
    }

    /// Drops back to idle after a failed collection.
    pub fn abort(&mut self) {
        self.phase = CollectorPhase::Idle;
    }
}
