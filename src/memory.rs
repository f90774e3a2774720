//! Per-flow attempt memory
//!
//! [`FlowMemory`] is a read-only view handed to callers. All mutation goes through
//! [`MemoryStore`], which enforces numbering, write-once outcomes and the
//! single-writer session lease.

pub mod persistence;
pub mod store;

pub use persistence::{AttemptPersistence, SledAttemptPersistence, StoredFlow};
pub use store::{MemoryStore, SessionLease};

use crate::attempt::Attempt;
use crate::pattern::{FailurePattern, Pattern};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Success and failure pattern sets of one flow, as persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSnapshot {
    pub success_patterns: BTreeSet<Pattern>,
    pub failure_patterns: BTreeSet<FailurePattern>,
}

/// Everything remembered about one target flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowMemory {
    flow_api_name: String,
    attempts: Vec<Attempt>,
    patterns: PatternSnapshot,
}

impl FlowMemory {
    pub fn empty(flow_api_name: impl Into<String>) -> Self {
        Self {
            flow_api_name: flow_api_name.into(),
            attempts: Vec::new(),
            patterns: PatternSnapshot::default(),
        }
    }

    pub(crate) fn from_parts(
        flow_api_name: impl Into<String>,
        attempts: Vec<Attempt>,
        patterns: PatternSnapshot,
    ) -> Self {
        Self {
            flow_api_name: flow_api_name.into(),
            attempts,
            patterns,
        }
    }

    pub fn flow_api_name(&self) -> &str {
        &self.flow_api_name
    }

    /// Attempts in ascending attempt-number order.
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn attempt(&self, attempt_number: u32) -> Option<&Attempt> {
        // Numbering is gapless from 1, so the number doubles as an index.
        attempt_number
            .checked_sub(1)
            .and_then(|idx| self.attempts.get(idx as usize))
            .filter(|a| a.attempt_number == attempt_number)
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub fn next_attempt_number(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    pub fn success_patterns(&self) -> &BTreeSet<Pattern> {
        &self.patterns.success_patterns
    }

    pub fn failure_patterns(&self) -> &BTreeSet<FailurePattern> {
        &self.patterns.failure_patterns
    }

    pub fn patterns(&self) -> &PatternSnapshot {
        &self.patterns
    }

    pub fn successful_attempts(&self) -> impl Iterator<Item = &Attempt> {
        self.attempts.iter().filter(|a| a.success())
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
            && self.patterns.success_patterns.is_empty()
            && self.patterns.failure_patterns.is_empty()
    }

    pub(crate) fn push_attempt(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }

    pub(crate) fn attempt_mut(&mut self, attempt_number: u32) -> Option<&mut Attempt> {
        attempt_number
            .checked_sub(1)
            .and_then(|idx| self.attempts.get_mut(idx as usize))
            .filter(|a| a.attempt_number == attempt_number)
    }

    pub(crate) fn replace_patterns(&mut self, patterns: PatternSnapshot) {
        self.patterns = patterns;
    }

    pub(crate) fn success_patterns_mut(&mut self) -> &mut BTreeSet<Pattern> {
        &mut self.patterns.success_patterns
    }

    pub(crate) fn failure_patterns_mut(&mut self) -> &mut BTreeSet<FailurePattern> {
        &mut self.patterns.failure_patterns
    }
}
