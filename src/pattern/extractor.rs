//! Pattern extraction and reconciliation against ground truth.

use crate::attempt::{Attempt, RepairError};
use crate::memory::FlowMemory;
use crate::pattern::outline::{ConnectorKind, ElementKind, FlowOutline};
use crate::pattern::{FailurePattern, Pattern};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

/// Changes applied to a flow's pattern sets by one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternDelta {
    pub added_success: Vec<Pattern>,
    pub added_failure: Vec<FailurePattern>,
    pub retracted: Vec<Pattern>,
}

impl PatternDelta {
    pub fn is_empty(&self) -> bool {
        self.added_success.is_empty() && self.added_failure.is_empty() && self.retracted.is_empty()
    }
}

/// Derives patterns from attempts and keeps a flow's pattern sets consistent with
/// finalized outcomes.
#[derive(Debug, Clone)]
pub struct PatternExtractor {
    min_corroborating_successes: usize,
}

impl Default for PatternExtractor {
    fn default() -> Self {
        Self::new(1)
    }
}

impl PatternExtractor {
    /// `min_corroborating_successes` is how many *other* successful attempts must
    /// exhibit a success pattern for it to survive a failing attempt that also
    /// exhibits it. Values below 1 are raised to 1.
    pub fn new(min_corroborating_successes: usize) -> Self {
        Self {
            min_corroborating_successes: min_corroborating_successes.max(1),
        }
    }

    pub fn min_corroborating_successes(&self) -> usize {
        self.min_corroborating_successes
    }

    /// Every structural pattern the XML exhibits.
    pub fn describe(&self, xml: &str) -> BTreeSet<Pattern> {
        match FlowOutline::parse(xml) {
            Ok(outline) => describe_outline(&outline),
            Err(_) => BTreeSet::from([Pattern::Unparseable]),
        }
    }

    pub fn extract_success_patterns(&self, attempt: &Attempt) -> BTreeSet<Pattern> {
        if !attempt.success() {
            return BTreeSet::new();
        }
        self.describe(&attempt.generated_xml)
    }

    /// One failure pattern per reported error, each pairing the error with the
    /// structure it most plausibly came from.
    pub fn extract_failure_patterns(&self, attempt: &Attempt) -> BTreeSet<FailurePattern> {
        if attempt.success() {
            return BTreeSet::new();
        }
        let outline = FlowOutline::parse(&attempt.generated_xml).ok();
        attempt
            .merged_errors()
            .into_iter()
            .map(|error| FailurePattern {
                pattern: correlate(outline.as_ref(), &error),
                error,
            })
            .collect()
    }

    /// Fold a finalized attempt into `memory`'s pattern sets.
    ///
    /// A failing attempt also retracts success patterns it exhibits unless enough
    /// other successful attempts corroborate them.
    pub fn reconcile(&self, memory: &mut FlowMemory, attempt: &Attempt) -> PatternDelta {
        let mut delta = PatternDelta::default();
        if !attempt.is_finalized() {
            return delta;
        }

        if attempt.success() {
            for pattern in self.extract_success_patterns(attempt) {
                if memory.success_patterns_mut().insert(pattern.clone()) {
                    delta.added_success.push(pattern);
                }
            }
            return delta;
        }

        for failure in self.extract_failure_patterns(attempt) {
            if memory.failure_patterns_mut().insert(failure.clone()) {
                delta.added_failure.push(failure);
            }
        }

        let exhibited = self.describe(&attempt.generated_xml);
        let suspects: Vec<Pattern> = memory
            .success_patterns()
            .intersection(&exhibited)
            .cloned()
            .collect();
        if suspects.is_empty() {
            return delta;
        }

        let corroborating: Vec<BTreeSet<Pattern>> = memory
            .attempts()
            .iter()
            .filter(|a| a.success() && a.attempt_number != attempt.attempt_number)
            .map(|a| self.describe(&a.generated_xml))
            .collect();

        for pattern in suspects {
            let support = corroborating.iter().filter(|p| p.contains(&pattern)).count();
            if support < self.min_corroborating_successes {
                debug!(
                    flow = %memory.flow_api_name(),
                    attempt = attempt.attempt_number,
                    pattern = %pattern,
                    support,
                    "retracting uncorroborated success pattern"
                );
                memory.success_patterns_mut().remove(&pattern);
                delta.retracted.push(pattern);
            }
        }

        delta
    }
}

fn describe_outline(outline: &FlowOutline) -> BTreeSet<Pattern> {
    let mut patterns = BTreeSet::new();

    let order = outline.execution_order();
    if !order.is_empty() {
        patterns.insert(Pattern::ExecutionOrder(order));
    }
    for kind in outline.kinds() {
        patterns.insert(Pattern::UsesElement(kind));
    }

    let loops: HashSet<&str> = outline
        .elements_of(ElementKind::Loop)
        .filter_map(|e| e.name.as_deref())
        .collect();
    let assignment_feeds_loop = outline
        .elements_of(ElementKind::Assignment)
        .any(|a| a.targets(ConnectorKind::Next).any(|t| loops.contains(t)));
    if assignment_feeds_loop {
        patterns.insert(Pattern::AssignmentBeforeLoop);
    }

    let mut decisions = outline.elements_of(ElementKind::Decision).peekable();
    if decisions.peek().is_some() {
        let all_covered = decisions.all(|d| d.has_connector(ConnectorKind::Default));
        patterns.insert(Pattern::DecisionDefaultPath { all_covered });
    }

    let mut dml = outline.elements.iter().filter(|e| e.kind.is_dml()).peekable();
    if dml.peek().is_some() {
        let all_covered = dml.all(|e| e.has_connector(ConnectorKind::Fault));
        patterns.insert(Pattern::DmlFaultPaths { all_covered });
    }

    if has_dml_inside_loop(outline) {
        patterns.insert(Pattern::DmlInsideLoop);
    }
    if let Some(process_type) = &outline.process_type {
        patterns.insert(Pattern::ProcessType(process_type.clone()));
    }
    if let Some(trigger_type) = &outline.trigger_type {
        patterns.insert(Pattern::TriggerType(trigger_type.clone()));
    }
    if !outline.hardcoded_ids.is_empty() {
        patterns.insert(Pattern::HardcodedRecordId);
    }

    patterns
}

/// Walks each loop body (from its next-value connector back to the loop) looking
/// for create/update/delete elements.
fn has_dml_inside_loop(outline: &FlowOutline) -> bool {
    let by_name: HashMap<&str, usize> = outline
        .elements
        .iter()
        .enumerate()
        .filter_map(|(idx, e)| e.name.as_deref().map(|n| (n, idx)))
        .collect();

    for (loop_idx, element) in outline.elements.iter().enumerate() {
        if element.kind != ElementKind::Loop {
            continue;
        }
        let mut seen: HashSet<usize> = HashSet::from([loop_idx]);
        let mut queue: VecDeque<usize> = element
            .targets(ConnectorKind::NextValue)
            .filter_map(|t| by_name.get(t).copied())
            .collect();
        while let Some(idx) = queue.pop_front() {
            if !seen.insert(idx) {
                continue;
            }
            let body = &outline.elements[idx];
            if body.kind.is_dml() {
                return true;
            }
            queue.extend(
                body.connectors
                    .iter()
                    .filter(|c| c.kind != ConnectorKind::Fault)
                    .filter_map(|c| by_name.get(c.target.as_str()).copied()),
            );
        }
    }
    false
}

fn correlate(outline: Option<&FlowOutline>, error: &RepairError) -> Pattern {
    let Some(outline) = outline else {
        return Pattern::Unparseable;
    };

    match error {
        RepairError::Validation(violation) => {
            if let Some(pattern) = pattern_for_rule(&violation.rule_id) {
                return pattern;
            }
            if let Some(element) = violation
                .element
                .as_deref()
                .and_then(|name| outline.element(name))
            {
                return Pattern::UsesElement(element.kind);
            }
        }
        RepairError::Deployment(record) => {
            let named = outline.elements.iter().find(|e| {
                e.name
                    .as_deref()
                    .is_some_and(|name| record.message.contains(name))
            });
            if let Some(element) = named {
                return Pattern::UsesElement(element.kind);
            }
        }
    }

    Pattern::ExecutionOrder(outline.execution_order())
}

/// Scanner rules that name a structural problem directly.
fn pattern_for_rule(rule_id: &str) -> Option<Pattern> {
    let rule = rule_id.to_ascii_lowercase().replace(['-', '_', ' '], "");
    if rule.contains("hardcodedid") {
        Some(Pattern::HardcodedRecordId)
    } else if rule.contains("dml") && rule.contains("loop") {
        Some(Pattern::DmlInsideLoop)
    } else if rule.contains("missingfaultpath") {
        Some(Pattern::DmlFaultPaths { all_covered: false })
    } else {
        None
    }
}
