//! Reusable structural patterns
//!
//! A [`Pattern`] is an abstract descriptor of generated Flow XML: how elements are
//! ordered and wired, never the literal XML. Success patterns bias the next
//! synthesis toward shapes that deployed and validated cleanly; failure patterns
//! pair a shape with the error it produced.

pub mod extractor;
pub mod outline;

pub use extractor::{PatternDelta, PatternExtractor};
pub use outline::{ElementKind, FlowOutline, OutlineError};

use crate::attempt::RepairError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    /// Element kinds in execution order from the start node.
    ExecutionOrder(Vec<ElementKind>),
    UsesElement(ElementKind),
    /// An assignment wired directly into a loop.
    AssignmentBeforeLoop,
    /// Whether every decision routes its default outcome somewhere.
    DecisionDefaultPath { all_covered: bool },
    /// A create/update/delete element inside a loop body.
    DmlInsideLoop,
    /// Whether every create/update/delete element has a fault connector.
    DmlFaultPaths { all_covered: bool },
    ProcessType(String),
    TriggerType(String),
    HardcodedRecordId,
    /// The XML could not be read as a Flow document.
    Unparseable,
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::ExecutionOrder(kinds) => {
                let names: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
                write!(f, "execution order {}", names.join(" -> "))
            }
            Pattern::UsesElement(kind) => write!(f, "uses {} elements", kind),
            Pattern::AssignmentBeforeLoop => write!(f, "assignment before loop"),
            Pattern::DecisionDefaultPath { all_covered: true } => {
                write!(f, "every decision has a default path")
            }
            Pattern::DecisionDefaultPath { all_covered: false } => {
                write!(f, "decision without a default path")
            }
            Pattern::DmlInsideLoop => write!(f, "record DML inside a loop"),
            Pattern::DmlFaultPaths { all_covered: true } => {
                write!(f, "every record DML has a fault path")
            }
            Pattern::DmlFaultPaths { all_covered: false } => {
                write!(f, "record DML without a fault path")
            }
            Pattern::ProcessType(t) => write!(f, "process type {}", t),
            Pattern::TriggerType(t) => write!(f, "trigger type {}", t),
            Pattern::HardcodedRecordId => write!(f, "hardcoded record id"),
            Pattern::Unparseable => write!(f, "unparseable flow XML"),
        }
    }
}

/// A structural pattern paired with the error it correlated with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailurePattern {
    pub pattern: Pattern,
    pub error: RepairError,
}

impl fmt::Display for FailurePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "avoid {} (caused {})", self.pattern, self.error)
    }
}
