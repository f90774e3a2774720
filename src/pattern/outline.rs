//! Structural outline of a Flow metadata document.
//!
//! Only the shape matters here: which node elements exist, how they are wired
//! together, and a few document-level properties. Labels, layout coordinates and
//! field values are ignored.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutlineError {
    #[error("Flow XML is empty")]
    Empty,

    #[error("Root element is <{0}>, expected <Flow>")]
    UnexpectedRoot(String),

    #[error("Malformed Flow XML: {0}")]
    Malformed(String),
}

/// Node element kinds that take part in flow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Start,
    Assignment,
    Decision,
    Loop,
    RecordCreate,
    RecordUpdate,
    RecordDelete,
    RecordLookup,
    Screen,
    Subflow,
    ActionCall,
    Wait,
    CollectionProcessor,
    CustomError,
    Transform,
}

impl ElementKind {
    fn from_tag(tag: &str) -> Option<Self> {
        let kind = match tag {
            "start" => ElementKind::Start,
            "assignments" => ElementKind::Assignment,
            "decisions" => ElementKind::Decision,
            "loops" => ElementKind::Loop,
            "recordCreates" => ElementKind::RecordCreate,
            "recordUpdates" => ElementKind::RecordUpdate,
            "recordDeletes" => ElementKind::RecordDelete,
            "recordLookups" => ElementKind::RecordLookup,
            "screens" => ElementKind::Screen,
            "subflows" => ElementKind::Subflow,
            "actionCalls" => ElementKind::ActionCall,
            "waits" => ElementKind::Wait,
            "collectionProcessors" => ElementKind::CollectionProcessor,
            "customErrors" => ElementKind::CustomError,
            "transforms" => ElementKind::Transform,
            _ => return None,
        };
        Some(kind)
    }

    /// Record create/update/delete: the elements that issue DML.
    pub fn is_dml(self) -> bool {
        matches!(
            self,
            ElementKind::RecordCreate | ElementKind::RecordUpdate | ElementKind::RecordDelete
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ElementKind::Start => "start",
            ElementKind::Assignment => "assignment",
            ElementKind::Decision => "decision",
            ElementKind::Loop => "loop",
            ElementKind::RecordCreate => "record_create",
            ElementKind::RecordUpdate => "record_update",
            ElementKind::RecordDelete => "record_delete",
            ElementKind::RecordLookup => "record_lookup",
            ElementKind::Screen => "screen",
            ElementKind::Subflow => "subflow",
            ElementKind::ActionCall => "action_call",
            ElementKind::Wait => "wait",
            ElementKind::CollectionProcessor => "collection_processor",
            ElementKind::CustomError => "custom_error",
            ElementKind::Transform => "transform",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorKind {
    Next,
    Default,
    Fault,
    NextValue,
    NoMoreValues,
}

impl ConnectorKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "connector" => Some(ConnectorKind::Next),
            "defaultConnector" => Some(ConnectorKind::Default),
            "faultConnector" => Some(ConnectorKind::Fault),
            "nextValueConnector" => Some(ConnectorKind::NextValue),
            "noMoreValuesConnector" => Some(ConnectorKind::NoMoreValues),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connector {
    pub kind: ConnectorKind,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineElement {
    pub kind: ElementKind,
    /// API name; the start element has none.
    pub name: Option<String>,
    /// Connectors in document order, including those nested in decision rules.
    pub connectors: Vec<Connector>,
}

impl OutlineElement {
    pub fn has_connector(&self, kind: ConnectorKind) -> bool {
        self.connectors.iter().any(|c| c.kind == kind)
    }

    pub fn targets(&self, kind: ConnectorKind) -> impl Iterator<Item = &str> {
        self.connectors
            .iter()
            .filter(move |c| c.kind == kind)
            .map(|c| c.target.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowOutline {
    pub elements: Vec<OutlineElement>,
    pub process_type: Option<String>,
    pub trigger_type: Option<String>,
    /// Target of `<startElementReference>`, used by flows without a `<start>` node.
    pub start_reference: Option<String>,
    pub hardcoded_ids: Vec<String>,
}

impl FlowOutline {
    pub fn parse(xml: &str) -> Result<Self, OutlineError> {
        if xml.trim().is_empty() {
            return Err(OutlineError::Empty);
        }

        let mut reader = Reader::from_str(xml);
        let mut outline = FlowOutline::default();
        let mut stack: Vec<String> = Vec::new();
        let mut current: Option<OutlineElement> = None;
        let mut seen_root = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    open_tag(&tag, &mut stack, &mut current, &mut seen_root)?;
                }
                Ok(Event::Empty(e)) => {
                    let tag = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    open_tag(&tag, &mut stack, &mut current, &mut seen_root)?;
                    close_tag(&mut stack, &mut current, &mut outline);
                }
                Ok(Event::End(_)) => {
                    close_tag(&mut stack, &mut current, &mut outline);
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| OutlineError::Malformed(e.to_string()))?;
                    on_text(text.trim(), &stack, &mut current, &mut outline);
                }
                Ok(Event::CData(c)) => {
                    let text = String::from_utf8_lossy(&c).into_owned();
                    on_text(text.trim(), &stack, &mut current, &mut outline);
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(OutlineError::Malformed(format!(
                        "at byte {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
            }
        }

        if !seen_root {
            return Err(OutlineError::Malformed("no root element".to_string()));
        }
        if !stack.is_empty() {
            return Err(OutlineError::Malformed(format!(
                "unclosed element <{}>",
                stack.join("/")
            )));
        }

        Ok(outline)
    }

    pub fn element(&self, name: &str) -> Option<&OutlineElement> {
        self.elements
            .iter()
            .find(|e| e.name.as_deref() == Some(name))
    }

    pub fn elements_of(&self, kind: ElementKind) -> impl Iterator<Item = &OutlineElement> {
        self.elements.iter().filter(move |e| e.kind == kind)
    }

    pub fn kinds(&self) -> HashSet<ElementKind> {
        self.elements.iter().map(|e| e.kind).collect()
    }

    /// Element kinds in execution order: a depth-first walk from the start node
    /// over non-fault connectors, with consecutive repeats collapsed. Flows with
    /// no reachable start fall back to document order.
    pub fn execution_order(&self) -> Vec<ElementKind> {
        let by_name: HashMap<&str, usize> = self
            .elements
            .iter()
            .enumerate()
            .filter_map(|(idx, e)| e.name.as_deref().map(|n| (n, idx)))
            .collect();

        let mut roots: Vec<usize> = self
            .elements
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind == ElementKind::Start)
            .map(|(idx, _)| idx)
            .collect();
        if roots.is_empty() {
            if let Some(&start) = self
                .start_reference
                .as_deref()
                .and_then(|n| by_name.get(n))
            {
                roots.push(start);
            }
        }

        let visited: Vec<usize> = if roots.is_empty() {
            (0..self.elements.len()).collect()
        } else {
            let mut visited = Vec::new();
            let mut seen: HashSet<usize> = HashSet::new();
            let mut stack: Vec<usize> = roots.into_iter().rev().collect();
            while let Some(idx) = stack.pop() {
                if !seen.insert(idx) {
                    continue;
                }
                visited.push(idx);
                let next: Vec<usize> = self.elements[idx]
                    .connectors
                    .iter()
                    .filter(|c| c.kind != ConnectorKind::Fault)
                    .filter_map(|c| by_name.get(c.target.as_str()).copied())
                    .collect();
                stack.extend(next.into_iter().rev());
            }
            visited
        };

        let mut order: Vec<ElementKind> = Vec::new();
        for idx in visited {
            let kind = self.elements[idx].kind;
            if order.last() != Some(&kind) {
                order.push(kind);
            }
        }
        order
    }
}

fn open_tag(
    tag: &str,
    stack: &mut Vec<String>,
    current: &mut Option<OutlineElement>,
    seen_root: &mut bool,
) -> Result<(), OutlineError> {
    if stack.is_empty() {
        if *seen_root {
            return Err(OutlineError::Malformed(format!(
                "second root element <{}>",
                tag
            )));
        }
        if tag != "Flow" {
            return Err(OutlineError::UnexpectedRoot(tag.to_string()));
        }
        *seen_root = true;
    } else if stack.len() == 1 {
        *current = ElementKind::from_tag(tag).map(|kind| OutlineElement {
            kind,
            name: None,
            connectors: Vec::new(),
        });
    }
    stack.push(tag.to_string());
    Ok(())
}

fn close_tag(
    stack: &mut Vec<String>,
    current: &mut Option<OutlineElement>,
    outline: &mut FlowOutline,
) {
    stack.pop();
    if stack.len() == 1 {
        if let Some(element) = current.take() {
            outline.elements.push(element);
        }
    }
}

fn on_text(
    text: &str,
    stack: &[String],
    current: &mut Option<OutlineElement>,
    outline: &mut FlowOutline,
) {
    if text.is_empty() {
        return;
    }
    let depth = stack.len();
    let tag = stack.last().map(String::as_str).unwrap_or_default();

    if depth == 2 {
        match tag {
            "processType" => outline.process_type = Some(text.to_string()),
            "startElementReference" => outline.start_reference = Some(text.to_string()),
            _ => {}
        }
        return;
    }

    let Some(element) = current.as_mut() else {
        return;
    };

    if depth == 3 && tag == "name" {
        element.name = Some(text.to_string());
    } else if depth == 3 && tag == "triggerType" && element.kind == ElementKind::Start {
        outline.trigger_type = Some(text.to_string());
    } else if tag == "targetReference" && depth >= 4 {
        if let Some(kind) = ConnectorKind::from_tag(&stack[depth - 2]) {
            element.connectors.push(Connector {
                kind,
                target: text.to_string(),
            });
        }
    }

    if looks_like_record_id(text) && !outline.hardcoded_ids.iter().any(|id| id == text) {
        outline.hardcoded_ids.push(text.to_string());
    }
}

/// 15 or 18 character Salesforce record id shape: alphanumeric, key prefix
/// starting with a digit or `a`, and a mix of letters and digits.
fn looks_like_record_id(text: &str) -> bool {
    if text.len() != 15 && text.len() != 18 {
        return false;
    }
    if !text.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return false;
    }
    let first = text.as_bytes()[0];
    if !(first.is_ascii_digit() || first == b'a') {
        return false;
    }
    let digits = text.bytes().filter(u8::is_ascii_digit).count();
    let letters = text.bytes().filter(u8::is_ascii_alphabetic).count();
    digits >= 3 && letters >= 1
}
