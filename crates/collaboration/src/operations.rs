/// Text operations exchanged between collaborators
/// An operation is a stream of retain/insert/delete components that walks the
/// whole document it was derived from
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{CollaborationError, DocumentId, Result, SessionId, UserId};

/// Formatting attributes; a `null` value on a retain clears the attribute
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Unique operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A single step of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Component {
    Insert {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    Delete {
        count: usize,
    },
    Retain {
        count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
}

impl Component {
    pub fn insert(text: impl Into<String>) -> Self {
        Component::Insert {
            text: text.into(),
            attributes: None,
        }
    }

    pub fn delete(count: usize) -> Self {
        Component::Delete { count }
    }

    pub fn retain(count: usize) -> Self {
        Component::Retain {
            count,
            attributes: None,
        }
    }

    /// Length in characters
    pub fn len(&self) -> usize {
        match self {
            Component::Insert { text, .. } => text.chars().count(),
            Component::Delete { count } | Component::Retain { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A retain that changes nothing
    pub fn is_noop(&self) -> bool {
        matches!(self, Component::Retain { attributes: None, .. })
    }

    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            Component::Insert { attributes, .. } | Component::Retain { attributes, .. } => {
                attributes.as_ref()
            }
            Component::Delete { .. } => None,
        }
    }
}

/// Text operation submitted by a collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation ID, kept across rebases
    pub operation_id: OperationId,

    pub document_id: DocumentId,

    /// User who created this operation
    pub user_id: UserId,

    /// Session the client was in when it created the operation. Informational
    /// only: sequencing is keyed by `document_id`, and a client may still
    /// hold operations from before a session was resumed.
    pub session_id: SessionId,

    pub components: Vec<Component>,

    /// Document version this operation applies to
    pub base_version: u64,

    /// Timestamp when operation was created (client time)
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    pub fn new(
        document_id: DocumentId,
        user_id: UserId,
        session_id: SessionId,
        base_version: u64,
        components: Vec<Component>,
    ) -> Self {
        Self {
            operation_id: OperationId::new(),
            document_id,
            user_id,
            session_id,
            components,
            base_version,
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Same operation, rebased onto another version with new components
    pub fn rebased(&self, components: Vec<Component>, base_version: u64) -> Self {
        Self {
            components,
            base_version,
            ..self.clone()
        }
    }

    /// Length of the document this operation expects
    pub fn base_len(&self) -> usize {
        self.components
            .iter()
            .map(|c| match c {
                Component::Insert { .. } => 0,
                other => other.len(),
            })
            .sum()
    }

    /// Length of the document after applying this operation
    pub fn target_len(&self) -> usize {
        self.components
            .iter()
            .map(|c| match c {
                Component::Delete { .. } => 0,
                other => other.len(),
            })
            .sum()
    }

    /// True when applying this operation changes nothing
    pub fn is_noop(&self) -> bool {
        self.components.iter().all(Component::is_noop)
    }

    /// Total order used to break insert/insert ties
    pub fn order_key(&self) -> (&UserId, &OperationId) {
        (&self.user_id, &self.operation_id)
    }

    /// Check structural invariants of the component stream
    pub fn validate(&self) -> Result<()> {
        let mut previous_noop = false;
        for (index, component) in self.components.iter().enumerate() {
            if component.is_empty() {
                return Err(CollaborationError::InvalidOperation(format!(
                    "component {} has zero length",
                    index
                )));
            }
            let noop = component.is_noop();
            if noop && previous_noop {
                return Err(CollaborationError::InvalidOperation(format!(
                    "components {} and {} are both plain retains",
                    index - 1,
                    index
                )));
            }
            previous_noop = noop;
        }
        Ok(())
    }
}

/// Builds normalized component streams
#[derive(Debug, Clone, Default)]
pub struct OperationBuilder {
    components: Vec<Component>,
}

impl OperationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(self, count: usize) -> Self {
        self.retain_with(count, None)
    }

    pub fn retain_with(mut self, count: usize, attributes: Option<Attributes>) -> Self {
        self.push(Component::Retain {
            count,
            attributes: normalize_attributes(attributes),
        });
        self
    }

    pub fn insert(self, text: impl Into<String>) -> Self {
        self.insert_with(text, None)
    }

    pub fn insert_with(mut self, text: impl Into<String>, attributes: Option<Attributes>) -> Self {
        self.push(Component::Insert {
            text: text.into(),
            attributes: normalize_attributes(attributes),
        });
        self
    }

    pub fn delete(mut self, count: usize) -> Self {
        self.push(Component::Delete { count });
        self
    }

    /// Append a component, merging it with its neighbour where possible.
    /// An insert directly after a delete is placed before it.
    pub fn push(&mut self, component: Component) {
        if component.is_empty() {
            return;
        }

        match (self.components.last_mut(), component) {
            (
                Some(Component::Retain { count, attributes }),
                Component::Retain {
                    count: more,
                    attributes: more_attributes,
                },
            ) if *attributes == more_attributes => *count += more,
            (Some(Component::Delete { count }), Component::Delete { count: more }) => {
                *count += more
            }
            (
                Some(Component::Insert { text, attributes }),
                Component::Insert {
                    text: more,
                    attributes: more_attributes,
                },
            ) if *attributes == more_attributes => text.push_str(&more),
            (Some(Component::Delete { .. }), insert @ Component::Insert { .. }) => {
                let delete_at = self.components.len() - 1;
                match (
                    delete_at.checked_sub(1).and_then(|i| self.components.get_mut(i)),
                    insert,
                ) {
                    (
                        Some(Component::Insert { text, attributes }),
                        Component::Insert {
                            text: more,
                            attributes: more_attributes,
                        },
                    ) if *attributes == more_attributes => text.push_str(&more),
                    (_, insert) => self.components.insert(delete_at, insert),
                }
            }
            (_, component) => self.components.push(component),
        }
    }

    pub fn build(self) -> Vec<Component> {
        self.components
    }
}

fn normalize_attributes(attributes: Option<Attributes>) -> Option<Attributes> {
    attributes.filter(|attrs| !attrs.is_empty())
}

/// A run of text sharing one set of attributes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
}

/// Rich-text document content as a sequence of attributed runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    runs: Vec<TextRun>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: &str) -> Self {
        let mut runs = Vec::new();
        push_run(&mut runs, text, Attributes::new());
        Self { runs }
    }

    /// Plain text content
    pub fn text(&self) -> String {
        self.runs.iter().map(|run| run.text.as_str()).collect()
    }

    pub fn runs(&self) -> &[TextRun] {
        &self.runs
    }

    /// Length in characters
    pub fn len(&self) -> usize {
        self.runs.iter().map(|run| run.text.chars().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Apply an operation, producing a new document. Either the whole
    /// operation applies or the document is left untouched.
    pub fn apply(&self, op: &Operation) -> Result<Document> {
        let expected = op.base_len();
        let actual = self.len();
        if expected != actual {
            return Err(CollaborationError::VersionMismatch { expected, actual });
        }

        let mut runs = Vec::with_capacity(self.runs.len() + 1);
        let mut cursor = RunCursor::new(&self.runs);

        for component in &op.components {
            match component {
                Component::Retain { count, attributes } => {
                    let mut remaining = *count;
                    while remaining > 0 {
                        let (piece, existing) = cursor
                            .next_piece(remaining)
                            .ok_or(CollaborationError::VersionMismatch { expected, actual })?;
                        remaining -= piece.chars().count();
                        let attrs = match attributes {
                            Some(patch) => patch_attributes(existing, patch),
                            None => existing.clone(),
                        };
                        push_run(&mut runs, piece, attrs);
                    }
                }
                Component::Insert { text, attributes } => {
                    let attrs = attributes
                        .as_ref()
                        .map(|attrs| patch_attributes(&Attributes::new(), attrs))
                        .unwrap_or_default();
                    push_run(&mut runs, text, attrs);
                }
                Component::Delete { count } => {
                    let mut remaining = *count;
                    while remaining > 0 {
                        let (piece, _) = cursor
                            .next_piece(remaining)
                            .ok_or(CollaborationError::VersionMismatch { expected, actual })?;
                        remaining -= piece.chars().count();
                    }
                }
            }
        }

        Ok(Document { runs })
    }
}

/// Apply `op` to `document`
pub fn apply(document: &Document, op: &Operation) -> Result<Document> {
    document.apply(op)
}

fn patch_attributes(base: &Attributes, patch: &Attributes) -> Attributes {
    let mut out = base.clone();
    for (key, value) in patch {
        if value.is_null() {
            out.remove(key);
        } else {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

fn push_run(runs: &mut Vec<TextRun>, text: &str, attributes: Attributes) {
    if text.is_empty() {
        return;
    }
    match runs.last_mut() {
        Some(last) if last.attributes == attributes => last.text.push_str(text),
        _ => runs.push(TextRun {
            text: text.to_string(),
            attributes,
        }),
    }
}

struct RunCursor<'a> {
    runs: &'a [TextRun],
    run: usize,
    byte_offset: usize,
}

impl<'a> RunCursor<'a> {
    fn new(runs: &'a [TextRun]) -> Self {
        Self {
            runs,
            run: 0,
            byte_offset: 0,
        }
    }

    /// Take up to `max_chars` characters from the current run
    fn next_piece(&mut self, max_chars: usize) -> Option<(&'a str, &'a Attributes)> {
        while self
            .runs
            .get(self.run)
            .is_some_and(|run| self.byte_offset >= run.text.len())
        {
            self.run += 1;
            self.byte_offset = 0;
        }

        let run = self.runs.get(self.run)?;
        let rest = &run.text[self.byte_offset..];
        let end = rest
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        self.byte_offset += end;
        Some((&rest[..end], &run.attributes))
    }
}
