/// Operational transformation: transform, compose and cursor rebasing
///
/// Both operations are walked in lock-step, consuming equal character counts
/// from each side. Inserts never consume base characters, so they are emitted
/// before anything else at the same coordinate; when both sides insert at the
/// same coordinate the operation with the smaller `(user_id, operation_id)` is
/// placed first.
use crate::{
    Attributes, CollaborationError, Component, ConflictResolution, Operation, OperationBuilder,
    Result,
};

/// Transform `a` so it applies after `b`, both derived from the same base
pub fn transform(a: &Operation, b: &Operation) -> Result<Operation> {
    Transformer::default().transform(a, b)
}

/// Collapse `a` followed by `b` into one operation
pub fn compose(a: &Operation, b: &Operation) -> Result<Operation> {
    Transformer::default().compose(a, b)
}

/// Transformation engine configured with an attribute conflict policy
#[derive(Debug, Clone, Copy, Default)]
pub struct Transformer {
    resolution: ConflictResolution,
}

impl Transformer {
    pub fn new(resolution: ConflictResolution) -> Self {
        Self { resolution }
    }

    pub fn transform(&self, a: &Operation, b: &Operation) -> Result<Operation> {
        if a.base_len() != b.base_len() {
            return Err(CollaborationError::VersionMismatch {
                expected: b.base_len(),
                actual: a.base_len(),
            });
        }

        let a_first = a.order_key() < b.order_key();
        let a_wins_attributes = self.attributes_win(a, b);

        let mut out = OperationBuilder::new();
        let mut left = Cursor::new(&a.components);
        let mut right = Cursor::new(&b.components);

        loop {
            match (left.peek(), right.peek()) {
                (None, None) => break,
                (Some(Component::Insert { .. }), Some(Component::Insert { .. })) if !a_first => {
                    out.push(Component::retain(right.remaining()));
                    right.take(usize::MAX);
                }
                (Some(Component::Insert { .. }), _) => out.push(left.take(usize::MAX)),
                (_, Some(Component::Insert { .. })) => {
                    out.push(Component::retain(right.remaining()));
                    right.take(usize::MAX);
                }
                (Some(_), Some(_)) => {
                    let n = left.remaining().min(right.remaining());
                    match (left.take(n), right.take(n)) {
                        (
                            Component::Retain { count, attributes },
                            Component::Retain {
                                attributes: theirs, ..
                            },
                        ) => out.push(Component::Retain {
                            count,
                            attributes: transform_attributes(
                                attributes,
                                theirs.as_ref(),
                                a_wins_attributes,
                            ),
                        }),
                        (Component::Delete { count }, Component::Retain { .. }) => {
                            out.push(Component::delete(count))
                        }
                        // Already deleted by `b`: nothing left for `a` to do here
                        (Component::Retain { .. }, Component::Delete { .. })
                        | (Component::Delete { .. }, Component::Delete { .. }) => {}
                        (left, right) => {
                            return Err(CollaborationError::InvalidOperation(format!(
                                "unexpected components {:?} / {:?}",
                                left, right
                            )))
                        }
                    }
                }
                _ => {
                    return Err(CollaborationError::VersionMismatch {
                        expected: b.base_len(),
                        actual: a.base_len(),
                    })
                }
            }
        }

        Ok(a.rebased(out.build(), b.base_version + 1))
    }

    pub fn compose(&self, a: &Operation, b: &Operation) -> Result<Operation> {
        if a.target_len() != b.base_len() {
            return Err(CollaborationError::VersionMismatch {
                expected: a.target_len(),
                actual: b.base_len(),
            });
        }

        let mut out = OperationBuilder::new();
        let mut first = Cursor::new(&a.components);
        let mut second = Cursor::new(&b.components);

        loop {
            match (first.peek(), second.peek()) {
                (None, None) => break,
                (Some(Component::Delete { .. }), _) => out.push(first.take(usize::MAX)),
                (_, Some(Component::Insert { .. })) => out.push(second.take(usize::MAX)),
                (Some(_), Some(_)) => {
                    let n = first.remaining().min(second.remaining());
                    match (first.take(n), second.take(n)) {
                        (
                            Component::Retain { count, attributes },
                            Component::Retain {
                                attributes: later, ..
                            },
                        ) => out.push(Component::Retain {
                            count,
                            attributes: compose_attributes(attributes, later, true),
                        }),
                        (Component::Retain { count, .. }, Component::Delete { .. }) => {
                            out.push(Component::delete(count))
                        }
                        (
                            Component::Insert { text, attributes },
                            Component::Retain {
                                attributes: later, ..
                            },
                        ) => out.push(Component::Insert {
                            text,
                            attributes: compose_attributes(attributes, later, false),
                        }),
                        // Inserted then deleted: cancels out
                        (Component::Insert { .. }, Component::Delete { .. }) => {}
                        (first, second) => {
                            return Err(CollaborationError::InvalidOperation(format!(
                                "unexpected components {:?} / {:?}",
                                first, second
                            )))
                        }
                    }
                }
                _ => {
                    return Err(CollaborationError::VersionMismatch {
                        expected: a.target_len(),
                        actual: b.base_len(),
                    })
                }
            }
        }

        let mut composed = a.rebased(out.build(), a.base_version);
        composed.timestamp = a.timestamp.max(b.timestamp);
        Ok(composed)
    }

    /// Transform `op` through every operation in `applied`, in order
    pub fn rebase<'a>(
        &self,
        op: &Operation,
        applied: impl IntoIterator<Item = &'a Operation>,
    ) -> Result<Operation> {
        let mut current = op.clone();
        for other in applied {
            current = self.transform(&current, other)?;
        }
        Ok(current)
    }

    /// Whether `a`'s attribute values survive a conflict with `b`
    fn attributes_win(&self, a: &Operation, b: &Operation) -> bool {
        let a_key = (a.timestamp, a.order_key());
        let b_key = (b.timestamp, b.order_key());
        match self.resolution {
            ConflictResolution::LastWriteWins => a_key > b_key,
            ConflictResolution::FirstWriteWins => a_key < b_key,
        }
    }
}

/// Move a caret index through `op`. With `insert_before`, text inserted
/// exactly at the index lands before the caret.
pub fn transform_index(op: &Operation, index: usize, insert_before: bool) -> usize {
    let mut consumed = 0;
    let mut new_index = index;

    for component in &op.components {
        if consumed > index {
            break;
        }
        match component {
            Component::Retain { count, .. } => consumed += count,
            Component::Insert { .. } => {
                if consumed < index || insert_before {
                    new_index += component.len();
                }
            }
            Component::Delete { count } => {
                let removed = (*count).min(index.saturating_sub(consumed));
                new_index -= removed;
                consumed += count;
            }
        }
    }

    new_index
}

fn transform_attributes(
    mine: Option<Attributes>,
    theirs: Option<&Attributes>,
    mine_wins: bool,
) -> Option<Attributes> {
    let mut mine = mine?;
    if let (false, Some(theirs)) = (mine_wins, theirs) {
        mine.retain(|key, _| !theirs.contains_key(key));
    }
    Some(mine).filter(|attrs| !attrs.is_empty())
}

fn compose_attributes(
    first: Option<Attributes>,
    second: Option<Attributes>,
    keep_null: bool,
) -> Option<Attributes> {
    let mut out = first.unwrap_or_default();
    out.extend(second.unwrap_or_default());
    if !keep_null {
        out.retain(|_, value| !value.is_null());
    }
    Some(out).filter(|attrs| !attrs.is_empty())
}

/// Walks a component stream allowing partial consumption of each component
struct Cursor<'a> {
    components: &'a [Component],
    index: usize,
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(components: &'a [Component]) -> Self {
        Self {
            components,
            index: 0,
            offset: 0,
        }
    }

    fn peek(&self) -> Option<&'a Component> {
        self.components.get(self.index)
    }

    fn remaining(&self) -> usize {
        self.peek().map(|c| c.len() - self.offset).unwrap_or(0)
    }

    /// Take up to `n` characters of the current component
    fn take(&mut self, n: usize) -> Component {
        let Some(current) = self.peek() else {
            return Component::retain(0);
        };
        let n = n.min(current.len() - self.offset);

        let piece = match current {
            Component::Insert { text, attributes } => Component::Insert {
                text: text.chars().skip(self.offset).take(n).collect(),
                attributes: attributes.clone(),
            },
            Component::Delete { .. } => Component::delete(n),
            Component::Retain { attributes, .. } => Component::Retain {
                count: n,
                attributes: attributes.clone(),
            },
        };

        self.offset += n;
        if self.offset >= current.len() {
            self.index += 1;
            self.offset = 0;
        }
        piece
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Document, DocumentId, OperationId, SessionId, UserId};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn op(user: &str, components: Vec<Component>) -> Operation {
        Operation::new(
            DocumentId::from("doc"),
            UserId::from(user),
            SessionId::new(),
            0,
            components,
        )
    }

    fn converge(doc: &str, a: &Operation, b: &Operation) -> (String, String) {
        let doc = Document::from_text(doc);
        let left = doc
            .apply(a)
            .unwrap()
            .apply(&transform(b, a).unwrap())
            .unwrap();
        let right = doc
            .apply(b)
            .unwrap()
            .apply(&transform(a, b).unwrap())
            .unwrap();
        (left.text(), right.text())
    }

    #[test]
    fn test_concurrent_inserts_same_position() {
        let a = op("u1", OperationBuilder::new().retain(1).insert("X").retain(1).build());
        let b = op("u2", OperationBuilder::new().retain(1).insert("Y").retain(1).build());

        let (left, right) = converge("ab", &a, &b);
        assert_eq!(left, "aXYb");
        assert_eq!(right, "aXYb");
    }

    #[test]
    fn test_insert_tie_uses_operation_id_for_same_user() {
        let mut a = op("u1", OperationBuilder::new().insert("A").build());
        let mut b = op("u1", OperationBuilder::new().insert("B").build());
        a.operation_id = OperationId(uuid::Uuid::from_u128(2));
        b.operation_id = OperationId(uuid::Uuid::from_u128(1));

        let (left, right) = converge("", &a, &b);
        assert_eq!(left, "BA");
        assert_eq!(right, "BA");
    }

    #[test]
    fn test_overlapping_deletes() {
        let a = op("u1", OperationBuilder::new().retain(1).delete(2).retain(2).build());
        let b = op("u2", OperationBuilder::new().retain(2).delete(2).retain(1).build());

        let (left, right) = converge("hello", &a, &b);
        assert_eq!(left, "ho");
        assert_eq!(right, "ho");

        // Rebased delete only removes what is still there
        assert_eq!(
            transform(&a, &b).unwrap().components,
            vec![Component::retain(1), Component::delete(1), Component::retain(1)]
        );
    }

    #[test]
    fn test_identical_deletes_become_noop() {
        let a = op("u1", OperationBuilder::new().retain(1).delete(3).build());
        let b = op("u2", OperationBuilder::new().retain(1).delete(3).build());

        let rebased = transform(&a, &b).unwrap();
        assert!(rebased.is_noop());
        assert_eq!(rebased.base_len(), 1);
    }

    #[test]
    fn test_insert_inside_deleted_range() {
        let a = op("u1", OperationBuilder::new().retain(2).insert("Z").retain(3).build());
        let b = op("u2", OperationBuilder::new().retain(1).delete(3).retain(1).build());

        let (left, right) = converge("hello", &a, &b);
        assert_eq!(left, "hZo");
        assert_eq!(left, right);
    }

    #[test]
    fn test_attribute_conflict_last_write_wins() {
        let now = Utc::now();
        let red = Attributes::from([("color".to_string(), json!("red"))]);
        let blue = Attributes::from([("color".to_string(), json!("blue"))]);

        let early = op("u1", OperationBuilder::new().retain_with(3, Some(red)).build())
            .with_timestamp(now);
        let late = op("u2", OperationBuilder::new().retain_with(3, Some(blue.clone())).build())
            .with_timestamp(now + Duration::seconds(1));

        let doc = Document::from_text("abc");
        let left = doc
            .apply(&early)
            .unwrap()
            .apply(&transform(&late, &early).unwrap())
            .unwrap();
        let right = doc
            .apply(&late)
            .unwrap()
            .apply(&transform(&early, &late).unwrap())
            .unwrap();

        assert_eq!(left, right);
        assert_eq!(left.runs()[0].attributes, blue);
    }

    #[test]
    fn test_attribute_conflict_first_write_wins() {
        let now = Utc::now();
        let red = Attributes::from([("color".to_string(), json!("red"))]);
        let blue = Attributes::from([("color".to_string(), json!("blue"))]);
        let early = op("u1", OperationBuilder::new().retain_with(2, Some(red.clone())).build())
            .with_timestamp(now);
        let late = op("u2", OperationBuilder::new().retain_with(2, Some(blue)).build())
            .with_timestamp(now + Duration::seconds(1));

        let transformer = Transformer::new(ConflictResolution::FirstWriteWins);
        let doc = Document::from_text("ab")
            .apply(&late)
            .unwrap()
            .apply(&transformer.transform(&early, &late).unwrap())
            .unwrap();
        assert_eq!(doc.runs()[0].attributes, red);
    }

    #[test]
    fn test_transform_rejects_different_bases() {
        let a = op("u1", OperationBuilder::new().retain(3).build());
        let b = op("u2", OperationBuilder::new().retain(4).build());
        assert!(matches!(
            transform(&a, &b),
            Err(CollaborationError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_transform_advances_base_version() {
        let a = op("u1", OperationBuilder::new().insert("x").build());
        let mut b = op("u2", OperationBuilder::new().insert("y").build());
        b.base_version = 4;
        let rebased = transform(&a, &b).unwrap();
        assert_eq!(rebased.base_version, 5);
        assert_eq!(rebased.operation_id, a.operation_id);
    }

    #[test]
    fn test_compose_matches_sequential_apply() {
        let doc = Document::from_text("hello world");
        let a = op("u1", OperationBuilder::new().retain(5).insert(",").retain(6).build());
        let b = op("u1", OperationBuilder::new().delete(1).insert("J").retain(11).build());

        let composed = compose(&a, &b).unwrap();
        let sequential = doc.apply(&a).unwrap().apply(&b).unwrap();
        assert_eq!(doc.apply(&composed).unwrap(), sequential);
        assert_eq!(sequential.text(), "Jello, world");
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let a = op("u1", OperationBuilder::new().retain(2).insert("xyz").build());
        let b = op("u1", OperationBuilder::new().retain(2).delete(3).build());
        let composed = compose(&a, &b).unwrap();
        assert_eq!(composed.components, vec![Component::retain(2)]);
    }

    #[test]
    fn test_compose_attributes() {
        let bold = Attributes::from([("bold".to_string(), json!(true))]);
        let unbold = Attributes::from([("bold".to_string(), json!(null))]);
        let a = op("u1", OperationBuilder::new().insert_with("hi", Some(bold)).build());
        let b = op("u1", OperationBuilder::new().retain_with(2, Some(unbold)).build());

        let composed = compose(&a, &b).unwrap();
        assert_eq!(composed.components, vec![Component::insert("hi")]);
    }

    #[test]
    fn test_rebase_chain() {
        let base = Document::from_text("abc");
        let first = op("u2", OperationBuilder::new().insert("1").retain(3).build());
        let mut second = op("u3", OperationBuilder::new().retain(4).insert("2").build());
        second.base_version = 1;
        let late = op("u1", OperationBuilder::new().retain(1).delete(1).retain(1).build());

        let rebased = Transformer::default()
            .rebase(&late, [&first, &second])
            .unwrap();
        let doc = base
            .apply(&first)
            .unwrap()
            .apply(&second)
            .unwrap()
            .apply(&rebased)
            .unwrap();
        assert_eq!(doc.text(), "1ac2");
        assert_eq!(rebased.base_version, 2);
    }

    #[test]
    fn test_transform_index() {
        let edit = op("u1", OperationBuilder::new().retain(2).insert("xx").delete(2).retain(2).build());

        assert_eq!(transform_index(&edit, 1, false), 1);
        assert_eq!(transform_index(&edit, 2, false), 2);
        assert_eq!(transform_index(&edit, 2, true), 4);
        // Caret inside the deleted range collapses to its start
        assert_eq!(transform_index(&edit, 3, false), 4);
        assert_eq!(transform_index(&edit, 5, false), 5);
    }
}
