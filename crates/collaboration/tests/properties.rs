//! Convergence properties: OT transform (TP1) and CRDT merge laws
use collaboration::crdt::{Crdt, GCounter, LwwRegister, OrSet, OrSetElement, PnCounter, TextCrdtState};
use collaboration::*;
use chrono::TimeZone;
use proptest::prelude::*;
use serde_json::json;

/// One step of a random edit: 0 retain, 1 insert, 2 delete
type Step = (u8, usize, String);

fn components_for(len: usize, steps: &[Step]) -> Vec<Component> {
    let mut builder = OperationBuilder::new();
    let mut remaining = len;
    for (kind, count, text) in steps {
        match kind % 3 {
            0 if remaining > 0 => {
                let n = 1 + count % remaining;
                builder = builder.retain(n);
                remaining -= n;
            }
            1 => builder = builder.insert(text.as_str()),
            2 if remaining > 0 => {
                let n = 1 + count % remaining;
                builder = builder.delete(n);
                remaining -= n;
            }
            _ => {}
        }
    }
    builder.retain(remaining).build()
}

fn step() -> impl Strategy<Value = Step> {
    (0u8..3, 0usize..8, "[a-z]{1,3}")
}

/// A step plus the formatting it carries: 0 none, 1 clear, 2 bold, 3 plain
type StyledStep = (Step, u8);

fn styled_step() -> impl Strategy<Value = StyledStep> {
    (step(), 0u8..4)
}

fn style(choice: u8) -> Option<Attributes> {
    let value = match choice {
        1 => json!(null),
        2 => json!(true),
        3 => json!(false),
        _ => return None,
    };
    Some(Attributes::from([("bold".to_string(), value)]))
}

fn styled_components_for(len: usize, steps: &[StyledStep]) -> Vec<Component> {
    let mut builder = OperationBuilder::new();
    let mut remaining = len;
    for ((kind, count, text), choice) in steps {
        match kind % 3 {
            0 if remaining > 0 => {
                let n = 1 + count % remaining;
                builder = builder.retain_with(n, style(*choice));
                remaining -= n;
            }
            1 => builder = builder.insert_with(text.as_str(), style(*choice)),
            2 if remaining > 0 => {
                let n = 1 + count % remaining;
                builder = builder.delete(n);
                remaining -= n;
            }
            _ => {}
        }
    }
    builder.retain(remaining).build()
}

fn resolution() -> impl Strategy<Value = ConflictResolution> {
    prop_oneof![
        Just(ConflictResolution::LastWriteWins),
        Just(ConflictResolution::FirstWriteWins),
    ]
}

fn operation(user: &str, components: Vec<Component>) -> Operation {
    Operation::new(
        DocumentId::from("doc"),
        UserId::from(user),
        SessionId::new(),
        0,
        components,
    )
}

proptest! {
    #[test]
    fn test_transform_converges(
        base in "[a-z]{0,12}",
        steps_a in prop::collection::vec(step(), 0..6),
        steps_b in prop::collection::vec(step(), 0..6),
    ) {
        let document = Document::from_text(&base);
        let len = base.chars().count();
        let a = operation("alice", components_for(len, &steps_a));
        let b = operation("bob", components_for(len, &steps_b));

        let a_then_b = document
            .apply(&a)
            .unwrap()
            .apply(&transform(&b, &a).unwrap())
            .unwrap();
        let b_then_a = document
            .apply(&b)
            .unwrap()
            .apply(&transform(&a, &b).unwrap())
            .unwrap();

        prop_assert_eq!(a_then_b.text(), b_then_a.text());
    }

    #[test]
    fn test_transform_converges_with_formatting(
        base in "[a-z]{0,12}",
        steps_a in prop::collection::vec(styled_step(), 0..6),
        steps_b in prop::collection::vec(styled_step(), 0..6),
        skew_a in 0i64..3,
        skew_b in 0i64..3,
        resolution in resolution(),
    ) {
        let epoch = chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let document = Document::from_text(&base);
        let len = base.chars().count();
        let a = operation("alice", styled_components_for(len, &steps_a))
            .with_timestamp(epoch + chrono::Duration::seconds(skew_a));
        let b = operation("bob", styled_components_for(len, &steps_b))
            .with_timestamp(epoch + chrono::Duration::seconds(skew_b));
        let transformer = Transformer::new(resolution);

        let a_then_b = document
            .apply(&a)
            .unwrap()
            .apply(&transformer.transform(&b, &a).unwrap())
            .unwrap();
        let b_then_a = document
            .apply(&b)
            .unwrap()
            .apply(&transformer.transform(&a, &b).unwrap())
            .unwrap();

        prop_assert_eq!(a_then_b, b_then_a);
    }

    #[test]
    fn test_compose_matches_sequential_apply(
        base in "[a-z]{0,12}",
        steps_a in prop::collection::vec(step(), 0..6),
        steps_b in prop::collection::vec(step(), 0..6),
    ) {
        let document = Document::from_text(&base);
        let a = operation("alice", components_for(base.chars().count(), &steps_a));
        let after_a = document.apply(&a).unwrap();
        let b = operation("alice", components_for(after_a.len(), &steps_b));

        let composed = compose(&a, &b).unwrap();
        prop_assert_eq!(
            document.apply(&composed).unwrap().text(),
            after_a.apply(&b).unwrap().text()
        );
    }

    #[test]
    fn test_g_counter_laws(
        a in prop::collection::btree_map("r[0-3]", 0u64..100, 0..4),
        b in prop::collection::btree_map("r[0-3]", 0u64..100, 0..4),
        c in prop::collection::btree_map("r[0-3]", 0u64..100, 0..4),
    ) {
        let counter = |counts: &std::collections::BTreeMap<String, u64>| {
            let mut counter = GCounter::new();
            for (replica, by) in counts {
                counter.increment(&ReplicaId(replica.clone()), *by);
            }
            counter
        };
        let (a, b, c) = (counter(&a), counter(&b), counter(&c));

        prop_assert_eq!(a.merged(&b), b.merged(&a));
        prop_assert_eq!(a.merged(&b).merged(&c), a.merged(&b.merged(&c)));
        prop_assert_eq!(a.merged(&a), a.clone());
        prop_assert!(a.merged(&b).value() >= a.value().max(b.value()));
    }

    #[test]
    fn test_pn_counter_laws(
        ops in prop::collection::vec((0usize..3, "r[0-2]", any::<bool>(), 1u64..10), 0..20),
    ) {
        let mut replicas = vec![PnCounter::new(), PnCounter::new(), PnCounter::new()];
        for (target, replica, up, by) in &ops {
            let replica = ReplicaId(replica.clone());
            if *up {
                replicas[*target].increment(&replica, *by);
            } else {
                replicas[*target].decrement(&replica, *by);
            }
        }
        let (a, b, c) = (&replicas[0], &replicas[1], &replicas[2]);

        prop_assert_eq!(a.merged(b), b.merged(a));
        prop_assert_eq!(a.merged(b).merged(c), a.merged(&b.merged(c)));
        prop_assert_eq!(a.merged(a), a.clone());
    }

    #[test]
    fn test_lww_register_laws(
        writes in prop::collection::vec((0u64..5, "r[0-2]", 0i64..4), 3),
    ) {
        let registers: Vec<LwwRegister> = writes
            .iter()
            .map(|(ts, replica, value)| LwwRegister::new(json!(value), *ts, ReplicaId(replica.clone())))
            .collect();
        let (a, b, c) = (&registers[0], &registers[1], &registers[2]);

        prop_assert_eq!(a.merged(b), b.merged(a));
        prop_assert_eq!(a.merged(b).merged(c), a.merged(&b.merged(c)));
        prop_assert_eq!(a.merged(a), a.clone());
    }

    #[test]
    fn test_or_set_laws(
        a in prop::collection::vec((0u8..6, any::<bool>()), 0..6),
        b in prop::collection::vec((0u8..6, any::<bool>()), 0..6),
        c in prop::collection::vec((0u8..6, any::<bool>()), 0..6),
    ) {
        // Records sharing a uid agree on everything but the tombstone
        let set = |records: &[(u8, bool)]| {
            let mut set = OrSet::new();
            for (uid, removed) in records {
                set.insert(OrSetElement {
                    value: json!(uid % 3),
                    timestamp: *uid as u64,
                    replica_id: ReplicaId::from("r1"),
                    uid: uid.to_string(),
                    removed: *removed,
                });
            }
            set
        };
        let (a, b, c) = (set(&a), set(&b), set(&c));

        prop_assert_eq!(a.merged(&b), b.merged(&a));
        prop_assert_eq!(a.merged(&b).merged(&c), a.merged(&b.merged(&c)));
        prop_assert_eq!(a.merged(&a), a.clone());
    }

    #[test]
    fn test_text_crdt_laws(
        edits in prop::collection::vec((0usize..3, any::<bool>(), 0usize..16, "[a-z]{1,2}"), 0..18),
    ) {
        let mut base = TextCrdtState::new(DocumentId::from("doc"));
        base.insert(&ReplicaId::from("seed"), 0, "abc").unwrap();
        let mut replicas = vec![base.clone(), base.clone(), base];
        let names = [ReplicaId::from("r0"), ReplicaId::from("r1"), ReplicaId::from("r2")];

        for (target, insert, seed, text) in &edits {
            let replica = &mut replicas[*target];
            let len = replica.len();
            if *insert || len == 0 {
                replica.insert(&names[*target], seed % (len + 1), text).unwrap();
            } else {
                replica.delete(&names[*target], seed % len, 1).unwrap();
            }
        }
        let (a, b, c) = (&replicas[0], &replicas[1], &replicas[2]);

        prop_assert_eq!(a.merged(b), b.merged(a));
        prop_assert_eq!(a.merged(b).merged(c), a.merged(&b.merged(c)));
        prop_assert_eq!(a.merged(a), a.clone());
    }
}
