//! Replication scenario tests
//!
//! Each mutation kind runs on a master graph; its batch goes through the
//! wire encoding and is replayed on a replica that started equivalent.
//! Afterwards both graphs must hold the same nodes and edges.

use nexus_effects::effects::{ApplierState, Effect, EffectBatch, EntityKind};
use nexus_effects::schema::SchemaNamespace;
use nexus_effects::testing::{ReplicationHarness, init_tracing};
use nexus_effects::value::{EncodeLimits, Point, PropertyValue};
use nexus_effects::{Error, GraphStore};

fn harness() -> ReplicationHarness {
    init_tracing();
    ReplicationHarness::new()
}

fn count(batch: &EffectBatch, pred: impl Fn(&Effect) -> bool) -> usize {
    batch.iter().filter(|e| pred(e)).count()
}

#[test]
fn test_create_labeled_node() {
    let mut h = harness();
    let (id, batch) = h.commit(|tx| tx.create_node(&["L"], &[])).unwrap();
    let batch = batch.unwrap();

    assert_eq!(
        batch.effects(),
        &[
            Effect::SchemaAdd {
                namespace: SchemaNamespace::Label,
                id: 0,
                name: "L".into()
            },
            Effect::NodeCreate {
                id,
                labels: vec![0],
                attributes: vec![]
            },
        ]
    );

    let replica = h.replica();
    let node = replica.store().node(id).unwrap();
    assert_eq!(node.labels.len(), 1);
    assert!(node.attributes.is_empty());
    assert_eq!(replica.schema().name_of(SchemaNamespace::Label, 0), Some("L"));
    h.assert_consistent();
}

#[test]
fn test_create_node_variants() {
    let mut h = harness();
    h.commit(|tx| tx.create_node(&[], &[])).unwrap();
    h.commit(|tx| tx.create_node(&[], &[("x", PropertyValue::Integer(1))])).unwrap();
    h.commit(|tx| {
        tx.create_node(
            &["A", "B"],
            &[("x", PropertyValue::Integer(2)), ("y", PropertyValue::from("two"))],
        )
    })
    .unwrap();

    assert_eq!(h.replica().store().export().nodes.len(), 3);
    h.assert_consistent();
}

#[test]
#[allow(clippy::approx_constant)]
fn test_typed_attribute_set() {
    let mut h = harness();
    let (node, _) = h.commit(|tx| tx.create_node(&["Thing"], &[])).unwrap();

    let values = vec![
        ("a", PropertyValue::Integer(1)),
        ("b", PropertyValue::from("str")),
        ("c", PropertyValue::Boolean(true)),
        (
            "d",
            PropertyValue::Array(vec![
                PropertyValue::Integer(1),
                PropertyValue::Array(vec![PropertyValue::Integer(2)]),
                PropertyValue::from("3"),
            ]),
        ),
        ("e", PropertyValue::Point(Point::new(51.0, 0.0))),
        ("f", PropertyValue::Double(3.14)),
        ("empty_string", PropertyValue::from("")),
    ];

    let assignments = values.clone();
    let (_, batch) = h
        .commit(move |tx| {
            for (key, value) in assignments {
                tx.set_attribute(EntityKind::Node, node, key, value)?;
            }
            Ok(())
        })
        .unwrap();
    let batch = batch.unwrap();

    let schema = h.master_schema();
    let assigned: Vec<&str> = batch
        .iter()
        .filter_map(|e| match e {
            Effect::AttributeSet { key, .. } => schema.name_of(SchemaNamespace::Attribute, *key),
            _ => None,
        })
        .collect();
    assert_eq!(assigned, vec!["a", "b", "c", "d", "e", "f", "empty_string"]);

    let replica = h.replica();
    let stored = &replica.store().node(node).unwrap().attributes;
    assert_eq!(stored.len(), 7);
    for (key, value) in &values {
        let id = replica.schema().id_of(SchemaNamespace::Attribute, key).unwrap();
        assert_eq!(stored.get(&id), Some(value), "attribute {}", key);
    }
    h.assert_consistent();
}

#[test]
fn test_edge_between_existing_nodes() {
    let mut h = harness();
    let (a, _) = h.commit(|tx| tx.create_node(&["P"], &[])).unwrap();
    let (b, _) = h.commit(|tx| tx.create_node(&["P"], &[])).unwrap();

    let (edge, batch) = h.commit(|tx| tx.create_edge("KNOWS", a, b, &[])).unwrap();
    let batch = batch.unwrap();
    assert_eq!(count(&batch, |e| matches!(e, Effect::EdgeCreate { .. })), 1);
    assert_eq!(count(&batch, |e| matches!(e, Effect::NodeCreate { .. })), 0);
    assert!(batch.iter().any(|e| matches!(
        e,
        Effect::EdgeCreate { src, dst, .. } if *src == a && *dst == b
    )));

    let replica = h.replica();
    let stored = replica.store().edge(edge).unwrap();
    assert_eq!((stored.src, stored.dst), (a, b));
    assert_eq!(
        replica
            .schema()
            .name_of(SchemaNamespace::RelationshipType, stored.relationship_type),
        Some("KNOWS")
    );
    assert_eq!(replica.store().export().edges.len(), 1);
    h.assert_consistent();
}

#[test]
fn test_edge_variants() {
    let mut h = harness();

    // with attributes, between new nodes
    h.commit(|tx| {
        let a = tx.create_node(&[], &[])?;
        let b = tx.create_node(&[], &[])?;
        tx.create_edge("R", a, b, &[("weight", PropertyValue::Double(0.5))])
    })
    .unwrap();

    // one new node, one existing node
    h.commit(|tx| {
        let c = tx.create_node(&["C"], &[])?;
        tx.create_edge("R", c, 0, &[])
    })
    .unwrap();

    // self loop
    h.commit(|tx| tx.create_edge("SELF", 1, 1, &[])).unwrap();

    assert_eq!(h.replica().store().export().edges.len(), 3);
    h.assert_consistent();
}

#[test]
fn test_label_add_and_remove() {
    let mut h = harness();
    let (node, _) = h.commit(|tx| tx.create_node(&["A"], &[])).unwrap();

    let (added, batch) = h.commit(|tx| tx.add_label(node, "B")).unwrap();
    assert!(added);
    assert_eq!(count(&batch.unwrap(), |e| matches!(e, Effect::LabelAdd { .. })), 1);
    h.assert_consistent();

    let (removed, batch) = h.commit(|tx| tx.remove_label(node, "A")).unwrap();
    assert!(removed);
    assert_eq!(count(&batch.unwrap(), |e| matches!(e, Effect::LabelRemove { .. })), 1);
    h.assert_consistent();

    // no-ops produce no batch
    let (added, batch) = h.commit(|tx| tx.add_label(node, "B")).unwrap();
    assert!(!added);
    assert!(batch.is_none());
}

#[test]
fn test_attribute_overwrite_and_tombstone() {
    let mut h = harness();
    let (node, _) = h
        .commit(|tx| tx.create_node(&[], &[("v", PropertyValue::Integer(1))]))
        .unwrap();

    h.commit(|tx| tx.set_attribute(EntityKind::Node, node, "v", PropertyValue::from("two")))
        .unwrap();
    h.assert_consistent();

    let (_, batch) = h
        .commit(|tx| tx.set_attribute(EntityKind::Node, node, "v", PropertyValue::Null))
        .unwrap();
    assert!(batch.unwrap().iter().any(|e| matches!(e, Effect::AttributeSet { value: None, .. })));
    assert!(h.replica().store().node(node).unwrap().attributes.is_empty());
    h.assert_consistent();
}

#[test]
fn test_edge_attributes() {
    let mut h = harness();
    let (edge, _) = h
        .commit(|tx| {
            let a = tx.create_node(&[], &[])?;
            tx.create_edge("R", a, a, &[])
        })
        .unwrap();

    h.commit(|tx| tx.set_attribute(EntityKind::Edge, edge, "since", PropertyValue::Integer(2020)))
        .unwrap();
    h.assert_consistent();

    h.commit(|tx| tx.remove_attribute(EntityKind::Edge, edge, "since")).unwrap();
    assert!(h.replica().store().edge(edge).unwrap().attributes.is_empty());
    h.assert_consistent();
}

#[test]
fn test_deletes() {
    let mut h = harness();
    let (edge, _) = h
        .commit(|tx| {
            let a = tx.create_node(&["A"], &[])?;
            let b = tx.create_node(&["B"], &[])?;
            tx.create_edge("R", a, b, &[])
        })
        .unwrap();

    h.commit(|tx| tx.delete_edge(edge)).unwrap();
    assert!(h.replica().store().edge(edge).is_none());
    h.assert_consistent();

    // detach delete: edges go first
    h.commit(|tx| {
        let c = tx.create_node(&[], &[])?;
        tx.create_edge("R", 0, c, &[])?;
        Ok(())
    })
    .unwrap();
    let (_, batch) = h.commit(|tx| tx.delete_node(0)).unwrap();
    let effects = batch.unwrap().into_effects();
    assert!(matches!(effects.first(), Some(Effect::EdgeDelete { .. })));
    assert!(matches!(effects.last(), Some(Effect::NodeDelete { id: 0 })));

    assert!(h.replica().store().node(0).is_none());
    h.assert_consistent();
}

#[test]
fn test_failed_batch_is_not_partially_applied() {
    let mut h = harness();
    h.commit(|tx| tx.create_node(&["Existing"], &[])).unwrap();

    let batch = EffectBatch::from_effects(vec![
        Effect::SchemaAdd {
            namespace: SchemaNamespace::Label,
            id: 1,
            name: "Ghost".into(),
        },
        Effect::NodeCreate {
            id: 10,
            labels: vec![1],
            attributes: vec![],
        },
        Effect::NodeDelete { id: 999 },
    ]);
    let err = h.replicate(&batch).unwrap_err();
    assert!(matches!(err, Error::Referential(_)));

    let replica = h.replica();
    assert!(matches!(replica.state(), ApplierState::Diverged { .. }));
    assert!(replica.store().node(10).is_none());
    assert_eq!(replica.schema().id_of(SchemaNamespace::Label, "Ghost"), None);

    // refused until resynchronized
    let (_, next) = h.execute(|tx| tx.create_node(&[], &[])).unwrap();
    assert!(h.replicate(&next.unwrap()).is_err());
    assert_eq!(h.replica().stats().batches_refused, 1);

    h.resync().unwrap();
    assert!(h.replica().state().is_synced());
    h.assert_consistent();
}

#[test]
fn test_truncated_payload_diverges() {
    let mut h = harness();
    let (_, batch) = h
        .execute(|tx| tx.create_node(&["L"], &[("k", PropertyValue::from("value"))]))
        .unwrap();
    let payload = batch.unwrap().encode(&EncodeLimits::default()).unwrap();

    let applier = h.replica_mut();
    let err = applier.apply(&payload[..payload.len() - 1]).unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
    assert!(applier.is_diverged());
    assert!(applier.store().export().nodes.is_empty());
    assert!(applier.schema().is_empty());
}

#[test]
fn test_schema_add_idempotence_boundary() {
    let mut h = harness();
    let add = |id: u32, name: &str| {
        EffectBatch::from_effects(vec![Effect::SchemaAdd {
            namespace: SchemaNamespace::Attribute,
            id,
            name: name.into(),
        }])
    };

    h.replica_mut().apply_batch(&add(0, "k")).unwrap();
    // consistent re-announcement is a no-op
    h.replica_mut().apply_batch(&add(0, "k")).unwrap();
    assert_eq!(h.replica().schema().len(SchemaNamespace::Attribute), 1);

    // inconsistent one diverges, never overwrites
    let err = h.replica_mut().apply_batch(&add(0, "other")).unwrap_err();
    assert!(matches!(err, Error::SchemaDivergence(_)));
    assert_eq!(h.replica().schema().name_of(SchemaNamespace::Attribute, 0), Some("k"));
    assert!(h.replica().is_diverged());
}

#[test]
fn test_oversized_value_aborts_transaction_on_master() {
    init_tracing();
    let limits = EncodeLimits {
        max_string_bytes: 4,
        ..Default::default()
    };
    let mut h = ReplicationHarness::with_limits(limits);

    let result = h.commit(|tx| tx.create_node(&["L"], &[("s", PropertyValue::from("too long"))]));
    assert!(matches!(result.unwrap_err(), Error::Encode(_)));
    assert_eq!(h.sequence(), 0);
    assert!(h.master().export().nodes.is_empty());
    assert!(h.master_schema().is_empty());
    h.assert_consistent();
}

#[test]
fn test_mixed_workload_stays_consistent() {
    let mut h = harness();
    for i in 0..20i64 {
        h.commit(|tx| {
            let n = tx.create_node(&["N"], &[("i", PropertyValue::Integer(i))])?;
            if n > 0 {
                tx.create_edge("NEXT", n - 1, n, &[])?;
            }
            if i % 3 == 0 {
                tx.add_label(n, "Third")?;
            }
            Ok(())
        })
        .unwrap();
    }
    h.commit(|tx| tx.delete_node(5)).unwrap();
    h.commit(|tx| tx.set_attribute(EntityKind::Node, 6, "i", PropertyValue::Null)).unwrap();

    assert_eq!(h.replica().stats().batches_applied, 22);
    h.assert_consistent();
}
