use std::ops::Bound;

use tenebra::{Config, ConstraintKind, Database, Gid, PropertyValue, StorageError, View};

fn open_in_memory() -> Database {
    Database::open(Config::in_memory()).expect("in-memory open cannot fail")
}

fn add_person(db: &Database, name: &str, age: i64) -> Gid {
    let acc = db.access();
    let gid = {
        let vertex = acc.create_vertex();
        let label = acc.label_id("Person");
        vertex.add_label(label).unwrap();
        vertex
            .set_property(acc.property_id("name"), PropertyValue::String(name.into()))
            .unwrap();
        vertex
            .set_property(acc.property_id("age"), PropertyValue::Int(age))
            .unwrap();
        vertex.gid()
    };
    acc.commit().unwrap();
    gid
}

#[test]
fn label_index_serves_existing_and_new_vertices() {
    let db = open_in_memory();
    let before = add_person(&db, "early", 30);
    db.create_label_index("Person").unwrap();
    let after = add_person(&db, "late", 40);

    let acc = db.access();
    let label = acc.label_id("Person");
    let found: Vec<Gid> = acc
        .vertices_by_label(label, View::Old)
        .unwrap()
        .iter()
        .map(|v| v.gid())
        .collect();
    assert_eq!(found, vec![before, after]);
}

#[test]
fn label_index_sees_own_uncommitted_writes_in_new_view() {
    let db = open_in_memory();
    db.create_label_index("Person").unwrap();

    let acc = db.access();
    let label = acc.label_id("Person");
    let gid = {
        let vertex = acc.create_vertex();
        vertex.add_label(label).unwrap();
        vertex.gid()
    };
    let new_view: Vec<Gid> = acc
        .vertices_by_label(label, View::New)
        .unwrap()
        .iter()
        .map(|v| v.gid())
        .collect();
    assert_eq!(new_view, vec![gid]);
    assert!(acc.vertices_by_label(label, View::Old).unwrap().is_empty());
}

#[test]
fn label_index_respects_label_removal() {
    let db = open_in_memory();
    db.create_label_index("Person").unwrap();
    let gid = add_person(&db, "fickle", 20);

    {
        let acc = db.access();
        let label = acc.label_id("Person");
        let vertex = acc.find_vertex(gid, View::Old).unwrap();
        assert!(vertex.remove_label(label).unwrap());
        drop(vertex);
        acc.commit().unwrap();
    }

    let acc = db.access();
    let label = acc.label_id("Person");
    assert!(acc.vertices_by_label(label, View::Old).unwrap().is_empty());
}

#[test]
fn querying_without_an_index_is_an_error() {
    let db = open_in_memory();
    let acc = db.access();
    let label = acc.label_id("Ghost");
    assert!(matches!(
        acc.vertices_by_label(label, View::Old),
        Err(StorageError::InvalidArgument(_))
    ));
}

#[test]
fn label_property_index_range_scan_is_value_ordered() {
    let db = open_in_memory();
    db.create_label_property_index("Person", "age").unwrap();
    for (name, age) in [("a", 3), ("b", 1), ("c", 4), ("d", 2), ("e", 5)] {
        add_person(&db, name, age);
    }

    let acc = db.access();
    let label = acc.label_id("Person");
    let age = acc.property_id("age");

    let ages = |lower: Bound<PropertyValue>, upper: Bound<PropertyValue>| -> Vec<i64> {
        acc.vertices_by_label_property_range(label, age, lower, upper, View::Old)
            .unwrap()
            .iter()
            .map(|v| match v.get_property(age, View::Old).unwrap() {
                PropertyValue::Int(value) => value,
                other => panic!("unexpected value {other:?}"),
            })
            .collect()
    };

    assert_eq!(
        ages(Bound::Unbounded, Bound::Unbounded),
        vec![1, 2, 3, 4, 5]
    );
    assert_eq!(
        ages(
            Bound::Included(PropertyValue::Int(2)),
            Bound::Excluded(PropertyValue::Int(4))
        ),
        vec![2, 3]
    );
    assert_eq!(
        ages(Bound::Excluded(PropertyValue::Int(3)), Bound::Unbounded),
        vec![4, 5]
    );
}

#[test]
fn label_property_index_tracks_property_updates() {
    let db = open_in_memory();
    db.create_label_property_index("Person", "age").unwrap();
    let gid = add_person(&db, "aging", 49);

    {
        let acc = db.access();
        let vertex = acc.find_vertex(gid, View::Old).unwrap();
        vertex
            .set_property(acc.property_id("age"), PropertyValue::Int(50))
            .unwrap();
        drop(vertex);
        acc.commit().unwrap();
    }

    let acc = db.access();
    let label = acc.label_id("Person");
    let age = acc.property_id("age");
    let at_50 = acc
        .vertices_by_label_property_value(label, age, &PropertyValue::Int(50), View::Old)
        .unwrap();
    assert_eq!(at_50.len(), 1);
    assert!(acc
        .vertices_by_label_property_value(label, age, &PropertyValue::Int(49), View::Old)
        .unwrap()
        .is_empty());
}

#[test]
fn existence_constraint_rejects_missing_property_at_commit() {
    let db = open_in_memory();
    db.create_existence_constraint("Person", "name").unwrap();

    let acc = db.access();
    let label = acc.label_id("Person");
    {
        let vertex = acc.create_vertex();
        vertex.add_label(label).unwrap();
    }
    let result = acc.commit();
    assert!(matches!(
        result,
        Err(StorageError::ConstraintViolation {
            kind: ConstraintKind::Existence,
            ..
        })
    ));

    // The violating transaction was aborted.
    let acc = db.access();
    assert_eq!(acc.vertices(View::Old).len(), 0);
}

#[test]
fn existence_constraint_creation_scans_existing_vertices() {
    let db = open_in_memory();
    {
        let acc = db.access();
        let label = acc.label_id("Person");
        let vertex = acc.create_vertex();
        vertex.add_label(label).unwrap();
        drop(vertex);
        acc.commit().unwrap();
    }
    assert!(matches!(
        db.create_existence_constraint("Person", "name"),
        Err(StorageError::ConstraintViolation { .. })
    ));
}

#[test]
fn unique_conflict_detected_at_commit() {
    let db = open_in_memory();
    db.create_unique_constraint("Person", &["name"]).unwrap();
    add_person(&db, "shared", 1);
    let b = {
        let acc = db.access();
        let gid = {
            let vertex = acc.create_vertex();
            let label = acc.label_id("Person");
            vertex.add_label(label).unwrap();
            vertex.gid()
        };
        acc.commit().unwrap();
        gid
    };

    let acc = db.access();
    let key = acc.property_id("name");
    {
        let vertex = acc.find_vertex(b, View::Old).unwrap();
        vertex
            .set_property(key, PropertyValue::String("shared".into()))
            .unwrap();
    }
    let result = acc.commit();
    match result {
        Err(StorageError::ConstraintViolation {
            kind: ConstraintKind::Unique,
            ..
        }) => {}
        other => panic!("expected unique violation, got {other:?}"),
    }

    // The loser's write was rolled back.
    let acc = db.access();
    let vertex = acc.find_vertex(b, View::Old).unwrap();
    assert!(vertex.get_property(key, View::Old).unwrap().is_null());
}

#[test]
fn unique_constraint_allows_distinct_values() {
    let db = open_in_memory();
    db.create_unique_constraint("Person", &["name"]).unwrap();
    add_person(&db, "one", 1);
    add_person(&db, "two", 2);
    let acc = db.access();
    assert_eq!(acc.vertices(View::Old).len(), 2);
}

#[test]
fn unique_constraint_creation_rejects_existing_duplicates() {
    let db = open_in_memory();
    add_person(&db, "twin", 1);
    add_person(&db, "twin", 2);
    assert!(matches!(
        db.create_unique_constraint("Person", &["name"]),
        Err(StorageError::ConstraintViolation { .. })
    ));
}

#[test]
fn unique_constraint_property_count_is_limited() {
    let db = open_in_memory();
    assert!(matches!(
        db.create_unique_constraint("Person", &[]),
        Err(StorageError::InvalidArgument(_))
    ));
    assert!(matches!(
        db.create_unique_constraint("Person", &["a", "b", "c", "d", "e"]),
        Err(StorageError::InvalidArgument(_))
    ));
    assert!(db
        .create_unique_constraint("Person", &["a", "b", "c", "d"])
        .unwrap());
}

#[test]
fn dropped_unique_constraint_no_longer_validates() {
    let db = open_in_memory();
    db.create_unique_constraint("Person", &["name"]).unwrap();
    add_person(&db, "dup", 1);
    assert!(db.drop_unique_constraint("Person", &["name"]).unwrap());
    add_person(&db, "dup", 2);
    let acc = db.access();
    assert_eq!(acc.vertices(View::Old).len(), 2);
}

#[test]
fn multi_property_unique_constraint_compares_tuples() {
    let db = open_in_memory();
    db.create_unique_constraint("Person", &["name", "age"])
        .unwrap();
    add_person(&db, "pair", 1);
    // Same name, different age: no conflict.
    add_person(&db, "pair", 2);

    let acc = db.access();
    let label = acc.label_id("Person");
    let name = acc.property_id("name");
    let age = acc.property_id("age");
    {
        let vertex = acc.create_vertex();
        vertex.add_label(label).unwrap();
        vertex
            .set_property(name, PropertyValue::String("pair".into()))
            .unwrap();
        vertex.set_property(age, PropertyValue::Int(2)).unwrap();
    }
    assert!(matches!(
        acc.commit(),
        Err(StorageError::ConstraintViolation {
            kind: ConstraintKind::Unique,
            ..
        })
    ));
}
