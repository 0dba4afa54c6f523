use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::tempdir;
use tenebra::durability::wal::{read_records, WalRecord};
use tenebra::{
    Config, ConstraintKind, Database, Gid, PropertyValue, SnapshotWalMode, StorageError, View,
};

fn durable(dir: &Path) -> Config {
    let mut config = Config::durable(dir);
    config.durability.snapshot_interval = Duration::from_secs(3600);
    config
}

fn snapshot_only(dir: &Path) -> Config {
    let mut config = durable(dir);
    config.durability.snapshot_wal_mode = SnapshotWalMode::PeriodicSnapshot;
    config
}

fn write_person(db: &Database, name: &str) -> Gid {
    let acc = db.access();
    let gid = {
        let vertex = acc.create_vertex();
        let label = acc.label_id("Person");
        vertex.add_label(label).unwrap();
        vertex
            .set_property(acc.property_id("name"), PropertyValue::String(name.into()))
            .unwrap();
        vertex.gid()
    };
    acc.commit().unwrap();
    gid
}

fn person_names(db: &Database) -> Vec<String> {
    let acc = db.access();
    let key = acc.property_id("name");
    let mut names: Vec<String> = acc
        .vertices(View::Old)
        .iter()
        .map(|v| match v.get_property(key, View::Old).unwrap() {
            PropertyValue::String(name) => name,
            other => panic!("unexpected name value {other:?}"),
        })
        .collect();
    names.sort();
    names
}

fn wal_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir.join("wal"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "wal"))
        .collect();
    files.sort();
    files
}

fn snapshot_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir.join("snapshots"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "snapshot"))
        .collect();
    files.sort();
    files
}

fn flip_byte(path: &Path, offset: usize) {
    let mut data = fs::read(path).unwrap();
    data[offset] ^= 0xFF;
    fs::write(path, data).unwrap();
}

#[test]
fn wal_only_round_trip() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(durable(dir.path())).unwrap();
        for name in ["a", "b", "c"] {
            write_person(&db, name);
        }
    }
    let db = Database::open(durable(dir.path())).unwrap();
    assert_eq!(db.vertex_count(), 3);
    assert_eq!(person_names(&db), vec!["a", "b", "c"]);
}

#[test]
fn snapshot_only_round_trip() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(snapshot_only(dir.path())).unwrap();
        write_person(&db, "solo");
        db.create_snapshot().unwrap();
    }
    let db = Database::open(snapshot_only(dir.path())).unwrap();
    assert_eq!(person_names(&db), vec!["solo"]);
}

#[test]
fn snapshot_plus_wal_tail_round_trip() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(durable(dir.path())).unwrap();
        write_person(&db, "in-snapshot");
        db.create_snapshot().unwrap();
        write_person(&db, "in-wal");
    }
    let db = Database::open(durable(dir.path())).unwrap();
    assert_eq!(person_names(&db), vec!["in-snapshot", "in-wal"]);
}

#[test]
fn wal_records_follow_commit_order() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(durable(dir.path())).unwrap();
        let a1 = db.access();
        let a2 = db.access();
        let a3 = db.access();
        for (acc, name) in [(&a1, "t1"), (&a2, "t2"), (&a3, "t3")] {
            let vertex = acc.create_vertex();
            vertex
                .set_property(acc.property_id("name"), PropertyValue::String(name.into()))
                .unwrap();
        }
        a3.commit().unwrap();
        a1.commit().unwrap();
        a2.commit().unwrap();
    }

    let files = wal_files(dir.path());
    assert_eq!(files.len(), 1);
    let (entries, clean) = read_records(&files[0]).unwrap();
    assert!(clean);
    assert_eq!(entries.len(), 9);

    // Three groups of create, set-property, end; timestamps non-decreasing
    // in file order, strictly increasing between groups.
    let mut group_timestamps = Vec::new();
    for group in entries.chunks(3) {
        assert!(matches!(group[0].record, WalRecord::VertexCreate { .. }));
        assert!(matches!(
            group[1].record,
            WalRecord::VertexSetProperty { .. }
        ));
        assert_eq!(group[2].record, WalRecord::TransactionEnd);
        assert_eq!(group[0].commit_timestamp, group[2].commit_timestamp);
        group_timestamps.push(group[0].commit_timestamp);
    }
    assert!(group_timestamps.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn truncated_wal_tail_discards_incomplete_transaction() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(durable(dir.path())).unwrap();
        for name in ["one", "two", "three"] {
            write_person(&db, name);
        }
    }
    let files = wal_files(dir.path());
    assert_eq!(files.len(), 1);
    let data = fs::read(&files[0]).unwrap();
    // Cut the footer and tear into the last transaction's frames.
    fs::write(&files[0], &data[..data.len() - 60]).unwrap();

    let db = Database::open(durable(dir.path())).unwrap();
    assert_eq!(person_names(&db), vec!["one", "two"]);
}

#[test]
fn corrupt_wal_segment_in_recovery_range_is_fatal() {
    let dir = tempdir().unwrap();
    {
        let mut config = durable(dir.path());
        // Force rotation so the corrupted file is not the last one.
        config.durability.wal_file_size_kibibytes = 1;
        let db = Database::open(config).unwrap();
        for i in 0..30 {
            write_person(&db, &format!("p{i}"));
        }
    }
    let files = wal_files(dir.path());
    assert!(files.len() >= 2, "rotation produced {} files", files.len());
    flip_byte(&files[0], 200);

    assert!(matches!(
        Database::open(durable(dir.path())),
        Err(StorageError::Corruption(_))
    ));
}

#[test]
fn recovery_falls_back_to_oldest_intact_snapshot() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(snapshot_only(dir.path())).unwrap();
        write_person(&db, "base1");
        write_person(&db, "base2");
        db.create_snapshot().unwrap();
        write_person(&db, "newer1");
        db.create_snapshot().unwrap();
        write_person(&db, "newer2");
        db.create_snapshot().unwrap();
    }
    let files = snapshot_files(dir.path());
    assert_eq!(files.len(), 3);
    // Corrupt the two newest snapshots; file names sort oldest-first.
    for path in &files[1..] {
        let len = fs::metadata(path).unwrap().len() as usize;
        flip_byte(path, len / 2);
    }

    let db = Database::open(snapshot_only(dir.path())).unwrap();
    assert_eq!(person_names(&db), vec!["base1", "base2"]);
}

#[test]
fn corrupting_every_snapshot_of_the_lineage_is_fatal() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(snapshot_only(dir.path())).unwrap();
        write_person(&db, "doomed");
        db.create_snapshot().unwrap();
        db.create_snapshot().unwrap();
    }
    for path in snapshot_files(dir.path()) {
        let len = fs::metadata(&path).unwrap().len() as usize;
        flip_byte(&path, len / 2);
    }
    assert!(matches!(
        Database::open(snapshot_only(dir.path())),
        Err(StorageError::Corruption(_))
    ));
}

#[test]
fn snapshot_retention_keeps_newest_of_current_lineage() {
    let foreign_dir = tempdir().unwrap();
    let foreign_file = {
        let db = Database::open(snapshot_only(foreign_dir.path())).unwrap();
        write_person(&db, "foreign");
        db.create_snapshot().unwrap();
        snapshot_files(foreign_dir.path()).remove(0)
    };

    let dir = tempdir().unwrap();
    let mut config = snapshot_only(dir.path());
    config.durability.snapshot_retention_count = 2;
    let planted = dir.path().join("snapshots/00000000000000000_9999.snapshot");
    {
        let db = Database::open(config).unwrap();
        // Plant a snapshot from an unrelated lineage; retention must not
        // touch it.
        fs::copy(&foreign_file, &planted).unwrap();
        for i in 0..4 {
            write_person(&db, &format!("p{i}"));
            db.create_snapshot().unwrap();
        }
    }

    let files = snapshot_files(dir.path());
    assert!(planted.exists());
    assert_eq!(files.len(), 3, "two retained plus the foreign snapshot");
}

#[test]
fn second_instance_cannot_take_the_directory() {
    let dir = tempdir().unwrap();
    let _db = Database::open(durable(dir.path())).unwrap();
    assert!(Database::open(durable(dir.path())).is_err());
}

#[test]
fn existing_files_move_to_backup_without_recovery() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(durable(dir.path())).unwrap();
        write_person(&db, "displaced");
    }
    let mut config = durable(dir.path());
    config.durability.recover_on_startup = false;
    let db = Database::open(config).unwrap();
    assert_eq!(db.vertex_count(), 0);
    assert!(dir.path().join(".backup").exists());
}

#[test]
fn thin_edges_reject_properties_and_survive_restart() {
    let dir = tempdir().unwrap();
    let mut config = durable(dir.path());
    config.items.properties_on_edges = false;
    let (a, b) = {
        let db = Database::open(config.clone()).unwrap();
        let a = write_person(&db, "from");
        let b = write_person(&db, "to");
        let acc = db.access();
        {
            let va = acc.find_vertex(a, View::Old).unwrap();
            let vb = acc.find_vertex(b, View::Old).unwrap();
            let knows = acc.edge_type_id("KNOWS");
            let edge = acc.create_edge(&va, &vb, knows).unwrap();
            assert!(matches!(
                edge.set_property(acc.property_id("weight"), PropertyValue::Int(1)),
                Err(StorageError::PropertiesDisabled)
            ));
        }
        acc.commit().unwrap();
        (a, b)
    };

    let db = Database::open(config).unwrap();
    let acc = db.access();
    let va = acc.find_vertex(a, View::Old).unwrap();
    let out = va.out_edges(View::Old).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].to_vertex().gid(), b);
}

#[test]
fn edge_retargeting_round_trips_through_the_wal() {
    let dir = tempdir().unwrap();
    let (a, b, c, weight);
    {
        let db = Database::open(durable(dir.path())).unwrap();
        a = write_person(&db, "a");
        b = write_person(&db, "b");
        c = write_person(&db, "c");
        {
            let acc = db.access();
            let va = acc.find_vertex(a, View::Old).unwrap();
            let vb = acc.find_vertex(b, View::Old).unwrap();
            let knows = acc.edge_type_id("KNOWS");
            let edge = acc.create_edge(&va, &vb, knows).unwrap();
            edge.set_property(acc.property_id("weight"), PropertyValue::Int(7))
                .unwrap();
            drop((edge, va, vb));
            acc.commit().unwrap();
        }
        {
            let acc = db.access();
            let va = acc.find_vertex(a, View::Old).unwrap();
            let vc = acc.find_vertex(c, View::Old).unwrap();
            let edge = va.out_edges(View::Old).unwrap().remove(0);
            acc.edge_set_to(&edge, &vc).unwrap();
            drop((edge, va, vc));
            acc.commit().unwrap();
        }
        weight = db.access().property_id("weight");

        // In-memory shape before restart.
        let acc = db.access();
        let va = acc.find_vertex(a, View::Old).unwrap();
        let vb = acc.find_vertex(b, View::Old).unwrap();
        let vc = acc.find_vertex(c, View::Old).unwrap();
        let out = va.out_edges(View::Old).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to_vertex().gid(), c);
        assert!(vb.in_edges(View::Old).unwrap().is_empty());
        assert_eq!(vc.in_edges(View::Old).unwrap().len(), 1);
    }

    let db = Database::open(durable(dir.path())).unwrap();
    let acc = db.access();
    let va = acc.find_vertex(a, View::Old).unwrap();
    let vb = acc.find_vertex(b, View::Old).unwrap();
    let vc = acc.find_vertex(c, View::Old).unwrap();
    let out = va.out_edges(View::Old).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].to_vertex().gid(), c);
    assert!(vb.in_edges(View::Old).unwrap().is_empty());
    assert_eq!(vc.in_edges(View::Old).unwrap().len(), 1);
    // The re-created registration kept the edge's properties.
    assert_eq!(
        out[0].get_property(weight, View::Old).unwrap(),
        PropertyValue::Int(7)
    );
}

#[test]
fn recovery_is_idempotent() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(durable(dir.path())).unwrap();
        write_person(&db, "stable");
        db.create_snapshot().unwrap();
        write_person(&db, "tail");
    }
    {
        let db = Database::open(durable(dir.path())).unwrap();
        assert_eq!(person_names(&db), vec!["stable", "tail"]);
    }
    let db = Database::open(durable(dir.path())).unwrap();
    assert_eq!(person_names(&db), vec!["stable", "tail"]);
    assert_eq!(db.vertex_count(), 2);
}

#[test]
fn schema_operations_survive_restart() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(durable(dir.path())).unwrap();
        db.create_label_index("Person").unwrap();
        db.create_unique_constraint("Person", &["name"]).unwrap();
        write_person(&db, "unique-name");
    }

    let db = Database::open(durable(dir.path())).unwrap();
    {
        let acc = db.access();
        let label = acc.label_id("Person");
        let found = acc.vertices_by_label(label, View::Old).unwrap();
        assert_eq!(found.len(), 1);
    }

    // The recovered unique constraint still validates commits.
    let acc = db.access();
    {
        let vertex = acc.create_vertex();
        let label = acc.label_id("Person");
        vertex.add_label(label).unwrap();
        vertex
            .set_property(
                acc.property_id("name"),
                PropertyValue::String("unique-name".into()),
            )
            .unwrap();
    }
    assert!(matches!(
        acc.commit(),
        Err(StorageError::ConstraintViolation {
            kind: ConstraintKind::Unique,
            ..
        })
    ));
}
