use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use tenebra::{
    Config, Database, Gid, IsolationLevel, PropertyValue, ReplicationSink, Result, StorageError,
    StorageMode, View, WalRecord,
};

fn open_in_memory() -> Database {
    Database::open(Config::in_memory()).expect("in-memory open cannot fail")
}

fn create_person(db: &Database, name: &str) -> Gid {
    let acc = db.access();
    let gid = {
        let vertex = acc.create_vertex();
        let label = acc.label_id("Person");
        let key = acc.property_id("name");
        vertex.add_label(label).unwrap();
        vertex
            .set_property(key, PropertyValue::String(name.into()))
            .unwrap();
        vertex.gid()
    };
    acc.commit().unwrap();
    gid
}

#[test]
fn committed_writes_visible_to_later_transactions() {
    let db = open_in_memory();
    let gid = create_person(&db, "ada");

    let acc = db.access();
    let vertex = acc.find_vertex(gid, View::Old).expect("vertex visible");
    let label = acc.label_id("Person");
    let key = acc.property_id("name");
    assert!(vertex.has_label(label, View::Old).unwrap());
    assert_eq!(
        vertex.get_property(key, View::Old).unwrap(),
        PropertyValue::String("ada".into())
    );
}

#[test]
fn snapshot_isolation_hides_later_commits() {
    let db = open_in_memory();
    let reader = db.access();

    let gid = create_person(&db, "berta");

    // The reader predates the commit, so neither view shows the vertex.
    assert!(reader.find_vertex(gid, View::Old).is_none());
    assert!(reader.find_vertex(gid, View::New).is_none());

    let later = db.access();
    assert!(later.find_vertex(gid, View::Old).is_some());
}

#[test]
fn own_writes_only_visible_in_new_view() {
    let db = open_in_memory();
    let acc = db.access();
    let vertex = acc.create_vertex();
    assert!(vertex.is_visible(View::New));
    assert!(!vertex.is_visible(View::Old));
}

#[test]
fn aborted_writes_are_never_visible() {
    let db = open_in_memory();
    let gid = {
        let acc = db.access();
        let gid = acc.create_vertex().gid();
        acc.abort();
        gid
    };
    let acc = db.access();
    assert!(acc.find_vertex(gid, View::Old).is_none());
    assert!(acc.find_vertex(gid, View::New).is_none());
}

#[test]
fn abort_restores_previous_property_value() {
    let db = open_in_memory();
    let gid = create_person(&db, "carol");

    {
        let acc = db.access();
        let key = acc.property_id("name");
        let vertex = acc.find_vertex(gid, View::Old).unwrap();
        vertex
            .set_property(key, PropertyValue::String("changed".into()))
            .unwrap();
        drop(vertex);
        acc.abort();
    }

    let acc = db.access();
    let key = acc.property_id("name");
    let vertex = acc.find_vertex(gid, View::Old).unwrap();
    assert_eq!(
        vertex.get_property(key, View::Old).unwrap(),
        PropertyValue::String("carol".into())
    );
}

#[test]
fn concurrent_writers_conflict_on_the_same_object() {
    let db = open_in_memory();
    let gid = create_person(&db, "dora");

    let t1 = db.access();
    let t2 = db.access();
    let key = t1.property_id("score");

    let v1 = t1.find_vertex(gid, View::Old).unwrap();
    v1.set_property(key, PropertyValue::Int(1)).unwrap();

    let v2 = t2.find_vertex(gid, View::Old).unwrap();
    assert!(matches!(
        v2.set_property(key, PropertyValue::Int(2)),
        Err(StorageError::SerializationError)
    ));
}

#[test]
fn first_committer_wins_under_snapshot_isolation() {
    let db = open_in_memory();
    let gid = create_person(&db, "erik");

    let t2 = db.access();
    {
        let t1 = db.access();
        let key = t1.property_id("score");
        let v1 = t1.find_vertex(gid, View::Old).unwrap();
        v1.set_property(key, PropertyValue::Int(1)).unwrap();
        drop(v1);
        t1.commit().unwrap();
    }

    // The commit landed after t2's start timestamp.
    let key = t2.property_id("score");
    let v2 = t2.find_vertex(gid, View::Old).unwrap();
    assert!(matches!(
        v2.set_property(key, PropertyValue::Int(2)),
        Err(StorageError::SerializationError)
    ));
}

#[test]
fn read_committed_sees_fresh_commits() {
    let db = open_in_memory();
    let gid = create_person(&db, "frida");

    let reader = db.access_with(Some(IsolationLevel::ReadCommitted));
    {
        let writer = db.access();
        let key = writer.property_id("score");
        let vertex = writer.find_vertex(gid, View::Old).unwrap();
        vertex.set_property(key, PropertyValue::Int(9)).unwrap();
        drop(vertex);
        writer.commit().unwrap();
    }

    let key = reader.property_id("score");
    let vertex = reader.find_vertex(gid, View::Old).unwrap();
    assert_eq!(
        vertex.get_property(key, View::Old).unwrap(),
        PropertyValue::Int(9)
    );
}

#[test]
fn concurrent_edge_creation_between_same_vertices() {
    let db = Arc::new(open_in_memory());
    let a = create_person(&db, "left");
    let b = create_person(&db, "right");

    const WRITERS: usize = 2;
    let barrier = Arc::new(Barrier::new(WRITERS));
    let mut handles = Vec::new();
    for _ in 0..WRITERS {
        let db = Arc::clone(&db);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            barrier.wait();
            // Edge creation conflicts on the endpoint chains; the loser
            // retries the whole transaction.
            loop {
                let acc = db.access();
                let outcome = (|| -> Result<()> {
                    let from = acc.find_vertex(a, View::Old).ok_or(StorageError::NonexistentObject)?;
                    let to = acc.find_vertex(b, View::Old).ok_or(StorageError::NonexistentObject)?;
                    let knows = acc.edge_type_id("KNOWS");
                    acc.create_edge(&from, &to, knows)?;
                    Ok(())
                })();
                match outcome {
                    Ok(()) => match acc.commit() {
                        Ok(()) => return Ok(()),
                        Err(error) if error.is_transient() => continue,
                        Err(error) => return Err(error),
                    },
                    Err(error) if error.is_transient() => continue,
                    Err(error) => return Err(error),
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    // Edges are not unique: both commits stand, with distinct gids.
    let acc = db.access();
    let from = acc.find_vertex(a, View::Old).unwrap();
    let to = acc.find_vertex(b, View::Old).unwrap();
    let out = from.out_edges(View::Old).unwrap();
    let inn = to.in_edges(View::Old).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(inn.len(), 2);
    assert_ne!(out[0].gid(), out[1].gid());
}

#[test]
fn delete_vertex_with_edges_is_rejected() {
    let db = open_in_memory();
    let a = create_person(&db, "anchor");
    let b = create_person(&db, "buddy");
    {
        let acc = db.access();
        let from = acc.find_vertex(a, View::Old).unwrap();
        let to = acc.find_vertex(b, View::Old).unwrap();
        let knows = acc.edge_type_id("KNOWS");
        acc.create_edge(&from, &to, knows).unwrap();
        drop((from, to));
        acc.commit().unwrap();
    }

    let acc = db.access();
    let vertex = acc.find_vertex(a, View::Old).unwrap();
    assert!(matches!(
        acc.delete_vertex(&vertex),
        Err(StorageError::VertexHasEdges)
    ));
}

#[test]
fn detach_delete_removes_symmetric_adjacency() {
    let db = open_in_memory();
    let a = create_person(&db, "a");
    let b = create_person(&db, "b");
    let c = create_person(&db, "c");
    {
        let acc = db.access();
        let va = acc.find_vertex(a, View::Old).unwrap();
        let vb = acc.find_vertex(b, View::Old).unwrap();
        let vc = acc.find_vertex(c, View::Old).unwrap();
        let knows = acc.edge_type_id("KNOWS");
        acc.create_edge(&va, &vb, knows).unwrap();
        acc.create_edge(&vc, &va, knows).unwrap();
        drop((va, vb, vc));
        acc.commit().unwrap();
    }

    {
        let acc = db.access();
        let va = acc.find_vertex(a, View::Old).unwrap();
        let (_, deleted_edges) = acc.detach_delete_vertex(&va).unwrap().expect("deletes");
        assert_eq!(deleted_edges.len(), 2);
        drop(deleted_edges);
        drop(va);
        acc.commit().unwrap();
    }

    let acc = db.access();
    assert!(acc.find_vertex(a, View::Old).is_none());
    let vb = acc.find_vertex(b, View::Old).unwrap();
    let vc = acc.find_vertex(c, View::Old).unwrap();
    assert!(vb.in_edges(View::Old).unwrap().is_empty());
    assert!(vc.out_edges(View::Old).unwrap().is_empty());
}

#[test]
fn bulk_detach_delete_handles_vertices_and_edges_together() {
    let db = open_in_memory();
    let a = create_person(&db, "a");
    let b = create_person(&db, "b");
    let c = create_person(&db, "c");
    {
        let acc = db.access();
        let va = acc.find_vertex(a, View::Old).unwrap();
        let vb = acc.find_vertex(b, View::Old).unwrap();
        let vc = acc.find_vertex(c, View::Old).unwrap();
        let knows = acc.edge_type_id("KNOWS");
        acc.create_edge(&va, &vb, knows).unwrap();
        acc.create_edge(&vb, &vc, knows).unwrap();
        drop((va, vb, vc));
        acc.commit().unwrap();
    }

    {
        let acc = db.access();
        let va = acc.find_vertex(a, View::Old).unwrap();
        let vb = acc.find_vertex(b, View::Old).unwrap();
        let edge = vb.out_edges(View::Old).unwrap().remove(0);
        let (vertices, edges) = acc.detach_delete(&[&va], &[&edge]).unwrap();
        // The explicit edge plus the edge incident to `a`.
        assert_eq!(vertices.len(), 1);
        assert_eq!(edges.len(), 2);
        drop((vertices, edges, edge, va, vb));
        acc.commit().unwrap();
    }

    let acc = db.access();
    assert!(acc.find_vertex(a, View::Old).is_none());
    let vc = acc.find_vertex(c, View::Old).unwrap();
    assert!(vc.in_edges(View::Old).unwrap().is_empty());
}

#[test]
fn termination_flag_aborts_next_write() {
    let db = open_in_memory();
    let gid = create_person(&db, "gone");

    let acc = db.access();
    acc.termination_flag().store(true, Ordering::SeqCst);
    let key = acc.property_id("name");
    let vertex = acc.find_vertex(gid, View::Old).unwrap();
    assert!(matches!(
        vertex.set_property(key, PropertyValue::Null),
        Err(StorageError::SerializationError)
    ));
}

#[test]
fn gc_reclaims_deleted_vertices_and_edges() {
    let db = open_in_memory();
    let a = create_person(&db, "short");
    let b = create_person(&db, "lived");
    {
        let acc = db.access();
        let va = acc.find_vertex(a, View::Old).unwrap();
        let vb = acc.find_vertex(b, View::Old).unwrap();
        let knows = acc.edge_type_id("KNOWS");
        acc.create_edge(&va, &vb, knows).unwrap();
        drop((va, vb));
        acc.commit().unwrap();
    }
    {
        let acc = db.access();
        let va = acc.find_vertex(a, View::Old).unwrap();
        acc.detach_delete_vertex(&va).unwrap().expect("deleted");
        drop(va);
        acc.commit().unwrap();
    }

    db.collect_garbage();
    assert_eq!(db.vertex_count(), 1);
    assert_eq!(db.edge_count(), 0);
}

#[test]
fn gc_keeps_versions_needed_by_active_readers() {
    let db = open_in_memory();
    let gid = create_person(&db, "still-here");

    let reader = db.access();
    {
        let acc = db.access();
        let vertex = acc.find_vertex(gid, View::Old).unwrap();
        acc.delete_vertex(&vertex).unwrap().expect("deleted");
        drop(vertex);
        acc.commit().unwrap();
    }

    db.collect_garbage();
    // The reader's snapshot predates the deletion.
    assert!(reader.find_vertex(gid, View::Old).is_some());
    drop(reader);

    db.collect_garbage();
    assert_eq!(db.vertex_count(), 0);
}

#[test]
fn analytical_mode_bypasses_isolation() {
    let db = open_in_memory();
    db.set_storage_mode(StorageMode::InMemoryAnalytical);
    assert!(matches!(
        db.set_isolation_level(IsolationLevel::ReadCommitted),
        Err(StorageError::WrongMode(_))
    ));

    let observer = db.access();
    let gid = {
        let writer = db.access();
        let gid = writer.create_vertex().gid();
        writer.commit().unwrap();
        gid
    };
    // No deltas, no isolation: the older observer sees the write.
    assert!(observer.find_vertex(gid, View::Old).is_some());
    drop(observer);

    {
        let acc = db.access();
        let vertex = acc.find_vertex(gid, View::Old).unwrap();
        acc.delete_vertex(&vertex).unwrap().expect("deleted");
        drop(vertex);
        acc.commit().unwrap();
    }
    db.collect_garbage();
    assert_eq!(db.vertex_count(), 0);
}

#[derive(Default)]
struct RecordingSink {
    deliveries: Mutex<Vec<(u64, usize)>>,
    fail: std::sync::atomic::AtomicBool,
}

impl ReplicationSink for RecordingSink {
    fn deliver(
        &self,
        commit_timestamp: u64,
        records: &[WalRecord],
    ) -> std::result::Result<(), String> {
        self.deliveries
            .lock()
            .unwrap()
            .push((commit_timestamp, records.len()));
        if self.fail.load(Ordering::SeqCst) {
            return Err("sink unavailable".into());
        }
        Ok(())
    }
}

#[test]
fn replication_sink_receives_commits_and_failures_do_not_roll_back() {
    let db = open_in_memory();
    let sink = Arc::new(RecordingSink::default());
    db.set_replication_sink(Arc::clone(&sink) as Arc<dyn ReplicationSink>);

    let first = create_person(&db, "alpha");
    {
        let deliveries = sink.deliveries.lock().unwrap();
        assert_eq!(deliveries.len(), 1);
        // Vertex create, label, property.
        assert_eq!(deliveries[0].1, 3);
    }

    sink.fail.store(true, Ordering::SeqCst);
    let acc = db.access();
    let key = acc.property_id("name");
    let vertex = acc.find_vertex(first, View::Old).unwrap();
    vertex
        .set_property(key, PropertyValue::String("beta".into()))
        .unwrap();
    drop(vertex);
    assert!(matches!(
        acc.commit(),
        Err(StorageError::ReplicationError(_))
    ));

    // The commit stands even though the sink failed.
    let acc = db.access();
    let vertex = acc.find_vertex(first, View::Old).unwrap();
    assert_eq!(
        vertex.get_property(key, View::Old).unwrap(),
        PropertyValue::String("beta".into())
    );
}

#[test]
fn replica_apply_uses_external_ids_and_timestamps() {
    let db = open_in_memory();

    let acc = db.replica_access();
    let gid = Gid::from_u64(4200);
    {
        let vertex = acc.create_vertex_ex(gid).unwrap();
        let label = acc.label_id("Person");
        vertex.add_label(label).unwrap();
    }
    acc.commit_with_timestamp(77).unwrap();

    let acc = db.access();
    assert!(acc.find_vertex(gid, View::Old).is_some());
    // The local counter was raised past the external id.
    let fresh = acc.create_vertex();
    assert!(fresh.gid().as_u64() > 4200);
}
