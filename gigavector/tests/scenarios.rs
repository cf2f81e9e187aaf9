//! End-to-end scenarios across the public surface.

use gigavector::cdc::{CdcConfig, CdcCursor, CdcStream, ChangeKind};
use gigavector::conditional::{Condition, ConditionalManager};
use gigavector::db::{Database, DatabaseConfig};
use gigavector::distance::Distance;
use gigavector::error::{CResult, Error};
use gigavector::index::IndexKind;
use gigavector::mvcc::MvccStore;
use gigavector::value::{Metadata, Value};

fn color(name: &str) -> Metadata {
    Metadata::from([("color".to_string(), Value::String(name.into()))])
}

/// Round-trip with metadata: filtered search returns only matching rows,
/// ordered by distance.
#[test]
fn filtered_search_round_trip() -> CResult<()> {
    let db = Database::open_in_memory(4, IndexKind::Flat)?;
    db.add_vector_with_metadata(&[1.0, 0.0, 0.0, 0.0], color("red"))?;
    db.add_vector_with_metadata(&[0.0, 1.0, 0.0, 0.0], color("blue"))?;
    db.add_vector_with_metadata(&[0.0, 0.0, 1.0, 0.0], color("red"))?;

    let hits =
        db.search_filtered(&[1.0, 0.0, 0.0, 0.0], 2, Distance::Euclidean, r#"color == "red""#)?;
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].row, 0);
    assert_eq!(hits[0].distance, 0.0);
    assert_eq!(hits[1].row, 2);
    assert!((hits[1].distance - 2.0f32.sqrt()).abs() < 1e-6);
    Ok(())
}

/// WAL replay: a write survives a close/reopen cycle without any snapshot.
#[test]
fn wal_replay_after_reopen() -> CResult<()> {
    let dir = tempdir::TempDir::new("gigavector")?;
    let path = dir.path().join("db.snapshot");

    let db = Database::open(path.clone(), 2, IndexKind::Flat)?;
    db.add_vector(&[0.1, 0.2])?;
    db.save()?;
    db.close()?;
    drop(db);

    let db = Database::open(path, 2, IndexKind::Flat)?;
    let hits = db.search(&[0.1, 0.2], 1, Distance::Euclidean)?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].row, 0);
    assert_eq!(hits[0].distance, 0.0);
    db.close()?;
    Ok(())
}

/// MVCC snapshot isolation across three transactions.
#[test]
fn mvcc_snapshots() -> CResult<()> {
    let mvcc = MvccStore::new(4)?;

    let t1 = mvcc.begin();
    t1.insert(&[1.0, 1.0, 1.0, 1.0])?;

    let t2 = mvcc.begin();
    assert_eq!(t2.count()?, 0);

    t1.commit()?;
    assert_eq!(t2.count()?, 0);

    let t3 = mvcc.begin();
    assert_eq!(t3.count()?, 1);

    t2.commit()?;
    t3.commit()?;
    Ok(())
}

/// Conditional update with an expected version: succeeds once, then fails.
#[test]
fn cas_with_version() -> CResult<()> {
    let db = Database::open_in_memory(4, IndexKind::Flat)?;
    let row = db.add_vector(&[1.0, 2.0, 3.0, 4.0])?;
    assert_eq!(db.get_version(row)?, 0);

    let cond = ConditionalManager::new(&db);
    let new_version =
        cond.update_vector(row, &[4.0, 3.0, 2.0, 1.0], &[Condition::VersionEquals(0)])?;
    assert_eq!(new_version, 1);

    assert!(matches!(
        cond.update_vector(row, &[0.0; 4], &[Condition::VersionEquals(0)]),
        Err(Error::ConditionFailed(_))
    ));
    assert_eq!(db.get_vector(row)?, vec![4.0, 3.0, 2.0, 1.0]);
    Ok(())
}

/// CDC polling: four published events come back in order and drain the
/// pending count.
#[test]
fn cdc_polling() -> CResult<()> {
    let cdc = CdcStream::new(CdcConfig { ring_buffer_size: 8, ..CdcConfig::default() })?;
    cdc.publish(ChangeKind::Insert, 0, None, None);
    cdc.publish(ChangeKind::Insert, 1, None, None);
    cdc.publish(ChangeKind::Delete, 0, None, None);
    cdc.publish(ChangeKind::UpdateVector, 1, None, None);

    let mut cursor = CdcCursor::from_seq(1);
    let events = cdc.poll(&mut cursor, 10);
    assert_eq!(events.len(), 4);
    assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert_eq!(cdc.pending(&cursor), 0);
    Ok(())
}

/// Deduplication probe: a vector within epsilon of a stored row reports
/// that row as its duplicate.
#[test]
fn dedup_probe() -> CResult<()> {
    let db = Database::open_in_memory(16, IndexKind::Flat)?;
    for i in 0..100u32 {
        let mut v = vec![0.0f32; 16];
        for (j, x) in v.iter_mut().enumerate() {
            *x = ((i as usize * 37 + j * 11) % 101) as f32 / 101.0 + i as f32;
        }
        db.add_vector(&v)?;
    }
    let mut probe = db.get_vector(42)?;
    probe[3] += 1e-5;
    assert_eq!(db.find_duplicate(&probe)?, Some(42));
    Ok(())
}

/// Concurrent searches run against a writer without tearing: every hit
/// returned was live at some point and tombstoned rows never surface.
#[test]
fn concurrent_search_and_write() -> CResult<()> {
    use std::sync::Arc;

    let db = Arc::new(Database::open_in_memory(4, IndexKind::Flat)?);
    for i in 0..64 {
        db.add_vector(&[i as f32, 0.0, 0.0, 0.0])?;
    }
    // Tombstone the odd rows from a writer thread while readers search.
    let writer = {
        let db = db.clone();
        std::thread::spawn(move || {
            for row in (1..64).step_by(2) {
                db.delete(row).expect("delete");
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = db.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let hits = db.search(&[32.0, 0.0, 0.0, 0.0], 8, Distance::Euclidean)
                        .expect("search");
                    assert!(hits.len() <= 8);
                }
            })
        })
        .collect();
    writer.join().expect("writer");
    for reader in readers {
        reader.join().expect("reader");
    }

    let hits = db.search(&[0.0; 4], 64, Distance::Euclidean)?;
    assert_eq!(hits.len(), 32);
    assert!(hits.iter().all(|n| n.row % 2 == 0));
    Ok(())
}

/// The CDC sequence numbers of a database's mutations reflect their
/// real-time order even under concurrent writers.
#[test]
fn cdc_orders_concurrent_writes() -> CResult<()> {
    use std::sync::Arc;

    let mut config = DatabaseConfig::new(2, IndexKind::Flat);
    config.cdc = Some(CdcConfig { ring_buffer_size: 1024, ..CdcConfig::default() });
    let db = Arc::new(Database::open_with_config(None, config)?);

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let db = db.clone();
            std::thread::spawn(move || {
                for i in 0..25 {
                    db.add_vector(&[t as f32, i as f32]).expect("add");
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer");
    }

    let mut cursor = CdcCursor::start();
    let events = db.poll(&mut cursor, 1024)?;
    assert_eq!(events.len(), 100);
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=100).collect::<Vec<u64>>());
    Ok(())
}
