//! Database construction: configuration, snapshot load, WAL replay.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde_derive::{Deserialize, Serialize};

use crate::cdc::{CdcConfig, CdcStream};
use crate::db::{CleanerHandle, Database};
use crate::distance::Distance;
use crate::error::{CResult, Error};
use crate::index::{Index, IndexConfig, IndexKind, LshConfig, LshDedup, VectorIndex};
use crate::optimizer::{Optimizer, OptimizerConfig};
use crate::payload::PayloadIndex;
use crate::storage::snapshot::read_snapshot;
use crate::storage::store::VectorStore;
use crate::storage::wal::{Wal, WalRecord, WalRecordKind};
use crate::ttl::{TtlConfig, TtlManager};
use crate::value::{decode_metadata, encode_metadata, Metadata};

/// Everything configurable about a database. All fields have defaults; the
/// embedding application decides how they get populated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub dimension: usize,
    pub index: IndexKind,

    /// Default metric for index construction. Individual searches may pass
    /// another metric.
    pub metric: Distance,

    pub index_config: IndexConfig,

    /// Enables change data capture when set.
    pub cdc: Option<CdcConfig>,

    pub ttl: TtlConfig,
    pub dedup: LshConfig,
    pub optimizer: OptimizerConfig,

    /// Metadata fields indexed by the payload index from the start.
    pub payload_fields: Vec<String>,

    /// Write-ahead logging for databases opened with a path.
    pub wal_enabled: bool,
}

impl DatabaseConfig {
    pub fn new(dimension: usize, index: IndexKind) -> Self {
        Self {
            dimension,
            index,
            metric: Distance::default(),
            index_config: IndexConfig::default(),
            cdc: None,
            ttl: TtlConfig::default(),
            dedup: LshConfig::default(),
            optimizer: OptimizerConfig::default(),
            payload_fields: Vec::new(),
            wal_enabled: true,
        }
    }
}

/// State under the database readers-writer lock.
pub(crate) struct Core {
    pub(crate) store: VectorStore,
    pub(crate) index: Index,
    pub(crate) payload: PayloadIndex,
    pub(crate) dedup: LshDedup,
    pub(crate) wal: Option<Wal>,
}

/// State shared by every handle clone and the cleaner thread.
pub(crate) struct Shared {
    pub(crate) config: DatabaseConfig,
    pub(crate) path: Option<PathBuf>,
    pub(crate) core: RwLock<Core>,
    pub(crate) cdc: Option<CdcStream>,
    pub(crate) ttl: TtlManager,
    pub(crate) optimizer: Optimizer,
    pub(crate) closed: AtomicBool,
    pub(crate) cleaner: Mutex<Option<CleanerHandle>>,
}

/// The WAL lives next to the snapshot, as `<snapshot>.wal`.
fn wal_path_for(path: &std::path::Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".wal");
    PathBuf::from(os)
}

pub(crate) fn open(path: Option<PathBuf>, config: DatabaseConfig) -> CResult<Database> {
    if config.dimension == 0 {
        return Err(Error::InvalidInput("dimension must be at least 1".into()));
    }

    let (mut store, mut index) = match &path {
        Some(p) if p.exists() => {
            let (store, index) = read_snapshot(p, config.dimension)?;
            if index.kind() != config.index {
                log::warn!(
                    "snapshot index kind {} overrides configured {}",
                    index.kind(),
                    config.index
                );
            }
            (store, index)
        }
        _ => (
            VectorStore::new(config.dimension)?,
            Index::open(config.index, config.dimension, config.metric, &config.index_config)?,
        ),
    };

    let wal = match (&path, config.wal_enabled) {
        (Some(p), true) => {
            let mut wal = Wal::new(wal_path_for(p))?;
            let records = wal.replay()?;
            replay_records(&mut store, &mut index, records)?;
            Some(wal)
        }
        _ => None,
    };

    let mut payload = PayloadIndex::new();
    for field in &config.payload_fields {
        payload.add_field(field);
    }
    payload.rebuild(&store);

    let mut dedup = LshDedup::new(config.dimension, config.dedup.clone())?;
    dedup.rebuild(&store)?;

    let cdc = match &config.cdc {
        Some(cdc_config) => Some(CdcStream::new(cdc_config.clone())?),
        None => None,
    };

    let optimizer = Optimizer::new(config.optimizer.clone());
    let shared = Arc::new(Shared {
        path,
        core: RwLock::new(Core { store, index, payload, dedup, wal }),
        cdc,
        ttl: TtlManager::new(),
        optimizer,
        closed: AtomicBool::new(false),
        cleaner: Mutex::new(None),
        config,
    });
    shared.spawn_cleaner();
    Ok(Database { shared })
}

/// Applies replayed WAL records. Replay is idempotent against the loaded
/// snapshot: inserts apply only at the next row index, and mutations only
/// when the record is newer than the row's last update.
fn replay_records(
    store: &mut VectorStore,
    index: &mut Index,
    records: Vec<WalRecord>,
) -> CResult<()> {
    let replayed = records.len();
    for record in records {
        match record.kind {
            WalRecordKind::Checkpoint => {}
            WalRecordKind::InsertVector | WalRecordKind::InsertVectorWithMeta => {
                let next = store.len() as u64;
                if record.row < next {
                    continue;
                }
                if record.row > next {
                    return Err(Error::Corrupted(format!(
                        "wal insert for row {} but store has {} rows",
                        record.row, next
                    )));
                }
                let (vector, meta) = match record.kind {
                    WalRecordKind::InsertVector => {
                        (decode_vector_payload(&record.payload, store.dim())?, Metadata::new())
                    }
                    _ => decode_vector_meta_payload(&record.payload, store.dim())?,
                };
                let row = store.restore_row(
                    &vector,
                    false,
                    0,
                    record.timestamp,
                    record.timestamp,
                    meta,
                )?;
                index.insert(store, row)?;
            }
            WalRecordKind::Delete => {
                if store.is_deleted(record.row)
                    || record.timestamp <= store.updated_at(record.row)?
                {
                    continue;
                }
                store.replay_delete(record.row, record.timestamp)?;
                index.remove(record.row)?;
            }
            WalRecordKind::UpdateVector => {
                if store.is_deleted(record.row)
                    || record.timestamp <= store.updated_at(record.row)?
                {
                    continue;
                }
                let vector = decode_vector_payload(&record.payload, store.dim())?;
                store.replay_update(record.row, &vector, record.timestamp)?;
                index.update(store, record.row)?;
            }
            WalRecordKind::UpdateMetadata => {
                if store.is_deleted(record.row)
                    || record.timestamp <= store.updated_at(record.row)?
                {
                    continue;
                }
                let meta = decode_meta_payload(&record.payload)?;
                store.replay_set_metadata(record.row, meta, record.timestamp)?;
            }
        }
    }
    if replayed > 0 {
        log::info!("replayed {} wal records, {} rows live", replayed, store.live_count());
    }
    Ok(())
}

pub(crate) fn encode_vector_payload(vector: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(vector.len() * 4);
    for &x in vector {
        // Writing to a Vec cannot fail.
        let _ = buf.write_f32::<LittleEndian>(x);
    }
    buf
}

pub(crate) fn encode_vector_meta_payload(vector: &[f32], meta: &Metadata) -> CResult<Vec<u8>> {
    let mut buf = encode_vector_payload(vector);
    encode_metadata(&mut buf, meta)?;
    Ok(buf)
}

pub(crate) fn encode_meta_payload(meta: &Metadata) -> CResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode_metadata(&mut buf, meta)?;
    Ok(buf)
}

fn decode_vector_payload(payload: &[u8], dim: usize) -> CResult<Vec<f32>> {
    let mut r = payload;
    let vector = read_vector(&mut r, dim)?;
    if !r.is_empty() {
        return Err(Error::Corrupted("trailing bytes after wal vector payload".into()));
    }
    Ok(vector)
}

fn decode_vector_meta_payload(payload: &[u8], dim: usize) -> CResult<(Vec<f32>, Metadata)> {
    let mut r = payload;
    let vector = read_vector(&mut r, dim)?;
    let meta = decode_metadata(&mut r)?;
    Ok((vector, meta))
}

fn decode_meta_payload(payload: &[u8]) -> CResult<Metadata> {
    decode_metadata(&mut &payload[..])
}

fn read_vector(r: &mut &[u8], dim: usize) -> CResult<Vec<f32>> {
    let mut vector = vec![0.0f32; dim];
    for x in vector.iter_mut() {
        *x = r
            .read_f32::<LittleEndian>()
            .map_err(|_| Error::Corrupted("wal vector payload too short".into()))?;
    }
    Ok(vector)
}
