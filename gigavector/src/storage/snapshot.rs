//! The binary snapshot: a full database image.
//!
//! Little-endian layout:
//!
//! ```text
//! magic(8) | version(u32) | dimension(u32) | row_count(u64) | rows | index_blob
//! ```
//!
//! Each row is `dim * f32 | tombstone(u8) | version(u64) | created_at(u64) |
//! updated_at(u64) | meta_count(u32) | metadata entries`. The index blob is
//! the index kind tag followed by whatever the index's `save` wrote.
//!
//! Writes go to a temporary sibling file which is then renamed over the
//! target, so a failed write leaves the previous snapshot intact.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CResult, Error};
use crate::index::{Index, IndexKind, VectorIndex};
use crate::storage::store::VectorStore;
use crate::value::{decode_metadata, encode_metadata};

const MAGIC: &[u8; 8] = b"GIGAVECT";
const FORMAT_VERSION: u32 = 1;

/// Writes a snapshot of the store and index to `path`, atomically.
pub fn write_snapshot(path: &Path, store: &VectorStore, index: &Index) -> CResult<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let file = std::fs::File::create(&tmp_path)?;
        let mut w = BufWriter::new(file);
        w.write_all(MAGIC)?;
        w.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        w.write_u32::<LittleEndian>(store.dim() as u32)?;
        w.write_u64::<LittleEndian>(store.len() as u64)?;

        for row in 0..store.len() as u64 {
            for &x in store.raw(row) {
                w.write_f32::<LittleEndian>(x)?;
            }
            w.write_u8(store.is_deleted(row) as u8)?;
            w.write_u64::<LittleEndian>(store.version(row)?)?;
            w.write_u64::<LittleEndian>(store.created_at(row)?)?;
            w.write_u64::<LittleEndian>(store.updated_at(row)?)?;
            encode_metadata(&mut w, store.metadata_raw(row))?;
        }

        w.write_u8(index.kind() as u8)?;
        index.save(&mut w)?;
        w.flush()?;
        w.into_inner().map_err(|e| Error::Io(e.to_string()))?.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    log::info!("wrote snapshot {} ({} rows)", path.display(), store.len());
    Ok(())
}

/// Loads a snapshot. The declared dimension must match the database's.
pub fn read_snapshot(path: &Path, dim: usize) -> CResult<(VectorStore, Index)> {
    let file = std::fs::File::open(path)?;
    let mut r = BufReader::new(file);

    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::Corrupted("snapshot magic mismatch".into()));
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(Error::Corrupted(format!("unsupported snapshot version {}", version)));
    }
    let snap_dim = r.read_u32::<LittleEndian>()? as usize;
    if snap_dim != dim {
        return Err(Error::Corrupted(format!(
            "snapshot dimension {} does not match database dimension {}",
            snap_dim, dim
        )));
    }

    let row_count = r.read_u64::<LittleEndian>()?;
    let mut store = VectorStore::new(dim)?;
    let mut vector = vec![0.0f32; dim];
    for _ in 0..row_count {
        for x in vector.iter_mut() {
            *x = r.read_f32::<LittleEndian>()?;
        }
        let deleted = r.read_u8()? != 0;
        let version = r.read_u64::<LittleEndian>()?;
        let created_at = r.read_u64::<LittleEndian>()?;
        let updated_at = r.read_u64::<LittleEndian>()?;
        let metadata = decode_metadata(&mut r)?;
        store.restore_row(&vector, deleted, version, created_at, updated_at, metadata)?;
    }

    let kind = IndexKind::from_u8(r.read_u8()?)?;
    let index = Index::load(kind, &mut r, dim, &store)?;
    Ok((store, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::Distance;
    use crate::index::IndexConfig;
    use crate::value::{Metadata, Value};

    fn build() -> CResult<(VectorStore, Index)> {
        let mut store = VectorStore::new(3)?;
        let mut index =
            Index::open(IndexKind::Flat, 3, Distance::Euclidean, &IndexConfig::default())?;
        for i in 0..5 {
            let row = store.append(&[i as f32, 0.0, 1.0])?;
            index.insert(&store, row)?;
        }
        store.attach_metadata(0, "color", Value::String("red".into()))?;
        store.set_metadata(
            1,
            Metadata::from([("rank".to_string(), Value::Integer(3))]),
        )?;
        store.delete(4)?;
        index.remove(4)?;
        Ok((store, index))
    }

    #[test]
    fn round_trip() -> CResult<()> {
        let dir = tempdir::TempDir::new("gigavector")?;
        let path = dir.path().join("db.snapshot");
        let (store, index) = build()?;
        write_snapshot(&path, &store, &index)?;

        let (loaded, loaded_index) = read_snapshot(&path, 3)?;
        assert_eq!(loaded.len(), store.len());
        assert_eq!(loaded.live_count(), store.live_count());
        assert_eq!(loaded.get(0)?, store.get(0)?);
        assert_eq!(loaded.metadata(0)?, store.metadata(0)?);
        assert_eq!(loaded.metadata(1)?, store.metadata(1)?);
        assert_eq!(loaded.version(0)?, store.version(0)?);
        assert_eq!(loaded.version(4)?, store.version(4)?);
        assert!(loaded.is_deleted(4));
        assert_eq!(loaded_index.kind(), IndexKind::Flat);
        assert_eq!(loaded_index.len(), 4);
        Ok(())
    }

    #[test]
    fn magic_mismatch_is_corrupted() -> CResult<()> {
        let dir = tempdir::TempDir::new("gigavector")?;
        let path = dir.path().join("db.snapshot");
        std::fs::write(&path, b"NOTMAGIC else entirely")?;
        assert!(matches!(read_snapshot(&path, 3), Err(Error::Corrupted(_))));
        Ok(())
    }

    #[test]
    fn dimension_mismatch_is_corrupted() -> CResult<()> {
        let dir = tempdir::TempDir::new("gigavector")?;
        let path = dir.path().join("db.snapshot");
        let (store, index) = build()?;
        write_snapshot(&path, &store, &index)?;
        assert!(matches!(read_snapshot(&path, 8), Err(Error::Corrupted(_))));
        Ok(())
    }

    #[test]
    fn failed_write_keeps_previous() -> CResult<()> {
        let dir = tempdir::TempDir::new("gigavector")?;
        let path = dir.path().join("db.snapshot");
        let (store, index) = build()?;
        write_snapshot(&path, &store, &index)?;
        let before = std::fs::read(&path)?;

        // A stale tmp file from a crashed write must not disturb the
        // current snapshot.
        std::fs::write(path.with_extension("tmp"), b"partial garbage")?;
        let after = std::fs::read(&path)?;
        assert_eq!(before, after);
        let (loaded, _) = read_snapshot(&path, 3)?;
        assert_eq!(loaded.len(), 5);
        Ok(())
    }
}
