//! The write-ahead log.
//!
//! An append-only file of mutation records, held under an exclusive file
//! lock while open. Each record is encoded little-endian as:
//!
//! - Record length as u32, covering kind, timestamp, row, and payload.
//! - Kind as u8.
//! - Timestamp (microseconds) as u64.
//! - Row index as u64.
//! - Payload, `length - 17` bytes, kind-specific.
//! - CRC32 of the payload as u32.
//!
//! On open the database replays the log from position 0. A record with a
//! checksum mismatch or a truncated tail ends the replay: trailing garbage
//! is discarded by truncating the file, the open itself succeeds.

use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::storage::now_micros;

/// Header bytes covered by the length field: kind + timestamp + row.
const HEADER_LEN: u32 = 1 + 8 + 8;

/// Record kinds. Values are part of the on-disk format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordKind {
    InsertVector = 1,
    InsertVectorWithMeta = 2,
    Delete = 3,
    UpdateVector = 4,
    UpdateMetadata = 5,
    Checkpoint = 6,
}

impl WalRecordKind {
    fn from_u8(tag: u8) -> CResult<Self> {
        Ok(match tag {
            1 => WalRecordKind::InsertVector,
            2 => WalRecordKind::InsertVectorWithMeta,
            3 => WalRecordKind::Delete,
            4 => WalRecordKind::UpdateVector,
            5 => WalRecordKind::UpdateMetadata,
            6 => WalRecordKind::Checkpoint,
            other => return Err(Error::Corrupted(format!("unknown wal record kind {}", other))),
        })
    }
}

/// One decoded log record.
#[derive(Clone, Debug, PartialEq)]
pub struct WalRecord {
    pub kind: WalRecordKind,
    pub timestamp: u64,
    pub row: u64,
    pub payload: Vec<u8>,
}

pub struct Wal {
    pub(crate) path: PathBuf,
    file: std::fs::File,
}

impl Wal {
    /// Opens or creates the log file, taking an exclusive lock until the
    /// value is dropped. Errors if the lock is already held.
    pub fn new(path: PathBuf) -> CResult<Self> {
        Self::new_with_lock(path, true)
    }

    pub fn new_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|err| Error::Io(format!("{}: {:?}", err, dir.to_str())))?;
        }
        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        if try_lock {
            file.try_lock_exclusive()?;
        }
        Ok(Self { path, file })
    }

    /// Appends a record, flushing it to the file. An append failure is fatal
    /// for the write that produced it.
    pub fn append(&mut self, kind: WalRecordKind, row: u64, payload: &[u8]) -> CResult<u64> {
        let timestamp = now_micros();
        self.append_record(&WalRecord { kind, timestamp, row, payload: payload.to_vec() })?;
        Ok(timestamp)
    }

    pub fn append_record(&mut self, record: &WalRecord) -> CResult<()> {
        let length = HEADER_LEN + record.payload.len() as u32;
        let crc = crc32fast::hash(&record.payload);

        self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(4 + length as usize + 4, &mut self.file);
        w.write_u32::<LittleEndian>(length)?;
        w.write_u8(record.kind as u8)?;
        w.write_u64::<LittleEndian>(record.timestamp)?;
        w.write_u64::<LittleEndian>(record.row)?;
        w.write_all(&record.payload)?;
        w.write_u32::<LittleEndian>(crc)?;
        w.flush()?;
        Ok(())
    }

    /// Scans the log from position 0, returning every record whose checksum
    /// matches. A corrupt or torn tail truncates the file to the last good
    /// record; the scan itself never fails for that.
    pub fn replay(&mut self) -> CResult<Vec<WalRecord>> {
        let file_len = self.file.metadata()?.len();
        let mut records = Vec::new();
        let mut r = BufReader::new(&mut self.file);
        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            let mut read_one = || -> Result<(WalRecord, u64), std::io::Error> {
                let length = r.read_u32::<LittleEndian>()?;
                if length < HEADER_LEN || pos + 4 + length as u64 + 4 > file_len {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "record extends beyond end of file",
                    ));
                }
                let kind = r.read_u8()?;
                let timestamp = r.read_u64::<LittleEndian>()?;
                let row = r.read_u64::<LittleEndian>()?;
                let mut payload = vec![0; (length - HEADER_LEN) as usize];
                r.read_exact(&mut payload)?;
                let crc = r.read_u32::<LittleEndian>()?;
                if crc != crc32fast::hash(&payload) {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "record checksum mismatch",
                    ));
                }
                let kind = WalRecordKind::from_u8(kind)
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad kind"))?;
                Ok((WalRecord { kind, timestamp, row, payload }, pos + 4 + length as u64 + 4))
            };

            match read_one() {
                Ok((record, next)) => {
                    records.push(record);
                    pos = next;
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::UnexpectedEof
                        || err.kind() == std::io::ErrorKind::InvalidData =>
                {
                    log::warn!(
                        "wal: discarding torn tail at offset {} ({}), truncating {}",
                        pos,
                        err,
                        self.path.display()
                    );
                    drop(r);
                    self.file.set_len(pos)?;
                    return Ok(records);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(records)
    }

    /// Truncates the log to empty. Called after a successful snapshot, whose
    /// image supersedes every logged record.
    pub fn reset(&mut self) -> CResult<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    pub fn sync(&mut self) -> CResult<()> {
        Ok(self.file.sync_all()?)
    }

    pub fn size(&self) -> CResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Best-effort flush when the log is dropped.
impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(error) = self.sync() {
            log::error!("failed to flush wal file: {}", error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_wal(name: &str) -> CResult<(tempdir::TempDir, Wal)> {
        let dir = tempdir::TempDir::new("gigavector")?;
        let wal = Wal::new(dir.path().join(name))?;
        Ok((dir, wal))
    }

    #[test]
    fn append_and_replay() -> CResult<()> {
        let (_dir, mut wal) = temp_wal("db.wal")?;
        wal.append(WalRecordKind::InsertVector, 0, &[1, 2, 3])?;
        wal.append(WalRecordKind::Delete, 0, &[])?;
        wal.append(WalRecordKind::UpdateVector, 7, &[9])?;
        let records = wal.replay()?;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].kind, WalRecordKind::InsertVector);
        assert_eq!(records[0].payload, vec![1, 2, 3]);
        assert_eq!(records[2].row, 7);
        Ok(())
    }

    #[test]
    fn reopen_preserves_records() -> CResult<()> {
        let dir = tempdir::TempDir::new("gigavector")?;
        let path = dir.path().join("db.wal");
        let mut wal = Wal::new(path.clone())?;
        wal.append(WalRecordKind::InsertVector, 0, &[42])?;
        drop(wal);
        let mut wal = Wal::new(path)?;
        let records = wal.replay()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, vec![42]);
        Ok(())
    }

    #[test]
    fn exclusive_lock() -> CResult<()> {
        let dir = tempdir::TempDir::new("gigavector")?;
        let path = dir.path().join("db.wal");
        let wal = Wal::new(path.clone())?;
        assert!(Wal::new(path.clone()).is_err());
        drop(wal);
        assert!(Wal::new(path).is_ok());
        Ok(())
    }

    #[test]
    fn torn_tail_discarded() -> CResult<()> {
        let dir = tempdir::TempDir::new("gigavector")?;
        let path = dir.path().join("db.wal");
        let mut wal = Wal::new(path.clone())?;
        wal.append(WalRecordKind::InsertVector, 0, &[1, 2, 3, 4])?;
        let good_len = wal.size()?;
        wal.append(WalRecordKind::InsertVector, 1, &[5, 6, 7, 8])?;
        drop(wal);

        // Truncate the file at every byte position inside the second record
        // and make sure only the first survives, with the tail discarded.
        let full_len = std::fs::metadata(&path)?.len();
        for cut in good_len..full_len {
            let copy = dir.path().join("cut.wal");
            std::fs::copy(&path, &copy)?;
            let f = std::fs::OpenOptions::new().write(true).open(&copy)?;
            f.set_len(cut)?;
            drop(f);

            let mut wal = Wal::new(copy.clone())?;
            let records = wal.replay()?;
            assert_eq!(records.len(), 1, "cut at {}", cut);
            assert_eq!(wal.size()?, good_len);
            drop(wal);
            std::fs::remove_file(copy)?;
        }
        Ok(())
    }

    #[test]
    fn corrupt_crc_discards_tail() -> CResult<()> {
        let dir = tempdir::TempDir::new("gigavector")?;
        let path = dir.path().join("db.wal");
        let mut wal = Wal::new(path.clone())?;
        wal.append(WalRecordKind::InsertVector, 0, &[1, 2, 3, 4])?;
        let good_len = wal.size()?;
        wal.append(WalRecordKind::InsertVector, 1, &[5, 6, 7, 8])?;
        drop(wal);

        // Flip a payload byte in the second record.
        let mut bytes = std::fs::read(&path)?;
        let flip = good_len as usize + 4 + HEADER_LEN as usize;
        bytes[flip] ^= 0xff;
        std::fs::write(&path, &bytes)?;

        let mut wal = Wal::new(path)?;
        let records = wal.replay()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].row, 0);
        Ok(())
    }

    #[test]
    fn reset_empties_log() -> CResult<()> {
        let (_dir, mut wal) = temp_wal("db.wal")?;
        wal.append(WalRecordKind::InsertVector, 0, &[1])?;
        wal.reset()?;
        assert_eq!(wal.size()?, 0);
        assert!(wal.replay()?.is_empty());
        Ok(())
    }
}
