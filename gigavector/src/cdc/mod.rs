//! Change data capture.
//!
//! A fixed-size ring of deep-copied mutation events under a mutex, with two
//! consumption styles: push subscriptions (callbacks filtered by an
//! event-kind bitmask, invoked outside the lock so a subscriber can call
//! back into the stream) and pull cursors that poll contiguous ranges of
//! sequence numbers. Sequence numbers start at 1 and strictly follow the
//! real-time order of successful publishes.
//!
//! Persistence is best-effort: when enabled, each event is appended to a
//! little-endian binary log, and a failed append never fails the publish;
//! it only bumps an error counter.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, WriteBytesExt};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::storage::now_micros;
use crate::value::Metadata;

/// Mutation kinds carried on the stream. Discriminants are part of the
/// persisted format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ChangeKind {
    Insert = 0,
    Delete = 1,
    UpdateVector = 2,
    UpdateMetadata = 3,
}

impl ChangeKind {
    /// This kind's bit in a subscription mask.
    pub fn bit(&self) -> u32 {
        1 << (*self as u32)
    }
}

/// Subscription mask matching every event kind.
pub const CDC_ALL: u32 = 0b1111;

/// One mutation event. Vectors and metadata are deep copies taken at
/// publish time.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    /// Monotonic sequence number, starting at 1.
    pub seq: u64,
    pub kind: ChangeKind,
    pub row: u64,
    pub timestamp: u64,
    pub vector: Option<Vec<f32>>,
    pub metadata: Option<Metadata>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CdcConfig {
    /// Ring capacity; the oldest event is overwritten when full.
    pub ring_buffer_size: usize,

    /// Append events to a binary log file.
    pub persist_to_file: bool,
    pub log_path: Option<PathBuf>,

    /// Stop appending once the log exceeds this size.
    pub max_log_size_mb: u64,

    /// Attach vector payloads to events.
    pub include_vector_data: bool,

    /// Subscriber cap; subscribing beyond it is `Exhausted`.
    pub max_subscribers: usize,
}

impl Default for CdcConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size: 65536,
            persist_to_file: false,
            log_path: None,
            max_log_size_mb: 256,
            include_vector_data: true,
            max_subscribers: 1024,
        }
    }
}

/// A pull cursor over the stream. Sequence `next` is the first event the
/// next poll returns.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CdcCursor {
    next: u64,
}

impl CdcCursor {
    /// A cursor starting from the given sequence number.
    pub fn from_seq(seq: u64) -> Self {
        Self { next: seq.max(1) }
    }

    /// A cursor that reads the whole retained window.
    pub fn start() -> Self {
        Self::from_seq(1)
    }

    pub fn position(&self) -> u64 {
        self.next
    }
}

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct Subscriber {
    mask: u32,
    callback: Callback,
}

struct CdcInner {
    ring: VecDeque<ChangeEvent>,
    next_seq: u64,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
    log: Option<std::fs::File>,
    log_size: u64,
    persist_errors: u64,
    dropped: u64,
}

/// Counters surfaced through database stats.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CdcStatus {
    /// Events published over the stream's lifetime.
    pub published: u64,

    /// Events overwritten before any poller consumed them.
    pub dropped: u64,

    /// Best-effort persistence failures.
    pub persist_errors: u64,

    pub subscribers: u64,
}

pub struct CdcStream {
    config: CdcConfig,
    inner: Mutex<CdcInner>,
}

impl CdcStream {
    pub fn new(config: CdcConfig) -> CResult<Self> {
        if config.ring_buffer_size == 0 {
            return Err(Error::InvalidInput("cdc ring size must be at least 1".into()));
        }
        let mut log = None;
        let mut log_size = 0;
        if config.persist_to_file {
            let path = config
                .log_path
                .clone()
                .ok_or_else(|| Error::InvalidInput("cdc persistence requires a log path".into()))?;
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            log_size = file.metadata()?.len();
            log = Some(file);
        }
        Ok(Self {
            config,
            inner: Mutex::new(CdcInner {
                ring: VecDeque::new(),
                next_seq: 1,
                subscribers: HashMap::new(),
                next_subscriber: 1,
                log,
                log_size,
                persist_errors: 0,
                dropped: 0,
            }),
        })
    }

    /// Publishes an event, assigning the next sequence number. Matching
    /// subscriber callbacks run after the lock is released.
    pub fn publish(
        &self,
        kind: ChangeKind,
        row: u64,
        vector: Option<&[f32]>,
        metadata: Option<&Metadata>,
    ) -> u64 {
        let vector = if self.config.include_vector_data {
            vector.map(|v| v.to_vec())
        } else {
            None
        };
        let event_holder;
        let callbacks: Vec<Callback>;
        {
            let mut inner = self.inner.lock().expect("cdc lock poisoned");
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let event = ChangeEvent {
                seq,
                kind,
                row,
                timestamp: now_micros(),
                vector,
                metadata: metadata.cloned(),
            };
            if inner.ring.len() >= self.config.ring_buffer_size {
                inner.ring.pop_front();
                inner.dropped += 1;
            }
            inner.ring.push_back(event.clone());
            self.persist(&mut inner, &event);

            // Snapshot the matching callbacks so they run outside the lock;
            // a subscriber calling back into the stream must not deadlock.
            callbacks = inner
                .subscribers
                .values()
                .filter(|s| s.mask & kind.bit() != 0)
                .map(|s| s.callback.clone())
                .collect();
            event_holder = event;
        }
        for callback in callbacks {
            callback(&event_holder);
        }
        event_holder.seq
    }

    /// Little-endian event record:
    /// `seq u64 | kind u32 | row u64 | timestamp u64 | dim u64 | vector |
    /// meta_len u32 | meta_json`.
    fn persist(&self, inner: &mut CdcInner, event: &ChangeEvent) {
        let max_bytes = self.config.max_log_size_mb * 1024 * 1024;
        let (log_size, result) = match inner.log.as_mut() {
            Some(file) if inner.log_size <= max_bytes => {
                let mut buf = Vec::new();
                let result = encode_log_record(&mut buf, event)
                    .and_then(|_| file.write_all(&buf).map_err(Error::from));
                (inner.log_size + buf.len() as u64, result)
            }
            _ => return,
        };
        match result {
            Ok(_) => inner.log_size = log_size,
            Err(err) => {
                inner.persist_errors += 1;
                log::error!("cdc: failed to persist event {}: {}", event.seq, err);
            }
        }
    }

    /// Registers a callback for the kinds set in `mask`. Returns the
    /// subscriber id for [`CdcStream::unsubscribe`].
    pub fn subscribe<F>(&self, mask: u32, callback: F) -> CResult<u64>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("cdc lock poisoned");
        if inner.subscribers.len() >= self.config.max_subscribers {
            return Err(Error::Exhausted(format!(
                "subscriber limit {} reached",
                self.config.max_subscribers
            )));
        }
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(id, Subscriber { mask, callback: Arc::new(callback) });
        Ok(id)
    }

    pub fn unsubscribe(&self, id: u64) -> CResult<()> {
        let mut inner = self.inner.lock().expect("cdc lock poisoned");
        inner
            .subscribers
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("subscriber {}", id)))
    }

    /// Returns up to `max` events from the cursor onward, in sequence
    /// order, and advances the cursor past the last one returned. A cursor
    /// that has fallen off the retained window is clamped forward.
    pub fn poll(&self, cursor: &mut CdcCursor, max: usize) -> Vec<ChangeEvent> {
        let inner = self.inner.lock().expect("cdc lock poisoned");
        let oldest = match inner.ring.front() {
            Some(event) => event.seq,
            None => return Vec::new(),
        };
        let start = cursor.next.max(oldest);
        let events: Vec<ChangeEvent> = inner
            .ring
            .iter()
            .skip((start - oldest) as usize)
            .take(max)
            .cloned()
            .collect();
        if let Some(last) = events.last() {
            cursor.next = last.seq + 1;
        } else {
            cursor.next = cursor.next.max(start);
        }
        events
    }

    /// How many retained events the cursor has not consumed yet.
    pub fn pending(&self, cursor: &CdcCursor) -> u64 {
        let inner = self.inner.lock().expect("cdc lock poisoned");
        let newest = inner.next_seq - 1;
        let oldest = match inner.ring.front() {
            Some(event) => event.seq,
            None => return 0,
        };
        let start = cursor.next.max(oldest);
        (newest + 1).saturating_sub(start)
    }

    pub fn status(&self) -> CdcStatus {
        let inner = self.inner.lock().expect("cdc lock poisoned");
        CdcStatus {
            published: inner.next_seq - 1,
            dropped: inner.dropped,
            persist_errors: inner.persist_errors,
            subscribers: inner.subscribers.len() as u64,
        }
    }
}

fn encode_log_record(w: &mut Vec<u8>, event: &ChangeEvent) -> CResult<()> {
    w.write_u64::<LittleEndian>(event.seq)?;
    w.write_u32::<LittleEndian>(event.kind as u32)?;
    w.write_u64::<LittleEndian>(event.row)?;
    w.write_u64::<LittleEndian>(event.timestamp)?;
    match &event.vector {
        Some(vector) => {
            w.write_u64::<LittleEndian>(vector.len() as u64)?;
            for &x in vector {
                w.write_f32::<LittleEndian>(x)?;
            }
        }
        None => w.write_u64::<LittleEndian>(0)?,
    }
    let meta_json = match &event.metadata {
        Some(meta) => serde_json::to_vec(meta)?,
        None => Vec::new(),
    };
    w.write_u32::<LittleEndian>(meta_json.len() as u32)?;
    w.write_all(&meta_json)?;
    Ok(())
}
