use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use hhj_result::{Error, Result};
use hhj_types::{Row, RowSchema, RowSource};
use lru::LruCache;

use crate::codec;
use crate::handles::{ReaderCount, ReaderLease};
use crate::spill_dir::SpillDir;
use crate::stats::{SpillIoSnapshot, SpillIoStats};

/// Index of a bucket in the store's arena.
///
/// Identifiers are never reused within one store, so a closed bucket's id
/// stays invalid instead of aliasing a newer bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(usize);

impl BucketId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Which input a bucket holds rows of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BucketRole {
    /// Rows that are indexed into a hash table.
    Build,
    /// Rows that are looked up against the build side's index.
    Probe,
}

impl fmt::Display for BucketRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketRole::Build => write!(f, "build"),
            BucketRole::Probe => write!(f, "probe"),
        }
    }
}

/// Read-only view of a bucket's bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketInfo {
    pub role: BucketRole,
    /// Position in `[0, num_partitions)` at the bucket's depth.
    pub partition: usize,
    pub depth: u32,
    /// Rows appended over the bucket's lifetime, resident or spilled.
    pub rows: u64,
    pub resident_bytes: usize,
    pub spilled: bool,
    pub closed: bool,
}

enum BucketState {
    Resident(Vec<Row>),
    Spilled(PathBuf),
    Closed,
}

struct Bucket {
    role: BucketRole,
    partition: usize,
    depth: u32,
    rows: u64,
    resident_bytes: usize,
    state: BucketState,
}

/// Arena of buckets backed by memory or by files in a [`SpillDir`].
pub struct PartitionStore {
    buckets: Vec<Bucket>,
    // Declared before `dir` so open writers close before the directory goes.
    writers: LruCache<BucketId, BufWriter<File>>,
    readers: ReaderCount,
    max_open_files: usize,
    build_schema: Arc<RowSchema>,
    probe_schema: Arc<RowSchema>,
    stats: Arc<SpillIoStats>,
    dir: SpillDir,
}

impl PartitionStore {
    pub fn new(
        dir: SpillDir,
        max_open_files: usize,
        build_schema: Arc<RowSchema>,
        probe_schema: Arc<RowSchema>,
    ) -> Result<Self> {
        if max_open_files < 2 {
            return Err(Error::configuration(format!(
                "max_open_files must be at least 2, got {max_open_files}"
            )));
        }
        Ok(Self {
            buckets: Vec::new(),
            writers: LruCache::unbounded(),
            readers: ReaderCount::default(),
            max_open_files,
            build_schema,
            probe_schema,
            stats: Arc::new(SpillIoStats::default()),
            dir,
        })
    }

    /// Allocate `n` empty resident buckets for partitions `0..n` at `depth`.
    ///
    /// The bucket arena only grows: closed buckets keep a small `Closed`
    /// entry until the store is finished, so ids are never reused. Each
    /// re-partitioned bucket adds `recursion_fanout` entries per side.
    pub fn create_partitions(&mut self, role: BucketRole, depth: u32, n: usize) -> Vec<BucketId> {
        let start = self.buckets.len();
        self.buckets.extend((0..n).map(|partition| Bucket {
            role,
            partition,
            depth,
            rows: 0,
            resident_bytes: 0,
            state: BucketState::Resident(Vec::new()),
        }));
        (start..start + n).map(BucketId).collect()
    }

    /// Add a row to a bucket: buffered in memory while resident, written
    /// straight to the bucket's file once spilled.
    pub fn append(&mut self, id: BucketId, row: Row) -> Result<()> {
        let bucket = self.bucket_mut(id)?;
        if matches!(bucket.state, BucketState::Closed) {
            return Err(closed_bucket(id));
        }
        bucket.rows += 1;
        if let BucketState::Resident(rows) = &mut bucket.state {
            bucket.resident_bytes += row.estimated_size();
            rows.push(row);
            return Ok(());
        }
        self.write_spilled(id, &row)
    }

    /// Move a resident bucket's rows to a new spill file. The writer stays
    /// open (subject to eviction) for rows appended later. Spilling an
    /// already spilled bucket is a no-op.
    pub fn spill(&mut self, id: BucketId) -> Result<()> {
        let path = {
            let bucket = self.bucket(id)?;
            match &bucket.state {
                BucketState::Spilled(_) => return Ok(()),
                BucketState::Closed => return Err(closed_bucket(id)),
                BucketState::Resident(_) => self.dir.file_path(&format!(
                    "{}-d{}-p{}-{}.spill",
                    bucket.role, bucket.depth, bucket.partition, id
                )),
            }
        };

        self.ensure_handle_available()?;
        let bucket = self.bucket_mut(id)?;
        let rows = match std::mem::replace(&mut bucket.state, BucketState::Spilled(path.clone()))
        {
            BucketState::Resident(rows) => rows,
            _ => unreachable!("bucket state checked above"),
        };
        bucket.resident_bytes = 0;

        let file = File::create(&path).map_err(|e| {
            Error::resource_exhausted(format!(
                "create spill file {} failed: {e}",
                path.display()
            ))
        })?;
        self.stats
            .files_created
            .fetch_add(1, Ordering::Relaxed);

        let mut writer = BufWriter::new(file);
        let written = codec::write_header(&mut writer).and_then(|()| {
            for row in &rows {
                let bytes = codec::write_frame(&mut writer, row)?;
                self.stats.record_write(bytes);
            }
            Ok(())
        });
        if let Err(e) = written {
            return Err(Error::resource_exhausted(format!(
                "spilling bucket {id} to {} failed: {e}",
                path.display()
            )));
        }

        tracing::debug!(bucket = %id, rows = rows.len(), path = %path.display(), "spilled bucket");
        self.writers.put(id, writer);
        Ok(())
    }

    /// Take ownership of a resident bucket's rows, closing the bucket.
    pub fn drain_resident(&mut self, id: BucketId) -> Result<Vec<Row>> {
        let bucket = self.bucket_mut(id)?;
        match std::mem::replace(&mut bucket.state, BucketState::Closed) {
            BucketState::Resident(rows) => {
                bucket.resident_bytes = 0;
                Ok(rows)
            }
            other => {
                bucket.state = other;
                Err(Error::Internal(format!(
                    "bucket {id} is not resident and cannot be drained from memory"
                )))
            }
        }
    }

    /// Open a forward-only reader over a spilled bucket.
    ///
    /// Pending writes are flushed and the bucket's writer is closed first.
    /// Each call yields a fresh pass from the first row.
    pub fn reload(&mut self, id: BucketId) -> Result<SpillReader> {
        let (path, role, rows) = {
            let bucket = self.bucket(id)?;
            match &bucket.state {
                BucketState::Spilled(path) => (path.clone(), bucket.role, bucket.rows),
                _ => {
                    return Err(Error::Internal(format!(
                        "bucket {id} is not spilled and cannot be reloaded"
                    )));
                }
            }
        };

        if let Some(mut writer) = self.writers.pop(&id) {
            writer.flush().map_err(|e| {
                Error::resource_exhausted(format!("flush of bucket {id} failed: {e}"))
            })?;
        }

        self.ensure_handle_available()?;
        let file = File::open(&path).map_err(|e| {
            Error::resource_exhausted(format!("open spill file {} failed: {e}", path.display()))
        })?;
        let lease = self.readers.lease();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;

        let schema = match role {
            BucketRole::Build => Arc::clone(&self.build_schema),
            BucketRole::Probe => Arc::clone(&self.probe_schema),
        };
        Ok(SpillReader {
            schema,
            reader,
            buf: Vec::new(),
            rows,
            stats: Arc::clone(&self.stats),
            _lease: lease,
        })
    }

    /// Release a bucket: resident rows are dropped, spill files deleted.
    pub fn close(&mut self, id: BucketId) -> Result<()> {
        self.writers.pop(&id);
        let bucket = self.bucket_mut(id)?;
        bucket.resident_bytes = 0;
        if let BucketState::Spilled(path) = std::mem::replace(&mut bucket.state, BucketState::Closed)
        {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    pub fn info(&self, id: BucketId) -> Result<BucketInfo> {
        let bucket = self
            .buckets
            .get(id.0)
            .ok_or_else(|| Error::Internal(format!("unknown bucket {id}")))?;
        Ok(BucketInfo {
            role: bucket.role,
            partition: bucket.partition,
            depth: bucket.depth,
            rows: bucket.rows,
            resident_bytes: bucket.resident_bytes,
            spilled: matches!(bucket.state, BucketState::Spilled(_)),
            closed: matches!(bucket.state, BucketState::Closed),
        })
    }

    pub fn is_spilled(&self, id: BucketId) -> bool {
        self.buckets
            .get(id.0)
            .is_some_and(|b| matches!(b.state, BucketState::Spilled(_)))
    }

    /// Number of rows held in memory by a bucket (zero once spilled or closed).
    pub fn resident_rows(&self, id: BucketId) -> usize {
        match self.buckets.get(id.0).map(|b| &b.state) {
            Some(BucketState::Resident(rows)) => rows.len(),
            _ => 0,
        }
    }

    /// Estimated bytes held in memory across all buckets.
    pub fn total_resident_bytes(&self) -> usize {
        self.buckets.iter().map(|b| b.resident_bytes).sum()
    }

    /// Handles currently open: cached writers plus live readers.
    pub fn open_handles(&self) -> usize {
        self.writers.len() + self.readers.get()
    }

    pub fn max_open_files(&self) -> usize {
        self.max_open_files
    }

    pub fn io_stats(&self) -> SpillIoSnapshot {
        self.stats.snapshot()
    }

    pub fn spill_dir(&self) -> &SpillDir {
        &self.dir
    }

    /// Close every handle and remove the working directory.
    pub fn finish(mut self) -> Result<()> {
        self.writers.clear();
        self.dir.close()
    }

    fn bucket(&self, id: BucketId) -> Result<&Bucket> {
        self.buckets
            .get(id.0)
            .ok_or_else(|| Error::Internal(format!("unknown bucket {id}")))
    }

    fn bucket_mut(&mut self, id: BucketId) -> Result<&mut Bucket> {
        self.buckets
            .get_mut(id.0)
            .ok_or_else(|| Error::Internal(format!("unknown bucket {id}")))
    }

    fn write_spilled(&mut self, id: BucketId, row: &Row) -> Result<()> {
        if !self.writers.contains(&id) {
            self.reopen_writer(id)?;
        }
        let writer = self
            .writers
            .get_mut(&id)
            .ok_or_else(|| Error::Internal(format!("writer for bucket {id} vanished")))?;
        match codec::write_frame(writer, row) {
            Ok(bytes) => {
                self.stats.record_write(bytes);
                Ok(())
            }
            Err(e) => {
                self.writers.pop(&id);
                Err(Error::resource_exhausted(format!(
                    "spill write to bucket {id} failed: {e}"
                )))
            }
        }
    }

    fn reopen_writer(&mut self, id: BucketId) -> Result<()> {
        let path = match &self.bucket(id)?.state {
            BucketState::Spilled(path) => path.clone(),
            _ => return Err(Error::Internal(format!("bucket {id} has no spill file"))),
        };
        self.ensure_handle_available()?;
        let file = OpenOptions::new().append(true).open(&path).map_err(|e| {
            Error::resource_exhausted(format!(
                "reopen spill file {} failed: {e}",
                path.display()
            ))
        })?;
        self.stats
            .writer_reopens
            .fetch_add(1, Ordering::Relaxed);
        self.writers.put(id, BufWriter::new(file));
        Ok(())
    }

    /// Evict least-recently-used writers until one more handle fits.
    fn ensure_handle_available(&mut self) -> Result<()> {
        while self.open_handles() >= self.max_open_files {
            let Some((victim, mut writer)) = self.writers.pop_lru() else {
                return Err(Error::resource_exhausted(format!(
                    "all {} permitted spill file handles are held by readers",
                    self.max_open_files
                )));
            };
            writer.flush().map_err(|e| {
                Error::resource_exhausted(format!("flush of evicted bucket {victim} failed: {e}"))
            })?;
            self.stats
                .writer_evictions
                .fetch_add(1, Ordering::Relaxed);
            tracing::trace!(bucket = %victim, "evicted spill writer");
        }
        Ok(())
    }
}

fn closed_bucket(id: BucketId) -> Error {
    Error::Internal(format!("bucket {id} is already closed"))
}

/// Forward-only pass over a spilled bucket.
///
/// Holds one file handle from the store's budget until dropped.
pub struct SpillReader {
    schema: Arc<RowSchema>,
    reader: BufReader<File>,
    buf: Vec<u8>,
    rows: u64,
    stats: Arc<SpillIoStats>,
    _lease: ReaderLease,
}

impl RowSource for SpillReader {
    fn schema(&self) -> &RowSchema {
        &self.schema
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        let row = codec::read_frame(&mut self.reader, &mut self.buf)?;
        if row.is_some() {
            self.stats.record_read(self.buf.len() + 4);
        }
        Ok(row)
    }

    fn estimated_rows(&self) -> Option<u64> {
        Some(self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hhj_types::{ColumnDef, Value, ValueType};

    fn schema() -> Arc<RowSchema> {
        Arc::new(RowSchema::new(vec![ColumnDef::new(
            "k",
            ValueType::Int64,
            false,
        )]))
    }

    fn store(max_open_files: usize) -> PartitionStore {
        let dir = SpillDir::create(None).unwrap();
        PartitionStore::new(dir, max_open_files, schema(), schema()).unwrap()
    }

    fn row(id: u64) -> Row {
        Row::new(id, vec![Value::Int64(id as i64)])
    }

    fn read_all(reader: &mut SpillReader) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Some(row) = reader.next_row().unwrap() {
            ids.push(row.id);
        }
        ids
    }

    #[test]
    fn test_resident_rows_stay_in_memory() {
        let mut store = store(4);
        let ids = store.create_partitions(BucketRole::Build, 0, 2);
        store.append(ids[0], row(1)).unwrap();
        store.append(ids[0], row(2)).unwrap();
        assert_eq!(store.resident_rows(ids[0]), 2);
        assert!(store.total_resident_bytes() > 0);
        assert_eq!(store.io_stats().frames_written, 0);

        let rows = store.drain_resident(ids[0]).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(store.info(ids[0]).unwrap().closed);
    }

    #[test]
    fn test_spill_then_append_streams_to_disk() {
        let mut store = store(4);
        let ids = store.create_partitions(BucketRole::Build, 0, 1);
        store.append(ids[0], row(1)).unwrap();
        store.spill(ids[0]).unwrap();
        store.append(ids[0], row(2)).unwrap();

        let info = store.info(ids[0]).unwrap();
        assert!(info.spilled);
        assert_eq!(info.rows, 2);
        assert_eq!(info.resident_bytes, 0);

        let mut reader = store.reload(ids[0]).unwrap();
        assert_eq!(reader.estimated_rows(), Some(2));
        assert_eq!(read_all(&mut reader), vec![1, 2]);
    }

    #[test]
    fn test_writers_are_evicted_and_reopened_within_budget() {
        let mut store = store(2);
        let ids = store.create_partitions(BucketRole::Probe, 0, 5);
        for id in &ids {
            store.spill(*id).unwrap();
            assert!(store.open_handles() <= 2);
        }
        for n in 0..50u64 {
            let id = ids[(n % 5) as usize];
            store.append(id, row(n)).unwrap();
            assert!(store.open_handles() <= 2);
        }
        let stats = store.io_stats();
        assert!(stats.writer_evictions > 0);
        assert!(stats.writer_reopens > 0);

        for (idx, id) in ids.iter().enumerate() {
            let mut reader = store.reload(*id).unwrap();
            let expected: Vec<u64> = (0..50u64).filter(|n| (n % 5) as usize == idx).collect();
            assert_eq!(read_all(&mut reader), expected);
        }
    }

    #[test]
    fn test_readers_exhaust_budget() {
        let mut store = store(2);
        let ids = store.create_partitions(BucketRole::Build, 0, 3);
        for id in &ids {
            store.spill(*id).unwrap();
        }
        let _a = store.reload(ids[0]).unwrap();
        let _b = store.reload(ids[1]).unwrap();
        let err = store.reload(ids[2]).err().unwrap();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[test]
    fn test_closed_ids_are_not_reused() {
        let mut store = store(3);
        let first = store.create_partitions(BucketRole::Build, 0, 2);
        store.close(first[0]).unwrap();
        store.close(first[1]).unwrap();

        let children = store.create_partitions(BucketRole::Build, 1, 3);
        assert_eq!(children[0].index(), 2);
        assert!(store.info(first[1]).unwrap().closed);
        let child = store.info(children[2]).unwrap();
        assert_eq!((child.depth, child.partition), (1, 2));
        assert!(!child.closed);
    }

    #[test]
    fn test_close_deletes_spill_file() {
        let mut store = store(3);
        let ids = store.create_partitions(BucketRole::Build, 1, 1);
        store.append(ids[0], row(1)).unwrap();
        store.spill(ids[0]).unwrap();
        let file_count = || std::fs::read_dir(store.spill_dir().path()).unwrap().count();
        assert_eq!(file_count(), 1);
        store.close(ids[0]).unwrap();
        assert_eq!(std::fs::read_dir(store.spill_dir().path()).unwrap().count(), 0);
        assert!(store.append(ids[0], row(2)).is_err());
    }
}
