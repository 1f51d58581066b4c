use std::sync::atomic::{AtomicU64, Ordering};

/// Spill I/O counters shared between the store and its readers.
#[derive(Debug, Default)]
pub struct SpillIoStats {
    pub files_created: AtomicU64,
    pub frames_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub frames_read: AtomicU64,
    pub bytes_read: AtomicU64,
    /// Writers closed to make room for another handle.
    pub writer_evictions: AtomicU64,
    /// Writers reopened in append mode after an eviction.
    pub writer_reopens: AtomicU64,
}

impl SpillIoStats {
    pub(crate) fn record_write(&self, bytes: usize) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.frames_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Capture a point-in-time snapshot of the accumulated counters.
    pub fn snapshot(&self) -> SpillIoSnapshot {
        SpillIoSnapshot {
            files_created: self.files_created.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            frames_read: self.frames_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            writer_evictions: self.writer_evictions.load(Ordering::Relaxed),
            writer_reopens: self.writer_reopens.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`SpillIoStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpillIoSnapshot {
    pub files_created: u64,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub frames_read: u64,
    pub bytes_read: u64,
    pub writer_evictions: u64,
    pub writer_reopens: u64,
}
