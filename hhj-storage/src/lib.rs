//! Partition store: buckets of rows that live in memory or in spill files.
//!
//! The join engine partitions each input into buckets. A bucket starts out
//! resident; under memory pressure it is spilled, after which every further
//! row appended to it streams straight to its file. Later the bucket is
//! reloaded as a forward-only [`SpillReader`] and finally closed, which frees
//! its memory or deletes its file.
//!
//! Two resources are bounded here:
//!
//! - **Disk location**: all files live in one [`SpillDir`], a scoped working
//!   directory removed when it is dropped, whatever the reason the join ended.
//! - **File handles**: at most `max_open_files` handles are open at once.
//!   Writers of spilled buckets form an LRU cache; when a new handle is needed
//!   the least-recently-used writer is flushed and closed, and reopened in
//!   append mode on its next write. Readers count against the same budget but
//!   are never evicted.
#![forbid(unsafe_code)]

mod codec;
mod handles;
mod partition_store;
mod spill_dir;
mod stats;

pub use codec::{SPILL_MAGIC, SPILL_VERSION};
pub use partition_store::{BucketId, BucketInfo, BucketRole, PartitionStore, SpillReader};
pub use spill_dir::SpillDir;
pub use stats::{SpillIoSnapshot, SpillIoStats};
