use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Count of open spill readers, shared between the store and the readers it
/// hands out. Writers are tracked by the store's LRU cache directly.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReaderCount(Arc<AtomicUsize>);

impl ReaderCount {
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Register one more open reader; the count drops when the lease does.
    pub(crate) fn lease(&self) -> ReaderLease {
        self.0.fetch_add(1, Ordering::AcqRel);
        ReaderLease(Arc::clone(&self.0))
    }
}

/// RAII registration of one open reader handle.
#[derive(Debug)]
pub(crate) struct ReaderLease(Arc<AtomicUsize>);

impl Drop for ReaderLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
