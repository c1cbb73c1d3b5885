//! Record sinks
//!
//! A sink disposes of fully assembled records. Allocation returns a
//! [`RecordSlot`] that keeps the sink's lock until the slot is saved, so a
//! record is either written completely or not at all.

pub mod rpc;
pub mod stob;

use crate::ts::{TransientStore, TsRecord};
use addb_common::WORD_SIZE;
use parking_lot::MappedMutexGuard;
use tracing::warn;

pub use rpc::{ItemSource, RpcItem, RpcItemSource, RpcSink};
pub use stob::{FileStob, MemStob, SegmentSlot, StorageSink, Stob};

/// Back end of an ADDB machine
pub trait RecordSink: Send + Sync {
    /// Reserve space for a record of `len` bytes (a multiple of the word
    /// size). `None` means the record must be dropped.
    fn rec_alloc(&self, len: usize) -> Option<RecordSlot<'_>>;

    /// Accept a populated slot obtained from this sink's `rec_alloc`
    fn save(&self, slot: RecordSlot<'_>);

    /// Periodic housekeeping
    fn skulk(&self) {}
}

/// Space reserved for one record
pub enum RecordSlot<'a> {
    /// Chunk of a transient store, store lock held
    Store(StoreSlot<'a>),
    /// Room in the current storage segment, sink lock held
    Segment(SegmentSlot<'a>),
    /// Plain heap buffer
    Heap(Vec<u64>),
}

impl RecordSlot<'_> {
    /// Heap-backed slot of `len` bytes
    #[must_use]
    pub fn heap(len: usize) -> Self {
        Self::Heap(vec![0; len.div_ceil(WORD_SIZE)])
    }

    pub fn words_mut(&mut self) -> &mut [u64] {
        match self {
            Self::Store(slot) => slot.words_mut(),
            Self::Segment(slot) => slot.words_mut(),
            Self::Heap(words) => words,
        }
    }

    #[must_use]
    pub fn words(&self) -> &[u64] {
        match self {
            Self::Store(slot) => slot.store.words(&slot.rec),
            Self::Segment(slot) => slot.words(),
            Self::Heap(words) => words,
        }
    }
}

/// Transient-store chunk plus the guard that protects the store. A slot
/// dropped without being saved gives its chunk back.
pub struct StoreSlot<'a> {
    store: MappedMutexGuard<'a, TransientStore>,
    rec: TsRecord,
    saved: bool,
}

impl<'a> StoreSlot<'a> {
    pub(crate) const fn new(store: MappedMutexGuard<'a, TransientStore>, rec: TsRecord) -> Self {
        Self {
            store,
            rec,
            saved: false,
        }
    }

    fn words_mut(&mut self) -> &mut [u64] {
        let rec = self.rec;
        self.store.words_mut(&rec)
    }

    /// Move the chunk to the store's ready list and release the lock
    pub(crate) fn save(mut self) {
        let rec = self.rec;
        self.store.save(rec);
        self.saved = true;
    }
}

impl Drop for StoreSlot<'_> {
    fn drop(&mut self) {
        if !self.saved
            && let Err(e) = self.store.free(self.rec)
        {
            warn!("Unsaved record slot could not be released: {e}");
        }
    }
}
