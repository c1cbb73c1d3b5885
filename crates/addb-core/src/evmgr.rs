//! Event managers
//!
//! The front door of an ADDB machine. The pass-through manager hands every
//! record straight to the machine's sink; the caching manager stages records
//! in a fixed-size transient store so it can be used where blocking is not
//! allowed, and later copies them into another machine.

use crate::machine::Machine;
use crate::registry::RecordType;
use crate::sink::{RecordSink, RecordSlot, StoreSlot};
use crate::ts::TransientStore;
use addb_common::config::CacheConfig;
use addb_common::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::{debug, warn};

/// Front end of an ADDB machine
pub trait EventManager: Send + Sync {
    /// Whether posting is safe where blocking is disallowed
    fn can_post_awkward(&self) -> bool;

    /// Whether the manager forwards to the machine's sink
    fn requires_sink(&self) -> bool;

    /// Reserve space for a record of `len` bytes
    fn rec_alloc(&self, len: usize) -> Option<RecordSlot<'_>>;

    /// Accept a populated record
    fn post(&self, slot: RecordSlot<'_>);

    /// Best-effort mirror of an exception to the system log
    fn log(&self, _rt: &RecordType, _fields: &[u64]) {}

    /// Records buffered and waiting for [`EventManager::copy`]
    fn buffered(&self) -> usize {
        0
    }

    /// Whether [`EventManager::copy`] is supported
    fn has_copy(&self) -> bool {
        false
    }

    /// Move every buffered record into `dest`
    fn copy(&self, _dest: &Machine) -> Result<()> {
        Err(Error::invalid_state("event manager does not buffer records"))
    }
}

/// Synchronous hand-off to a record sink
pub struct PassThroughEventManager {
    sink: Arc<dyn RecordSink>,
}

impl PassThroughEventManager {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink }
    }
}

impl EventManager for PassThroughEventManager {
    fn can_post_awkward(&self) -> bool {
        false
    }

    fn requires_sink(&self) -> bool {
        true
    }

    fn rec_alloc(&self, len: usize) -> Option<RecordSlot<'_>> {
        self.sink.rec_alloc(len)
    }

    fn post(&self, slot: RecordSlot<'_>) {
        self.sink.save(slot);
    }

    fn log(&self, rt: &RecordType, fields: &[u64]) {
        let names = rt.field_names();
        let values: Vec<String> = names
            .iter()
            .zip(fields)
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        warn!("ADDB exception {} ({}): {}", rt.name(), rt.id(), values.join(" "));
    }
}

/// Fixed-capacity staging cache
pub struct CacheEventManager {
    store: Mutex<TransientStore>,
    page_size: usize,
}

impl CacheEventManager {
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let store = TransientStore::new(&config.store())?;
        let page_size = store.page_size();
        Ok(Self {
            store: Mutex::new(store),
            page_size,
        })
    }

    /// Acquire the store without ever parking the thread
    fn lock(&self) -> MutexGuard<'_, TransientStore> {
        loop {
            if let Some(guard) = self.store.try_lock() {
                return guard;
            }
            std::hint::spin_loop();
        }
    }

    /// Number of records waiting to be copied
    #[must_use]
    pub fn cached(&self) -> usize {
        self.lock().ready_len()
    }
}

impl EventManager for CacheEventManager {
    fn can_post_awkward(&self) -> bool {
        true
    }

    fn requires_sink(&self) -> bool {
        false
    }

    fn rec_alloc(&self, len: usize) -> Option<RecordSlot<'_>> {
        let mut store = self.lock();
        let rec = store.alloc(len)?;
        let store = MutexGuard::map(store, |s| s);
        Some(RecordSlot::Store(StoreSlot::new(store, rec)))
    }

    fn post(&self, slot: RecordSlot<'_>) {
        match slot {
            RecordSlot::Store(slot) => slot.save(),
            _ => debug!("cache event manager given a foreign slot, record dropped"),
        }
    }

    fn buffered(&self) -> usize {
        self.cached()
    }

    fn has_copy(&self) -> bool {
        true
    }

    fn copy(&self, dest: &Machine) -> Result<()> {
        let evmgr = dest
            .posting_evmgr()
            .ok_or_else(|| Error::invalid_state("copy destination cannot post"))?;
        if Arc::as_ptr(&evmgr).cast::<()>() == std::ptr::from_ref(self).cast::<()>() {
            return Err(Error::invalid_state("cache cannot be copied into itself"));
        }
        if !dest.platform().can_block() && !evmgr.can_post_awkward() {
            return Err(Error::invalid_state("cache flush needs a context that may block"));
        }

        let mut copied = 0usize;
        loop {
            let Some(rec) = self.lock().get(self.page_size) else {
                break;
            };

            let Some(mut slot) = evmgr.rec_alloc(rec.size()) else {
                self.lock().save(rec);
                debug!("cache flush stopped after {copied} records: destination full");
                return Err(Error::OutOfMemory {
                    requested: rec.size(),
                });
            };

            {
                let store = self.lock();
                slot.words_mut().copy_from_slice(store.words(&rec));
            }
            evmgr.post(slot);

            if let Err(e) = self.lock().free(rec) {
                warn!("cache flush could not release record: {e}");
            }
            copied += 1;
        }

        debug!("cache flush copied {copied} records");
        Ok(())
    }
}
