//! RPC record sink
//!
//! Records are staged in a transient store. The network layer pulls them
//! through an [`ItemSource`] attached per outbound connection: each pulled
//! [`RpcItem`] packs as many ready records as fit, and stays in flight
//! until the sender reports the outcome. Failed items go back to the ready
//! list; delivered ones are freed.
//!
//! Dropping the sink waits for every in-flight item to complete.

use super::{RecordSink, RecordSlot, StoreSlot};
use crate::platform::Platform;
use crate::record::{BATCH_HEADER_SIZE, BatchBuilder};
use crate::ts::{TransientStore, TsRecord};
use addb_common::Result;
use addb_common::config::RpcSinkConfig;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct RpcState {
    store: TransientStore,
    /// In-flight items and the chunks they carry
    submitted: HashMap<u64, Vec<TsRecord>>,
    next_item: u64,
    attached: HashSet<u64>,
    closed: bool,
}

struct RpcShared {
    state: Mutex<RpcState>,
    /// Signalled whenever the in-flight set becomes empty
    drained: Condvar,
}

/// Sink handing records to the network layer
pub struct RpcSink {
    shared: Arc<RpcShared>,
    extend_pages: usize,
    drain_timeout: Option<Duration>,
    platform: Arc<dyn Platform>,
}

impl RpcSink {
    pub fn new(config: &RpcSinkConfig, platform: Arc<dyn Platform>) -> Result<Self> {
        let store = TransientStore::new(&config.store)?;
        Ok(Self {
            shared: Arc::new(RpcShared {
                state: Mutex::new(RpcState {
                    store,
                    submitted: HashMap::new(),
                    next_item: 1,
                    attached: HashSet::new(),
                    closed: false,
                }),
                drained: Condvar::new(),
            }),
            extend_pages: config.extend_pages,
            drain_timeout: config.drain_timeout_ms.map(Duration::from_millis),
            platform,
        })
    }

    /// Register the item source of an outbound connection
    pub fn attach(&self, conn_id: u64) -> Arc<RpcItemSource> {
        if !self.shared.state.lock().attached.insert(conn_id) {
            debug!("RPC item source {conn_id} attached twice");
        }
        Arc::new(RpcItemSource {
            conn_id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Deregister a connection's item source; it stops offering items
    pub fn detach(&self, conn_id: u64) {
        self.shared.state.lock().attached.remove(&conn_id);
    }

    /// Records waiting to be pulled
    #[must_use]
    pub fn ready(&self) -> usize {
        self.shared.state.lock().store.ready_len()
    }

    /// Items pulled but not yet completed
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().submitted.len()
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.shared.state.lock().store.page_count()
    }

    fn grow(&self, state: &mut RpcState, len: usize) -> Option<TsRecord> {
        let store = &mut state.store;
        let room = store.max_pages() - store.page_count();
        let n = self.extend_pages.min(room);
        if n == 0 || !store.fits_page(len) {
            return None;
        }
        if let Err(e) = store.extend(n) {
            warn!("RPC sink could not grow its store: {e}");
            return None;
        }
        debug!("RPC sink store grown to {} pages", store.page_count());
        store.alloc(len)
    }
}

impl RecordSink for RpcSink {
    fn rec_alloc(&self, len: usize) -> Option<RecordSlot<'_>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return None;
        }
        let rec = match state.store.alloc(len) {
            Some(rec) => rec,
            None => {
                let Some(rec) = self.grow(&mut state, len) else {
                    warn!("RPC sink store exhausted, dropping a {len} byte record");
                    return None;
                };
                rec
            }
        };
        let store = MutexGuard::map(state, |s| &mut s.store);
        Some(RecordSlot::Store(StoreSlot::new(store, rec)))
    }

    fn save(&self, slot: RecordSlot<'_>) {
        match slot {
            RecordSlot::Store(slot) => slot.save(),
            _ => debug!("RPC sink given a foreign slot, record dropped"),
        }
    }
}

impl Drop for RpcSink {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.attached.clear();

        let undelivered = state.store.ready_len();
        if undelivered > 0 {
            info!("RPC sink closing with {undelivered} undelivered records");
        }
        if state.submitted.is_empty() {
            return;
        }
        if !self.platform.can_block() {
            warn!(
                "RPC sink closing with {} items in flight, cannot wait here",
                state.submitted.len()
            );
            return;
        }

        match self.drain_timeout {
            None => {
                while !state.submitted.is_empty() {
                    self.shared.drained.wait(&mut state);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !state.submitted.is_empty() {
                    if self.shared.drained.wait_until(&mut state, deadline).timed_out() {
                        warn!(
                            "RPC sink gave up on {} in-flight items after {timeout:?}",
                            state.submitted.len()
                        );
                        break;
                    }
                }
            }
        }
    }
}

/// Network-layer view of a sink: pull records for one connection
pub trait ItemSource: Send + Sync {
    /// Whether a call to `get_item` would produce an item
    fn has_item(&self) -> bool;

    /// Pack ready records into an item of at most `max_bytes`
    fn get_item(&self, max_bytes: usize) -> Option<RpcItem>;
}

/// Item source bound to one connection
pub struct RpcItemSource {
    conn_id: u64,
    shared: Arc<RpcShared>,
}

impl RpcItemSource {
    #[must_use]
    pub const fn conn_id(&self) -> u64 {
        self.conn_id
    }
}

impl ItemSource for RpcItemSource {
    fn has_item(&self) -> bool {
        let state = self.shared.state.lock();
        !state.closed && state.attached.contains(&self.conn_id) && state.store.has_ready()
    }

    fn get_item(&self, max_bytes: usize) -> Option<RpcItem> {
        let mut state = self.shared.state.lock();
        if state.closed || !state.attached.contains(&self.conn_id) {
            return None;
        }

        let mut room = max_bytes.checked_sub(BATCH_HEADER_SIZE)?;
        let mut batch = BatchBuilder::new();
        let mut recs = Vec::new();
        while let Some(rec) = state.store.get(room) {
            batch.push(state.store.words(&rec));
            room -= rec.size();
            recs.push(rec);
        }
        if recs.is_empty() {
            return None;
        }

        let id = state.next_item;
        state.next_item += 1;
        let count = batch.count();
        state.submitted.insert(id, recs);
        debug!("RPC item {id} for connection {}: {count} records", self.conn_id);

        Some(RpcItem {
            id,
            payload: batch.finish(),
            count,
            shared: Arc::clone(&self.shared),
            settled: false,
        })
    }
}

/// Records in flight to the network. Dropping an item without calling
/// [`RpcItem::complete`] counts as a failed send.
pub struct RpcItem {
    id: u64,
    payload: Bytes,
    count: u32,
    shared: Arc<RpcShared>,
    settled: bool,
}

impl RpcItem {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Encoded record batch
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Report the send outcome
    pub fn complete(mut self, result: Result<()>) {
        if let Err(e) = &result {
            debug!("RPC item {} failed, requeueing {} records: {e}", self.id, self.count);
        }
        self.settle(result.is_ok());
    }

    fn settle(&mut self, delivered: bool) {
        if self.settled {
            return;
        }
        self.settled = true;

        let mut state = self.shared.state.lock();
        if let Some(recs) = state.submitted.remove(&self.id) {
            for rec in recs {
                if delivered {
                    if let Err(e) = state.store.free(rec) {
                        warn!("RPC item {} could not release a record: {e}", self.id);
                    }
                } else {
                    state.store.save(rec);
                }
            }
        }
        if state.submitted.is_empty() {
            self.shared.drained.notify_all();
        }
    }
}

impl Drop for RpcItem {
    fn drop(&mut self) {
        self.settle(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{WireRecord, decode_batch};
    use crate::testing::TestPlatform;
    use addb_common::config::TransientStoreConfig;
    use addb_common::{BaseKind, Error, RecordId};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sink_with(store: TransientStoreConfig, drain_timeout_ms: Option<u64>) -> RpcSink {
        let config = RpcSinkConfig {
            store,
            extend_pages: 1,
            drain_timeout_ms,
        };
        RpcSink::new(&config, Arc::new(TestPlatform::default())).unwrap()
    }

    fn sink() -> RpcSink {
        sink_with(TransientStoreConfig::default(), None)
    }

    fn record(n: u64, nfields: usize) -> WireRecord {
        WireRecord {
            rid: RecordId::new(BaseKind::DataPoint, 3),
            timestamp: n,
            contexts: vec![vec![1, n]],
            fields: vec![n; nfields],
        }
    }

    fn stage(sink: &RpcSink, rec: &WireRecord) -> bool {
        let Some(mut slot) = sink.rec_alloc(rec.encoded_len()) else {
            return false;
        };
        rec.encode_into(slot.words_mut());
        sink.save(slot);
        true
    }

    fn used_words(sink: &RpcSink) -> usize {
        sink.shared.state.lock().store.used_words()
    }

    #[test]
    fn test_get_item_packs_records() {
        let sink = sink();
        let recs: Vec<_> = (1..=3).map(|n| record(n, 2)).collect();
        for rec in &recs {
            assert!(stage(&sink, rec));
        }

        let source = sink.attach(7);
        assert!(source.has_item());
        let item = source.get_item(4096).unwrap();
        assert_eq!(item.count(), 3);
        assert_eq!(decode_batch(item.payload()).unwrap(), recs);
        assert!(!source.has_item());
        assert_eq!(sink.in_flight(), 1);

        item.complete(Ok(()));
        assert_eq!(sink.in_flight(), 0);
        assert_eq!(used_words(&sink), 0);
    }

    #[test]
    fn test_item_respects_size_limit() {
        let sink = sink();
        let rec = record(1, 4);
        for _ in 0..3 {
            stage(&sink, &rec);
        }
        let source = sink.attach(1);
        let max = BATCH_HEADER_SIZE + 2 * rec.encoded_len();
        let item = source.get_item(max).unwrap();
        assert_eq!(item.count(), 2);
        assert!(item.payload().len() <= max);
        assert_eq!(sink.ready(), 1);

        assert!(source.get_item(BATCH_HEADER_SIZE).is_none());
        assert!(source.get_item(0).is_none());
        item.complete(Ok(()));
    }

    #[test]
    fn test_failed_send_requeues() {
        let sink = sink();
        stage(&sink, &record(1, 1));
        stage(&sink, &record(2, 1));
        let source = sink.attach(1);

        let item = source.get_item(4096).unwrap();
        let used = used_words(&sink);
        item.complete(Err(Error::transport("connection reset")));
        assert_eq!(sink.ready(), 2);
        assert_eq!(used_words(&sink), used);

        // dropping without completing is a failure too
        drop(source.get_item(4096).unwrap());
        assert_eq!(sink.ready(), 2);

        let retry = source.get_item(4096).unwrap();
        assert_eq!(retry.count(), 2);
        retry.complete(Ok(()));
        assert_eq!(used_words(&sink), 0);
    }

    #[test]
    fn test_detached_source_is_idle() {
        let sink = sink();
        stage(&sink, &record(1, 1));
        let source = sink.attach(3);
        sink.detach(3);
        assert!(!source.has_item());
        assert!(source.get_item(4096).is_none());
        assert_eq!(sink.ready(), 1);
    }

    #[test]
    fn test_store_grows_to_max() {
        let sink = sink_with(
            TransientStoreConfig {
                init_pages: 1,
                max_pages: 2,
                page_size: 64,
            },
            None,
        );
        // 4 fixed words, 1 depth word, 2 ids and 1 field: a full page
        let rec = record(1, 1);
        assert_eq!(rec.encoded_len(), 64);
        assert!(stage(&sink, &rec));
        assert_eq!(sink.page_count(), 1);
        assert!(stage(&sink, &rec));
        assert_eq!(sink.page_count(), 2);
        assert!(!stage(&sink, &rec));
        assert_eq!(sink.ready(), 2);
    }

    #[test]
    fn test_drop_waits_for_in_flight() {
        let sink = sink();
        stage(&sink, &record(1, 1));
        let item = sink.attach(1).get_item(4096).unwrap();

        let completed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&completed);
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
            item.complete(Ok(()));
        });

        drop(sink);
        assert!(completed.load(Ordering::SeqCst));
        sender.join().unwrap();
    }

    #[test]
    fn test_drop_wait_is_bounded() {
        let sink = sink_with(TransientStoreConfig::default(), Some(10));
        stage(&sink, &record(1, 1));
        let item = sink.attach(1).get_item(4096).unwrap();

        let started = Instant::now();
        drop(sink);
        assert!(started.elapsed() < Duration::from_secs(5));
        item.complete(Ok(()));
    }
}
