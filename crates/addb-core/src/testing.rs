//! Fakes shared by the unit tests

use crate::platform::Platform;
use crate::record::WireRecord;
use crate::sink::{RecordSink, RecordSlot};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use uuid::Uuid;

pub const TEST_NODE_HI: u64 = 0xaaaa_0000_0000_0001;
pub const TEST_NODE_LO: u64 = 0xbbbb_0000_0000_0002;
pub const TEST_PID: u64 = 4242;

/// Deterministic platform: fixed identity, clock ticking by one per read
#[derive(Default)]
pub struct TestPlatform {
    clock: AtomicU64,
    restricted: AtomicBool,
}

impl TestPlatform {
    /// Pretend to run where blocking is disallowed
    pub fn set_restricted(&self, restricted: bool) {
        self.restricted.store(restricted, Ordering::SeqCst);
    }
}

impl Platform for TestPlatform {
    fn node_uuid(&self) -> Uuid {
        Uuid::from_u64_pair(TEST_NODE_HI, TEST_NODE_LO)
    }

    fn process_id(&self) -> u64 {
        TEST_PID
    }

    fn can_block(&self) -> bool {
        !self.restricted.load(Ordering::SeqCst)
    }

    fn now(&self) -> u64 {
        1_000 + self.clock.fetch_add(1, Ordering::SeqCst)
    }
}

/// Sink that decodes and keeps every saved record
#[derive(Default)]
pub struct CaptureSink {
    records: Mutex<Vec<WireRecord>>,
    limit: Option<usize>,
}

impl CaptureSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse allocations once `limit` records have been saved
    pub fn with_limit(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            limit: Some(limit),
        })
    }

    pub fn records(&self) -> Vec<WireRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}

impl RecordSink for CaptureSink {
    fn rec_alloc(&self, len: usize) -> Option<RecordSlot<'_>> {
        if self.limit.is_some_and(|limit| self.len() >= limit) {
            return None;
        }
        Some(RecordSlot::heap(len))
    }

    fn save(&self, slot: RecordSlot<'_>) {
        let (rec, used) = WireRecord::decode(slot.words()).unwrap();
        assert_eq!(used, slot.words().len());
        self.records.lock().push(rec);
    }
}
