//! Storage record sink
//!
//! Records are appended to an in-memory segment buffer which is written to
//! a storage object (stob) when full, when the skulk timeout expires, or
//! when the sink is released. The stob is a ring of `stob_size /
//! segment_size` segments; every write of a segment uses a fresh sequence
//! number so the newest copy always wins.

use super::{RecordSink, RecordSlot};
use crate::record::decode_batch;
use crate::segment::{HEADER_SIZE, SegmentHeader, SegmentTrailer, TRAILER_SIZE};
use addb_common::config::StobSinkConfig;
use addb_common::{Error, Result, WORD_SIZE};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Byte-addressed storage object
pub trait Stob: Send + Sync {
    /// Read into `buf` at `offset`; returns the number of bytes read, short
    /// at the end of the object
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current size in bytes
    fn size(&self) -> Result<u64>;

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Growable in-memory stob
#[derive(Default)]
pub struct MemStob {
    data: RwLock<Vec<u8>>,
}

impl MemStob {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the whole object
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl Stob for MemStob {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.read();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::storage(format!("offset {offset} out of range")))?;
        let end = start + bytes.len();
        let mut data = self.data.write();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }
}

/// Stob backed by a regular file
pub struct FileStob {
    file: Mutex<File>,
    path: PathBuf,
}

impl FileStob {
    /// Open an existing file for reading and writing
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::storage(format!("failed to open {}: {e}", path.display())))?;
        Ok(Self::from_file(file, path))
    }

    /// Open a file read-only, for dump tools
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::storage(format!("failed to open {}: {e}", path.display())))?;
        Ok(Self::from_file(file, path))
    }

    /// Open a file, creating it if missing
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::storage(format!("failed to create {}: {e}", path.display())))?;
        Ok(Self::from_file(file, path))
    }

    fn from_file(file: File, path: &Path) -> Self {
        Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Stob for FileStob {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut done = 0;
        while done < buf.len() {
            match file.read(&mut buf[done..])? {
                0 => break,
                n => done += n,
            }
        }
        Ok(done)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}

struct StobState {
    /// Image of the segment being filled
    buf: Vec<u8>,
    /// Record under assembly
    scratch: Vec<u64>,
    /// Next free byte in `buf`
    pos: usize,
    rec_nr: u32,
    persisted_rec_nr: u32,
    /// Sequence number of the next segment write
    seq: u64,
    /// Stob offset of the segment being filled
    offset: u64,
    last_persist: Instant,
}

impl StobState {
    fn append_scratch(&mut self, words: usize) {
        let start = self.pos;
        for (chunk, word) in self.buf[start..start + words * WORD_SIZE]
            .chunks_exact_mut(WORD_SIZE)
            .zip(&self.scratch[..words])
        {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        self.pos += words * WORD_SIZE;
        self.rec_nr += 1;
    }

    const fn is_dirty(&self) -> bool {
        self.rec_nr != self.persisted_rec_nr
    }
}

/// Room for one record in the current segment; holds the sink lock
pub struct SegmentSlot<'a> {
    state: MutexGuard<'a, StobState>,
    words: usize,
}

impl SegmentSlot<'_> {
    pub fn words_mut(&mut self) -> &mut [u64] {
        let words = self.words;
        &mut self.state.scratch[..words]
    }

    #[must_use]
    pub fn words(&self) -> &[u64] {
        &self.state.scratch[..self.words]
    }
}

/// Sink appending records to segments of a stob
pub struct StorageSink {
    stob: Arc<dyn Stob>,
    segsize: usize,
    seg_nr: u64,
    timeout: Duration,
    state: Mutex<StobState>,
}

impl StorageSink {
    /// Open a repository, continuing after the most recently written
    /// segment
    pub fn open(stob: Arc<dyn Stob>, config: &StobSinkConfig) -> Result<Self> {
        config.validate()?;
        let segsize = config.segment_size as usize;
        let seg_nr = config.segment_count();
        let (seq, offset) = recover(stob.as_ref(), config.segment_size, seg_nr)?;
        info!(
            "Storage sink opened: {seg_nr} segments of {segsize} bytes, next seq {seq} at {offset}"
        );

        Ok(Self {
            stob,
            segsize,
            seg_nr,
            timeout: Duration::from_millis(config.timeout_ms),
            state: Mutex::new(StobState {
                buf: vec![0; segsize],
                scratch: Vec::new(),
                pos: HEADER_SIZE,
                rec_nr: 0,
                persisted_rec_nr: 0,
                seq,
                offset,
                last_persist: Instant::now(),
            }),
        })
    }

    /// Write out any records not yet persisted
    pub fn flush(&self) {
        let mut state = self.state.lock();
        if state.is_dirty() {
            self.persist(&mut state);
        }
    }

    /// Append every record of an RPC batch payload; returns the number of
    /// records stored
    pub fn save_batch(&self, payload: &[u8]) -> Result<usize> {
        let records = decode_batch(payload)?;
        let mut saved = 0;
        for rec in &records {
            let Some(mut slot) = self.rec_alloc(rec.encoded_len()) else {
                continue;
            };
            rec.encode_into(slot.words_mut());
            self.save(slot);
            saved += 1;
        }
        if saved < records.len() {
            warn!("Stored {saved} of {} batch records", records.len());
        }
        Ok(saved)
    }

    /// Sequence number the next segment write will carry
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.state.lock().seq
    }

    /// Stob offset of the segment being filled
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.state.lock().offset
    }

    /// Records accepted but not yet written to the stob
    #[must_use]
    pub fn unpersisted(&self) -> u32 {
        let state = self.state.lock();
        state.rec_nr - state.persisted_rec_nr
    }

    #[must_use]
    pub const fn segment_count(&self) -> u64 {
        self.seg_nr
    }

    fn persist(&self, state: &mut StobState) {
        let seq = state.seq;
        let segsize = self.segsize;
        state.buf[..HEADER_SIZE].copy_from_slice(&SegmentHeader::new(seq, segsize as u32).encode());
        state.buf[segsize - TRAILER_SIZE..]
            .copy_from_slice(&SegmentTrailer::new(seq, state.rec_nr).encode());

        // the records stay buffered even if the write fails
        match self.stob.write_at(state.offset, &state.buf) {
            Ok(()) => debug!(
                "Persisted segment {seq} at {}: {} records",
                state.offset, state.rec_nr
            ),
            Err(e) => error!("Failed to write segment {seq} at {}: {e}", state.offset),
        }
        state.seq += 1;
        state.persisted_rec_nr = state.rec_nr;
        state.last_persist = Instant::now();
    }

    fn advance(&self, state: &mut StobState) {
        state.offset = (state.offset + self.segsize as u64) % (self.seg_nr * self.segsize as u64);
        state.buf.fill(0);
        state.pos = HEADER_SIZE;
        state.rec_nr = 0;
        state.persisted_rec_nr = 0;
    }
}

impl RecordSink for StorageSink {
    fn rec_alloc(&self, len: usize) -> Option<RecordSlot<'_>> {
        let words = len.div_ceil(WORD_SIZE);
        let bytes = words * WORD_SIZE;
        let limit = self.segsize - TRAILER_SIZE;
        if bytes > limit - HEADER_SIZE {
            warn!(
                "Dropping a {len} byte record: segments hold at most {} bytes",
                limit - HEADER_SIZE
            );
            return None;
        }

        let mut state = self.state.lock();
        if state.pos + bytes > limit {
            if state.is_dirty() {
                self.persist(&mut state);
            }
            self.advance(&mut state);
        }
        state.scratch.clear();
        state.scratch.resize(words, 0);
        Some(RecordSlot::Segment(SegmentSlot { state, words }))
    }

    fn save(&self, slot: RecordSlot<'_>) {
        match slot {
            RecordSlot::Segment(mut slot) => {
                let words = slot.words;
                slot.state.append_scratch(words);
            }
            _ => debug!("storage sink given a foreign slot, record dropped"),
        }
    }

    fn skulk(&self) {
        let mut state = self.state.lock();
        if state.is_dirty() && state.last_persist.elapsed() >= self.timeout {
            self.persist(&mut state);
        }
    }
}

impl Drop for StorageSink {
    fn drop(&mut self) {
        self.flush();
        if let Err(e) = self.stob.sync() {
            error!("Failed to sync storage sink: {e}");
        }
    }
}

/// Header at `offset`; `None` for unwritten or unreadable space
fn read_header(stob: &dyn Stob, offset: u64) -> Result<Option<SegmentHeader>> {
    let mut buf = [0u8; HEADER_SIZE];
    if stob.read_at(offset, &mut buf)? < HEADER_SIZE {
        return Ok(None);
    }
    let header = SegmentHeader::decode(&buf)?;
    Ok((!header.is_zero()).then_some(header))
}

/// Locate the write position after the newest segment: returns the next
/// sequence number and the offset to write at.
///
/// Writes proceed round-robin, so segments `0..=k` form the newest run and
/// carry sequence numbers at least that of segment 0; the rest are older or
/// unwritten. Bisect for `k`.
fn recover(stob: &dyn Stob, segsize: u32, seg_nr: u64) -> Result<(u64, u64)> {
    let Some(first) = read_header(stob, 0)? else {
        return Ok((1, 0));
    };
    first.validate(Some(segsize))?;
    let first_seq = first.seq_nr;

    let seq_at = |idx: u64| -> Result<u64> {
        Ok(read_header(stob, idx * u64::from(segsize))?
            .filter(|h| h.validate(Some(segsize)).is_ok())
            .map_or(0, |h| h.seq_nr))
    };

    let mut lo = 0;
    let mut seq_lo = first_seq;
    let mut hi = seg_nr - 1;
    if hi == 0 {
        return Ok((first_seq + 1, 0));
    }
    let seq_hi = seq_at(hi)?;
    if seq_hi >= first_seq {
        return Ok((seq_hi + 1, 0));
    }
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        let seq_mid = seq_at(mid)?;
        if seq_mid >= first_seq {
            lo = mid;
            seq_lo = seq_mid;
        } else {
            hi = mid;
        }
    }
    Ok((seq_lo + 1, (lo + 1) * u64::from(segsize)))
}
