//! Reading records back from a repository
//!
//! Segments are visited in storage order. Unwritten space ends the walk; a
//! segment that was only partly written (trailer does not match header) is
//! skipped silently; a segment with a corrupt header is reported and the
//! walk continues with the next one.

use crate::record::{WireRecord, decode_records, words_from_bytes};
use crate::registry::Registry;
use crate::segment::{HEADER_SIZE, SegmentHeader, SegmentTrailer, TRAILER_SIZE};
use crate::sink::Stob;
use addb_common::config::StobSinkConfig;
use addb_common::{BaseKind, Error, Result};
use std::collections::VecDeque;
use tracing::debug;

/// Segment size recorded in the repository's first header, `None` for an
/// empty repository
pub fn segment_size_of(stob: &dyn Stob) -> Result<Option<u32>> {
    let mut buf = [0u8; HEADER_SIZE];
    if stob.read_at(0, &mut buf)? < HEADER_SIZE {
        return Ok(None);
    }
    let header = SegmentHeader::decode(&buf)?;
    if header.is_zero() {
        return Ok(None);
    }
    header.validate(None)?;
    if header.segsize < StobSinkConfig::MIN_SEGMENT_SIZE
        || header.segsize as usize % addb_common::WORD_SIZE != 0
    {
        return Err(Error::invalid_format(format!(
            "unusable segment size {}",
            header.segsize
        )));
    }
    Ok(Some(header.segsize))
}

/// One valid segment
#[derive(Debug)]
pub struct Segment {
    pub offset: u64,
    pub header: SegmentHeader,
    pub trailer: SegmentTrailer,
    data: Vec<u8>,
}

impl Segment {
    /// Decode the segment's records
    pub fn records(&self) -> Result<Vec<WireRecord>> {
        let body = &self.data[HEADER_SIZE..self.data.len() - TRAILER_SIZE];
        let words = words_from_bytes(body)?;
        let (records, _) = decode_records(&words, self.trailer.rec_nr as usize).map_err(|e| {
            Error::invalid_format(format!("segment {}: {e}", self.header.seq_nr))
        })?;
        Ok(records)
    }
}

/// Iterator over the valid segments of a repository
pub struct SegmentIter<'a> {
    stob: &'a dyn Stob,
    segsize: u32,
    offset: u64,
    done: bool,
}

impl<'a> SegmentIter<'a> {
    pub fn new(stob: &'a dyn Stob) -> Result<Self> {
        let segsize = segment_size_of(stob)?;
        Ok(Self {
            stob,
            segsize: segsize.unwrap_or_default(),
            offset: 0,
            done: segsize.is_none(),
        })
    }

    /// Segment size of the repository, 0 when empty
    #[must_use]
    pub const fn segment_size(&self) -> u32 {
        self.segsize
    }

    fn read_next(&mut self) -> Result<Option<Segment>> {
        let mut data = vec![0u8; self.segsize as usize];
        let offset = self.offset;
        let n = self.stob.read_at(offset, &mut data)?;
        self.offset += u64::from(self.segsize);
        if n < data.len() {
            self.done = true;
            return Ok(None);
        }

        let header = SegmentHeader::decode(&data)?;
        if header.is_zero() {
            self.done = true;
            return Ok(None);
        }
        header
            .validate(Some(self.segsize))
            .map_err(|e| Error::invalid_format(format!("segment at {offset}: {e}")))?;
        let trailer = SegmentTrailer::decode(&data[data.len() - TRAILER_SIZE..])?;

        Ok(Some(Segment {
            offset,
            header,
            trailer,
            data,
        }))
    }
}

impl Iterator for SegmentIter<'_> {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.read_next() {
                Ok(Some(seg)) if seg.trailer.matches(&seg.header) && seg.trailer.rec_nr > 0 => {
                    return Some(Ok(seg));
                }
                Ok(Some(seg)) => debug!(
                    "Skipping segment at {}: header seq {}, trailer seq {}, {} records",
                    seg.offset, seg.header.seq_nr, seg.trailer.seq_nr, seg.trailer.rec_nr
                ),
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

/// Which records a cursor yields
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CursorFilter {
    /// Exception, data point, counter and sequence records
    Events,
    /// Context definitions
    Contexts,
    #[default]
    All,
}

impl CursorFilter {
    #[must_use]
    pub fn matches(self, rec: &WireRecord) -> bool {
        match self {
            Self::Events => rec.is_event(),
            Self::Contexts => rec.is_context_definition(),
            Self::All => true,
        }
    }
}

/// Record-by-record walk over a repository
pub struct Cursor<'a> {
    segments: SegmentIter<'a>,
    filter: CursorFilter,
    pending: VecDeque<WireRecord>,
}

impl<'a> Cursor<'a> {
    pub fn new(stob: &'a dyn Stob, filter: CursorFilter) -> Result<Self> {
        Ok(Self {
            segments: SegmentIter::new(stob)?,
            filter,
            pending: VecDeque::new(),
        })
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<WireRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(rec) = self.pending.pop_front() {
                return Some(Ok(rec));
            }
            let records = match self.segments.next()? {
                Ok(seg) => seg.records(),
                Err(e) => Err(e),
            };
            match records {
                Ok(records) => {
                    let filter = self.filter;
                    self.pending
                        .extend(records.into_iter().filter(|r| filter.matches(r)));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Name of the record type or context type a record refers to
#[must_use]
pub fn type_name(registry: &Registry, rec: &WireRecord) -> Option<String> {
    let id = rec.rid.type_id();
    match rec.rid.kind()? {
        BaseKind::ContextDef => registry
            .lookup_context_type(id)
            .map(|ct| ct.name().to_string()),
        _ => registry
            .lookup_record_type(id)
            .map(|rt| rt.name().to_string()),
    }
}
