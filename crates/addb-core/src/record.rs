//! Wire record format
//!
//! A record is a run of little-endian 64-bit words:
//!
//! ```text
//! record_id | timestamp | ctx_count | (depth | ids[depth]) * ctx_count | field_count | fields
//! ```
//!
//! The layout is self-delimiting, so records can be packed back to back in
//! segments and RPC payloads.

use addb_common::{Error, RecordId, Result, WORD_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

/// Header of an RPC batch payload: record count (u32) + reserved (u32)
pub const BATCH_HEADER_SIZE: usize = 8;

/// Smallest encoded record: rid, timestamp, ctx_count, field_count
pub const MIN_RECORD_WORDS: usize = 4;

/// Words needed to encode a record with the given context depths and field
/// count
#[must_use]
pub fn encoded_words(depths: impl IntoIterator<Item = usize>, field_count: usize) -> usize {
    let (nctx, ids) = depths
        .into_iter()
        .fold((0usize, 0usize), |(n, sum), d| (n + 1, sum + d));
    // rid, timestamp, ctx_count, one depth word per context, field_count
    MIN_RECORD_WORDS + nctx + ids + field_count
}

/// Fully assembled diagnostic record
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WireRecord {
    pub rid: RecordId,
    pub timestamp: u64,
    pub contexts: Vec<Vec<u64>>,
    pub fields: Vec<u64>,
}

impl WireRecord {
    /// Encoded length in words
    #[must_use]
    pub fn encoded_words(&self) -> usize {
        encoded_words(self.contexts.iter().map(Vec::len), self.fields.len())
    }

    /// Encoded length in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.encoded_words() * WORD_SIZE
    }

    /// Encode into `out`, which must be exactly [`Self::encoded_words`] long
    pub fn encode_into(&self, out: &mut [u64]) {
        let mut w = WordWriter::new(out);
        w.push(self.rid.as_u64());
        w.push(self.timestamp);
        w.push(self.contexts.len() as u64);
        for path in &self.contexts {
            w.push(path.len() as u64);
            w.extend(path);
        }
        w.push(self.fields.len() as u64);
        w.extend(&self.fields);
        debug_assert!(w.is_full());
    }

    /// Encode into a fresh word vector
    #[must_use]
    pub fn encode(&self) -> Vec<u64> {
        let mut words = vec![0; self.encoded_words()];
        self.encode_into(&mut words);
        words
    }

    /// Decode one record from the front of `words`; returns the record and
    /// the number of words consumed
    pub fn decode(words: &[u64]) -> Result<(Self, usize)> {
        let mut r = WordReader::new(words);
        let rid = RecordId::from_raw(r.word()?);
        let timestamp = r.word()?;
        let nctx = r.len()?;
        let mut contexts = Vec::with_capacity(nctx);
        for _ in 0..nctx {
            let depth = r.len()?;
            if depth == 0 {
                return Err(Error::invalid_format("context path of depth 0"));
            }
            contexts.push(r.words(depth)?.to_vec());
        }
        let nfields = r.len()?;
        let fields = r.words(nfields)?.to_vec();

        Ok((
            Self {
                rid,
                timestamp,
                contexts,
                fields,
            },
            r.pos,
        ))
    }

    /// Whether this is an event (exception, data point, counter or
    /// sequence)
    #[must_use]
    pub fn is_event(&self) -> bool {
        self.rid.kind().is_some_and(addb_common::BaseKind::is_event)
    }

    /// Whether this is a context definition
    #[must_use]
    pub fn is_context_definition(&self) -> bool {
        self.rid.kind() == Some(addb_common::BaseKind::ContextDef)
    }
}

/// Sequential writer over a word slice
pub(crate) struct WordWriter<'a> {
    out: &'a mut [u64],
    pos: usize,
}

impl<'a> WordWriter<'a> {
    pub(crate) const fn new(out: &'a mut [u64]) -> Self {
        Self { out, pos: 0 }
    }

    pub(crate) fn push(&mut self, word: u64) {
        self.out[self.pos] = word;
        self.pos += 1;
    }

    pub(crate) fn extend(&mut self, words: &[u64]) {
        self.out[self.pos..self.pos + words.len()].copy_from_slice(words);
        self.pos += words.len();
    }

    /// Hand out the next `n` words for the caller to fill
    pub(crate) fn reserve(&mut self, n: usize) -> &mut [u64] {
        let start = self.pos;
        self.pos += n;
        &mut self.out[start..self.pos]
    }

    pub(crate) const fn is_full(&self) -> bool {
        self.pos == self.out.len()
    }
}

struct WordReader<'a> {
    words: &'a [u64],
    pos: usize,
}

impl<'a> WordReader<'a> {
    const fn new(words: &'a [u64]) -> Self {
        Self { words, pos: 0 }
    }

    fn word(&mut self) -> Result<u64> {
        Ok(self.words(1)?[0])
    }

    fn len(&mut self) -> Result<usize> {
        let n = self.word()?;
        usize::try_from(n)
            .ok()
            .filter(|&n| n <= self.words.len() - self.pos)
            .ok_or_else(|| Error::invalid_format(format!("length {n} exceeds record")))
    }

    fn words(&mut self, n: usize) -> Result<&'a [u64]> {
        let end = self.pos + n;
        if end > self.words.len() {
            return Err(Error::invalid_format(format!(
                "record truncated at word {}",
                self.words.len()
            )));
        }
        let out = &self.words[self.pos..end];
        self.pos = end;
        Ok(out)
    }
}

/// Append words to a byte buffer in little-endian order
pub fn put_words(buf: &mut impl BufMut, words: &[u64]) {
    for &w in words {
        buf.put_u64_le(w);
    }
}

/// Convert little-endian bytes to words; `bytes.len()` must be a multiple
/// of the word size
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u64>> {
    if bytes.len() % WORD_SIZE != 0 {
        return Err(Error::invalid_format(format!(
            "{} bytes is not a whole number of words",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(WORD_SIZE)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

/// Builder for the payload of one outbound RPC item
pub struct BatchBuilder {
    buf: BytesMut,
    count: u32,
}

impl BatchBuilder {
    #[must_use]
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(BATCH_HEADER_SIZE);
        buf.put_u64_le(0);
        Self { buf, count: 0 }
    }

    /// Append one encoded record
    pub fn push(&mut self, words: &[u64]) {
        put_words(&mut self.buf, words);
        self.count += 1;
    }

    /// Payload size so far, header included
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Seal the payload
    #[must_use]
    pub fn finish(mut self) -> Bytes {
        self.buf[..4].copy_from_slice(&self.count.to_le_bytes());
        self.buf.freeze()
    }
}

impl Default for BatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode `count` records packed back to back at the front of `words`;
/// returns the records and the number of words consumed
pub fn decode_records(words: &[u64], count: usize) -> Result<(Vec<WireRecord>, usize)> {
    if count > words.len() / MIN_RECORD_WORDS {
        return Err(Error::invalid_format(format!(
            "{count} records cannot fit in {} words",
            words.len()
        )));
    }
    let mut records = Vec::with_capacity(count);
    let mut pos = 0;
    for i in 0..count {
        let (rec, used) = WireRecord::decode(&words[pos..])
            .map_err(|e| Error::invalid_format(format!("record {i}: {e}")))?;
        records.push(rec);
        pos += used;
    }
    Ok((records, pos))
}

/// Decode every record of an RPC batch payload
pub fn decode_batch(payload: &[u8]) -> Result<Vec<WireRecord>> {
    if payload.len() < BATCH_HEADER_SIZE {
        return Err(Error::invalid_format("batch payload shorter than header"));
    }
    let count = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
    let words = words_from_bytes(&payload[BATCH_HEADER_SIZE..])?;

    let (records, pos) = decode_records(&words, count)?;
    if pos != words.len() {
        return Err(Error::invalid_format(format!(
            "{} trailing words after {count} records",
            words.len() - pos
        )));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use addb_common::BaseKind;

    fn sample() -> WireRecord {
        WireRecord {
            rid: RecordId::new(BaseKind::DataPoint, 42),
            timestamp: 1_700_000_000,
            contexts: vec![vec![9, 1, 3], vec![9, 2]],
            fields: vec![512, 17],
        }
    }

    #[test]
    fn test_encoded_layout() {
        let rec = sample();
        assert_eq!(rec.encoded_words(), 4 + 2 + 5 + 2);
        assert_eq!(
            rec.encode(),
            vec![(2u64 << 32) | 42, 1_700_000_000, 2, 3, 9, 1, 3, 2, 9, 2, 2, 512, 17]
        );
        assert!(rec.is_event());
        assert!(!rec.is_context_definition());
    }

    #[test]
    fn test_decode_consumes_one_record() {
        let a = sample();
        let mut b = sample();
        b.rid = RecordId::new(BaseKind::ContextDef, 3);
        b.fields.clear();

        let mut words = a.encode();
        words.extend(b.encode());

        let (first, used) = WireRecord::decode(&words).unwrap();
        assert_eq!(first, a);
        let (second, rest) = WireRecord::decode(&words[used..]).unwrap();
        assert_eq!(second, b);
        assert_eq!(used + rest, words.len());
        assert!(second.is_context_definition());
    }

    #[test]
    fn test_decode_truncated() {
        let words = sample().encode();
        assert!(WireRecord::decode(&words[..words.len() - 1]).is_err());
        assert!(WireRecord::decode(&[]).is_err());
        // Absurd context count
        assert!(WireRecord::decode(&[1, 2, u64::MAX]).is_err());
    }

    #[test]
    fn test_batch_payload() {
        let rec = sample();
        let mut batch = BatchBuilder::new();
        assert!(batch.is_empty());
        batch.push(&rec.encode());
        batch.push(&rec.encode());
        assert_eq!(batch.len(), BATCH_HEADER_SIZE + 2 * rec.encoded_len());

        let payload = batch.finish();
        assert_eq!(&payload[..4], &2u32.to_le_bytes());
        let records = decode_batch(&payload).unwrap();
        assert_eq!(records, vec![rec.clone(), rec]);
    }

    #[test]
    fn test_batch_rejects_trailing_garbage() {
        let mut batch = BatchBuilder::new();
        batch.push(&sample().encode());
        let mut payload = batch.finish().to_vec();
        payload.extend_from_slice(&[0u8; 8]);
        assert!(decode_batch(&payload).is_err());
        assert!(decode_batch(&payload[..3]).is_err());
    }

    #[test]
    fn test_batch_count_larger_than_payload() {
        let mut payload = vec![0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0];
        payload.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_batch(&payload),
            Err(Error::InvalidFormat(_))
        ));

        let words = sample().encode();
        assert!(decode_records(&words, 4).is_err());
        let (recs, used) = decode_records(&words, 1).unwrap();
        assert_eq!(recs, vec![sample()]);
        assert_eq!(used, words.len());
    }
}
