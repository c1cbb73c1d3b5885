//! Transient store
//!
//! A page-based slab allocator that stages encoded records in memory until
//! a consumer drains them. Each page carries a bitmap with one bit per
//! word: 0 = free, 1 = used.
//!
//! The store is not self-synchronizing. Owners wrap it in a mutex.

use addb_common::config::TransientStoreConfig;
use addb_common::{Error, Result, WORD_SIZE};
use std::collections::VecDeque;

/// Header of a chunk carved out of the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TsRecord {
    page: u32,
    word: u32,
    words: u32,
}

impl TsRecord {
    /// Page index
    #[must_use]
    pub const fn page(&self) -> usize {
        self.page as usize
    }

    /// First word within the page
    #[must_use]
    pub const fn word(&self) -> usize {
        self.word as usize
    }

    /// Length in words
    #[must_use]
    pub const fn words(&self) -> usize {
        self.words as usize
    }

    /// Length in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        self.words as usize * WORD_SIZE
    }
}

struct Page {
    words: Vec<u64>,
    bitmap: Vec<u8>,
}

impl Page {
    fn try_new(nr_words: usize) -> Result<Self> {
        let mut words = Vec::new();
        words
            .try_reserve_exact(nr_words)
            .map_err(|_| Error::OutOfMemory {
                requested: nr_words * WORD_SIZE,
            })?;
        words.resize(nr_words, 0);

        let map_bytes = nr_words.div_ceil(8);
        let mut bitmap = Vec::new();
        bitmap
            .try_reserve_exact(map_bytes)
            .map_err(|_| Error::OutOfMemory {
                requested: map_bytes,
            })?;
        bitmap.resize(map_bytes, 0);

        Ok(Self { words, bitmap })
    }

    fn is_set(&self, word: usize) -> bool {
        self.bitmap[word / 8] & (1 << (word % 8)) != 0
    }

    fn set(&mut self, word: usize) {
        self.bitmap[word / 8] |= 1 << (word % 8);
    }

    fn clear(&mut self, word: usize) {
        self.bitmap[word / 8] &= !(1 << (word % 8));
    }

    /// First run of `count` free words at or after `start`
    fn find_free_run(&self, start: usize, count: usize) -> Option<usize> {
        let mut run_start = start;
        let mut run_len = 0usize;

        for word in start..self.words.len() {
            if self.is_set(word) {
                run_start = word + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
        }

        None
    }

    fn used_words(&self) -> usize {
        self.bitmap.iter().map(|b| b.count_ones() as usize).sum()
    }
}

/// Page-based staging allocator with a FIFO ready list
pub struct TransientStore {
    pages: Vec<Page>,
    max_pages: usize,
    words_per_page: usize,
    /// Page and word where the next allocation scan starts
    cursor: (usize, usize),
    ready: VecDeque<TsRecord>,
}

impl TransientStore {
    /// Create a store with `init_pages` zeroed pages
    pub fn new(config: &TransientStoreConfig) -> Result<Self> {
        config.validate()?;
        let mut store = Self {
            pages: Vec::new(),
            max_pages: config.max_pages,
            words_per_page: config.words_per_page(),
            cursor: (0, 0),
            ready: VecDeque::new(),
        };
        store.extend(config.init_pages)?;
        Ok(store)
    }

    /// Carve out `len` bytes (rounded up to whole words) of contiguous free
    /// space within one page.
    ///
    /// The scan starts at the rotating cursor and wraps across all pages
    /// once. Returns `None` if no run of that size exists; the caller may
    /// `extend` and retry.
    pub fn alloc(&mut self, len: usize) -> Option<TsRecord> {
        let count = len.div_ceil(WORD_SIZE);
        if count == 0 || count > self.words_per_page || self.pages.is_empty() {
            return None;
        }

        let npages = self.pages.len();
        let (first_page, first_word) = self.cursor;

        // The last step revisits the starting page from word 0.
        for step in 0..=npages {
            let pidx = (first_page + step) % npages;
            let start = if step == 0 { first_word } else { 0 };
            let Some(widx) = self.pages[pidx].find_free_run(start, count) else {
                continue;
            };

            let page = &mut self.pages[pidx];
            for word in widx..widx + count {
                page.set(word);
            }

            let end = widx + count;
            self.cursor = if end == self.words_per_page {
                ((pidx + 1) % npages, 0)
            } else {
                (pidx, end)
            };

            return Some(TsRecord {
                page: pidx as u32,
                word: widx as u32,
                words: count as u32,
            });
        }

        None
    }

    /// Grow the pool by `n` pages.
    ///
    /// Fails with [`Error::CapacityExceeded`] when the pool would exceed its
    /// maximum. On any failure the existing pages are left untouched.
    pub fn extend(&mut self, n: usize) -> Result<()> {
        let requested = self.pages.len() + n;
        if requested > self.max_pages {
            return Err(Error::CapacityExceeded {
                requested,
                max: self.max_pages,
            });
        }

        let mut batch = Vec::with_capacity(n);
        for _ in 0..n {
            batch.push(Page::try_new(self.words_per_page)?);
        }
        self.pages
            .try_reserve(n)
            .map_err(|_| Error::OutOfMemory {
                requested: n * self.page_size(),
            })?;
        self.pages.extend(batch);
        Ok(())
    }

    /// Append an allocated chunk to the ready list
    pub fn save(&mut self, rec: TsRecord) {
        self.ready.push_back(rec);
    }

    /// Remove and return the first ready chunk no larger than `max_len`
    /// bytes
    pub fn get(&mut self, max_len: usize) -> Option<TsRecord> {
        let idx = self.ready.iter().position(|r| r.size() <= max_len)?;
        self.ready.remove(idx)
    }

    /// Release a chunk's words back to the free pool
    pub fn free(&mut self, rec: TsRecord) -> Result<()> {
        let page = self
            .pages
            .get_mut(rec.page())
            .ok_or_else(|| Error::invalid_argument(format!("page {} out of range", rec.page)))?;
        let end = rec.word() + rec.words();
        if end > page.words.len() {
            return Err(Error::invalid_argument(format!(
                "chunk {}+{} exceeds page",
                rec.word, rec.words
            )));
        }
        if let Some(word) = (rec.word()..end).find(|&w| !page.is_set(w)) {
            return Err(Error::invalid_argument(format!(
                "word {word} of page {} is not allocated",
                rec.page
            )));
        }

        for word in rec.word()..end {
            page.clear(word);
        }
        Ok(())
    }

    /// Payload words of a chunk
    #[must_use]
    pub fn words(&self, rec: &TsRecord) -> &[u64] {
        &self.pages[rec.page()].words[rec.word()..rec.word() + rec.words()]
    }

    /// Mutable payload words of a chunk
    pub fn words_mut(&mut self, rec: &TsRecord) -> &mut [u64] {
        &mut self.pages[rec.page()].words[rec.word()..rec.word() + rec.words()]
    }

    /// Whether a chunk of `len` bytes could ever be allocated
    #[must_use]
    pub const fn fits_page(&self, len: usize) -> bool {
        len.div_ceil(WORD_SIZE) <= self.words_per_page
    }

    /// Current number of pages
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Maximum number of pages
    #[must_use]
    pub const fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Page size in bytes
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.words_per_page * WORD_SIZE
    }

    /// Number of words marked used across all pages
    #[must_use]
    pub fn used_words(&self) -> usize {
        self.pages.iter().map(Page::used_words).sum()
    }

    /// Whether a word is marked used
    #[must_use]
    pub fn is_word_used(&self, page: usize, word: usize) -> bool {
        self.pages.get(page).is_some_and(|p| p.is_set(word))
    }

    /// Number of chunks in the ready list
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Whether any chunk is waiting in the ready list
    #[must_use]
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Size in bytes of the first ready chunk
    #[must_use]
    pub fn first_ready_size(&self) -> Option<usize> {
        self.ready.front().map(TsRecord::size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn store(init: usize, max: usize, page_size: usize) -> TransientStore {
        TransientStore::new(&TransientStoreConfig {
            init_pages: init,
            max_pages: max,
            page_size,
        })
        .unwrap()
    }

    #[test]
    fn test_alloc_advances_cursor() {
        let mut ts = store(2, 2, 128); // 16 words per page

        let a = ts.alloc(40).unwrap();
        assert_eq!((a.page(), a.word(), a.words()), (0, 0, 5));
        let b = ts.alloc(8).unwrap();
        assert_eq!((b.page(), b.word()), (0, 5));

        // Exactly fills the rest of page 0; cursor moves to page 1.
        let c = ts.alloc(80).unwrap();
        assert_eq!((c.page(), c.word(), c.words()), (0, 6, 10));
        let d = ts.alloc(8).unwrap();
        assert_eq!((d.page(), d.word()), (1, 0));
        assert_eq!(ts.used_words(), 17);
    }

    #[test]
    fn test_alloc_rejects_oversized() {
        let mut ts = store(1, 1, 128);
        assert!(ts.alloc(0).is_none());
        assert!(ts.alloc(129).is_none());
        assert!(!ts.fits_page(136));
        assert!(ts.alloc(128).is_some());
    }

    #[test]
    fn test_alloc_wraps_after_free() {
        let mut ts = store(1, 1, 128);
        let a = ts.alloc(64).unwrap();
        let _b = ts.alloc(64).unwrap();
        assert!(ts.alloc(8).is_none());

        ts.free(a).unwrap();
        let c = ts.alloc(64).unwrap();
        assert_eq!((c.page(), c.word()), (0, 0));
    }

    #[test]
    fn test_free_unallocated_fails() {
        let mut ts = store(1, 1, 128);
        let a = ts.alloc(16).unwrap();
        ts.free(a).unwrap();
        assert!(ts.free(a).is_err());
        assert_eq!(ts.used_words(), 0);
    }

    #[test]
    fn test_extend_capacity() {
        let mut ts = store(2, 4, 128);
        let a = ts.alloc(24).unwrap();

        let err = ts.extend(3).unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded {
                requested: 5,
                max: 4
            }
        ));
        assert_eq!(ts.page_count(), 2);
        assert!(ts.is_word_used(a.page(), a.word()));
        assert_eq!(ts.used_words(), 3);

        ts.extend(2).unwrap();
        assert_eq!(ts.page_count(), 4);
        assert!(ts.extend(1).is_err());
        assert!(ts.extend(0).is_ok());
    }

    #[test]
    fn test_get_first_fit() {
        let mut ts = store(1, 1, 256);
        let big = ts.alloc(64).unwrap();
        let small = ts.alloc(16).unwrap();
        let medium = ts.alloc(32).unwrap();
        ts.save(big);
        ts.save(small);
        ts.save(medium);

        assert_eq!(ts.get(40), Some(small));
        assert_eq!(ts.get(40), Some(medium));
        assert_eq!(ts.get(40), None);
        assert_eq!(ts.ready_len(), 1);
        assert_eq!(ts.get(usize::MAX), Some(big));
        assert!(!ts.has_ready());
    }

    #[test]
    fn test_words_roundtrip_payload() {
        let mut ts = store(1, 1, 128);
        let rec = ts.alloc(24).unwrap();
        ts.words_mut(&rec).copy_from_slice(&[1, 2, 3]);
        assert_eq!(ts.words(&rec), &[1, 2, 3]);
    }

    #[test]
    fn test_conservation() {
        let mut rng = StdRng::seed_from_u64(0xadd8);
        let mut ts = store(2, 6, 256);
        let mut outstanding: Vec<TsRecord> = Vec::new();

        for _ in 0..2000 {
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let len = rng.gen_range(1..=96);
                    match ts.alloc(len) {
                        Some(rec) => {
                            ts.save(rec);
                            outstanding.push(rec);
                        }
                        None => {
                            let _ = ts.extend(1);
                        }
                    }
                }
                2 => {
                    if let Some(rec) = ts.get(rng.gen_range(8..=96)) {
                        ts.free(rec).unwrap();
                        outstanding.retain(|r| *r != rec);
                    }
                }
                _ => {
                    if let Some(rec) = ts.get(usize::MAX) {
                        ts.save(rec);
                    }
                }
            }

            let expected: usize = outstanding.iter().map(TsRecord::words).sum();
            assert_eq!(ts.used_words(), expected);
        }

        // No two outstanding chunks share a word.
        let mut seen = std::collections::HashSet::new();
        for rec in &outstanding {
            for word in rec.word()..rec.word() + rec.words() {
                assert!(seen.insert((rec.page(), word)));
                assert!(ts.is_word_used(rec.page(), word));
            }
        }
    }
}
