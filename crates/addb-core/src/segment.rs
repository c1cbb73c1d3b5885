//! Repository segment format
//!
//! ```text
//! +-----------------------------+
//! | seq_nr u64 | ver u32 | size u32 |  header
//! +-----------------------------+
//! | records, back to back       |
//! | zero padding                |
//! +-----------------------------+
//! | seq_nr u64 | rec_nr u32 | 0 u32 |  trailer
//! +-----------------------------+
//! ```
//!
//! All integers are little-endian. A segment is valid when the header and
//! trailer carry the same nonzero sequence number.

use addb_common::{Error, Result};

pub const SEGMENT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 16;
pub const TRAILER_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentHeader {
    pub seq_nr: u64,
    pub ver_nr: u32,
    pub segsize: u32,
}

impl SegmentHeader {
    #[must_use]
    pub const fn new(seq_nr: u64, segsize: u32) -> Self {
        Self {
            seq_nr,
            ver_nr: SEGMENT_VERSION,
            segsize,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(&self.seq_nr.to_le_bytes());
        out[8..12].copy_from_slice(&self.ver_nr.to_le_bytes());
        out[12..16].copy_from_slice(&self.segsize.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::invalid_format("segment header too short"));
        }
        Ok(Self {
            seq_nr: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            ver_nr: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            segsize: u32::from_le_bytes(data[12..16].try_into().unwrap()),
        })
    }

    /// Never-written space
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.seq_nr == 0 && self.ver_nr == 0 && self.segsize == 0
    }

    /// Check version, sequence number and, when known, the segment size
    pub fn validate(&self, segsize: Option<u32>) -> Result<()> {
        if self.ver_nr != SEGMENT_VERSION {
            return Err(Error::invalid_format(format!(
                "segment version {} (expected {SEGMENT_VERSION})",
                self.ver_nr
            )));
        }
        if self.seq_nr == 0 {
            return Err(Error::invalid_format("segment sequence number is zero"));
        }
        match segsize {
            Some(size) if size != self.segsize => Err(Error::invalid_format(format!(
                "segment size {} in a repository of {size} byte segments",
                self.segsize
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentTrailer {
    pub seq_nr: u64,
    pub rec_nr: u32,
    pub reserved: u32,
}

impl SegmentTrailer {
    #[must_use]
    pub const fn new(seq_nr: u64, rec_nr: u32) -> Self {
        Self {
            seq_nr,
            rec_nr,
            reserved: 0,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; TRAILER_SIZE] {
        let mut out = [0u8; TRAILER_SIZE];
        out[0..8].copy_from_slice(&self.seq_nr.to_le_bytes());
        out[8..12].copy_from_slice(&self.rec_nr.to_le_bytes());
        out[12..16].copy_from_slice(&self.reserved.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < TRAILER_SIZE {
            return Err(Error::invalid_format("segment trailer too short"));
        }
        Ok(Self {
            seq_nr: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            rec_nr: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            reserved: u32::from_le_bytes(data[12..16].try_into().unwrap()),
        })
    }

    /// Whether this trailer closes the segment opened by `header`
    #[must_use]
    pub const fn matches(&self, header: &SegmentHeader) -> bool {
        self.seq_nr != 0 && self.seq_nr == header.seq_nr
    }
}
