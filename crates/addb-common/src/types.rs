//! Core types for ADDB
//!
//! Base record kinds and the 64-bit record identifier that travels in
//! every wire record.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of one record word in bytes
pub const WORD_SIZE: usize = 8;

/// Base kind of a record type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum BaseKind {
    /// Exception: unusual condition, mirrored to the system log
    Exception = 1,
    /// Data point: a set of named values sampled at one instant
    DataPoint = 2,
    /// Counter: accumulated statistics with optional histogram
    Counter = 3,
    /// Sequence: variable-length array of values
    Sequence = 4,
    /// Context definition: announces a new context object
    ContextDef = 5,
}

impl BaseKind {
    /// Kind name as printed by tooling
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exception => "exception",
            Self::DataPoint => "data-point",
            Self::Counter => "counter",
            Self::Sequence => "sequence",
            Self::ContextDef => "context-def",
        }
    }

    /// Whether records of this kind are events (as opposed to context
    /// definitions)
    #[must_use]
    pub const fn is_event(self) -> bool {
        !matches!(self, Self::ContextDef)
    }
}

impl TryFrom<u32> for BaseKind {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Exception),
            2 => Ok(Self::DataPoint),
            3 => Ok(Self::Counter),
            4 => Ok(Self::Sequence),
            5 => Ok(Self::ContextDef),
            _ => Err(crate::Error::invalid_format(format!(
                "invalid base kind: {value}"
            ))),
        }
    }
}

impl fmt::Display for BaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record identifier: base kind in the high 32 bits, record type or
/// context type id in the low 32 bits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(u64);

impl RecordId {
    /// Build an identifier from a base kind and a type id
    #[must_use]
    pub const fn new(kind: BaseKind, type_id: u32) -> Self {
        Self(((kind as u64) << 32) | type_id as u64)
    }

    /// Wrap a raw identifier read from the wire
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw 64-bit value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Base kind, if the high bits name a known kind
    #[must_use]
    pub fn kind(self) -> Option<BaseKind> {
        BaseKind::try_from((self.0 >> 32) as u32).ok()
    }

    /// Record type or context type id
    #[must_use]
    pub const fn type_id(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{kind}:{}", self.type_id()),
            None => write!(f, "{:#018x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_layout() {
        let rid = RecordId::new(BaseKind::Counter, 0x1234);
        assert_eq!(rid.as_u64(), (3u64 << 32) | 0x1234);
        assert_eq!(rid.kind(), Some(BaseKind::Counter));
        assert_eq!(rid.type_id(), 0x1234);
        assert_eq!(rid.to_string(), "counter:4660");
    }

    #[test]
    fn test_record_id_unknown_kind() {
        let rid = RecordId::from_raw(99u64 << 32);
        assert_eq!(rid.kind(), None);
        assert_eq!(rid.type_id(), 0);
    }

    #[test]
    fn test_base_kind_event() {
        assert!(BaseKind::Exception.is_event());
        assert!(BaseKind::Sequence.is_event());
        assert!(!BaseKind::ContextDef.is_event());
        assert!(BaseKind::try_from(0).is_err());
    }
}
