//! Record type and context type registry
//!
//! Descriptors are built at module-init time, registered once, and live
//! for the rest of the process. Both tables share one lock.

use addb_common::{BaseKind, Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Hash buckets per table
const REGISTRY_BUCKETS: usize = 31;

/// Field layout of a record type
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldLayout {
    /// Named fields (exception and data-point kinds)
    Named(Vec<String>),
    /// Histogram bucket bounds (counter kind); may be empty
    Buckets(Vec<u64>),
    /// Variable-length payload (sequence kind)
    Sequence,
}

/// Immutable description of a record class
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordType {
    id: u32,
    name: String,
    kind: BaseKind,
    layout: FieldLayout,
}

impl RecordType {
    /// Exception record type with the given field names
    pub fn exception(id: u32, name: impl Into<String>, fields: &[&str]) -> Self {
        Self::named(BaseKind::Exception, id, name, fields)
    }

    /// Data-point record type with the given field names
    pub fn data_point(id: u32, name: impl Into<String>, fields: &[&str]) -> Self {
        Self::named(BaseKind::DataPoint, id, name, fields)
    }

    /// Counter record type; `buckets` are the histogram bounds, empty for
    /// no histogram
    pub fn counter(id: u32, name: impl Into<String>, buckets: &[u64]) -> Self {
        Self {
            id,
            name: name.into(),
            kind: BaseKind::Counter,
            layout: FieldLayout::Buckets(buckets.to_vec()),
        }
    }

    /// Sequence record type
    pub fn sequence(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: BaseKind::Sequence,
            layout: FieldLayout::Sequence,
        }
    }

    fn named(kind: BaseKind, id: u32, name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            layout: FieldLayout::Named(fields.iter().map(|f| (*f).to_string()).collect()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn kind(&self) -> BaseKind {
        self.kind
    }

    #[must_use]
    pub const fn layout(&self) -> &FieldLayout {
        &self.layout
    }

    /// Field names, empty unless the kind is exception or data point
    #[must_use]
    pub fn field_names(&self) -> &[String] {
        match &self.layout {
            FieldLayout::Named(names) => names,
            _ => &[],
        }
    }

    /// Histogram bounds, empty unless the kind is counter
    #[must_use]
    pub fn buckets(&self) -> &[u64] {
        match &self.layout {
            FieldLayout::Buckets(bounds) => bounds,
            _ => &[],
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id == 0 || self.name.is_empty() {
            return Err(Error::invalid_descriptor(format!(
                "record type '{}' needs a name and a nonzero id",
                self.name
            )));
        }
        let consistent = match (&self.layout, self.kind) {
            (FieldLayout::Named(_), BaseKind::Exception | BaseKind::DataPoint)
            | (FieldLayout::Sequence, BaseKind::Sequence) => true,
            (FieldLayout::Buckets(bounds), BaseKind::Counter) => {
                bounds.windows(2).all(|w| w[0] < w[1])
            }
            _ => false,
        };
        if !consistent {
            return Err(Error::invalid_descriptor(format!(
                "record type '{}' has a malformed {} layout",
                self.name, self.kind
            )));
        }
        Ok(())
    }
}

/// Immutable description of a context class
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextType {
    id: u32,
    name: String,
    fields: Vec<String>,
}

impl ContextType {
    pub fn new(id: u32, name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            id,
            name: name.into(),
            fields: fields.iter().map(|f| (*f).to_string()).collect(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn field_names(&self) -> &[String] {
        &self.fields
    }

    fn validate(&self) -> Result<()> {
        if self.id == 0 || self.name.is_empty() {
            return Err(Error::invalid_descriptor(format!(
                "context type '{}' needs a name and a nonzero id",
                self.name
            )));
        }
        Ok(())
    }
}

trait Keyed {
    fn key(&self) -> u32;
}

impl Keyed for RecordType {
    fn key(&self) -> u32 {
        self.id
    }
}

impl Keyed for ContextType {
    fn key(&self) -> u32 {
        self.id
    }
}

struct Table<T> {
    buckets: Vec<Vec<Arc<T>>>,
}

impl<T: Keyed> Table<T> {
    fn new() -> Self {
        Self {
            buckets: (0..REGISTRY_BUCKETS).map(|_| Vec::new()).collect(),
        }
    }

    fn bucket(id: u32) -> usize {
        id as usize % REGISTRY_BUCKETS
    }

    fn find(&self, id: u32) -> Option<&Arc<T>> {
        self.buckets[Self::bucket(id)].iter().find(|d| d.key() == id)
    }

    fn insert(&mut self, desc: Arc<T>) {
        self.buckets[Self::bucket(desc.key())].push(desc);
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

struct Tables {
    record_types: Table<RecordType>,
    context_types: Table<ContextType>,
}

/// Registry of record and context type descriptors
pub struct Registry {
    tables: Mutex<Tables>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                record_types: Table::new(),
                context_types: Table::new(),
            }),
        }
    }

    /// Register a record type; the id must be unused
    pub fn register_record_type(&self, rt: RecordType) -> Result<Arc<RecordType>> {
        rt.validate()?;
        let mut tables = self.tables.lock();
        if tables.record_types.find(rt.id).is_some() {
            return Err(Error::DuplicateId {
                kind: "record type",
                id: rt.id,
            });
        }
        debug!("Registered record type {} ({}:{})", rt.name, rt.kind, rt.id);
        let rt = Arc::new(rt);
        tables.record_types.insert(Arc::clone(&rt));
        Ok(rt)
    }

    /// Register a context type; the id must be unused
    pub fn register_context_type(&self, ct: ContextType) -> Result<Arc<ContextType>> {
        ct.validate()?;
        let mut tables = self.tables.lock();
        if tables.context_types.find(ct.id).is_some() {
            return Err(Error::DuplicateId {
                kind: "context type",
                id: ct.id,
            });
        }
        debug!("Registered context type {} ({})", ct.name, ct.id);
        let ct = Arc::new(ct);
        tables.context_types.insert(Arc::clone(&ct));
        Ok(ct)
    }

    #[must_use]
    pub fn lookup_record_type(&self, id: u32) -> Option<Arc<RecordType>> {
        self.tables.lock().record_types.find(id).cloned()
    }

    #[must_use]
    pub fn lookup_context_type(&self, id: u32) -> Option<Arc<ContextType>> {
        self.tables.lock().context_types.find(id).cloned()
    }

    /// Number of registered (record types, context types)
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        let tables = self.tables.lock();
        (tables.record_types.len(), tables.context_types.len())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new();
        let rt = registry
            .register_record_type(RecordType::data_point(40, "io_size", &["bytes", "usec"]))
            .unwrap();

        let found = registry.lookup_record_type(40).unwrap();
        assert!(Arc::ptr_eq(&rt, &found));
        assert_eq!(found.field_names().len(), 2);
        assert!(registry.lookup_record_type(41).is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = Registry::new();
        registry
            .register_record_type(RecordType::exception(7, "oops", &["rc"]))
            .unwrap();
        let err = registry
            .register_record_type(RecordType::sequence(7, "other"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId { id: 7, .. }));
        assert_eq!(registry.lookup_record_type(7).unwrap().name(), "oops");

        // Context ids are a separate namespace.
        registry
            .register_context_type(ContextType::new(7, "service", &[]))
            .unwrap();
        assert!(
            registry
                .register_context_type(ContextType::new(7, "again", &[]))
                .is_err()
        );
    }

    #[test]
    fn test_colliding_buckets() {
        let registry = Registry::new();
        for id in [3, 3 + 31, 3 + 62] {
            registry
                .register_context_type(ContextType::new(id, format!("ct{id}"), &["f"]))
                .unwrap();
        }
        assert_eq!(registry.lookup_context_type(34).unwrap().name(), "ct34");
        assert_eq!(registry.counts(), (0, 3));
    }

    #[test]
    fn test_malformed_descriptors() {
        let registry = Registry::new();
        assert!(
            registry
                .register_record_type(RecordType::counter(9, "lat", &[10, 10, 20]))
                .is_err()
        );
        assert!(
            registry
                .register_record_type(RecordType::sequence(0, "zero"))
                .is_err()
        );
        assert!(
            registry
                .register_context_type(ContextType::new(5, "", &[]))
                .is_err()
        );
        assert_eq!(registry.counts(), (0, 0));
    }
}
