//! ADDB Core
//!
//! Diagnostic record collection: components post typed records against
//! hierarchical contexts through an ADDB machine, which assembles them and
//! delivers them to the network or to a segment repository.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  post_*(rt, cv, data) │
//! └──────────┬───────────┘
//!            │
//! ┌──────────▼───────────┐
//! │  Machine             │
//! │  - EventManager      │  pass-through, or cache for restricted contexts
//! │  - RecordSink        │
//! └──────────┬───────────┘
//!            │
//!     ┌──────┴───────┐
//! ┌───▼─────┐  ┌─────▼──────┐
//! │ RpcSink │  │ StorageSink│  segments in a stob
//! └─────────┘  └────────────┘
//! ```

pub mod context;
pub mod counter;
pub mod evmgr;
pub mod machine;
pub mod platform;
pub mod post;
pub mod record;
pub mod registry;
pub mod retrieval;
pub mod segment;
pub mod sink;
pub mod skulk;
pub mod subsystem;
pub mod ts;

#[cfg(test)]
mod testing;

pub use context::Context;
pub use counter::Counter;
pub use evmgr::{CacheEventManager, EventManager, PassThroughEventManager};
pub use machine::Machine;
pub use platform::{DefaultPlatform, Platform};
pub use post::PostData;
pub use record::{BatchBuilder, WireRecord, decode_batch};
pub use registry::{ContextType, FieldLayout, RecordType, Registry};
pub use retrieval::{Cursor, CursorFilter, SegmentIter, type_name};
pub use sink::{
    FileStob, ItemSource, MemStob, RecordSink, RecordSlot, RpcItem, RpcItemSource, RpcSink,
    StorageSink, Stob,
};
pub use skulk::skulk_loop;
pub use subsystem::Subsystem;
pub use ts::{TransientStore, TsRecord};
