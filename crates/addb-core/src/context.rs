//! Context identity
//!
//! A context names where a record came from. Local contexts form a tree:
//! each node takes its relative id from its parent's child counter, and its
//! absolute id is the path of relative ids from the root. Imported contexts
//! carry an absolute path received from elsewhere.
//!
//! Creating a local context posts a context-definition record. Contexts
//! declared against the default machine before it is fully configured are
//! queued in [`DeferredDefs`] and posted once configuration completes.

use crate::machine::Machine;
use crate::post;
use crate::registry::ContextType;
use addb_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

enum Origin {
    Local {
        ctype: Arc<ContextType>,
        id: u64,
        parent: Option<Arc<Context>>,
        children: AtomicU64,
    },
    Imported(Arc<[u64]>),
}

/// Node of the context tree, or an imported absolute path
pub struct Context {
    depth: u32,
    origin: Origin,
}

impl Context {
    /// Top-level context with a fixed relative id
    pub(crate) fn root(ctype: Arc<ContextType>, id: u64) -> Arc<Self> {
        Arc::new(Self {
            depth: 1,
            origin: Origin::Local {
                ctype,
                id,
                parent: None,
                children: AtomicU64::new(0),
            },
        })
    }

    /// Child of `parent` with an explicit relative id
    pub(crate) fn child_with_id(
        ctype: Arc<ContextType>,
        parent: &Arc<Self>,
        id: u64,
    ) -> Result<Arc<Self>> {
        if parent.is_imported() {
            return Err(Error::invalid_state("imported context cannot be a parent"));
        }
        Ok(Arc::new(Self {
            depth: parent.depth + 1,
            origin: Origin::Local {
                ctype,
                id,
                parent: Some(Arc::clone(parent)),
                children: AtomicU64::new(0),
            },
        }))
    }

    /// Declare a new child of `parent` and post its definition through
    /// `mc`. `fields` are the attribute values, one per field of `ctype`.
    pub fn new_local(
        mc: &Machine,
        ctype: &Arc<ContextType>,
        parent: &Arc<Self>,
        fields: &[u64],
    ) -> Result<Arc<Self>> {
        let Origin::Local { children, .. } = &parent.origin else {
            return Err(Error::invalid_state("imported context cannot be a parent"));
        };
        if fields.len() != ctype.field_names().len() {
            return Err(Error::invalid_argument(format!(
                "context type {} takes {} fields, got {}",
                ctype.name(),
                ctype.field_names().len(),
                fields.len()
            )));
        }

        let id = children.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = Self::child_with_id(Arc::clone(ctype), parent, id)?;

        match mc.deferred() {
            Some(deferred) if deferred.defer(mc, &ctx, fields) => {
                debug!("Deferred definition of context {}:{id}", ctype.name());
            }
            _ => post::post_context_def(mc, &ctx, fields),
        }
        Ok(ctx)
    }

    /// Child of `parent` taking the next relative id, without posting a
    /// definition
    pub(crate) fn next_child(ctype: Arc<ContextType>, parent: &Arc<Self>) -> Result<Arc<Self>> {
        let Origin::Local { children, .. } = &parent.origin else {
            return Err(Error::invalid_state("imported context cannot be a parent"));
        };
        let id = children.fetch_add(1, Ordering::SeqCst) + 1;
        Self::child_with_id(ctype, parent, id)
    }

    /// Context referring to a foreign absolute id path
    pub fn import(path: impl Into<Arc<[u64]>>) -> Result<Arc<Self>> {
        let path = path.into();
        if path.is_empty() {
            return Err(Error::invalid_argument("context path cannot be empty"));
        }
        let depth = u32::try_from(path.len())
            .map_err(|_| Error::invalid_argument("context path too deep"))?;
        Ok(Arc::new(Self {
            depth,
            origin: Origin::Imported(path),
        }))
    }

    /// Absolute id path, root first
    #[must_use]
    pub fn export(&self) -> Vec<u64> {
        let mut path = vec![0; self.depth as usize];
        self.write_path(&mut path);
        path
    }

    /// Write the absolute id path into `out`, which must be `depth` long
    pub(crate) fn write_path(&self, out: &mut [u64]) {
        let mut node = self;
        let mut end = out.len();
        loop {
            match &node.origin {
                Origin::Imported(path) => {
                    out[..end].copy_from_slice(&path[path.len() - end..]);
                    return;
                }
                Origin::Local { id, parent, .. } => {
                    end -= 1;
                    out[end] = *id;
                    match parent {
                        Some(p) if end > 0 => node = p,
                        _ => return,
                    }
                }
            }
        }
    }

    /// Drop any still-pending definition of this context
    pub fn fini(self: Arc<Self>, mc: &Machine) {
        if let Some(deferred) = mc.deferred() {
            deferred.cancel(&self);
        }
    }

    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    /// Relative id; for imported contexts the last element of the path
    #[must_use]
    pub fn id(&self) -> u64 {
        match &self.origin {
            Origin::Local { id, .. } => *id,
            Origin::Imported(path) => path[path.len() - 1],
        }
    }

    #[must_use]
    pub fn context_type(&self) -> Option<&Arc<ContextType>> {
        match &self.origin {
            Origin::Local { ctype, .. } => Some(ctype),
            Origin::Imported(_) => None,
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Self>> {
        match &self.origin {
            Origin::Local { parent, .. } => parent.as_ref(),
            Origin::Imported(_) => None,
        }
    }

    #[must_use]
    pub const fn is_imported(&self) -> bool {
        matches!(self.origin, Origin::Imported(_))
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("path", &self.export())
            .field("imported", &self.is_imported())
            .finish()
    }
}

struct PendingDef {
    ctx: Weak<Context>,
    fields: Vec<u64>,
}

#[derive(Default)]
struct DeferredState {
    /// Posted first on every transition to fully configured
    well_known: Vec<PendingDef>,
    queue: VecDeque<PendingDef>,
}

/// Context definitions waiting for the default machine to be configured
#[derive(Default)]
pub struct DeferredDefs {
    state: Mutex<DeferredState>,
}

impl DeferredDefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition every sink of the machine must see, such as
    /// the node and process contexts
    pub(crate) fn add_well_known(&self, ctx: &Arc<Context>, fields: &[u64]) {
        self.state.lock().well_known.push(PendingDef {
            ctx: Arc::downgrade(ctx),
            fields: fields.to_vec(),
        });
    }

    /// Queue a definition unless `mc` is fully configured, in which case
    /// the caller should post directly. The check runs under the queue lock
    /// so it cannot race with [`DeferredDefs::drain`].
    pub(crate) fn defer(&self, mc: &Machine, ctx: &Arc<Context>, fields: &[u64]) -> bool {
        let mut state = self.state.lock();
        if mc.is_fully_configured() {
            return false;
        }
        state.queue.push_back(PendingDef {
            ctx: Arc::downgrade(ctx),
            fields: fields.to_vec(),
        });
        true
    }

    pub(crate) fn cancel(&self, ctx: &Context) {
        let target = std::ptr::from_ref(ctx);
        self.state
            .lock()
            .queue
            .retain(|p| !std::ptr::eq(p.ctx.as_ptr(), target));
    }

    /// Post the well-known definitions, then every queued definition in
    /// FIFO order. Called each time `mc` becomes fully configured.
    pub(crate) fn drain(&self, mc: &Machine) {
        let mut state = self.state.lock();
        let mut posted = 0usize;
        for pending in &state.well_known {
            if let Some(ctx) = pending.ctx.upgrade() {
                post::post_context_def(mc, &ctx, &pending.fields);
                posted += 1;
            }
        }
        while let Some(pending) = state.queue.pop_front() {
            if let Some(ctx) = pending.ctx.upgrade() {
                post::post_context_def(mc, &ctx, &pending.fields);
                posted += 1;
            }
        }
        debug!("Posted {posted} deferred context definitions");
    }

    /// Queued definitions, not counting the well-known ones
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.well_known.clear();
    }
}
