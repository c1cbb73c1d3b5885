//! Posting and record assembly
//!
//! Every post computes the record size up front, allocates it in one piece
//! from the machine's event manager, fills it in place and hands it back.
//! Nothing here returns an error: a record that cannot be posted is dropped
//! and the reason logged.

use crate::context::Context;
use crate::counter::Counter;
use crate::machine::Machine;
use crate::record::{WordWriter, encoded_words};
use crate::registry::RecordType;
use addb_common::{BaseKind, RecordId, WORD_SIZE};
use std::sync::Arc;
use tracing::{debug, warn};

/// Kind-specific payload of a post
#[derive(Clone, Copy, Debug)]
pub enum PostData<'a> {
    /// Exception or data-point values, one per field name
    Fields(&'a [u64]),
    /// Current statistics of a counter
    Counter(&'a Counter),
    /// Free-form word sequence
    Sequence(&'a [u64]),
}

impl Machine {
    /// Post a record of type `rt` against the context vector `cv`
    pub fn post(&self, rt: &RecordType, cv: &[&Context], data: PostData<'_>) {
        if cv.is_empty() {
            warn!("Dropping {} record: empty context vector", rt.name());
            return;
        }
        let field_count = match (rt.kind(), data) {
            (BaseKind::Exception | BaseKind::DataPoint, PostData::Fields(f))
                if f.len() == rt.field_names().len() =>
            {
                f.len()
            }
            (BaseKind::Counter, PostData::Counter(c)) if c.record_type().id() == rt.id() => {
                c.field_words()
            }
            (BaseKind::Sequence, PostData::Sequence(s)) => s.len(),
            (kind, _) => {
                warn!("Dropping {} record: payload does not match {kind} layout", rt.name());
                return;
            }
        };

        if let (BaseKind::Exception, PostData::Fields(fields)) = (rt.kind(), data)
            && let Some(evmgr) = self.evmgr()
        {
            evmgr.log(rt, fields);
        }

        rec_post(self, RecordId::new(rt.kind(), rt.id()), cv, field_count, |out| {
            match data {
                PostData::Fields(words) | PostData::Sequence(words) => {
                    out.copy_from_slice(words);
                }
                PostData::Counter(counter) => counter.write_fields(out),
            }
        });
    }

    pub fn post_exception(&self, rt: &RecordType, cv: &[&Context], fields: &[u64]) {
        self.post(rt, cv, PostData::Fields(fields));
    }

    pub fn post_data_point(&self, rt: &RecordType, cv: &[&Context], fields: &[u64]) {
        self.post(rt, cv, PostData::Fields(fields));
    }

    pub fn post_sequence(&self, rt: &RecordType, cv: &[&Context], words: &[u64]) {
        self.post(rt, cv, PostData::Sequence(words));
    }

    /// Post the counter's statistics, then reset it
    pub fn post_counter(&self, cv: &[&Context], counter: &mut Counter) {
        let rt = Arc::clone(counter.record_type());
        self.post(&rt, cv, PostData::Counter(counter));
        counter.reset();
    }

    /// Post and reset the counter only if it holds samples
    pub fn post_counter_if_sampled(&self, cv: &[&Context], counter: &mut Counter) -> bool {
        if counter.nr() == 0 {
            return false;
        }
        self.post_counter(cv, counter);
        true
    }
}

/// Post the definition record of a local context
pub(crate) fn post_context_def(mc: &Machine, ctx: &Context, fields: &[u64]) {
    let Some(ctype) = ctx.context_type() else {
        return;
    };
    let rid = RecordId::new(BaseKind::ContextDef, ctype.id());
    rec_post(mc, rid, &[ctx], fields.len(), |out| out.copy_from_slice(fields));
}

fn rec_post(
    mc: &Machine,
    rid: RecordId,
    cv: &[&Context],
    field_count: usize,
    fill: impl FnOnce(&mut [u64]),
) {
    let Some(evmgr) = mc.posting_evmgr() else {
        return;
    };
    if !mc.platform().can_block() && !evmgr.can_post_awkward() {
        debug!("Dropping record {rid}: machine cannot post in a restricted context");
        return;
    }

    let words = encoded_words(cv.iter().map(|c| c.depth() as usize), field_count);
    let timestamp = mc.platform().now();
    let Some(mut slot) = evmgr.rec_alloc(words * WORD_SIZE) else {
        debug!("Dropping record {rid}: no room for {words} words");
        return;
    };

    {
        let mut w = WordWriter::new(slot.words_mut());
        w.push(rid.as_u64());
        w.push(timestamp);
        w.push(cv.len() as u64);
        for ctx in cv {
            w.push(u64::from(ctx.depth()));
            ctx.write_path(w.reserve(ctx.depth() as usize));
        }
        w.push(field_count as u64);
        fill(w.reserve(field_count));
        debug_assert!(w.is_full());
    }
    evmgr.post(slot);
}
