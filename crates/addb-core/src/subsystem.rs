//! ADDB subsystem
//!
//! Owns the registry, the process-wide default machine and the well-known
//! node and process contexts. The default machine starts unconfigured;
//! context definitions made against it are queued while it lacks either an
//! event manager or a sink. Each time it becomes fully configured the node
//! and process definitions are posted, followed by the queue.

use crate::context::{Context, DeferredDefs};
use crate::machine::Machine;
use crate::platform::{DefaultPlatform, Platform};
use crate::registry::{ContextType, Registry};
use addb_common::{AddbConfig, Result};
use std::sync::Arc;
use tracing::info;

pub const CT_NODE_HI: u32 = 10;
pub const CT_NODE_LO: u32 = 11;
pub const CT_PROCESS: u32 = 12;

/// Context types every repository refers to
pub struct BuiltinTypes {
    pub node_hi: Arc<ContextType>,
    pub node_lo: Arc<ContextType>,
    pub process: Arc<ContextType>,
}

/// Register the node and process context types
pub fn register_builtin_types(registry: &Registry) -> Result<BuiltinTypes> {
    Ok(BuiltinTypes {
        node_hi: registry.register_context_type(ContextType::new(CT_NODE_HI, "node_hi", &[]))?,
        node_lo: registry.register_context_type(ContextType::new(CT_NODE_LO, "node_lo", &[]))?,
        process: registry.register_context_type(ContextType::new(
            CT_PROCESS,
            "process",
            &["timestamp", "pid"],
        ))?,
    })
}

pub struct Subsystem {
    registry: Registry,
    machine: Arc<Machine>,
    deferred: Arc<DeferredDefs>,
    node_root: Arc<Context>,
    node: Arc<Context>,
    process: Arc<Context>,
}

impl Subsystem {
    pub fn init(platform: Arc<dyn Platform>) -> Result<Self> {
        let registry = Registry::new();
        let types = register_builtin_types(&registry)?;
        let deferred = Arc::new(DeferredDefs::new());
        let machine = Arc::new(Machine::with_deferred(
            Arc::clone(&platform),
            Arc::clone(&deferred),
        ));

        let uuid = platform.node_uuid();
        let (hi, lo) = uuid.as_u64_pair();
        let node_root = Context::root(types.node_hi, hi);
        deferred.add_well_known(&node_root, &[]);
        let node = Context::child_with_id(types.node_lo, &node_root, lo)?;
        deferred.add_well_known(&node, &[]);
        let process = Context::next_child(types.process, &node)?;
        deferred.add_well_known(&process, &[platform.now(), platform.process_id()]);

        info!(
            "ADDB subsystem initialized: node {uuid}, process {}",
            platform.process_id()
        );
        Ok(Self {
            registry,
            machine,
            deferred,
            node_root,
            node,
            process,
        })
    }

    /// Initialize on the default platform described by `config`
    pub fn from_config(config: &AddbConfig) -> Result<Self> {
        config.validate()?;
        Self::init(Arc::new(DefaultPlatform::new(&config.node)))
    }

    /// Release the default machine and drop every pending definition
    pub fn fini(&self) {
        self.machine.fini();
        self.deferred.clear();
        info!("ADDB subsystem finalized");
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Process-wide default machine
    #[must_use]
    pub const fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    #[must_use]
    pub const fn node_root(&self) -> &Arc<Context> {
        &self.node_root
    }

    #[must_use]
    pub const fn node(&self) -> &Arc<Context> {
        &self.node
    }

    #[must_use]
    pub const fn process(&self) -> &Arc<Context> {
        &self.process
    }

    /// Context definitions still waiting for the default machine
    #[must_use]
    pub fn pending_definitions(&self) -> usize {
        self.deferred.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RecordType;
    use crate::testing::{CaptureSink, TEST_NODE_HI, TEST_NODE_LO, TEST_PID, TestPlatform};
    use addb_common::{BaseKind, RecordId};

    fn subsystem() -> Subsystem {
        Subsystem::init(Arc::new(TestPlatform::default())).unwrap()
    }

    #[test]
    fn test_well_known_contexts() {
        let sub = subsystem();
        assert_eq!(sub.node_root().export(), vec![TEST_NODE_HI]);
        assert_eq!(sub.node().export(), vec![TEST_NODE_HI, TEST_NODE_LO]);
        assert_eq!(sub.process().depth(), 3);
        assert_eq!(sub.process().id(), 1);
        assert_eq!(sub.pending_definitions(), 0);
        assert_eq!(sub.registry().counts(), (0, 3));
        assert!(!sub.machine().is_configured());
    }

    #[test]
    fn test_deferred_definitions_drain_on_configure() {
        let sub = subsystem();
        let ct = sub
            .registry()
            .register_context_type(ContextType::new(100, "service", &["value"]))
            .unwrap();
        let x = Context::new_local(sub.machine(), &ct, sub.process(), &[42]).unwrap();

        let sink = CaptureSink::new();
        sub.machine().configure_sink(sink.clone()).unwrap();
        assert_eq!(sink.len(), 0);
        sub.machine().configure_pass_through_evmgr().unwrap();

        let recs = sink.records();
        let kinds: Vec<_> = recs.iter().map(|r| r.rid).collect();
        assert_eq!(
            kinds,
            vec![
                RecordId::new(BaseKind::ContextDef, CT_NODE_HI),
                RecordId::new(BaseKind::ContextDef, CT_NODE_LO),
                RecordId::new(BaseKind::ContextDef, CT_PROCESS),
                RecordId::new(BaseKind::ContextDef, 100),
            ]
        );
        assert_eq!(recs[2].fields[1], TEST_PID);

        let defs: Vec<_> = recs.iter().filter(|r| r.contexts == vec![x.export()]).collect();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].fields, vec![42]);
        assert_eq!(sub.pending_definitions(), 0);
    }

    #[test]
    fn test_default_machine_posts_after_configure() {
        let sub = subsystem();
        let rt = sub
            .registry()
            .register_record_type(RecordType::exception(1, "oops", &["rc"]))
            .unwrap();
        let sink = CaptureSink::new();
        sub.machine().configure_sink(sink.clone()).unwrap();
        sub.machine().configure_pass_through_evmgr().unwrap();

        sub.machine().post_exception(&rt, &[&**sub.process()], &[22]);
        let last = sink.records().pop().unwrap();
        assert!(last.is_event());
        assert_eq!(last.contexts, vec![sub.process().export()]);
    }

    #[test]
    fn test_reconfigured_machine_gets_well_known_definitions() {
        let sub = subsystem();
        let first = CaptureSink::new();
        sub.machine().configure_sink(first.clone()).unwrap();
        sub.machine().configure_pass_through_evmgr().unwrap();
        assert_eq!(first.len(), 3);

        sub.machine().fini();
        let ct = sub
            .registry()
            .register_context_type(ContextType::new(101, "late", &["value"]))
            .unwrap();
        let late = Context::new_local(sub.machine(), &ct, sub.process(), &[7]).unwrap();
        assert_eq!(sub.pending_definitions(), 1);

        let second = CaptureSink::new();
        sub.machine().configure_sink(second.clone()).unwrap();
        sub.machine().configure_pass_through_evmgr().unwrap();
        let recs = second.records();
        assert_eq!(recs.len(), 4);
        assert_eq!(recs[0].contexts, vec![sub.node_root().export()]);
        assert_eq!(recs[2].contexts, vec![sub.process().export()]);
        assert_eq!(recs[3].contexts, vec![late.export()]);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_fini_drops_pending() {
        let sub = subsystem();
        sub.fini();
        assert_eq!(sub.pending_definitions(), 0);
        assert!(!sub.machine().is_configured());
    }

    #[test]
    fn test_from_config() {
        let config = AddbConfig::default();
        let sub = Subsystem::from_config(&config).unwrap();
        assert_eq!(sub.node_root().depth(), 1);
    }
}
