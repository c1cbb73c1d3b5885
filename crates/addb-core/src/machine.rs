//! ADDB machine
//!
//! A machine is a handle holding a shared event manager and a shared record
//! sink. Duplicating a machine clones both handles; a component is torn
//! down when the last machine holding it lets go.

use crate::context::DeferredDefs;
use crate::evmgr::{CacheEventManager, EventManager, PassThroughEventManager};
use crate::platform::{DefaultPlatform, Platform};
use crate::sink::{RecordSink, RpcSink, StorageSink, Stob};
use addb_common::config::{CacheConfig, RpcSinkConfig, StobSinkConfig};
use addb_common::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone, Default)]
struct Components {
    evmgr: Option<Arc<dyn EventManager>>,
    sink: Option<Arc<dyn RecordSink>>,
}

/// Composition root for posting
pub struct Machine {
    components: RwLock<Components>,
    platform: Arc<dyn Platform>,
    /// Present only on the subsystem's default machine
    deferred: Option<Arc<DeferredDefs>>,
}

impl Machine {
    /// Create an unconfigured machine
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            components: RwLock::new(Components::default()),
            platform,
            deferred: None,
        }
    }

    pub(crate) fn with_deferred(platform: Arc<dyn Platform>, deferred: Arc<DeferredDefs>) -> Self {
        Self {
            components: RwLock::new(Components::default()),
            platform,
            deferred: Some(deferred),
        }
    }

    /// Install a pass-through event manager over the configured sink
    pub fn configure_pass_through_evmgr(&self) -> Result<()> {
        {
            let mut c = self.components.write();
            if c.evmgr.is_some() {
                return Err(Error::invalid_state("event manager already configured"));
            }
            let Some(sink) = c.sink.clone() else {
                return Err(Error::invalid_state(
                    "pass-through event manager needs a record sink",
                ));
            };
            c.evmgr = Some(Arc::new(PassThroughEventManager::new(sink)));
        }
        debug!("Configured pass-through event manager");
        self.after_configure();
        Ok(())
    }

    /// Install a caching event manager
    pub fn configure_cache_evmgr(&self, config: &CacheConfig) -> Result<()> {
        {
            let mut c = self.components.write();
            if c.evmgr.is_some() {
                return Err(Error::invalid_state("event manager already configured"));
            }
            c.evmgr = Some(Arc::new(CacheEventManager::new(config)?));
        }
        debug!(
            "Configured cache event manager: {} pages of {} bytes",
            config.pages, config.page_size
        );
        self.after_configure();
        Ok(())
    }

    /// Install an RPC sink; the returned handle is what the network layer
    /// attaches item sources to
    pub fn configure_rpc_sink(&self, config: &RpcSinkConfig) -> Result<Arc<RpcSink>> {
        let sink = {
            let mut c = self.components.write();
            if c.sink.is_some() {
                return Err(Error::invalid_state("record sink already configured"));
            }
            let sink = Arc::new(RpcSink::new(config, Arc::clone(&self.platform))?);
            c.sink = Some(Arc::clone(&sink) as Arc<dyn RecordSink>);
            sink
        };
        info!("Configured RPC sink");
        self.after_configure();
        Ok(sink)
    }

    /// Install a storage sink writing segments to `stob`
    pub fn configure_stob_sink(
        &self,
        stob: Arc<dyn Stob>,
        config: &StobSinkConfig,
    ) -> Result<Arc<StorageSink>> {
        let sink = {
            let mut c = self.components.write();
            if c.sink.is_some() {
                return Err(Error::invalid_state("record sink already configured"));
            }
            let sink = Arc::new(StorageSink::open(stob, config)?);
            c.sink = Some(Arc::clone(&sink) as Arc<dyn RecordSink>);
            sink
        };
        info!("Configured storage sink");
        self.after_configure();
        Ok(sink)
    }

    /// Install any other record sink
    pub fn configure_sink(&self, sink: Arc<dyn RecordSink>) -> Result<()> {
        {
            let mut c = self.components.write();
            if c.sink.is_some() {
                return Err(Error::invalid_state("record sink already configured"));
            }
            c.sink = Some(sink);
        }
        self.after_configure();
        Ok(())
    }

    /// Share the components of `src`, which must be fully configured with a
    /// pass-through event manager. This machine must be unconfigured.
    pub fn dup(&self, src: &Self) -> Result<()> {
        if std::ptr::eq(self, src) {
            return Err(Error::invalid_state("machine cannot duplicate itself"));
        }
        let shared = src.components.read().clone();
        let (Some(evmgr), Some(_)) = (&shared.evmgr, &shared.sink) else {
            return Err(Error::invalid_state("source machine is not fully configured"));
        };
        if evmgr.can_post_awkward() {
            return Err(Error::invalid_state("caching machines cannot be duplicated"));
        }
        {
            let mut c = self.components.write();
            if c.evmgr.is_some() || c.sink.is_some() {
                return Err(Error::invalid_state("destination machine is configured"));
            }
            *c = shared;
        }
        self.after_configure();
        Ok(())
    }

    /// Release both components
    pub fn fini(&self) {
        let released = std::mem::take(&mut *self.components.write());
        // Dropping a sink may wait for in-flight records; do it unlocked.
        drop(released);
    }

    #[must_use]
    pub fn has_evmgr(&self) -> bool {
        self.components.read().evmgr.is_some()
    }

    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.components.read().sink.is_some()
    }

    /// Either component present
    #[must_use]
    pub fn is_configured(&self) -> bool {
        let c = self.components.read();
        c.evmgr.is_some() || c.sink.is_some()
    }

    /// Both components present
    #[must_use]
    pub fn is_fully_configured(&self) -> bool {
        let c = self.components.read();
        c.evmgr.is_some() && c.sink.is_some()
    }

    /// Event manager present and safe where blocking is disallowed
    #[must_use]
    pub fn can_post_awkward(&self) -> bool {
        self.components
            .read()
            .evmgr
            .as_ref()
            .is_some_and(|e| e.can_post_awkward())
    }

    /// Records held by a caching event manager
    #[must_use]
    pub fn buffered_records(&self) -> usize {
        self.evmgr().map_or(0, |e| e.buffered())
    }

    /// Run the sink's housekeeping
    pub fn skulk(&self) {
        if let Some(sink) = self.sink() {
            sink.skulk();
        }
    }

    /// Drain this machine's cache into `dest`
    pub fn flush_to(&self, dest: &Self) -> Result<()> {
        let evmgr = self
            .evmgr()
            .ok_or_else(|| Error::invalid_state("machine has no event manager"))?;
        if !evmgr.has_copy() {
            return Err(Error::invalid_state("event manager does not buffer records"));
        }
        evmgr.copy(dest)
    }

    #[must_use]
    pub fn sink(&self) -> Option<Arc<dyn RecordSink>> {
        self.components.read().sink.clone()
    }

    #[must_use]
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub(crate) fn evmgr(&self) -> Option<Arc<dyn EventManager>> {
        self.components.read().evmgr.clone()
    }

    /// Event manager to post through, if the machine can accept records
    pub(crate) fn posting_evmgr(&self) -> Option<Arc<dyn EventManager>> {
        let c = self.components.read();
        let evmgr = c.evmgr.as_ref()?;
        if evmgr.requires_sink() && c.sink.is_none() {
            return None;
        }
        Some(Arc::clone(evmgr))
    }

    pub(crate) fn deferred(&self) -> Option<&DeferredDefs> {
        self.deferred.as_deref()
    }

    fn after_configure(&self) {
        if let Some(deferred) = &self.deferred
            && self.is_fully_configured()
        {
            deferred.drain(self);
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(Arc::new(DefaultPlatform::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CaptureSink, TestPlatform};
    use addb_common::config::TransientStoreConfig;

    fn machine() -> Machine {
        Machine::new(Arc::new(TestPlatform::default()))
    }

    #[test]
    fn test_lifecycle_predicates() {
        let mc = machine();
        assert!(!mc.is_configured());

        mc.configure_sink(CaptureSink::new()).unwrap();
        assert!(mc.has_sink());
        assert!(mc.is_configured());
        assert!(!mc.is_fully_configured());

        mc.configure_pass_through_evmgr().unwrap();
        assert!(mc.is_fully_configured());
        assert!(!mc.can_post_awkward());

        mc.fini();
        assert!(!mc.is_configured());
    }

    #[test]
    fn test_pass_through_needs_sink() {
        let mc = machine();
        assert!(matches!(
            mc.configure_pass_through_evmgr(),
            Err(Error::InvalidState(_))
        ));
        assert!(!mc.has_evmgr());
    }

    #[test]
    fn test_second_sink_rejected() {
        let mc = machine();
        mc.configure_sink(CaptureSink::new()).unwrap();
        assert!(mc.configure_sink(CaptureSink::new()).is_err());
        assert!(mc.configure_rpc_sink(&RpcSinkConfig::default()).is_err());
        let stob = Arc::new(crate::sink::MemStob::new());
        assert!(mc.configure_stob_sink(stob, &StobSinkConfig::default()).is_err());
    }

    #[test]
    fn test_second_evmgr_rejected() {
        let mc = machine();
        mc.configure_cache_evmgr(&CacheConfig::default()).unwrap();
        assert!(mc.can_post_awkward());
        assert!(mc.configure_cache_evmgr(&CacheConfig::default()).is_err());
        mc.configure_sink(CaptureSink::new()).unwrap();
        assert!(mc.configure_pass_through_evmgr().is_err());
    }

    #[test]
    fn test_dup_shares_components() {
        let sink = CaptureSink::new();
        let src = machine();
        src.configure_sink(sink.clone()).unwrap();
        src.configure_pass_through_evmgr().unwrap();

        let dst = machine();
        dst.dup(&src).unwrap();
        assert!(dst.is_fully_configured());
        // test handle, two machine handles, the shared pass-through manager
        assert_eq!(Arc::strong_count(&sink), 4);

        src.fini();
        assert_eq!(Arc::strong_count(&sink), 3);
        dst.fini();
        assert_eq!(Arc::strong_count(&sink), 1);
    }

    #[test]
    fn test_dup_preconditions() {
        let partial = machine();
        partial.configure_sink(CaptureSink::new()).unwrap();
        assert!(machine().dup(&partial).is_err());

        let cached = machine();
        cached.configure_cache_evmgr(&CacheConfig::default()).unwrap();
        cached.configure_sink(CaptureSink::new()).unwrap();
        assert!(machine().dup(&cached).is_err());

        let src = machine();
        src.configure_sink(CaptureSink::new()).unwrap();
        src.configure_pass_through_evmgr().unwrap();
        let dst = machine();
        dst.configure_sink(CaptureSink::new()).unwrap();
        assert!(dst.dup(&src).is_err());
        assert!(src.dup(&src).is_err());
    }

    #[test]
    fn test_flush_requires_cache() {
        let src = machine();
        src.configure_sink(CaptureSink::new()).unwrap();
        src.configure_pass_through_evmgr().unwrap();
        assert!(src.flush_to(&machine()).is_err());

        let bad = machine();
        assert!(
            bad.configure_cache_evmgr(&CacheConfig {
                pages: 0,
                page_size: TransientStoreConfig::default().page_size,
            })
            .is_err()
        );
    }
}
