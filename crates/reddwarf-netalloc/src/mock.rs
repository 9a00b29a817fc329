//! In-memory network driver used to exercise and test the orchestration
//! layer without a real out-of-process plugin (spec.md §6 contract, no
//! concrete driver is specified beyond it).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::driver::{Capability, DataScope, IpamData, NetworkDriver};
use crate::error::Result;
use crate::types::NetworkId;

/// A network driver that records the `NetworkAllocate`/`NetworkFree` calls
/// it receives and returns a deterministic opaque options map, the way a
/// real overlay/bridge driver would hand back driver-specific state.
pub struct MockNetworkDriver {
    capability: Capability,
    allocated: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl MockNetworkDriver {
    pub fn new(capability: Capability) -> Self {
        Self {
            capability,
            allocated: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn global() -> Self {
        Self::new(Capability {
            data_scope: DataScope::Global,
        })
    }

    pub fn local() -> Self {
        Self::new(Capability {
            data_scope: DataScope::Local,
        })
    }

    pub fn is_allocated(&self, id: &NetworkId) -> bool {
        self.allocated.lock().unwrap().contains_key(id.as_str())
    }
}

#[async_trait]
impl NetworkDriver for MockNetworkDriver {
    async fn network_allocate(
        &self,
        id: &NetworkId,
        options: &BTreeMap<String, String>,
        ipv4: &[IpamData],
        _ipv6: &[IpamData],
    ) -> Result<BTreeMap<String, String>> {
        let mut driver_options = options.clone();
        if let Some(first) = ipv4.first() {
            driver_options.insert("com.docker.network.bridge.subnet".into(), first.pool.to_string());
        }
        self.allocated
            .lock()
            .unwrap()
            .insert(id.as_str().to_string(), driver_options.clone());
        Ok(driver_options)
    }

    async fn network_free(&self, id: &NetworkId) -> Result<()> {
        self.allocated.lock().unwrap().remove(id.as_str());
        Ok(())
    }

    fn capability(&self) -> Capability {
        self.capability
    }
}

/// A plugin getter that always fails, used to exercise the
/// *driver-not-found* path when no driver is pre-registered and lazy
/// loading is unavailable.
pub struct NoPluginsGetter;

#[async_trait]
impl crate::driver::PluginGetter for NoPluginsGetter {
    async fn get(
        &self,
        name: &str,
        _endpoint_type: &str,
        _mode: &str,
    ) -> Result<Arc<dyn NetworkDriver>> {
        Err(crate::error::AllocatorError::DriverNotFound {
            name: name.to_string(),
        })
    }
}
