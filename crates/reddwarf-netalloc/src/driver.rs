//! Driver registry: lookup and lazy-load of network drivers and IPAM
//! drivers by name (spec.md §4.1, §6).

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{AllocatorError, IpamError, Result};
use crate::types::NetworkId;

/// Default network driver name used when a network spec omits one.
pub const DEFAULT_DRIVER: &str = "overlay";

/// Default IPAM driver name used when an IPAM spec omits one.
pub const DEFAULT_IPAM_DRIVER: &str = "default";

/// Label marking a network as one of the cluster's predefined networks.
pub const LABEL_PREDEFINED: &str = "com.docker.swarm.predefined";

/// Legacy label used to recognize the ingress network by name + label.
pub const LABEL_INGRESS_INTERNAL: &str = "com.docker.swarm.internal";

/// Legacy ingress network name.
pub const INGRESS_NETWORK_NAME: &str = "ingress";

/// Option key marking a `RequestAddress` call as a gateway request.
pub const OPT_REQUEST_ADDRESS_TYPE: &str = "RequestAddressType";
pub const VAL_REQUEST_ADDRESS_TYPE_GATEWAY: &str = "Gateway";

/// Option key requesting deterministic incrementing allocation.
pub const OPT_ALLOC_SERIAL: &str = "AllocSerial";

/// Meta key under which a driver may return a gateway address from `RequestPool`.
pub const NETLABEL_GATEWAY: &str = "com.docker.network.gateway";

/// Plugin endpoint type passed to the plugin getter when resolving network drivers.
pub const NETWORK_PLUGIN_ENDPOINT_TYPE: &str = "NetworkDriver";

/// The network driver's declared scope: node-local, or coordinated cluster-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataScope {
    Local,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub data_scope: DataScope,
}

/// One `(subnet, gateway)` entry built for `NetworkAllocate` (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct IpamData {
    pub pool: IpNetwork,
    pub gateway: Option<IpNetwork>,
}

/// Network driver contract (spec.md §6).
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    async fn network_allocate(
        &self,
        id: &NetworkId,
        options: &BTreeMap<String, String>,
        ipv4: &[IpamData],
        ipv6: &[IpamData],
    ) -> Result<BTreeMap<String, String>>;

    async fn network_free(&self, id: &NetworkId) -> Result<()>;

    fn capability(&self) -> Capability;
}

/// IPAM driver contract (spec.md §6).
#[async_trait]
pub trait IpamDriver: Send + Sync {
    async fn request_pool(
        &self,
        address_space: &str,
        subnet: Option<IpNetwork>,
        range: Option<IpNetwork>,
        options: &BTreeMap<String, String>,
        v6: bool,
    ) -> std::result::Result<(crate::types::PoolId, IpNetwork, BTreeMap<String, String>), IpamError>;

    async fn release_pool(&self, pool: &crate::types::PoolId) -> std::result::Result<(), IpamError>;

    async fn request_address(
        &self,
        pool: &crate::types::PoolId,
        preferred: Option<IpAddr>,
        options: &BTreeMap<String, String>,
    ) -> std::result::Result<(IpNetwork, BTreeMap<String, String>), IpamError>;

    async fn release_address(
        &self,
        pool: &crate::types::PoolId,
        addr: IpAddr,
    ) -> std::result::Result<(), IpamError>;

    fn default_address_spaces(&self) -> (String, String);
}

/// Plugin getter contract: looked up only for network drivers, only on a
/// registry cache miss (spec.md §6).
#[async_trait]
pub trait PluginGetter: Send + Sync {
    async fn get(
        &self,
        name: &str,
        endpoint_type: &str,
        mode: &str,
    ) -> Result<Arc<dyn NetworkDriver>>;
}

/// Case-insensitive membership test against the built-in network driver
/// initializers registered at construction (spec.md §4.1, §6).
pub fn is_built_in_driver(name: &str) -> bool {
    const BUILTINS: &[&str] = &["overlay", "bridge", "host", "null"];
    let lower = name.to_ascii_lowercase();
    BUILTINS.iter().any(|b| *b == lower)
}

struct NetworkDriverEntry {
    driver: Arc<dyn NetworkDriver>,
    capability: Capability,
}

/// Lookup and lazy-load of network drivers and IPAM drivers by name.
///
/// Populated at construction with built-in initializers; external drivers
/// are discovered lazily via the injected plugin getter (never global,
/// spec.md §9 REDESIGN FLAGS).
pub struct DriverRegistry {
    network_drivers: RwLock<HashMap<String, NetworkDriverEntry>>,
    ipam_drivers: RwLock<HashMap<String, Arc<dyn IpamDriver>>>,
    plugin_getter: Option<Arc<dyn PluginGetter>>,
}

impl DriverRegistry {
    pub fn new(plugin_getter: Option<Arc<dyn PluginGetter>>) -> Self {
        Self {
            network_drivers: RwLock::new(HashMap::new()),
            ipam_drivers: RwLock::new(HashMap::new()),
            plugin_getter,
        }
    }

    /// Register a built-in (or test) network driver.
    pub async fn add_driver(&self, name: impl Into<String>, driver: Arc<dyn NetworkDriver>) {
        let name = name.into();
        let capability = driver.capability();
        self.network_drivers
            .write()
            .await
            .insert(name, NetworkDriverEntry { driver, capability });
    }

    /// Register a built-in (or test) IPAM driver.
    pub async fn add_ipam_driver(&self, name: impl Into<String>, driver: Arc<dyn IpamDriver>) {
        self.ipam_drivers.write().await.insert(name.into(), driver);
    }

    pub fn get_plugin_getter(&self) -> Option<Arc<dyn PluginGetter>> {
        self.plugin_getter.clone()
    }

    /// `Driver(name) -> (driver, capability) | nil` (spec.md §4.1).
    pub async fn driver(&self, name: &str) -> Option<(Arc<dyn NetworkDriver>, Capability)> {
        self.network_drivers
            .read()
            .await
            .get(name)
            .map(|e| (e.driver.clone(), e.capability))
    }

    /// `IPAM(name) -> ipam | nil` (spec.md §4.1).
    pub async fn ipam(&self, name: &str) -> Option<Arc<dyn IpamDriver>> {
        self.ipam_drivers.read().await.get(name).cloned()
    }

    /// `IPAMDefaultAddressSpaces(name) -> (localAS, globalAS)` (spec.md §4.1).
    pub async fn ipam_default_address_spaces(&self, name: &str) -> Result<(String, String)> {
        let driver = self
            .ipam(name)
            .await
            .ok_or_else(|| AllocatorError::IpamNotFound {
                name: name.to_string(),
            })?;
        Ok(driver.default_address_spaces())
    }

    /// Resolve a network driver by name, lazily loading from the plugin
    /// getter on cache miss (spec.md §4.1 step 2).
    pub async fn resolve_driver(
        &self,
        driver_config_name: Option<&str>,
    ) -> Result<(String, Arc<dyn NetworkDriver>, Capability)> {
        let name = driver_config_name
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_DRIVER)
            .to_string();

        if let Some((driver, cap)) = self.driver(&name).await {
            return Ok((name, driver, cap));
        }

        let getter = self
            .plugin_getter
            .clone()
            .ok_or_else(|| AllocatorError::DriverNotFound { name: name.clone() })?;

        debug!(driver = %name, "network driver cache miss, attempting plugin load");
        let loaded = getter
            .get(&name, NETWORK_PLUGIN_ENDPOINT_TYPE, "")
            .await
            .map_err(|_| AllocatorError::DriverNotFound { name: name.clone() })?;
        self.add_driver(name.clone(), loaded).await;

        self.driver(&name)
            .await
            .map(|(d, c)| (name.clone(), d, c))
            .ok_or(AllocatorError::DriverNotFound { name })
    }

    /// Resolve an IPAM driver by name. IPAM drivers are never lazily loaded
    /// from a plugin (spec.md §4.1).
    pub async fn resolve_ipam(
        &self,
        ipam_driver_name: Option<&str>,
    ) -> Result<(String, Arc<dyn IpamDriver>)> {
        let name = ipam_driver_name
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_IPAM_DRIVER)
            .to_string();
        let driver = self
            .ipam(&name)
            .await
            .ok_or_else(|| AllocatorError::IpamNotFound { name: name.clone() })?;
        Ok((name, driver))
    }
}
