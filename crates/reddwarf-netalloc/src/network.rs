//! Network lifecycle: allocates/releases network-wide state — IPAM pools,
//! gateways, and driver state (spec.md §4.3).

use std::collections::BTreeMap;

use ipnetwork::IpNetwork;
use tracing::debug;

use crate::driver::{DataScope, DriverRegistry, IpamData};
use crate::error::{AllocatorError, Result};
use crate::ipam;
use crate::types::{DriverState, Network, NetworkId};

/// Internal bookkeeping for one allocated network (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct NetworkRecord {
    pub network: Network,
    /// pool-CIDR-string -> driver-assigned pool handle.
    pub pools: BTreeMap<String, crate::types::PoolId>,
    /// allocated-address-string -> the pool handle it came from.
    pub endpoints: BTreeMap<String, crate::types::PoolId>,
    pub is_node_local: bool,
}

impl NetworkRecord {
    fn new(network: Network, is_node_local: bool) -> Self {
        Self {
            network,
            pools: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            is_node_local,
        }
    }
}

// `Default` is only needed so `NetworkRecord` can sit behind
// `HashMap::entry` patterns in tests; a real record always goes through
// `NetworkRecord::new`.
impl Default for Network {
    fn default() -> Self {
        Network::new(NetworkId::from(""), Default::default())
    }
}

/// `Allocate(network)` (spec.md §4.3).
pub(crate) async fn allocate(
    registry: &DriverRegistry,
    network: Network,
) -> Result<NetworkRecord> {
    let (_driver_name, driver, capability) = registry
        .resolve_driver(network.spec.driver_config.name.as_deref())
        .await?;

    let is_node_local = capability.data_scope == DataScope::Local;

    if is_node_local {
        let mut network = network;
        network.driver_state = Some(DriverState {
            name: network.spec.driver_config.name.clone().unwrap_or_default(),
            options: BTreeMap::new(),
        });
        // Backward-compat marker: some consumers require a non-nil IPAM field.
        network.ipam = crate::types::NetworkIpam::default();
        debug!(network_id = %network.id, "allocated node-local network, no IPAM/driver-state required");
        return Ok(NetworkRecord::new(network, true));
    }

    let mut record = NetworkRecord::new(network, false);
    ipam::allocate_pools(registry, &mut record).await?;

    if let Err(e) = allocate_driver_state(driver.as_ref(), &mut record).await {
        ipam::release_pools(
            registry,
            record.network.ipam.driver.as_deref(),
            &record.network.ipam.configs,
            &record.pools,
        )
        .await;
        return Err(e);
    }

    Ok(record)
}

/// `Deallocate(network)` (spec.md §4.3).
pub(crate) async fn deallocate(
    registry: &DriverRegistry,
    record: NetworkRecord,
) -> Result<()> {
    if record.is_node_local {
        return Ok(());
    }

    let driver_free_result = match registry
        .resolve_driver(record.network.spec.driver_config.name.as_deref())
        .await
    {
        Ok((_, driver, _)) => free_driver_state(driver.as_ref(), &record.network.id).await,
        Err(e) => Err(e),
    };

    ipam::release_pools(
        registry,
        record.network.ipam.driver.as_deref(),
        &record.network.ipam.configs,
        &record.pools,
    )
    .await;

    driver_free_result
}

/// `allocateDriverState(network)` (spec.md §4.6).
async fn allocate_driver_state(
    driver: &dyn crate::driver::NetworkDriver,
    record: &mut NetworkRecord,
) -> Result<()> {
    let mut options = record.network.spec.driver_config.options.clone();
    if let Some(existing) = &record.network.driver_state {
        for (k, v) in &existing.options {
            options.insert(k.clone(), v.clone());
        }
    }

    let ipv4: Vec<IpamData> = record
        .network
        .ipam
        .configs
        .iter()
        .filter(|c| !c.is_v6())
        .filter_map(|c| {
            let pool = c.subnet?;
            let gateway = c
                .gateway
                .and_then(|ip| IpNetwork::new(ip, pool.prefix()).ok());
            Some(IpamData { pool, gateway })
        })
        .collect();

    let driver_options = driver
        .network_allocate(&record.network.id, &options, &ipv4, &[])
        .await
        .map_err(|e| AllocatorError::DriverAllocateFailed {
            network_id: record.network.id.to_string(),
            reason: e.to_string(),
        })?;

    record.network.driver_state = Some(DriverState {
        name: record
            .network
            .spec
            .driver_config
            .name
            .clone()
            .unwrap_or_else(|| crate::driver::DEFAULT_DRIVER.to_string()),
        options: driver_options,
    });
    Ok(())
}

/// `freeDriverState(network)` (spec.md §4.6).
async fn free_driver_state(
    driver: &dyn crate::driver::NetworkDriver,
    network_id: &NetworkId,
) -> Result<()> {
    driver
        .network_free(network_id)
        .await
        .map_err(|e| AllocatorError::DriverFreeFailed {
            network_id: network_id.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverRegistry;
    use crate::ipam_driver::InMemoryIpamDriver;
    use crate::mock::MockNetworkDriver;
    use crate::types::{DriverConfig, IpamConfig, IpamSpec, NetworkSpec};
    use std::sync::Arc;

    async fn registry_with_mocks() -> DriverRegistry {
        let registry = DriverRegistry::new(None);
        registry
            .add_driver("overlay", Arc::new(MockNetworkDriver::global()))
            .await;
        registry
            .add_driver("bridge", Arc::new(MockNetworkDriver::local()))
            .await;
        registry
            .add_ipam_driver("default", Arc::new(InMemoryIpamDriver::new()))
            .await;
        registry
    }

    #[tokio::test]
    async fn test_allocate_overlay_single_ipv4_pool() {
        let registry = registry_with_mocks().await;
        let subnet: IpNetwork = "10.0.0.0/24".parse().unwrap();
        let network = Network::new(
            "net-1",
            NetworkSpec {
                name: "net-1".into(),
                driver_config: DriverConfig {
                    name: Some("overlay".into()),
                    ..Default::default()
                },
                ipam: IpamSpec {
                    configs: vec![IpamConfig {
                        subnet: Some(subnet),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let record = allocate(&registry, network).await.unwrap();
        assert_eq!(record.pools.len(), 1);
        assert!(record.pools.contains_key("10.0.0.0/24"));
        assert_eq!(
            record.network.ipam.configs[0].gateway,
            Some("10.0.0.1".parse().unwrap())
        );
        assert_eq!(record.network.driver_state.as_ref().unwrap().name, "overlay");
    }

    #[tokio::test]
    async fn test_allocate_node_local_network() {
        let registry = registry_with_mocks().await;
        let network = Network::new(
            "net-local",
            NetworkSpec {
                name: "net-local".into(),
                driver_config: DriverConfig {
                    name: Some("bridge".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let record = allocate(&registry, network).await.unwrap();
        assert!(record.is_node_local);
        assert!(record.pools.is_empty());
        assert_eq!(record.network.driver_state.as_ref().unwrap().name, "bridge");

        deallocate(&registry, record).await.unwrap();
    }

    #[tokio::test]
    async fn test_deallocate_releases_pools_and_driver_state() {
        let registry = registry_with_mocks().await;
        let subnet: IpNetwork = "10.0.0.0/24".parse().unwrap();
        let network = Network::new(
            "net-2",
            NetworkSpec {
                name: "net-2".into(),
                driver_config: DriverConfig {
                    name: Some("overlay".into()),
                    ..Default::default()
                },
                ipam: IpamSpec {
                    configs: vec![IpamConfig {
                        subnet: Some(subnet),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let record = allocate(&registry, network).await.unwrap();
        deallocate(&registry, record).await.unwrap();
    }
}
