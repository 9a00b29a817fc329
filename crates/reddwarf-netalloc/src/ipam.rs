//! IPAM orchestration: requests/releases pools and addresses against the
//! driver layer on behalf of network/VIP/task allocation (spec.md §4.4, §4.5).

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::warn;

use crate::driver::{
    DriverRegistry, IpamDriver, NETLABEL_GATEWAY, OPT_ALLOC_SERIAL, OPT_REQUEST_ADDRESS_TYPE,
    VAL_REQUEST_ADDRESS_TYPE_GATEWAY,
};
use crate::error::{AllocatorError, IpamError, Result};
use crate::network::NetworkRecord;
use crate::types::{IpamConfig, NetworkAttachment, PoolId};

/// `allocatePools(network)` (spec.md §4.4).
///
/// Requests a pool per IPAM config (falling back to a single synthetic
/// IPv4 config if the network declares none), resolving a gateway for
/// each and backfilling the subnet/gateway the driver chose into the
/// network's published IPAM state. On failure partway through, releases
/// everything acquired so far for earlier configs.
pub(crate) async fn allocate_pools(
    registry: &DriverRegistry,
    record: &mut NetworkRecord,
) -> Result<()> {
    let (ipam_name, ipam) = registry
        .resolve_ipam(record.network.spec.ipam.driver.as_deref())
        .await?;
    let (_local_as, global_as) = ipam.default_address_spaces();

    let configs = if !record.network.ipam.configs.is_empty() {
        // Live IPAM state already exists (e.g. across a restart) and is
        // authoritative over the spec's declared configs.
        record.network.ipam.configs.clone()
    } else if !record.network.spec.ipam.configs.is_empty() {
        record.network.spec.ipam.configs.clone()
    } else {
        vec![IpamConfig::default()]
    };

    record.network.ipam.driver = Some(ipam_name);
    record.network.ipam.options = BTreeMap::new();
    record.network.ipam.configs = configs.clone();

    let mut acquired: Vec<(PoolId, Option<IpAddr>)> = Vec::new();

    for (idx, config) in configs.iter().enumerate() {
        match allocate_one_pool(ipam.as_ref(), &global_as, config, &record.network.id).await {
            Ok((pool_id, pool_cidr, resolved)) => {
                record.pools.insert(pool_cidr.to_string(), pool_id.clone());
                acquired.push((pool_id, resolved.gateway));
                record.network.ipam.configs[idx] = resolved;
            }
            Err(e) => {
                for (pool_id, gateway) in acquired.into_iter().rev() {
                    if let Some(gw) = gateway {
                        let _ = ipam.release_address(&pool_id, gw).await;
                    }
                    let _ = ipam.release_pool(&pool_id).await;
                }
                record.pools.clear();
                return Err(e);
            }
        }
    }

    Ok(())
}

async fn allocate_one_pool(
    ipam: &dyn IpamDriver,
    address_space: &str,
    config: &IpamConfig,
    network_id: &crate::types::NetworkId,
) -> Result<(PoolId, IpNetwork, IpamConfig)> {
    let (pool_id, pool_cidr, meta) = ipam
        .request_pool(
            address_space,
            config.subnet,
            config.range,
            &BTreeMap::new(),
            config.is_v6(),
        )
        .await
        .map_err(|e| AllocatorError::PoolRequestFailed {
            network_id: network_id.to_string(),
            reason: e.to_string(),
        })?;

    let mut resolved = config.clone();
    resolved.subnet = Some(pool_cidr);

    let gateway_from_meta = meta
        .get(NETLABEL_GATEWAY)
        .and_then(|s| s.parse::<IpAddr>().ok());

    let gateway_opts = || {
        let mut opts = BTreeMap::new();
        opts.insert(
            OPT_REQUEST_ADDRESS_TYPE.to_string(),
            VAL_REQUEST_ADDRESS_TYPE_GATEWAY.to_string(),
        );
        // By this point in allocatePools the network always has an IPAM
        // driver declared, so the serial-allocation option is always set.
        opts.insert(OPT_ALLOC_SERIAL.to_string(), "true".to_string());
        opts
    };

    let gateway = if let Some(gw) = gateway_from_meta {
        Some(gw)
    } else if let Some(existing) = config.gateway {
        // The subnet already carries a desired gateway; claim it explicitly
        // so the IPAM driver records it as allocated.
        let (assigned, _) = ipam
            .request_address(&pool_id, Some(existing), &gateway_opts())
            .await
            .map_err(|e| AllocatorError::AddressRequestFailed {
                reason: e.to_string(),
            })?;
        Some(assigned.ip())
    } else {
        let (assigned, _) = ipam
            .request_address(&pool_id, None, &gateway_opts())
            .await
            .map_err(|e| AllocatorError::AddressRequestFailed {
                reason: e.to_string(),
            })?;
        Some(assigned.ip())
    };

    resolved.gateway = gateway;
    Ok((pool_id, pool_cidr, resolved))
}

/// `releasePools(ipam, configs, pools)` (spec.md §4.5). Best-effort: every
/// release is attempted and failures are only logged, never propagated.
pub(crate) async fn release_pools(
    registry: &DriverRegistry,
    ipam_driver_name: Option<&str>,
    configs: &[IpamConfig],
    pools: &BTreeMap<String, PoolId>,
) {
    let ipam = match registry.resolve_ipam(ipam_driver_name).await {
        Ok((_, ipam)) => ipam,
        Err(e) => {
            warn!(error = %e, "no IPAM driver available to release pools");
            return;
        }
    };

    for config in configs {
        if let (Some(subnet), Some(gateway)) = (config.subnet, config.gateway) {
            if let Some(pool_id) = pools.get(&subnet.to_string()) {
                if let Err(e) = ipam.release_address(pool_id, gateway).await {
                    warn!(pool = %pool_id, error = %e, "failed to release gateway address");
                }
            }
        }
    }

    for pool_id in pools.values() {
        if let Err(e) = ipam.release_pool(pool_id).await {
            warn!(pool = %pool_id, error = %e, "failed to release pool");
        }
    }
}

/// Parses a requested address as CIDR, falling back to a bare IP; an empty
/// string means "no preference", but a non-empty string that is neither
/// errors out rather than silently falling through to driver-chosen
/// allocation (spec.md §4.5 step 4).
fn parse_requested_address(raw: &str) -> Result<Option<IpAddr>> {
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(net) = raw.parse::<IpNetwork>() {
        return Ok(Some(net.ip()));
    }
    raw.parse::<IpAddr>().map(Some).map_err(|_| AllocatorError::ParseError {
        input: raw.to_string(),
    })
}

/// `allocateNetworkIPs(network, attachment)` (spec.md §4.5).
///
/// Tries each requested address (or a single unset slot) against each of
/// the network's pools in turn, stopping at the first successful
/// allocation — an attachment with more than one requested address still
/// receives exactly one (spec.md §9 Open Questions).
pub(crate) async fn allocate_network_ips(
    registry: &DriverRegistry,
    record: &mut NetworkRecord,
    attachment: &mut NetworkAttachment,
) -> Result<()> {
    let (_, ipam) = registry
        .resolve_ipam(record.network.ipam.driver.as_deref())
        .await?;

    let serial = record.network.ipam.driver.is_some();
    let mut opts = BTreeMap::new();
    if serial {
        opts.insert(OPT_ALLOC_SERIAL.to_string(), "true".to_string());
    }

    let requested: Vec<Option<IpAddr>> = if attachment.addresses.is_empty() {
        vec![None]
    } else {
        attachment
            .addresses
            .iter()
            .map(|a| parse_requested_address(a))
            .collect::<Result<Vec<_>>>()?
    };

    for preferred in requested {
        for pool_id in record.pools.values() {
            match ipam.request_address(pool_id, preferred, &opts).await {
                Ok((assigned, _meta)) => {
                    record
                        .endpoints
                        .insert(assigned.ip().to_string(), pool_id.clone());
                    attachment.addresses = vec![assigned.to_string()];
                    return Ok(());
                }
                Err(IpamError::NoAvailableIps) | Err(IpamError::IpOutOfRange) => {
                    continue;
                }
                Err(e) => {
                    return Err(AllocatorError::AddressRequestFailed {
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    Err(AllocatorError::NoAvailableIp {
        network_id: record.network.id.to_string(),
    })
}

/// `releaseEndpoints(network, attachment)` (spec.md §4.5). Best-effort: any
/// error releasing one address is logged and the remaining addresses are
/// still attempted. Always clears the attachment's address list.
pub(crate) async fn release_attachment_endpoints(
    registry: &DriverRegistry,
    record: &mut NetworkRecord,
    attachment: &mut NetworkAttachment,
) {
    let ipam = match registry
        .resolve_ipam(record.network.ipam.driver.as_deref())
        .await
    {
        Ok((_, ipam)) => ipam,
        Err(e) => {
            warn!(network_id = %record.network.id, error = %e, "no IPAM driver available to release endpoints");
            attachment.addresses.clear();
            return;
        }
    };

    for addr in &attachment.addresses {
        let ip = addr
            .parse::<IpNetwork>()
            .map(|n| n.ip())
            .or_else(|_| addr.parse::<IpAddr>())
            .ok();
        let Some(ip) = ip else { continue };

        let pool_id = record.endpoints.remove(&ip.to_string());
        let Some(pool_id) = pool_id else { continue };

        if let Err(e) = ipam.release_address(&pool_id, ip).await {
            warn!(address = %ip, error = %e, "failed to release address");
        }
    }

    attachment.addresses.clear();
}
