//! Service allocation: published ports plus per-network virtual IPs
//! (spec.md §4.7).

use std::collections::{HashMap, HashSet};

use crate::driver::DriverRegistry;
use crate::network::NetworkRecord;
use crate::portalloc::PortAllocator;
use crate::predicates;
use crate::types::{AllocationOptions, Network, NetworkId, ResolutionMode, Service, Vip};
use crate::vip;

/// `ServiceNeedsAllocation(service, opts)` (spec.md §4.7 step 1).
///
/// A live VIP on the ingress network is exempted from the "every live VIP
/// must be in the spec" check when the service still needs ingress — that
/// VIP legitimately has no corresponding spec network attachment.
pub fn service_needs_allocation(
    service: &Service,
    networks: &[Network],
    ports: &PortAllocator,
    opts: AllocationOptions,
) -> bool {
    if !ports.is_ports_allocated_on_init(service, opts) {
        return true;
    }

    let desired: HashSet<&NetworkId> = service
        .spec
        .desired_networks()
        .iter()
        .map(|n| &n.target)
        .collect();

    let Some(endpoint) = service.endpoint.as_ref() else {
        return !desired.is_empty() || !service.spec.endpoint.ports.is_empty();
    };

    match service.spec.endpoint.mode {
        ResolutionMode::DnsRoundRobin => !endpoint.vips.is_empty(),
        ResolutionMode::VirtualIp => {
            if desired
                .iter()
                .any(|target| !endpoint.vips.iter().any(|v| &&v.network_id == target))
            {
                return true;
            }
            let needs_ingress = predicates::is_ingress_network_needed(service, networks);
            endpoint.vips.iter().any(|v| {
                !desired.contains(&v.network_id)
                    && !(needs_ingress && predicates::is_vip_on_ingress_network(v, networks))
            })
        }
    }
}

/// `ServiceAllocate(service, networks, ports, opts)` (spec.md §4.7).
///
/// Allocates ports before VIPs — a port conflict must be caught before any
/// VIP resources are claimed for the service. Per step 1, any error raised
/// once ports are claimed triggers a full `ServiceDeallocate` of whatever
/// this call itself obtained (ports plus any VIPs reconciled so far) before
/// the error is returned to the caller.
pub async fn service_allocate(
    registry: &DriverRegistry,
    records: &mut HashMap<NetworkId, NetworkRecord>,
    ports: &PortAllocator,
    service: &mut Service,
) -> crate::error::Result<()> {
    ports.service_allocate_ports(service)?;

    let endpoint = service.endpoint.get_or_insert_with(Default::default);
    endpoint.spec = service.spec.endpoint.clone();

    if service.spec.endpoint.mode == ResolutionMode::DnsRoundRobin {
        let mut stale = std::mem::take(&mut endpoint.vips);
        for v in &mut stale {
            if let Some(record) = records.get_mut(&v.network_id) {
                vip::deallocate_vip(registry, record, v).await;
            }
        }
        return Ok(());
    }

    match reconcile_vips(registry, records, service).await {
        Ok(vips) => {
            service.endpoint.as_mut().unwrap().vips = vips;
            Ok(())
        }
        Err((err, partial)) => {
            for mut v in partial {
                if let Some(record) = records.get_mut(&v.network_id) {
                    vip::deallocate_vip(registry, record, &mut v).await;
                }
            }
            if let Some(endpoint) = service.endpoint.as_mut() {
                endpoint.vips.clear();
            }
            ports.service_deallocate_ports(service);
            Err(err)
        }
    }
}

/// Drives steps 5-6 of `ServiceAllocate` (reconcile existing VIPs, then add
/// missing ones). On failure, returns every VIP this call itself already
/// claimed an address for, so the caller can roll them back — the discarded
/// VIPs released in the first loop below need no further handling since
/// their addresses are already freed by the time any subsequent step fails.
async fn reconcile_vips(
    registry: &DriverRegistry,
    records: &mut HashMap<NetworkId, NetworkRecord>,
    service: &mut Service,
) -> std::result::Result<Vec<Vip>, (crate::error::AllocatorError, Vec<Vip>)> {
    let desired: Vec<NetworkId> = service
        .spec
        .desired_networks()
        .iter()
        .map(|n| n.target.clone())
        .collect();
    let desired_set: HashSet<&NetworkId> = desired.iter().collect();

    let all_networks: Vec<crate::types::Network> =
        records.values().map(|r| r.network.clone()).collect();
    let needs_ingress = predicates::is_ingress_network_needed(service, &all_networks);

    let endpoint = service.endpoint.as_mut().unwrap();
    let mut kept: Vec<Vip> = Vec::new();
    let mut discarded: Vec<Vip> = Vec::new();
    for v in std::mem::take(&mut endpoint.vips) {
        let on_needed_ingress = needs_ingress
            && records
                .get(&v.network_id)
                .map(|r| predicates::is_ingress_network(&r.network))
                .unwrap_or(false);
        if desired_set.contains(&v.network_id) || on_needed_ingress {
            kept.push(v);
        } else {
            discarded.push(v);
        }
    }

    for mut v in discarded {
        if let Some(record) = records.get_mut(&v.network_id) {
            vip::deallocate_vip(registry, record, &mut v).await;
        }
    }

    // Reallocate kept VIPs: a no-op when the address is already recorded in
    // the network's endpoints, but this is what re-derives the address if a
    // kept VIP somehow lost its allocation. `vips` accumulates every VIP
    // this call has successfully claimed so far, so a later failure can
    // roll back exactly that set.
    let mut vips: Vec<Vip> = Vec::new();
    for mut v in kept {
        if let Some(record) = records.get_mut(&v.network_id) {
            if let Err(e) = vip::allocate_vip(registry, record, &mut v, None).await {
                return Err((e, vips));
            }
        }
        vips.push(v);
    }

    let already_covered: HashSet<NetworkId> = vips.iter().map(|v| v.network_id.clone()).collect();
    for network_id in &desired {
        if already_covered.contains(network_id) {
            continue;
        }
        let record = match records.get_mut(network_id) {
            Some(r) => r,
            None => {
                return Err((
                    crate::error::AllocatorError::NoLocalState {
                        network_id: network_id.to_string(),
                    },
                    vips,
                ))
            }
        };
        let mut v = Vip::new(network_id.clone());
        if let Err(e) = vip::allocate_vip(registry, record, &mut v, None).await {
            return Err((e, vips));
        }
        vips.push(v);
    }

    Ok(vips)
}

/// `ServiceDeallocate(service)` (spec.md §4.7).
pub async fn service_deallocate(
    registry: &DriverRegistry,
    records: &mut HashMap<NetworkId, NetworkRecord>,
    ports: &PortAllocator,
    service: &mut Service,
) {
    ports.service_deallocate_ports(service);

    if let Some(endpoint) = service.endpoint.as_mut() {
        for v in &mut endpoint.vips {
            if let Some(record) = records.get_mut(&v.network_id) {
                vip::deallocate_vip(registry, record, v).await;
            }
        }
        endpoint.vips.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverRegistry;
    use crate::ipam::allocate_pools;
    use crate::ipam_driver::InMemoryIpamDriver;
    use crate::types::{
        DriverConfig, EndpointSpec, IpamConfig, IpamSpec, Network, NetworkAttachmentConfig,
        NetworkSpec, PortConfig, Protocol, PublishMode, ServiceSpec,
    };
    use ipnetwork::IpNetwork;
    use std::sync::Arc;

    async fn registry_with_network(id: &str, subnet: &str) -> (DriverRegistry, HashMap<NetworkId, NetworkRecord>) {
        let registry = DriverRegistry::new(None);
        registry
            .add_ipam_driver("default", Arc::new(InMemoryIpamDriver::new()))
            .await;
        let net: IpNetwork = subnet.parse().unwrap();
        let mut record = NetworkRecord {
            network: Network::new(
                id,
                NetworkSpec {
                    name: id.into(),
                    driver_config: DriverConfig::default(),
                    ipam: IpamSpec {
                        configs: vec![IpamConfig {
                            subnet: Some(net),
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                    ..Default::default()
                },
            ),
            ..Default::default()
        };
        allocate_pools(&registry, &mut record).await.unwrap();
        let mut records = HashMap::new();
        records.insert(NetworkId::from(id), record);
        (registry, records)
    }

    #[tokio::test]
    async fn test_service_allocate_assigns_vip_per_network() {
        let (registry, mut records) = registry_with_network("net-a", "10.5.0.0/24").await;
        let ports = PortAllocator::new();
        let mut service = Service::new(
            "svc-a",
            ServiceSpec {
                endpoint: EndpointSpec {
                    mode: ResolutionMode::VirtualIp,
                    ports: vec![PortConfig {
                        name: "web".into(),
                        protocol: Protocol::Tcp,
                        target_port: 80,
                        published_port: None,
                        publish_mode: PublishMode::Ingress,
                    }],
                },
                networks: vec![NetworkAttachmentConfig::new("net-a")],
                task_networks: vec![],
            },
        );

        service_allocate(&registry, &mut records, &ports, &mut service)
            .await
            .unwrap();
        let endpoint = service.endpoint.unwrap();
        assert_eq!(endpoint.vips.len(), 1);
        assert!(!endpoint.vips[0].addr.is_empty());
        assert_eq!(endpoint.ports.len(), 1);
    }

    #[tokio::test]
    async fn test_service_needs_allocation_initially_true() {
        let (_registry, _records) = registry_with_network("net-b", "10.6.0.0/24").await;
        let ports = PortAllocator::new();
        let service = Service::new(
            "svc-b",
            ServiceSpec {
                networks: vec![NetworkAttachmentConfig::new("net-b")],
                ..Default::default()
            },
        );
        assert!(service_needs_allocation(
            &service,
            &[],
            &ports,
            AllocationOptions::default()
        ));
    }

    #[tokio::test]
    async fn test_service_switch_to_dns_round_robin_releases_vips() {
        let (registry, mut records) = registry_with_network("net-c", "10.7.0.0/24").await;
        let ports = PortAllocator::new();
        let mut service = Service::new(
            "svc-c",
            ServiceSpec {
                endpoint: EndpointSpec {
                    mode: ResolutionMode::VirtualIp,
                    ports: vec![],
                },
                networks: vec![NetworkAttachmentConfig::new("net-c")],
                task_networks: vec![],
            },
        );
        service_allocate(&registry, &mut records, &ports, &mut service)
            .await
            .unwrap();
        assert_eq!(service.endpoint.as_ref().unwrap().vips.len(), 1);

        service.spec.endpoint.mode = ResolutionMode::DnsRoundRobin;
        service_allocate(&registry, &mut records, &ports, &mut service)
            .await
            .unwrap();
        assert!(service.endpoint.as_ref().unwrap().vips.is_empty());
    }

    #[tokio::test]
    async fn test_service_deallocate_releases_ports_and_vips() {
        let (registry, mut records) = registry_with_network("net-d", "10.8.0.0/24").await;
        let ports = PortAllocator::new();
        let mut service = Service::new(
            "svc-d",
            ServiceSpec {
                endpoint: EndpointSpec {
                    mode: ResolutionMode::VirtualIp,
                    ports: vec![PortConfig {
                        name: "web".into(),
                        protocol: Protocol::Tcp,
                        target_port: 80,
                        published_port: Some(8080),
                        publish_mode: PublishMode::Ingress,
                    }],
                },
                networks: vec![NetworkAttachmentConfig::new("net-d")],
                task_networks: vec![],
            },
        );
        service_allocate(&registry, &mut records, &ports, &mut service)
            .await
            .unwrap();

        service_deallocate(&registry, &mut records, &ports, &mut service).await;
        assert!(service.endpoint.as_ref().unwrap().vips.is_empty());
        assert!(service.endpoint.as_ref().unwrap().ports.is_empty());

        // The published port should be free for reuse now.
        let mut other = Service::new(
            "svc-e",
            ServiceSpec {
                endpoint: EndpointSpec {
                    mode: ResolutionMode::VirtualIp,
                    ports: vec![PortConfig {
                        name: "web".into(),
                        protocol: Protocol::Tcp,
                        target_port: 80,
                        published_port: Some(8080),
                        publish_mode: PublishMode::Ingress,
                    }],
                },
                networks: vec![],
                task_networks: vec![],
            },
        );
        ports.service_allocate_ports(&mut other).unwrap();
    }

    #[tokio::test]
    async fn test_ingress_vip_retained_when_network_attachment_dropped() {
        let registry = DriverRegistry::new(None);
        registry
            .add_ipam_driver("default", Arc::new(InMemoryIpamDriver::new()))
            .await;
        let mut records = HashMap::new();
        for (id, subnet, ingress) in
            [("net-app", "10.12.0.0/24", false), ("net-ingress", "10.13.0.0/24", true)]
        {
            let net: IpNetwork = subnet.parse().unwrap();
            let mut record = NetworkRecord {
                network: Network::new(
                    id,
                    NetworkSpec {
                        name: id.into(),
                        driver_config: DriverConfig::default(),
                        ingress,
                        ipam: IpamSpec {
                            configs: vec![IpamConfig {
                                subnet: Some(net),
                                ..Default::default()
                            }],
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                ),
                ..Default::default()
            };
            allocate_pools(&registry, &mut record).await.unwrap();
            records.insert(NetworkId::from(id), record);
        }

        let ports = PortAllocator::new();
        let mut service = Service::new(
            "svc-ingress",
            ServiceSpec {
                endpoint: EndpointSpec {
                    mode: ResolutionMode::VirtualIp,
                    ports: vec![PortConfig {
                        name: "web".into(),
                        protocol: Protocol::Tcp,
                        target_port: 80,
                        published_port: None,
                        publish_mode: PublishMode::Ingress,
                    }],
                },
                networks: vec![
                    NetworkAttachmentConfig::new("net-app"),
                    NetworkAttachmentConfig::new("net-ingress"),
                ],
                task_networks: vec![],
            },
        );
        service_allocate(&registry, &mut records, &ports, &mut service)
            .await
            .unwrap();
        assert_eq!(service.endpoint.as_ref().unwrap().vips.len(), 2);
        let ingress_addr = service
            .endpoint
            .as_ref()
            .unwrap()
            .vips
            .iter()
            .find(|v| v.network_id.as_str() == "net-ingress")
            .unwrap()
            .addr
            .clone();

        // Drop the explicit attachment to the ingress network; the service
        // still publishes an ingress port, so the ingress VIP must survive.
        service.spec.networks = vec![NetworkAttachmentConfig::new("net-app")];
        service_allocate(&registry, &mut records, &ports, &mut service)
            .await
            .unwrap();
        let endpoint = service.endpoint.as_ref().unwrap();
        assert_eq!(endpoint.vips.len(), 2);
        let retained = endpoint
            .vips
            .iter()
            .find(|v| v.network_id.as_str() == "net-ingress")
            .unwrap();
        assert_eq!(retained.addr, ingress_addr);
    }

    #[tokio::test]
    async fn test_service_allocate_rolls_back_ports_and_vips_on_mid_failure() {
        let registry = DriverRegistry::new(None);
        registry
            .add_ipam_driver("default", Arc::new(InMemoryIpamDriver::new()))
            .await;

        let mut records = HashMap::new();
        for (id, subnet) in [("net-ok", "10.14.0.0/24"), ("net-tiny", "10.15.0.0/30")] {
            let net: IpNetwork = subnet.parse().unwrap();
            let mut record = NetworkRecord {
                network: Network::new(
                    id,
                    NetworkSpec {
                        name: id.into(),
                        driver_config: DriverConfig::default(),
                        ipam: IpamSpec {
                            configs: vec![IpamConfig {
                                subnet: Some(net),
                                ..Default::default()
                            }],
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                ),
                ..Default::default()
            };
            allocate_pools(&registry, &mut record).await.unwrap();
            records.insert(NetworkId::from(id), record);
        }

        // net-tiny is a /30: the gateway already took its one usable host
        // address, so any further VIP request against it fails.
        let tiny = records.get_mut(&NetworkId::from("net-tiny")).unwrap();
        let mut probe = crate::types::NetworkAttachment::new("net-tiny");
        let err = crate::ipam::allocate_network_ips(&registry, tiny, &mut probe).await;
        assert!(err.is_err());

        let ports = PortAllocator::new();
        let mut service = Service::new(
            "svc-rollback",
            ServiceSpec {
                endpoint: EndpointSpec {
                    mode: ResolutionMode::VirtualIp,
                    ports: vec![PortConfig {
                        name: "web".into(),
                        protocol: Protocol::Tcp,
                        target_port: 80,
                        published_port: Some(8123),
                        publish_mode: PublishMode::Ingress,
                    }],
                },
                networks: vec![
                    NetworkAttachmentConfig::new("net-ok"),
                    NetworkAttachmentConfig::new("net-tiny"),
                ],
                task_networks: vec![],
            },
        );

        let err = service_allocate(&registry, &mut records, &ports, &mut service)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::AllocatorError::NoAvailableIp { .. }));

        // The VIP claimed on net-ok before net-tiny failed must be released.
        let ok_record = records.get(&NetworkId::from("net-ok")).unwrap();
        assert!(ok_record.endpoints.is_empty());
        assert!(service.endpoint.as_ref().unwrap().vips.is_empty());

        // The ingress port must be released too, freeing it for another service.
        let mut other = Service::new(
            "svc-other",
            ServiceSpec {
                endpoint: EndpointSpec {
                    mode: ResolutionMode::VirtualIp,
                    ports: vec![PortConfig {
                        name: "web".into(),
                        protocol: Protocol::Tcp,
                        target_port: 80,
                        published_port: Some(8123),
                        publish_mode: PublishMode::Ingress,
                    }],
                },
                networks: vec![],
                task_networks: vec![],
            },
        );
        ports.service_allocate_ports(&mut other).unwrap();
    }
}
