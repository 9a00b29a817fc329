//! Assigns and releases L4 published ports for service endpoints
//! (spec.md §4.2).

use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Mutex;

use crate::error::{AllocatorError, Result};
use crate::types::{AllocationOptions, Endpoint, PortConfig, Protocol, PublishMode, Service, ServiceId};

/// Identity of a logical port within a service spec, stable across
/// reallocation so a dynamic port assignment can be reused on idempotent
/// reapply.
type PortKey = (String, Protocol, u16, PublishModeKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PublishModeKey {
    Ingress,
    Host,
}

fn port_key(p: &PortConfig) -> PortKey {
    let mode = match p.publish_mode {
        PublishMode::Ingress => PublishModeKey::Ingress,
        PublishMode::Host => PublishModeKey::Host,
    };
    (p.name.clone(), p.protocol, p.target_port, mode)
}

/// The dynamic port range used when a service does not request a specific
/// published port (the IANA ephemeral range, the same one Docker/swarmkit
/// draws from).
pub const DYNAMIC_PORT_RANGE: RangeInclusive<u16> = 49152..=65535;

pub struct PortAllocator {
    claims: Mutex<HashMap<(Protocol, u16), HashSet<ServiceId>>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            claims: Mutex::new(HashMap::new()),
        }
    }

    fn claimed_by_other(&self, key: (Protocol, u16), service_id: &ServiceId) -> bool {
        self.claims
            .lock()
            .unwrap()
            .get(&key)
            .map(|owners| owners.iter().any(|id| id != service_id))
            .unwrap_or(false)
    }

    fn claim(&self, key: (Protocol, u16), service_id: ServiceId) {
        self.claims
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .insert(service_id);
    }

    fn unclaim(&self, key: (Protocol, u16), service_id: &ServiceId) {
        let mut claims = self.claims.lock().unwrap();
        if let Some(owners) = claims.get_mut(&key) {
            owners.remove(service_id);
            if owners.is_empty() {
                claims.remove(&key);
            }
        }
    }

    fn find_free_port(&self, protocol: Protocol, service_id: &ServiceId) -> Option<u16> {
        let claims = self.claims.lock().unwrap();
        DYNAMIC_PORT_RANGE.into_iter().find(|candidate| {
            claims
                .get(&(protocol, *candidate))
                .map(|owners| owners.is_empty() || owners.contains(service_id))
                .unwrap_or(true)
        })
    }

    /// `ServiceAllocatePorts(service)` (spec.md §4.2).
    pub fn service_allocate_ports(&self, service: &mut Service) -> Result<()> {
        let spec_ports = service.spec.endpoint.ports.clone();
        let previously_assigned: HashMap<PortKey, u16> = service
            .endpoint
            .as_ref()
            .map(|e| {
                e.ports
                    .iter()
                    .filter_map(|p| p.published_port.map(|port| (port_key(p), port)))
                    .collect()
            })
            .unwrap_or_default();

        let mut assigned = Vec::with_capacity(spec_ports.len());
        for port in &spec_ports {
            let mut resolved = port.clone();
            let key = port_key(port);

            let published = if let Some(existing) = previously_assigned.get(&key) {
                // Idempotent reapply: keep (and re-claim) the previous assignment.
                *existing
            } else if let Some(requested) = port.published_port {
                if self.claimed_by_other((port.protocol, requested), &service.id) {
                    return Err(AllocatorError::PortUnavailable {
                        port: requested,
                        protocol: port.protocol,
                    });
                }
                requested
            } else {
                self.find_free_port(port.protocol, &service.id)
                    .ok_or(AllocatorError::NoAvailableIp {
                        network_id: "dynamic-port-range".to_string(),
                    })?
            };

            self.claim((port.protocol, published), service.id.clone());
            resolved.published_port = Some(published);
            assigned.push(resolved);
        }

        // Release claims for ports dropped from the spec.
        let new_keys: HashSet<(Protocol, u16)> = assigned
            .iter()
            .map(|p| (p.protocol, p.published_port.unwrap()))
            .collect();
        for (key, port) in &previously_assigned {
            let claim_key = (key.1, *port);
            if !new_keys.contains(&claim_key) {
                self.unclaim(claim_key, &service.id);
            }
        }

        let endpoint = service.endpoint.get_or_insert_with(Endpoint::default);
        endpoint.ports = assigned;
        Ok(())
    }

    /// `ServiceDeallocatePorts(service)` (spec.md §4.2).
    pub fn service_deallocate_ports(&self, service: &mut Service) {
        if let Some(endpoint) = service.endpoint.as_mut() {
            for port in &endpoint.ports {
                if let Some(published) = port.published_port {
                    self.unclaim((port.protocol, published), &service.id);
                }
            }
            endpoint.ports.clear();
        }
    }

    /// `HostPublishPortsNeedUpdate(service)` (spec.md §4.2).
    pub fn host_publish_ports_need_update(&self, service: &Service) -> bool {
        let spec_host: HashSet<PortKey> = service
            .spec
            .endpoint
            .ports
            .iter()
            .filter(|p| p.publish_mode == PublishMode::Host)
            .map(port_key)
            .collect();
        let live_host: HashSet<PortKey> = service
            .endpoint
            .as_ref()
            .map(|e| {
                e.ports
                    .iter()
                    .filter(|p| p.publish_mode == PublishMode::Host)
                    .map(port_key)
                    .collect()
            })
            .unwrap_or_default();
        spec_host != live_host
    }

    /// `IsPortsAllocatedOnInit(service, onInit)` (spec.md §4.2).
    pub fn is_ports_allocated_on_init(&self, service: &Service, opts: AllocationOptions) -> bool {
        let Some(endpoint) = service.endpoint.as_ref() else {
            return service.spec.endpoint.ports.is_empty();
        };

        if opts.on_init {
            // Tolerate already-assigned dynamic ports: compare only by
            // logical identity, not by the specific published value.
            let spec_keys: HashSet<PortKey> =
                service.spec.endpoint.ports.iter().map(port_key).collect();
            let live_keys: HashSet<PortKey> = endpoint.ports.iter().map(port_key).collect();
            return spec_keys == live_keys;
        }

        if service.spec.endpoint.ports.len() != endpoint.ports.len() {
            return false;
        }
        let live: HashMap<PortKey, u16> = endpoint
            .ports
            .iter()
            .filter_map(|p| p.published_port.map(|port| (port_key(p), port)))
            .collect();
        service.spec.endpoint.ports.iter().all(|p| {
            let key = port_key(p);
            match (p.published_port, live.get(&key)) {
                (Some(requested), Some(actual)) => requested == *actual,
                (None, Some(_)) => true,
                _ => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EndpointSpec, ServiceSpec};

    fn port(name: &str, target: u16, requested: Option<u16>, mode: PublishMode) -> PortConfig {
        PortConfig {
            name: name.to_string(),
            protocol: Protocol::Tcp,
            target_port: target,
            published_port: requested,
            publish_mode: mode,
        }
    }

    fn service_with_ports(id: &str, ports: Vec<PortConfig>) -> Service {
        Service::new(
            id,
            ServiceSpec {
                endpoint: EndpointSpec {
                    ports,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_allocate_honors_requested_port() {
        let allocator = PortAllocator::new();
        let mut service = service_with_ports("svc-a", vec![port("web", 80, Some(8080), PublishMode::Ingress)]);
        allocator.service_allocate_ports(&mut service).unwrap();
        assert_eq!(
            service.endpoint.unwrap().ports[0].published_port,
            Some(8080)
        );
    }

    #[test]
    fn test_allocate_conflicting_requested_port_fails() {
        let allocator = PortAllocator::new();
        let mut a = service_with_ports("svc-a", vec![port("web", 80, Some(8080), PublishMode::Ingress)]);
        allocator.service_allocate_ports(&mut a).unwrap();

        let mut b = service_with_ports("svc-b", vec![port("web", 80, Some(8080), PublishMode::Ingress)]);
        let err = allocator.service_allocate_ports(&mut b).unwrap_err();
        assert!(matches!(err, AllocatorError::PortUnavailable { .. }));
    }

    #[test]
    fn test_allocate_dynamic_port_is_idempotent() {
        let allocator = PortAllocator::new();
        let mut service = service_with_ports("svc-a", vec![port("web", 80, None, PublishMode::Ingress)]);
        allocator.service_allocate_ports(&mut service).unwrap();
        let first = service.endpoint.as_ref().unwrap().ports[0].published_port;

        allocator.service_allocate_ports(&mut service).unwrap();
        let second = service.endpoint.as_ref().unwrap().ports[0].published_port;
        assert_eq!(first, second);
    }

    #[test]
    fn test_deallocate_releases_claims() {
        let allocator = PortAllocator::new();
        let mut a = service_with_ports("svc-a", vec![port("web", 80, Some(8080), PublishMode::Ingress)]);
        allocator.service_allocate_ports(&mut a).unwrap();
        allocator.service_deallocate_ports(&mut a);

        let mut b = service_with_ports("svc-b", vec![port("web", 80, Some(8080), PublishMode::Ingress)]);
        allocator.service_allocate_ports(&mut b).unwrap();
        assert_eq!(b.endpoint.unwrap().ports[0].published_port, Some(8080));
    }

    #[test]
    fn test_host_publish_ports_need_update() {
        let allocator = PortAllocator::new();
        let mut service = service_with_ports("svc-a", vec![port("web", 80, None, PublishMode::Ingress)]);
        allocator.service_allocate_ports(&mut service).unwrap();
        assert!(!allocator.host_publish_ports_need_update(&service));

        service
            .spec
            .endpoint
            .ports
            .push(port("admin", 9000, None, PublishMode::Host));
        assert!(allocator.host_publish_ports_need_update(&service));
    }
}
