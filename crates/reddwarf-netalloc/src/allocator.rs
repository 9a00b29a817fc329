//! Top-level allocator facade tying the driver registry, port allocator,
//! and per-network IPAM state together behind one object (spec.md §6).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::driver::{DriverRegistry, IpamDriver, NetworkDriver, PluginGetter};
use crate::error::{AllocatorError, Result};
use crate::network::{self, NetworkRecord};
use crate::portalloc::PortAllocator;
use crate::predicates;
use crate::service;
use crate::task_node;
use crate::types::{
    AllocationOptions, Network, NetworkAttachmentConfig, NetworkId, Node, NodeId, Service,
    ServiceId, Task, TaskId,
};

/// The cluster network allocator: the single entry point a control plane
/// embeds to turn network/service/task/node specs into concrete IPAM and
/// driver-backed allocations.
///
/// Besides the per-network IPAM state, it maintains the allocated-ID index
/// sets from spec.md §3's `AllocatorState` — services/tasks/nodes are
/// tracked separately from whether their resources happen to be live,
/// since e.g. a service with no VIPs left is removed from the index even
/// though it may still exist upstream.
pub struct NetworkAllocator {
    registry: DriverRegistry,
    ports: PortAllocator,
    networks: Mutex<HashMap<NetworkId, NetworkRecord>>,
    services: Mutex<HashSet<ServiceId>>,
    tasks: Mutex<HashSet<TaskId>>,
    nodes: Mutex<HashSet<NodeId>>,
}

impl NetworkAllocator {
    pub fn new(plugin_getter: Option<Arc<dyn PluginGetter>>) -> Self {
        Self {
            registry: DriverRegistry::new(plugin_getter),
            ports: PortAllocator::new(),
            networks: Mutex::new(HashMap::new()),
            services: Mutex::new(HashSet::new()),
            tasks: Mutex::new(HashSet::new()),
            nodes: Mutex::new(HashSet::new()),
        }
    }

    pub async fn add_driver(&self, name: impl Into<String>, driver: Arc<dyn NetworkDriver>) {
        self.registry.add_driver(name, driver).await;
    }

    pub async fn add_ipam_driver(&self, name: impl Into<String>, driver: Arc<dyn IpamDriver>) {
        self.registry.add_ipam_driver(name, driver).await;
    }

    /// `AllocateNetwork(network)` (spec.md §4.3).
    pub async fn allocate_network(&self, network: Network) -> Result<Network> {
        let mut networks = self.networks.lock().await;
        if networks.contains_key(&network.id) {
            return Err(AllocatorError::AlreadyAllocated {
                network_id: network.id.to_string(),
            });
        }
        let id = network.id.clone();
        let record = network::allocate(&self.registry, network).await?;
        let result = record.network.clone();
        networks.insert(id, record);
        Ok(result)
    }

    /// `DeallocateNetwork(networkID)` (spec.md §4.3).
    pub async fn deallocate_network(&self, network_id: &NetworkId) -> Result<()> {
        let mut networks = self.networks.lock().await;
        let record = networks
            .remove(network_id)
            .ok_or_else(|| AllocatorError::NotAllocated {
                resource_id: network_id.to_string(),
            })?;
        network::deallocate(&self.registry, record).await
    }

    pub async fn service_needs_allocation(&self, service: &Service, opts: AllocationOptions) -> bool {
        let networks = self.networks_snapshot().await;
        service::service_needs_allocation(service, &networks, &self.ports, opts)
    }

    /// `ServiceAllocate(service)` (spec.md §4.7).
    pub async fn allocate_service(&self, service: &mut Service) -> Result<()> {
        let mut networks = self.networks.lock().await;
        service::service_allocate(&self.registry, &mut networks, &self.ports, service).await?;

        // Step 7: a non-empty resulting VIP list keeps the service in the
        // index; an empty one (DNS round-robin, or a VirtualIp service with
        // no networks) removes it.
        let has_vips = service
            .endpoint
            .as_ref()
            .map(|e| !e.vips.is_empty())
            .unwrap_or(false);
        let mut services = self.services.lock().await;
        if has_vips {
            services.insert(service.id.clone());
        } else {
            services.remove(&service.id);
        }
        Ok(())
    }

    /// `ServiceDeallocate(service)` (spec.md §4.7).
    pub async fn deallocate_service(&self, service: &mut Service) {
        let mut networks = self.networks.lock().await;
        service::service_deallocate(&self.registry, &mut networks, &self.ports, service).await;
        self.services.lock().await.remove(&service.id);
    }

    /// `AllocateTask(task, desiredNetworks)` (spec.md §4.9).
    pub async fn allocate_task(
        &self,
        task: &mut Task,
        desired: &[NetworkAttachmentConfig],
    ) -> Result<()> {
        let mut networks = self.networks.lock().await;
        task_node::allocate_task(&self.registry, &mut networks, task, desired).await?;
        self.tasks.lock().await.insert(task.id.clone());
        Ok(())
    }

    /// `DeallocateTask(task)` (spec.md §4.9).
    pub async fn deallocate_task(&self, task: &mut Task) {
        let mut networks = self.networks.lock().await;
        task_node::deallocate_task(&self.registry, &mut networks, task).await;
        self.tasks.lock().await.remove(&task.id);
    }

    /// `AllocateNode(node, networkID)` (spec.md §4.9).
    pub async fn allocate_node(&self, node: &mut Node, network_id: NetworkId) -> Result<()> {
        let mut networks = self.networks.lock().await;
        task_node::allocate_node(&self.registry, &mut networks, node, network_id).await?;
        self.nodes.lock().await.insert(node.id.clone());
        Ok(())
    }

    /// `DeallocateNode(node)` (spec.md §4.9).
    pub async fn deallocate_node(&self, node: &mut Node) {
        let mut networks = self.networks.lock().await;
        task_node::deallocate_node(&self.registry, &mut networks, node).await;
        self.nodes.lock().await.remove(&node.id);
    }

    pub async fn is_allocated(&self, network_id: &NetworkId) -> bool {
        let networks = self.networks.lock().await;
        networks
            .get(network_id)
            .map(|r| predicates::is_allocated(&r.network))
            .unwrap_or(false)
    }

    pub async fn is_task_allocated(
        &self,
        task: &Task,
        desired: &[NetworkAttachmentConfig],
    ) -> bool {
        if !self.tasks.lock().await.contains(&task.id) {
            return false;
        }
        let networks = self.networks.lock().await;
        predicates::is_task_allocated(task, desired, |id| {
            networks.get(id).map(|r| r.is_node_local).unwrap_or(false)
        })
    }

    pub async fn is_node_allocated(&self, node: &Node, network_id: &NetworkId) -> bool {
        if !self.nodes.lock().await.contains(&node.id) {
            return false;
        }
        let networks = self.networks.lock().await;
        let node_local = networks
            .get(network_id)
            .map(|r| r.is_node_local)
            .unwrap_or(false);
        predicates::is_node_allocated(node, network_id, node_local)
    }

    /// Snapshot of currently-allocated networks, for predicates like
    /// `IsIngressNetworkNeeded` that must scan the whole set.
    pub async fn networks_snapshot(&self) -> Vec<Network> {
        self.networks
            .lock()
            .await
            .values()
            .map(|r| r.network.clone())
            .collect()
    }
}
