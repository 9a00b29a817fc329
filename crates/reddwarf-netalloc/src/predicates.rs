//! Allocation-state predicates used by callers (and the allocator itself)
//! to decide whether (re)allocation is needed (spec.md §4.10).

use crate::driver::{is_built_in_driver, LABEL_INGRESS_INTERNAL, LABEL_PREDEFINED};
use crate::types::{Network, NetworkId, Node, Service, Task};

pub use crate::driver::is_built_in_driver as is_built_in_driver_name;

/// `IsAllocated(network)`: a network is allocated once it carries driver
/// state (node-local networks never get pools, so driver state alone is
/// the signal).
pub fn is_allocated(network: &Network) -> bool {
    network.driver_state.is_some()
}

/// `IsTaskAllocated(task, desiredNetworks)`: every desired network must be
/// present in the task's attachments with a non-empty address list, unless
/// the network is node-local (no addresses are ever assigned to those).
pub fn is_task_allocated(
    task: &Task,
    desired: &[crate::types::NetworkAttachmentConfig],
    node_local: impl Fn(&NetworkId) -> bool,
) -> bool {
    desired.iter().all(|want| {
        task.attachments.iter().any(|have| {
            have.network == want.target && (node_local(&want.target) || !have.addresses.is_empty())
        })
    })
}

/// `IsNodeAllocated(node, networkID)`.
pub fn is_node_allocated(node: &Node, network_id: &NetworkId, node_local: bool) -> bool {
    node.attachment.network == *network_id
        && (node_local || !node.attachment.addresses.is_empty())
}

/// `IsIngressNetwork(network)`: matches either the explicit ingress flag or
/// the legacy name + internal-label convention.
pub fn is_ingress_network(network: &Network) -> bool {
    if network.spec.ingress {
        return true;
    }
    network.spec.name == crate::driver::INGRESS_NETWORK_NAME
        && network.spec.labels.contains_key(LABEL_INGRESS_INTERNAL)
}

/// `IsIngressNetworkNeeded(service)`: true if the service publishes any
/// port in ingress mode and does not already attach to an ingress network.
pub fn is_ingress_network_needed(service: &Service, networks: &[Network]) -> bool {
    let publishes_ingress_port = service
        .spec
        .endpoint
        .ports
        .iter()
        .any(|p| p.publish_mode == crate::types::PublishMode::Ingress);
    if !publishes_ingress_port {
        return false;
    }

    let attached_to_ingress = service.spec.networks.iter().any(|attachment| {
        networks
            .iter()
            .any(|n| n.id == attachment.target && is_ingress_network(n))
    });
    !attached_to_ingress
}

/// `IsVIPOnIngressNetwork(vip, networks)`.
pub fn is_vip_on_ingress_network(vip: &crate::types::Vip, networks: &[Network]) -> bool {
    networks
        .iter()
        .any(|n| n.id == vip.network_id && is_ingress_network(n))
}
