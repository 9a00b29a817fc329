//! Task and node network attachment allocation (spec.md §4.9).

use std::collections::HashMap;

use crate::driver::DriverRegistry;
use crate::error::Result;
use crate::ipam;
use crate::network::NetworkRecord;
use crate::types::{NetworkAttachment, NetworkAttachmentConfig, NetworkId, Node, Task};

/// `AllocateTask(task, desiredNetworks)` (spec.md §4.9).
///
/// Node-local networks are skipped (they carry no pool/driver state); for
/// every other network an address is requested. On failure partway
/// through, the attachments obtained for earlier networks in this call are
/// released best-effort before the error is returned.
pub async fn allocate_task(
    registry: &DriverRegistry,
    records: &mut HashMap<NetworkId, NetworkRecord>,
    task: &mut Task,
    desired: &[NetworkAttachmentConfig],
) -> Result<()> {
    let already: std::collections::HashSet<NetworkId> =
        task.attachments.iter().map(|a| a.network.clone()).collect();

    let mut new_attachments: Vec<NetworkAttachment> = Vec::new();

    for config in desired {
        if already.contains(&config.target) {
            continue;
        }

        let record = records.get_mut(&config.target).ok_or_else(|| {
            crate::error::AllocatorError::NoLocalState {
                network_id: config.target.to_string(),
            }
        })?;

        let mut attachment = NetworkAttachment::new(config.target.clone());
        if !record.is_node_local {
            if let Err(e) = ipam::allocate_network_ips(registry, record, &mut attachment).await {
                for mut done in new_attachments.into_iter().rev() {
                    if let Some(r) = records.get_mut(&done.network) {
                        ipam::release_attachment_endpoints(registry, r, &mut done).await;
                    }
                }
                return Err(e);
            }
        }
        new_attachments.push(attachment);
    }

    task.attachments.extend(new_attachments);
    Ok(())
}

/// `DeallocateTask(task)` (spec.md §4.9).
pub async fn deallocate_task(
    registry: &DriverRegistry,
    records: &mut HashMap<NetworkId, NetworkRecord>,
    task: &mut Task,
) {
    for mut attachment in std::mem::take(&mut task.attachments) {
        if let Some(record) = records.get_mut(&attachment.network) {
            if !record.is_node_local {
                ipam::release_attachment_endpoints(registry, record, &mut attachment).await;
            }
        }
    }
}

/// `AllocateNode(node, networkID)` (spec.md §4.9).
pub async fn allocate_node(
    registry: &DriverRegistry,
    records: &mut HashMap<NetworkId, NetworkRecord>,
    node: &mut Node,
    network_id: NetworkId,
) -> Result<()> {
    if node.attachment.network == network_id && !node.attachment.addresses.is_empty() {
        return Ok(());
    }

    let record = records
        .get_mut(&network_id)
        .ok_or_else(|| crate::error::AllocatorError::NoLocalState {
            network_id: network_id.to_string(),
        })?;

    let mut attachment = NetworkAttachment::new(network_id);
    if !record.is_node_local {
        ipam::allocate_network_ips(registry, record, &mut attachment).await?;
    }
    node.attachment = attachment;
    Ok(())
}

/// `DeallocateNode(node)` (spec.md §4.9).
pub async fn deallocate_node(
    registry: &DriverRegistry,
    records: &mut HashMap<NetworkId, NetworkRecord>,
    node: &mut Node,
) {
    let mut attachment = std::mem::replace(&mut node.attachment, NetworkAttachment::default());
    if let Some(record) = records.get_mut(&attachment.network) {
        if !record.is_node_local {
            ipam::release_attachment_endpoints(registry, record, &mut attachment).await;
        }
    }
}
