//! Virtual-IP allocation for service endpoints (spec.md §4.8).

use ipnetwork::IpNetwork;

use crate::driver::DriverRegistry;
use crate::error::Result;
use crate::ipam;
use crate::network::NetworkRecord;
use crate::types::{NetworkAttachment, Vip};

/// `allocateVIP(vip, preferredAddress)` (spec.md §4.8). Locating the network
/// record and failing with *no-local-state* when it is absent is the
/// caller's job (the record is already in hand by the time this runs).
///
/// One behavior is carried over unchanged from the original design
/// (spec.md §9 Open Questions): `preferred_address` is parsed but never
/// actually forwarded as the preferred IP on the underlying request.
pub(crate) async fn allocate_vip(
    registry: &DriverRegistry,
    record: &mut NetworkRecord,
    vip: &mut Vip,
    _preferred_address: Option<&str>,
) -> Result<()> {
    if record.is_node_local {
        return Ok(());
    }

    let already_allocated = vip
        .addr
        .parse::<IpNetwork>()
        .map(|n| record.endpoints.contains_key(&n.ip().to_string()))
        .unwrap_or(false);
    if already_allocated {
        return Ok(());
    }

    let mut attachment = NetworkAttachment::new(vip.network_id.clone());
    ipam::allocate_network_ips(registry, record, &mut attachment).await?;
    vip.addr = attachment
        .addresses
        .into_iter()
        .next()
        .unwrap_or_default();
    Ok(())
}

/// `deallocateVIP(vip)` (spec.md §4.8).
pub(crate) async fn deallocate_vip(
    registry: &DriverRegistry,
    record: &mut NetworkRecord,
    vip: &mut Vip,
) {
    if vip.addr.is_empty() {
        return;
    }
    let mut attachment = NetworkAttachment {
        network: vip.network_id.clone(),
        addresses: vec![std::mem::take(&mut vip.addr)],
    };
    ipam::release_attachment_endpoints(registry, record, &mut attachment).await;
}
