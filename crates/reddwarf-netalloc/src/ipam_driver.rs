//! In-memory IPAM driver used to exercise and test the pool/address
//! orchestration layer (spec.md §6 specifies only the IPAM driver
//! *contract*; a runnable crate needs one concrete implementation,
//! grounded in `reddwarf_runtime::network::Ipam`'s sequential-allocation
//! approach, generalized from a single fixed CIDR to multiple pools).

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ipnetwork::IpNetwork;

use crate::driver::{IpamDriver, OPT_ALLOC_SERIAL, OPT_REQUEST_ADDRESS_TYPE, VAL_REQUEST_ADDRESS_TYPE_GATEWAY};
use crate::error::IpamError;
use crate::types::PoolId;

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from_be_bytes(v6.octets()),
    }
}

fn u128_to_ip(value: u128, v6: bool) -> IpAddr {
    if v6 {
        IpAddr::V6(Ipv6Addr::from(value.to_be_bytes()))
    } else {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    }
}

struct Pool {
    network: IpNetwork,
    allocated: HashSet<IpAddr>,
    /// Cursor for serial (non-reuse) allocation; only advances forward.
    serial_cursor: u128,
}

impl Pool {
    fn first_usable(&self) -> u128 {
        ip_to_u128(self.network.network()) + 1
    }

    fn last_usable(&self) -> u128 {
        let v6 = self.network.is_ipv6();
        let host_bits = if v6 {
            128 - self.network.prefix() as u32
        } else {
            32 - self.network.prefix() as u32
        };
        if host_bits >= 120 {
            // Unreasonably large pool for this in-memory driver; cap the
            // scan range rather than overflow u128 arithmetic.
            return ip_to_u128(self.network.network()) + (1u128 << 32);
        }
        let size = 1u128 << host_bits;
        let last = ip_to_u128(self.network.network()) + size - 1;
        // IPv4 networks reserve the broadcast address; IPv6 has none.
        if !v6 && host_bits >= 2 {
            last - 1
        } else {
            last
        }
    }
}

/// Sequential, in-memory IPAM driver. Not persistent, not clustered — a
/// stand-in for the real out-of-process IPAM plugins this crate delegates
/// to in production.
pub struct InMemoryIpamDriver {
    pools: Mutex<BTreeMap<String, Pool>>,
    next_pool_id: AtomicU64,
    next_auto_subnet: AtomicU64,
}

impl Default for InMemoryIpamDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIpamDriver {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(BTreeMap::new()),
            next_pool_id: AtomicU64::new(0),
            next_auto_subnet: AtomicU64::new(1),
        }
    }

    fn auto_subnet(&self, v6: bool) -> IpNetwork {
        let n = self.next_auto_subnet.fetch_add(1, Ordering::SeqCst);
        if v6 {
            let base = 0xfd00_0000_0000_0000_u128 << 64 | (n as u128) << 48;
            IpNetwork::new(IpAddr::V6(Ipv6Addr::from(base.to_be_bytes())), 64)
                .expect("fixed /64 prefix is always valid")
        } else {
            let octet2 = (n % 255) as u8;
            IpNetwork::new(IpAddr::V4(Ipv4Addr::new(10, octet2, 0, 0)), 24)
                .expect("fixed /24 prefix is always valid")
        }
    }
}

#[async_trait]
impl IpamDriver for InMemoryIpamDriver {
    async fn request_pool(
        &self,
        _address_space: &str,
        subnet: Option<IpNetwork>,
        _range: Option<IpNetwork>,
        _options: &BTreeMap<String, String>,
        v6: bool,
    ) -> std::result::Result<(PoolId, IpNetwork, BTreeMap<String, String>), IpamError> {
        let network = subnet.unwrap_or_else(|| self.auto_subnet(v6));
        let id = self.next_pool_id.fetch_add(1, Ordering::SeqCst);
        let pool_id = PoolId(format!("pool-{}", id));

        let first_usable = ip_to_u128(network.network()) + 1;
        self.pools.lock().unwrap().insert(
            pool_id.0.clone(),
            Pool {
                network,
                allocated: HashSet::new(),
                serial_cursor: first_usable,
            },
        );

        Ok((pool_id, network, BTreeMap::new()))
    }

    async fn release_pool(&self, pool: &PoolId) -> std::result::Result<(), IpamError> {
        self.pools.lock().unwrap().remove(&pool.0);
        Ok(())
    }

    async fn request_address(
        &self,
        pool: &PoolId,
        preferred: Option<IpAddr>,
        options: &BTreeMap<String, String>,
    ) -> std::result::Result<(IpNetwork, BTreeMap<String, String>), IpamError> {
        let mut pools = self.pools.lock().unwrap();
        let p = pools
            .get_mut(&pool.0)
            .ok_or_else(|| IpamError::Other(format!("unknown pool {}", pool.0)))?;

        let is_gateway_request = options
            .get(OPT_REQUEST_ADDRESS_TYPE)
            .map(|v| v == VAL_REQUEST_ADDRESS_TYPE_GATEWAY)
            .unwrap_or(false);
        let serial = options
            .get(OPT_ALLOC_SERIAL)
            .map(|v| v == "true")
            .unwrap_or(false);

        let candidate_value: u128 = if let Some(pref) = preferred {
            if !p.network.contains(pref) {
                return Err(IpamError::IpOutOfRange);
            }
            ip_to_u128(pref)
        } else if is_gateway_request {
            ip_to_u128(p.network.network()) + 1
        } else {
            let start = if serial {
                p.serial_cursor.max(p.first_usable())
            } else {
                p.first_usable()
            };
            let mut found = None;
            let mut cur = start;
            let last = p.last_usable();
            while cur <= last {
                let candidate_ip = u128_to_ip(cur, p.network.is_ipv6());
                if !p.allocated.contains(&candidate_ip) {
                    found = Some(cur);
                    break;
                }
                cur += 1;
            }
            match found {
                Some(v) => v,
                None => return Err(IpamError::NoAvailableIps),
            }
        };

        let candidate_ip = u128_to_ip(candidate_value, p.network.is_ipv6());
        if p.allocated.contains(&candidate_ip) {
            if preferred.is_some() {
                return Err(IpamError::Other(format!("address {} already allocated", candidate_ip)));
            }
            return Err(IpamError::NoAvailableIps);
        }

        p.allocated.insert(candidate_ip);
        if candidate_value >= p.serial_cursor {
            p.serial_cursor = candidate_value + 1;
        }

        let assigned = IpNetwork::new(candidate_ip, p.network.prefix())
            .map_err(|e| IpamError::Other(e.to_string()))?;
        Ok((assigned, BTreeMap::new()))
    }

    async fn release_address(&self, pool: &PoolId, addr: IpAddr) -> std::result::Result<(), IpamError> {
        if let Some(p) = self.pools.lock().unwrap().get_mut(&pool.0) {
            p.allocated.remove(&addr);
        }
        Ok(())
    }

    fn default_address_spaces(&self) -> (String, String) {
        ("LocalDefault".to_string(), "GlobalDefault".to_string())
    }
}
