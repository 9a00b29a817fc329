//! The data model mirrored by the allocator: networks, services, tasks and
//! nodes, plus the endpoint/IPAM/driver-state fields the allocator mutates
//! in place.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(NetworkId);
string_id!(ServiceId);
string_id!(TaskId);
string_id!(NodeId);

/// An opaque, driver-assigned handle for a requested IPAM pool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub String);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

/// A single IPAM config entry: a requested subnet/range/gateway for one
/// address family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpamConfig {
    pub subnet: Option<IpNetwork>,
    pub range: Option<IpNetwork>,
    pub gateway: Option<IpAddr>,
    pub family: Option<AddressFamily>,
}

impl IpamConfig {
    pub fn is_v6(&self) -> bool {
        matches!(self.family, Some(AddressFamily::V6))
            || self.subnet.map(|s| s.is_ipv6()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpamSpec {
    pub driver: Option<String>,
    pub configs: Vec<IpamConfig>,
}

/// Live/resolved IPAM state on a network, as opposed to `IpamSpec` which is
/// the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkIpam {
    pub driver: Option<String>,
    pub options: BTreeMap<String, String>,
    pub configs: Vec<IpamConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: Option<String>,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub driver_config: DriverConfig,
    pub ingress: bool,
    pub ipam: IpamSpec,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverState {
    pub name: String,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub spec: NetworkSpec,
    pub ipam: NetworkIpam,
    pub driver_state: Option<DriverState>,
}

impl Network {
    pub fn new(id: impl Into<NetworkId>, spec: NetworkSpec) -> Self {
        Self {
            id: id.into(),
            spec,
            ipam: NetworkIpam::default(),
            driver_state: None,
        }
    }
}

/// A reference to a network plus the addresses (CIDR strings) assigned to
/// this attachment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub network: NetworkId,
    pub addresses: Vec<String>,
}

impl NetworkAttachment {
    pub fn new(network: impl Into<NetworkId>) -> Self {
        Self {
            network: network.into(),
            addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishMode {
    Ingress,
    Host,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    pub name: String,
    pub protocol: Protocol,
    pub target_port: u16,
    pub published_port: Option<u16>,
    pub publish_mode: PublishMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionMode {
    VirtualIp,
    DnsRoundRobin,
}

impl Default for ResolutionMode {
    fn default() -> Self {
        ResolutionMode::VirtualIp
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub mode: ResolutionMode,
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAttachmentConfig {
    pub target: NetworkId,
}

impl NetworkAttachmentConfig {
    pub fn new(target: impl Into<NetworkId>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub endpoint: EndpointSpec,
    pub networks: Vec<NetworkAttachmentConfig>,
    pub task_networks: Vec<NetworkAttachmentConfig>,
}

impl ServiceSpec {
    /// `spec.Task.Networks` if non-empty, else `spec.Networks` (spec.md §4.7 step 4).
    pub fn desired_networks(&self) -> &[NetworkAttachmentConfig] {
        if !self.task_networks.is_empty() {
            &self.task_networks
        } else {
            &self.networks
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vip {
    pub network_id: NetworkId,
    pub addr: String,
}

impl Vip {
    pub fn new(network_id: impl Into<NetworkId>) -> Self {
        Self {
            network_id: network_id.into(),
            addr: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoint {
    pub spec: EndpointSpec,
    pub vips: Vec<Vip>,
    pub ports: Vec<PortConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub spec: ServiceSpec,
    pub endpoint: Option<Endpoint>,
}

impl Service {
    pub fn new(id: impl Into<ServiceId>, spec: ServiceSpec) -> Self {
        Self {
            id: id.into(),
            spec,
            endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub attachments: Vec<NetworkAttachment>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub attachment: NetworkAttachment,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, attachment: NetworkAttachment) -> Self {
        Self {
            id: id.into(),
            attachment,
        }
    }
}

/// Explicit configuration record replacing the functional-options flag
/// pattern `ServiceNeedsAllocation(service, ...opts)` would use in the
/// original (spec.md §9 REDESIGN FLAGS).
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationOptions {
    pub on_init: bool,
}
