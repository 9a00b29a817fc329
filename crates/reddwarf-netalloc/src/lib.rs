//! Cluster network allocator: IPAM, VIP, and port allocation for networks,
//! services, tasks, and nodes in a container orchestrator's control plane.
//!
//! [`NetworkAllocator`] is the public entry point; everything else in this
//! crate is either data model (`types`), the driver/IPAM plugin contracts
//! (`driver`), or the orchestration logic wired together behind it.

mod allocator;
mod driver;
mod error;
mod ipam;
mod ipam_driver;
mod mock;
mod network;
mod portalloc;
mod predicates;
mod service;
mod task_node;
mod types;
mod vip;

pub use allocator::NetworkAllocator;
pub use driver::{
    is_built_in_driver, Capability, DataScope, IpamData, IpamDriver, NetworkDriver, PluginGetter,
    DEFAULT_DRIVER, DEFAULT_IPAM_DRIVER, INGRESS_NETWORK_NAME,
};
pub use error::{AllocatorError, IpamError, Result};
pub use ipam_driver::InMemoryIpamDriver;
pub use mock::{MockNetworkDriver, NoPluginsGetter};
pub use portalloc::DYNAMIC_PORT_RANGE;
pub use predicates::{
    is_allocated, is_ingress_network, is_ingress_network_needed, is_node_allocated,
    is_task_allocated, is_vip_on_ingress_network,
};
pub use types::{
    AddressFamily, AllocationOptions, DriverConfig, DriverState, Endpoint, EndpointSpec,
    IpamConfig, IpamSpec, Network, NetworkAttachment, NetworkAttachmentConfig, NetworkId,
    NetworkIpam, NetworkSpec, Node, NodeId, PoolId, PortConfig, Protocol, PublishMode,
    ResolutionMode, Service, ServiceId, ServiceSpec, Task, TaskId, Vip,
};
