use miette::Diagnostic;
use thiserror::Error;

/// Error taxonomy for the cluster network allocator (spec.md §7).
#[derive(Error, Debug, Diagnostic)]
pub enum AllocatorError {
    #[error("network already allocated: {network_id}")]
    #[diagnostic(
        code(reddwarf::netalloc::already_allocated),
        help("call DeallocateNetwork first, or skip re-allocating an already-bound network")
    )]
    AlreadyAllocated {
        #[allow(unused)]
        network_id: String,
    },

    #[error("resource not allocated: {resource_id}")]
    #[diagnostic(
        code(reddwarf::netalloc::not_allocated),
        help("the caller passed an object that was never (or no longer) allocated")
    )]
    NotAllocated {
        #[allow(unused)]
        resource_id: String,
    },

    #[error("network driver not found: {name}")]
    #[diagnostic(
        code(reddwarf::netalloc::driver_not_found),
        help("register the driver with AddDriver, or check the plugin getter's search path")
    )]
    DriverNotFound {
        #[allow(unused)]
        name: String,
    },

    #[error("IPAM driver not found: {name}")]
    #[diagnostic(
        code(reddwarf::netalloc::ipam_not_found),
        help("IPAM drivers must be pre-registered; they are not lazily loaded from plugins")
    )]
    IpamNotFound {
        #[allow(unused)]
        name: String,
    },

    #[error("no plugin getter configured")]
    #[diagnostic(
        code(reddwarf::netalloc::plugin_store_missing),
        help("construct the allocator with Some(plugin_getter) to resolve drivers lazily")
    )]
    PluginStoreMissing,

    #[error("pool request failed for network {network_id}: {reason}")]
    #[diagnostic(code(reddwarf::netalloc::pool_request_failed))]
    PoolRequestFailed {
        #[allow(unused)]
        network_id: String,
        #[allow(unused)]
        reason: String,
    },

    #[error("address request failed: {reason}")]
    #[diagnostic(code(reddwarf::netalloc::address_request_failed))]
    AddressRequestFailed {
        #[allow(unused)]
        reason: String,
    },

    #[error("no available IP address in any pool of network {network_id}")]
    #[diagnostic(
        code(reddwarf::netalloc::no_available_ip),
        help("the network's pools are exhausted; expand the IPAM config or free unused addresses")
    )]
    NoAvailableIp {
        #[allow(unused)]
        network_id: String,
    },

    #[error("failed to parse address '{input}'")]
    #[diagnostic(code(reddwarf::netalloc::parse_error))]
    ParseError { input: String },

    #[error("driver allocate failed for network {network_id}: {reason}")]
    #[diagnostic(code(reddwarf::netalloc::driver_allocate_failed))]
    DriverAllocateFailed {
        #[allow(unused)]
        network_id: String,
        #[allow(unused)]
        reason: String,
    },

    #[error("driver free failed for network {network_id}: {reason}")]
    #[diagnostic(code(reddwarf::netalloc::driver_free_failed))]
    DriverFreeFailed {
        #[allow(unused)]
        network_id: String,
        #[allow(unused)]
        reason: String,
    },

    #[error("no local state for network {network_id}")]
    #[diagnostic(
        code(reddwarf::netalloc::no_local_state),
        help("the network must be allocated before its VIPs/attachments can be")
    )]
    NoLocalState {
        #[allow(unused)]
        network_id: String,
    },

    #[error("port {port} ({protocol:?}) is unavailable")]
    #[diagnostic(code(reddwarf::netalloc::port_unavailable))]
    PortUnavailable {
        #[allow(unused)]
        port: u16,
        #[allow(unused)]
        protocol: crate::types::Protocol,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] reddwarf_core::ReddwarfError),
}

pub type Result<T> = std::result::Result<T, AllocatorError>;

/// A driver-reported error, distinguished so callers of `request_address`
/// can fall through to the next pool (spec.md §4.5 step 6, §6).
#[derive(Error, Debug, Diagnostic)]
pub enum IpamError {
    #[error("no available IPs in this pool")]
    NoAvailableIps,
    #[error("requested address is out of range for this pool")]
    IpOutOfRange,
    #[error("{0}")]
    Other(String),
}
