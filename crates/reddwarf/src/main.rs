use std::sync::Arc;

use clap::Parser;
use reddwarf_netalloc::{
    AllocationOptions, DriverConfig, EndpointSpec, IpamConfig, IpamSpec, MockNetworkDriver,
    Network, NetworkAllocator, NetworkAttachmentConfig, NetworkSpec, PortConfig, Protocol,
    PublishMode, ResolutionMode, Service, ServiceSpec, Task,
};
use tracing::info;

/// Demonstration CLI for the cluster network allocator. Exercises
/// network/service/task allocation against the built-in mock drivers —
/// nothing here talks to a real network stack or plugin socket.
#[derive(Parser)]
#[command(name = "reddwarf", about = "Cluster network allocator demo")]
struct Cli {
    /// Subnet to carve the demo overlay network's pool from
    #[arg(long, default_value = "10.88.0.0/16")]
    subnet: String,

    /// Name to allocate the demo service under
    #[arg(long, default_value = "demo-service")]
    service_name: String,

    /// Published ingress port for the demo service
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    run_demo(&cli.subnet, &cli.service_name, cli.port)
        .await
        .map_err(|e| miette::miette!("demo run failed: {}", e))
}

/// Allocate a network, a service attached to it, and a task attached to
/// the service's network, then tear everything back down — the same
/// lifecycle a control plane would drive, minus the control plane.
async fn run_demo(
    subnet: &str,
    service_name: &str,
    port: u16,
) -> Result<(), reddwarf_netalloc::AllocatorError> {
    let subnet: ipnetwork::IpNetwork = subnet
        .parse()
        .expect("--subnet must be a valid CIDR, e.g. 10.88.0.0/16");

    info!("Using built-in mock network driver and in-memory IPAM driver");
    let allocator = NetworkAllocator::new(None);
    allocator
        .add_driver("overlay", Arc::new(MockNetworkDriver::global()))
        .await;
    allocator
        .add_ipam_driver(
            "default",
            Arc::new(reddwarf_netalloc::InMemoryIpamDriver::new()),
        )
        .await;

    let network = Network::new(
        "demo-net",
        NetworkSpec {
            name: "demo-net".into(),
            driver_config: DriverConfig {
                name: Some("overlay".into()),
                ..Default::default()
            },
            ipam: IpamSpec {
                configs: vec![IpamConfig {
                    subnet: Some(subnet),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        },
    );

    info!(network_id = %network.id, %subnet, "allocating network");
    let network = allocator.allocate_network(network).await?;
    info!(driver_state = ?network.driver_state, "network allocated");

    let mut service = Service::new(
        service_name,
        ServiceSpec {
            endpoint: EndpointSpec {
                mode: ResolutionMode::VirtualIp,
                ports: vec![PortConfig {
                    name: "web".into(),
                    protocol: Protocol::Tcp,
                    target_port: port,
                    published_port: Some(port),
                    publish_mode: PublishMode::Ingress,
                }],
            },
            networks: vec![NetworkAttachmentConfig::new("demo-net")],
            task_networks: vec![],
        },
    );

    info!(service_name, "allocating service");
    allocator.allocate_service(&mut service).await?;
    for vip in &service.endpoint.as_ref().unwrap().vips {
        info!(network_id = %vip.network_id, addr = %vip.addr, "service VIP assigned");
    }

    let mut task = Task::new("demo-task");
    let desired = [NetworkAttachmentConfig::new("demo-net")];
    info!("allocating task onto demo-net");
    allocator.allocate_task(&mut task, &desired).await?;
    for attachment in &task.attachments {
        info!(network_id = %attachment.network, addresses = ?attachment.addresses, "task attached");
    }

    let needs_realloc = allocator
        .service_needs_allocation(&service, AllocationOptions::default())
        .await;
    info!(needs_realloc, "re-checked service allocation state");

    info!("tearing down demo resources");
    allocator.deallocate_task(&mut task).await;
    allocator.deallocate_service(&mut service).await;
    allocator.deallocate_network(&network.id).await?;

    info!("demo complete");
    Ok(())
}
