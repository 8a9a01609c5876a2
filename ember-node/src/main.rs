use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, info};

use ember_node::http::app;
use ember_node::vm::{NodeLimits, VmManager, start_liveness_sweep};

#[derive(Parser, Debug)]
#[clap(
    name = "ember-node",
    about = "ember data plane - runs CI runner microVMs on a host",
    rename_all = "kebab-case",
    rename_all_env = "screaming-snake"
)]
pub struct Args {
    /// Port to listen on
    #[clap(short, long, default_value = "8350")]
    port: u16,

    /// Working directory for instance state
    #[clap(long, default_value = "/var/lib/ember")]
    work_dir: PathBuf,

    /// Path to the firecracker binary
    #[clap(long, default_value = "/usr/local/bin/firecracker")]
    firecracker_binary: PathBuf,

    /// Default kernel image attached to every VM
    #[clap(long, default_value = "/var/lib/ember/images/vmlinux")]
    kernel_image: PathBuf,

    /// Default rootfs image copied for every VM
    #[clap(long, default_value = "/var/lib/ember/images/rootfs.ext4")]
    rootfs_image: PathBuf,

    /// Directory holding named rootfs snapshots
    #[clap(long, default_value = "/var/lib/ember/snapshots")]
    snapshot_dir: PathBuf,

    /// Host bridge VM TAP devices attach to in bridge mode
    #[clap(long, default_value = "embr0")]
    bridge_name: String,

    /// Maximum number of concurrently active VMs
    #[clap(long, default_value = "4")]
    max_concurrent: usize,

    /// Minimum free space on the working mount, in GiB
    #[clap(long, default_value = "30")]
    min_free_gib: u64,

    /// Maximum guest memory per VM, in MiB
    #[clap(long, default_value = "8192")]
    max_memory_mib: i64,

    /// Maximum vCPUs per VM
    #[clap(long, default_value = "8")]
    max_vcpus: i64,

    /// Seconds between liveness sweeps over tracked PIDs
    #[clap(long, default_value = "15")]
    sweep_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args = Args::parse();
    let addr = format!("0.0.0.0:{}", args.port);

    let max_vcpus = args.max_vcpus.min(num_cpus::get() as i64);

    info!("ember-node starting on {}", addr);
    info!("Working directory: {}", args.work_dir.display());
    info!("Firecracker binary: {}", args.firecracker_binary.display());
    info!(
        "Limits: max_concurrent={}, min_free_gib={}, max_memory_mib={}, max_vcpus={}",
        args.max_concurrent, args.min_free_gib, args.max_memory_mib, max_vcpus
    );
    info!(
        "Host: {}",
        gethostname::gethostname().to_string_lossy()
    );

    tokio::fs::create_dir_all(args.work_dir.join("instances")).await?;

    let limits = NodeLimits {
        work_dir: args.work_dir,
        firecracker_binary: args.firecracker_binary,
        default_kernel: args.kernel_image,
        default_rootfs: args.rootfs_image,
        snapshot_dir: args.snapshot_dir,
        bridge_name: args.bridge_name,
        max_concurrent: args.max_concurrent,
        min_free_gib: args.min_free_gib,
        max_memory_mib: args.max_memory_mib,
        max_vcpus,
    };

    let manager = Arc::new(VmManager::new(limits));
    manager.recover().await;

    tokio::spawn(start_liveness_sweep(
        manager.clone(),
        Duration::from_secs(args.sweep_interval),
    ));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app(manager).into_make_service()).await?;

    Ok(())
}
