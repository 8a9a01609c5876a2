//! Node-local authority over microVM lifecycle.
//!
//! The manager owns the active-VM set, enforces admission limits, and
//! drives create/delete through storage, networking, and the firecracker
//! launcher. Any failure after admission rolls back every resource already
//! allocated for that VM; rollback errors are logged and swallowed so they
//! never mask the original cause.

mod cloud_init;
mod storage;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use common::api::{CreateVmRequest, NetworkMode, NetworkRequest, VmRecord, VmStatus};
use common::cloud_init::{CloudInitBundle, FirstBootConfig};
use common::identity;

use crate::firecracker::{FirecrackerError, FirecrackerLauncher, LaunchSpec};
use crate::network::{NetworkAllocation, NetworkError, NetworkManager};

pub use storage::{InstanceStore, RootfsSource, StorageError};

#[derive(Debug, Error)]
pub enum VmManagerError {
    #[error("{0}")]
    AdmissionDenied(String),

    #[error("VM {0} already exists")]
    AlreadyExists(String),

    #[error("VM {0} not found")]
    NotFound(String),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    HostFailure(String),
}

impl From<StorageError> for VmManagerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::MissingImage(path) => {
                VmManagerError::Invalid(format!("source image {} does not exist", path.display()))
            }
            other => VmManagerError::HostFailure(other.to_string()),
        }
    }
}

impl From<NetworkError> for VmManagerError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::InvalidConfig(msg) => VmManagerError::Invalid(msg),
            other => VmManagerError::HostFailure(other.to_string()),
        }
    }
}

impl From<FirecrackerError> for VmManagerError {
    fn from(e: FirecrackerError) -> Self {
        VmManagerError::HostFailure(e.to_string())
    }
}

/// Node-wide limits and defaults, fixed at startup.
#[derive(Debug, Clone)]
pub struct NodeLimits {
    pub work_dir: PathBuf,
    pub firecracker_binary: PathBuf,
    pub default_kernel: PathBuf,
    pub default_rootfs: PathBuf,
    pub snapshot_dir: PathBuf,
    pub bridge_name: String,
    pub max_concurrent: usize,
    pub min_free_gib: u64,
    pub max_memory_mib: i64,
    pub max_vcpus: i64,
}

struct VmEntry {
    record: VmRecord,
    /// Present for VMs created by this process; reconstructed from the
    /// record for VMs adopted after a restart.
    allocation: Option<NetworkAllocation>,
}

pub struct VmManager {
    limits: NodeLimits,
    store: InstanceStore,
    network: NetworkManager,
    launcher: FirecrackerLauncher,
    vms: Mutex<HashMap<String, VmEntry>>,
}

impl VmManager {
    pub fn new(limits: NodeLimits) -> Self {
        let store = InstanceStore::new(&limits.work_dir);
        let network = NetworkManager::new(limits.bridge_name.clone());
        let launcher = FirecrackerLauncher::new(&limits.firecracker_binary);
        Self {
            limits,
            store,
            network,
            launcher,
            vms: Mutex::new(HashMap::new()),
        }
    }

    pub async fn self_check(&self) -> Result<(), VmManagerError> {
        self.store.self_check().await?;
        Ok(())
    }

    /// Create a VM end to end. See the module docs for the rollback
    /// contract.
    pub async fn create_vm(&self, request: CreateVmRequest) -> Result<VmRecord, VmManagerError> {
        let vm_id = identity::vm_id(&request.name);
        info!(name = %request.name, vm_id = %vm_id, "creating VM");

        let network_request = request.network.clone().unwrap_or_default();

        // Admission and slot reservation are one atomic step under the map
        // lock; denials are final.
        {
            let mut vms = self.vms.lock().await;
            if let Some(entry) = vms.get(&vm_id) {
                if entry.record.status.is_active() {
                    return Err(VmManagerError::AlreadyExists(request.name));
                }
                // A stopped or errored instance with the same identity is
                // superseded by the new create.
                vms.remove(&vm_id);
            }

            let active = vms
                .values()
                .filter(|e| e.record.status.is_active())
                .count();
            let free_gib = self.store.free_disk_gib()?;
            check_admission(&self.limits, active, free_gib, request.memory, request.cpus)?;

            let placeholder = self.placeholder_record(&vm_id, &request, &network_request);
            vms.insert(
                vm_id.clone(),
                VmEntry {
                    record: placeholder,
                    allocation: None,
                },
            );
        }

        match self.create_inner(&vm_id, &request, &network_request).await {
            Ok((record, allocation)) => {
                let mut vms = self.vms.lock().await;
                vms.insert(
                    vm_id.clone(),
                    VmEntry {
                        record: record.clone(),
                        allocation: Some(allocation),
                    },
                );
                info!(vm_id = %vm_id, "VM created");
                Ok(record)
            }
            Err(e) => {
                let mut vms = self.vms.lock().await;
                vms.remove(&vm_id);
                Err(e)
            }
        }
    }

    async fn create_inner(
        &self,
        vm_id: &str,
        request: &CreateVmRequest,
        network_request: &NetworkRequest,
    ) -> Result<(VmRecord, NetworkAllocation), VmManagerError> {
        let rootfs_source = self.resolve_rootfs(request);
        let rootfs_path = match &rootfs_source {
            RootfsSource::Default => self.limits.default_rootfs.clone(),
            RootfsSource::Image(path) => path.clone(),
            RootfsSource::Snapshot(name) => self.limits.snapshot_dir.join(format!("{name}.ext4")),
        };
        let (kernel_path, kernel_source) = match &request.kernel_image {
            Some(path) => (PathBuf::from(path), format!("image:{path}")),
            None => (self.limits.default_kernel.clone(), "default".to_string()),
        };

        let paths = match self.store.prepare(vm_id, &rootfs_path, &kernel_path).await {
            Ok(paths) => paths,
            Err(e) => {
                self.cleanup(vm_id, None, None).await;
                return Err(e.into());
            }
        };

        let bundle = match self.resolve_bundle(vm_id, request, network_request).await {
            Ok(bundle) => bundle,
            Err(e) => {
                self.cleanup(vm_id, None, None).await;
                return Err(e);
            }
        };

        if let Err(e) = cloud_init::write_bundle(
            vm_id,
            &paths.cloud_init_dir,
            &paths.cloud_init_iso,
            &bundle,
        )
        .await
        {
            self.cleanup(vm_id, None, None).await;
            return Err(VmManagerError::HostFailure(e.to_string()));
        }

        let allocation = match self.network.setup(vm_id, network_request).await {
            Ok(allocation) => allocation,
            Err(e) => {
                // setup already undid its own partial steps
                self.cleanup(vm_id, None, None).await;
                return Err(e.into());
            }
        };

        let spec = LaunchSpec {
            vm_id,
            socket_path: &paths.socket,
            console_log_path: &paths.console_log,
            kernel_path: &paths.kernel,
            rootfs_path: &paths.rootfs,
            cloud_init_iso: &paths.cloud_init_iso,
            tap_name: &allocation.tap_name,
            guest_mac: &allocation.mac,
            vcpus: request.cpus,
            memory_mib: request.memory,
        };

        let pid = match self.launcher.spawn(&spec).await {
            Ok(pid) => pid,
            Err(e) => {
                self.cleanup(vm_id, Some(&allocation), None).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.launcher.configure_and_start(&spec).await {
            self.cleanup(vm_id, Some(&allocation), Some(pid)).await;
            return Err(e.into());
        }

        let record = VmRecord {
            vm_id: vm_id.to_string(),
            name: request.name.clone(),
            tap_name: allocation.tap_name.clone(),
            bridge_name: allocation.bridge_name.clone(),
            mac: allocation.mac.clone(),
            ip: allocation.ip.clone(),
            networking: allocation.mode,
            memory_mib: request.memory,
            vcpus: request.cpus,
            pid: Some(pid),
            status: VmStatus::Running,
            created_at: Utc::now(),
            console_log_path: paths.console_log.display().to_string(),
            rootfs_path: paths.rootfs.display().to_string(),
            kernel_path: paths.kernel.display().to_string(),
            socket_path: paths.socket.display().to_string(),
            ephemeral: true,
            kernel_source,
            rootfs_source: rootfs_source.describe(),
        };

        if let Err(e) = self.store.write_record(&record).await {
            self.cleanup(vm_id, Some(&allocation), Some(pid)).await;
            return Err(e.into());
        }

        Ok((record, allocation))
    }

    /// Kill and dismantle a VM. A missing VM is a `NotFound`; callers treat
    /// that as already-deleted.
    pub async fn delete_vm(&self, name: &str) -> Result<(), VmManagerError> {
        let entry = {
            let mut vms = self.vms.lock().await;
            let key = vms
                .iter()
                .find(|(id, e)| *id == name || e.record.name == name)
                .map(|(id, _)| id.clone());
            key.and_then(|key| vms.remove(&key))
                .ok_or_else(|| VmManagerError::NotFound(name.to_string()))?
        };

        let vm_id = entry.record.vm_id.clone();
        info!(vm_id = %vm_id, "deleting VM");

        if let Some(pid) = entry.record.pid
            && pid_alive(pid)
            && let Err(e) = kill(Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL)
        {
            warn!(vm_id = %vm_id, "failed to kill VM process {}: {}", pid, e);
        }

        let allocation = entry
            .allocation
            .unwrap_or_else(|| allocation_from_record(&entry.record));
        self.network.teardown(&allocation).await;

        if let Err(e) = self.store.remove(&vm_id).await {
            warn!(vm_id = %vm_id, "failed to remove instance directory: {}", e);
        }

        info!(vm_id = %vm_id, "VM deleted");
        Ok(())
    }

    pub async fn get_vm(&self, name: &str) -> Option<VmRecord> {
        let vms = self.vms.lock().await;
        vms.values()
            .map(|e| &e.record)
            .find(|r| r.vm_id == name || r.name == name)
            .cloned()
    }

    /// All tracked records, keyed by runner name.
    pub async fn list_vms(&self) -> HashMap<String, VmRecord> {
        let vms = self.vms.lock().await;
        vms.values()
            .map(|e| (e.record.name.clone(), e.record.clone()))
            .collect()
    }

    /// One liveness pass: any tracked running PID that no longer exists
    /// flips the record to stopped.
    pub async fn sweep_once(&self) {
        let dead: Vec<String> = {
            let vms = self.vms.lock().await;
            vms.values()
                .filter(|e| {
                    e.record.status == VmStatus::Running
                        && !e.record.pid.map(pid_alive).unwrap_or(false)
                })
                .map(|e| e.record.vm_id.clone())
                .collect()
        };

        for vm_id in dead {
            warn!(vm_id = %vm_id, "VM process disappeared, marking stopped");
            let record = {
                let mut vms = self.vms.lock().await;
                let Some(entry) = vms.get_mut(&vm_id) else {
                    continue;
                };
                entry.record.status = VmStatus::Stopped;
                entry.record.clone()
            };
            if let Err(e) = self.store.write_record(&record).await {
                warn!(vm_id = %vm_id, "failed to persist stopped record: {}", e);
            }
        }
    }

    /// Adopt persisted instances after a restart: dead PIDs flip to
    /// stopped, and TAP devices that belong to no live record are removed.
    pub async fn recover(&self) {
        let records = self.store.load_all_records().await;
        info!("recovering {} persisted VM record(s)", records.len());

        let mut live_taps = Vec::new();
        for mut record in records {
            let alive = record.pid.map(pid_alive).unwrap_or(false);
            if record.status == VmStatus::Running && !alive {
                record.status = VmStatus::Stopped;
                if let Err(e) = self.store.write_record(&record).await {
                    warn!(vm_id = %record.vm_id, "failed to persist recovered record: {}", e);
                }
            }
            if record.status == VmStatus::Running {
                live_taps.push(record.tap_name.clone());
            }
            info!(vm_id = %record.vm_id, status = ?record.status, "recovered VM");

            let mut vms = self.vms.lock().await;
            vms.insert(
                record.vm_id.clone(),
                VmEntry {
                    record,
                    allocation: None,
                },
            );
        }

        for tap in self.orphan_taps(&live_taps).await {
            warn!(tap = %tap, "removing orphan TAP device");
            self.network.remove_orphan_tap(&tap).await;
        }
    }

    async fn orphan_taps(&self, live: &[String]) -> Vec<String> {
        let output = match tokio::process::Command::new("ip")
            .args(["-o", "link", "show"])
            .output()
            .await
        {
            Ok(output) if output.status.success() => output.stdout,
            _ => return Vec::new(),
        };

        String::from_utf8_lossy(&output)
            .lines()
            .filter_map(|line| line.split(':').nth(1))
            .map(|name| name.trim().split('@').next().unwrap_or("").to_string())
            .filter(|name| is_managed_tap(name) && !live.iter().any(|t| t == name))
            .collect()
    }

    fn resolve_rootfs(&self, request: &CreateVmRequest) -> RootfsSource {
        if let Some(snapshot) = &request.snapshot {
            RootfsSource::Snapshot(snapshot.clone())
        } else if let Some(image) = &request.rootfs_image {
            RootfsSource::Image(PathBuf::from(image))
        } else {
            RootfsSource::Default
        }
    }

    /// Use the controller-provided bundle when present, otherwise render
    /// defaults from the request. Either way the result must validate.
    async fn resolve_bundle(
        &self,
        vm_id: &str,
        request: &CreateVmRequest,
        network_request: &NetworkRequest,
    ) -> Result<CloudInitBundle, VmManagerError> {
        if let Some(bundle) = &request.cloud_init {
            bundle
                .validate()
                .map_err(|e| VmManagerError::Invalid(e.to_string()))?;
            return Ok(bundle.clone());
        }

        let config = FirstBootConfig {
            hostname: vm_id.to_string(),
            github_url: request.github_url.clone(),
            registration_token: request.github_token.clone(),
            runner_name: request.name.clone(),
            labels: request.labels.clone().unwrap_or_default(),
            ephemeral: true,
            network: network_request
                .guest_network()
                .map_err(VmManagerError::Invalid)?,
            ssh_authorized_key: self.store.read_ssh_public_key(vm_id).await,
        };

        config
            .render(vm_id)
            .map_err(|e| VmManagerError::Invalid(e.to_string()))
    }

    fn placeholder_record(
        &self,
        vm_id: &str,
        request: &CreateVmRequest,
        network_request: &NetworkRequest,
    ) -> VmRecord {
        let paths = self.store.paths(vm_id);
        VmRecord {
            vm_id: vm_id.to_string(),
            name: request.name.clone(),
            tap_name: identity::tap_name(vm_id),
            bridge_name: None,
            mac: identity::guest_mac(vm_id).to_string(),
            ip: "dhcp".to_string(),
            networking: network_request.mode,
            memory_mib: request.memory,
            vcpus: request.cpus,
            pid: None,
            status: VmStatus::Creating,
            created_at: Utc::now(),
            console_log_path: paths.console_log.display().to_string(),
            rootfs_path: paths.rootfs.display().to_string(),
            kernel_path: paths.kernel.display().to_string(),
            socket_path: paths.socket.display().to_string(),
            ephemeral: true,
            kernel_source: "default".to_string(),
            rootfs_source: "default".to_string(),
        }
    }

    /// Best-effort rollback after a failed create. Never propagates.
    async fn cleanup(&self, vm_id: &str, allocation: Option<&NetworkAllocation>, pid: Option<i32>) {
        if let Some(pid) = pid
            && pid_alive(pid)
            && let Err(e) = kill(Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL)
        {
            warn!(vm_id = %vm_id, "cleanup: failed to kill process {}: {}", pid, e);
        }
        if let Some(allocation) = allocation {
            self.network.teardown(allocation).await;
        }
        if let Err(e) = self.store.remove(vm_id).await {
            warn!(vm_id = %vm_id, "cleanup: failed to remove instance dir: {}", e);
        }
    }
}

/// Periodic liveness sweep over tracked PIDs.
pub async fn start_liveness_sweep(manager: Arc<VmManager>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        manager.sweep_once().await;
    }
}

fn check_admission(
    limits: &NodeLimits,
    active: usize,
    free_gib: u64,
    memory_mib: i64,
    cpus: i64,
) -> Result<(), VmManagerError> {
    if memory_mib < 1 || cpus < 1 {
        return Err(VmManagerError::Invalid(format!(
            "memory ({memory_mib} MiB) and cpus ({cpus}) must be at least 1"
        )));
    }
    if active >= limits.max_concurrent {
        return Err(VmManagerError::AdmissionDenied(format!(
            "maximum concurrent VMs reached ({}/{})",
            active, limits.max_concurrent
        )));
    }
    if free_gib < limits.min_free_gib {
        return Err(VmManagerError::AdmissionDenied(format!(
            "insufficient free disk: {} GiB available, {} GiB required",
            free_gib, limits.min_free_gib
        )));
    }
    if memory_mib > limits.max_memory_mib {
        return Err(VmManagerError::AdmissionDenied(format!(
            "requested memory {} MiB exceeds maximum {} MiB",
            memory_mib, limits.max_memory_mib
        )));
    }
    if cpus > limits.max_vcpus {
        return Err(VmManagerError::AdmissionDenied(format!(
            "requested cpus {} exceeds maximum {}",
            cpus, limits.max_vcpus
        )));
    }
    Ok(())
}

fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

fn is_managed_tap(name: &str) -> bool {
    name.len() == 11
        && name.starts_with("tap")
        && name[3..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Reconstruct enough of the allocation to tear down a VM adopted after a
/// restart. NAT subnets are recovered from the guest address assuming the
/// default /24 layout.
fn allocation_from_record(record: &VmRecord) -> NetworkAllocation {
    let nat = if record.networking == NetworkMode::Nat {
        record.ip.parse::<std::net::Ipv4Addr>().ok().map(|guest| {
            let octets = guest.octets();
            let network = std::net::Ipv4Addr::new(octets[0], octets[1], octets[2], 0);
            crate::network::NatRules {
                subnet: format!("{network}/24"),
                gateway: std::net::Ipv4Addr::new(octets[0], octets[1], octets[2], 1).to_string(),
                prefix_len: 24,
            }
        })
    } else {
        None
    };

    let macvlan_link = if record.networking == NetworkMode::Macvlan {
        Some(format!("mvl{}", &record.tap_name[3..]))
    } else {
        None
    };

    NetworkAllocation {
        mode: record.networking,
        tap_name: record.tap_name.clone(),
        bridge_name: record.bridge_name.clone(),
        macvlan_link,
        mac: record.mac.clone(),
        ip: record.ip.clone(),
        nat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> NodeLimits {
        NodeLimits {
            work_dir: PathBuf::from("/var/lib/ember"),
            firecracker_binary: PathBuf::from("/usr/local/bin/firecracker"),
            default_kernel: PathBuf::from("/var/lib/ember/images/vmlinux"),
            default_rootfs: PathBuf::from("/var/lib/ember/images/rootfs.ext4"),
            snapshot_dir: PathBuf::from("/var/lib/ember/snapshots"),
            bridge_name: "embr0".to_string(),
            max_concurrent: 2,
            min_free_gib: 30,
            max_memory_mib: 4096,
            max_vcpus: 4,
        }
    }

    #[test]
    fn admission_denies_when_concurrency_cap_is_reached() {
        let err = check_admission(&limits(), 2, 100, 2048, 2).unwrap_err();
        match err {
            VmManagerError::AdmissionDenied(msg) => {
                assert_eq!(msg, "maximum concurrent VMs reached (2/2)");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn admission_denies_when_disk_is_below_floor() {
        let err = check_admission(&limits(), 0, 29, 2048, 2).unwrap_err();
        assert!(matches!(err, VmManagerError::AdmissionDenied(_)));
    }

    #[test]
    fn admission_names_the_memory_limit_in_the_denial() {
        let err = check_admission(&limits(), 0, 100, 4097, 2).unwrap_err();
        match err {
            VmManagerError::AdmissionDenied(msg) => {
                assert!(msg.contains("4096"), "message should name the maximum: {msg}");
                assert!(msg.contains("4097"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn admission_denies_excess_cpus() {
        let err = check_admission(&limits(), 0, 100, 2048, 5).unwrap_err();
        assert!(matches!(err, VmManagerError::AdmissionDenied(_)));
    }

    #[test]
    fn admission_rejects_non_positive_shapes_as_invalid() {
        let err = check_admission(&limits(), 0, 100, 0, 2).unwrap_err();
        assert!(matches!(err, VmManagerError::Invalid(_)));
    }

    #[test]
    fn admission_accepts_a_request_within_limits() {
        check_admission(&limits(), 1, 100, 2048, 2).unwrap();
    }

    #[test]
    fn managed_tap_names_are_recognized() {
        assert!(is_managed_tap("tap0a1b2c3d"));
        assert!(!is_managed_tap("tap0"));
        assert!(!is_managed_tap("eth0"));
        assert!(!is_managed_tap("tapZZZZZZZZ"));
    }

    #[test]
    fn nat_allocation_is_reconstructed_from_guest_address() {
        let record = VmRecord {
            vm_id: "acme-0a1b2c3d".to_string(),
            name: "acme".to_string(),
            tap_name: "tap0a1b2c3d".to_string(),
            bridge_name: None,
            mac: "06:aa:bb:cc:dd:ee".to_string(),
            ip: "172.30.0.2".to_string(),
            networking: NetworkMode::Nat,
            memory_mib: 2048,
            vcpus: 2,
            pid: None,
            status: VmStatus::Stopped,
            created_at: Utc::now(),
            console_log_path: String::new(),
            rootfs_path: String::new(),
            kernel_path: String::new(),
            socket_path: String::new(),
            ephemeral: true,
            kernel_source: "default".to_string(),
            rootfs_source: "default".to_string(),
        };

        let allocation = allocation_from_record(&record);
        let nat = allocation.nat.expect("nat rules");
        assert_eq!(nat.subnet, "172.30.0.0/24");
        assert_eq!(nat.gateway, "172.30.0.1");
    }
}
