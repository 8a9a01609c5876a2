//! Wire contract between the controller and the node daemon.
//!
//! Both sides depend on these types so the HTTP API cannot drift. All
//! bodies are JSON with snake_case keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cloud_init::CloudInitBundle;

/// Lifecycle status of a VM on a node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl VmStatus {
    /// `error` absorbs launch-time failures and counts as stopped for
    /// liveness purposes.
    pub fn is_active(self) -> bool {
        matches!(self, VmStatus::Creating | VmStatus::Running)
    }
}

/// Guest networking mode.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Bridge,
    Host,
    Nat,
    Macvlan,
}

/// Per-VM networking request, dispatched on `mode` by the daemon.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NetworkRequest {
    #[serde(default)]
    pub mode: NetworkMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet_cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhcp_enabled: Option<bool>,
}

/// Host-side NAT layout derived from a subnet request. Gateway defaults to
/// the first host address, the guest always gets the second.
#[derive(Debug, Clone, PartialEq)]
pub struct NatPlan {
    /// Normalized network address in CIDR form, e.g. `172.30.0.0/24`.
    pub subnet: String,
    pub prefix_len: u8,
    pub gateway: std::net::Ipv4Addr,
    pub guest: std::net::Ipv4Addr,
}

impl NetworkRequest {
    /// Compute the NAT layout for this request. Pure; both the controller
    /// (for the first-boot documents) and the daemon (for the host rules)
    /// derive from the same plan.
    pub fn nat_plan(&self) -> Result<NatPlan, String> {
        let subnet_cidr = self
            .subnet_cidr
            .as_deref()
            .ok_or_else(|| "nat mode requires subnet_cidr".to_string())?;
        let (addr, prefix_len) = parse_cidr(subnet_cidr)?;
        if prefix_len > 30 {
            return Err(format!("subnet {subnet_cidr} too small for gateway and guest"));
        }

        let mask = u32::MAX << (32 - prefix_len);
        let network = u32::from(addr) & mask;

        let gateway = match self.gateway.as_deref() {
            Some(g) => g
                .parse::<std::net::Ipv4Addr>()
                .map_err(|_| format!("invalid gateway {g}"))?,
            None => std::net::Ipv4Addr::from(network + 1),
        };
        let guest = std::net::Ipv4Addr::from(network + 2);

        Ok(NatPlan {
            subnet: format!("{}/{}", std::net::Ipv4Addr::from(network), prefix_len),
            prefix_len,
            gateway,
            guest,
        })
    }

    /// What the guest should be told about its interface, derived without
    /// touching the host.
    pub fn guest_network(&self) -> Result<crate::cloud_init::GuestNetwork, String> {
        use crate::cloud_init::{DEFAULT_DNS, GuestNetwork};

        match self.mode {
            NetworkMode::Bridge | NetworkMode::Host | NetworkMode::Macvlan => {
                Ok(GuestNetwork::Dhcp)
            }
            NetworkMode::Nat => {
                if self.dhcp_enabled == Some(true) {
                    return Ok(GuestNetwork::Dhcp);
                }
                let plan = self.nat_plan()?;
                Ok(GuestNetwork::Static {
                    address: format!("{}/{}", plan.guest, plan.prefix_len),
                    gateway: plan.gateway.to_string(),
                    dns: DEFAULT_DNS.iter().map(|s| s.to_string()).collect(),
                })
            }
        }
    }
}

fn parse_cidr(cidr: &str) -> Result<(std::net::Ipv4Addr, u8), String> {
    let invalid = || format!("invalid CIDR {cidr}");
    let (addr, len) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr = addr.parse::<std::net::Ipv4Addr>().map_err(|_| invalid())?;
    let len = len.parse::<u8>().map_err(|_| invalid())?;
    if len > 32 {
        return Err(invalid());
    }
    Ok((addr, len))
}

/// `POST /api/vms` request body.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateVmRequest {
    /// Runner name; the daemon derives the VM id from it.
    pub name: String,
    /// Guest memory in MiB.
    pub memory: i64,
    /// Guest vCPU count.
    pub cpus: i64,
    /// URL the runner registers against (enterprise/org/repo page).
    pub github_url: String,
    /// Short-lived registration token, consumed by first boot.
    pub github_token: String,
    /// Boot from a named rootfs snapshot instead of the default image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkRequest>,
    /// Pre-rendered and validated first-boot documents. When absent the
    /// daemon renders defaults from the other fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInitBundle>,
}

/// The VM record as tracked by the daemon, persisted to `info.json` in the
/// instance directory and returned verbatim by the HTTP API.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VmRecord {
    pub vm_id: String,
    pub name: String,
    pub tap_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_name: Option<String>,
    pub mac: String,
    /// Literal IPv4 address, or the sentinel `"dhcp"`.
    pub ip: String,
    pub networking: NetworkMode,
    pub memory_mib: i64,
    pub vcpus: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub status: VmStatus,
    pub created_at: DateTime<Utc>,
    pub console_log_path: String,
    pub rootfs_path: String,
    pub kernel_path: String,
    pub socket_path: String,
    pub ephemeral: bool,
    /// Origin of the kernel, e.g. `"default"` or `"image:/path"`.
    pub kernel_source: String,
    /// Origin of the rootfs, e.g. `"default"`, `"snapshot:warm"`, `"image:/path"`.
    pub rootfs_source: String,
}

/// `POST /api/vms` success body.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateVmResponse {
    pub vm_name: String,
    pub status: String,
}

/// `DELETE /api/vms/{name}` success body.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeleteVmResponse {
    pub success: bool,
}

/// `GET /api/vms` body; keyed by runner name.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ListVmsResponse {
    pub vms: BTreeMap<String, VmRecord>,
}

/// `GET /health` body.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: String,
}

/// Error body carried on every non-2xx daemon response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_accepts_minimal_body() {
        let body = r#"{
            "name": "acme-1700000000-ab12c",
            "memory": 2048,
            "cpus": 2,
            "github_url": "https://github.com/acme",
            "github_token": "REG_TOKEN"
        }"#;

        let req: CreateVmRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.memory, 2048);
        assert!(req.snapshot.is_none());
        assert!(req.network.is_none());
    }

    #[test]
    fn network_mode_round_trips_lowercase() {
        let json = serde_json::to_string(&NetworkMode::Macvlan).unwrap();
        assert_eq!(json, "\"macvlan\"");
        let mode: NetworkMode = serde_json::from_str("\"nat\"").unwrap();
        assert_eq!(mode, NetworkMode::Nat);
    }

    fn nat_request(subnet: &str, gateway: Option<&str>) -> NetworkRequest {
        NetworkRequest {
            mode: NetworkMode::Nat,
            subnet_cidr: Some(subnet.to_string()),
            gateway: gateway.map(|g| g.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn nat_plan_defaults_gateway_and_guest() {
        let plan = nat_request("172.30.0.0/24", None).nat_plan().unwrap();
        assert_eq!(plan.subnet, "172.30.0.0/24");
        assert_eq!(plan.gateway, std::net::Ipv4Addr::new(172, 30, 0, 1));
        assert_eq!(plan.guest, std::net::Ipv4Addr::new(172, 30, 0, 2));
    }

    #[test]
    fn nat_plan_normalizes_host_bits() {
        let plan = nat_request("10.1.2.77/16", None).nat_plan().unwrap();
        assert_eq!(plan.subnet, "10.1.0.0/16");
        assert_eq!(plan.guest, std::net::Ipv4Addr::new(10, 1, 0, 2));
    }

    #[test]
    fn nat_plan_respects_explicit_gateway() {
        let plan = nat_request("172.30.0.0/24", Some("172.30.0.254"))
            .nat_plan()
            .unwrap();
        assert_eq!(plan.gateway, std::net::Ipv4Addr::new(172, 30, 0, 254));
    }

    #[test]
    fn nat_plan_rejects_tiny_subnets_and_garbage() {
        assert!(nat_request("10.0.0.0/31", None).nat_plan().is_err());
        assert!(nat_request("not-a-subnet", None).nat_plan().is_err());
        assert!(nat_request("10.0.0.0/40", None).nat_plan().is_err());
    }

    #[test]
    fn guest_network_is_dhcp_for_bridge_mode() {
        let request = NetworkRequest::default();
        assert_eq!(
            request.guest_network().unwrap(),
            crate::cloud_init::GuestNetwork::Dhcp
        );
    }

    #[test]
    fn guest_network_is_static_for_nat_mode() {
        match nat_request("172.30.0.0/24", None).guest_network().unwrap() {
            crate::cloud_init::GuestNetwork::Static {
                address, gateway, ..
            } => {
                assert_eq!(address, "172.30.0.2/24");
                assert_eq!(gateway, "172.30.0.1");
            }
            other => panic!("expected static network, got {other:?}"),
        }
    }
}
