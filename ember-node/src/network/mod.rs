//! Host-side network plumbing for VM TAP devices.
//!
//! Dispatches on the requested mode: bridge attaches the TAP to a
//! pre-existing host bridge, nat gives the guest a private subnet behind
//! masquerade rules, macvlan hangs a macvlan link off a physical parent,
//! host is a bare TAP. All mutations run under a process-wide mutex so a
//! failed setup never interleaves with another VM's teardown; on failure
//! every completed step is undone before the error is returned.

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use common::api::{NetworkMode, NetworkRequest};
use common::identity;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("`{command}` failed with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("invalid network config: {0}")]
    InvalidConfig(String),
}

/// Everything allocated for one VM, kept so teardown can undo it.
#[derive(Debug, Clone)]
pub struct NetworkAllocation {
    pub mode: NetworkMode,
    pub tap_name: String,
    pub bridge_name: Option<String>,
    pub macvlan_link: Option<String>,
    pub mac: String,
    /// Guest address, or the sentinel `"dhcp"`.
    pub ip: String,
    pub nat: Option<NatRules>,
}

#[derive(Debug, Clone)]
pub struct NatRules {
    pub subnet: String,
    pub gateway: String,
    pub prefix_len: u8,
}

pub struct NetworkManager {
    default_bridge: String,
    // Serializes all netlink/iptables mutations on this host.
    lock: Mutex<()>,
}

impl NetworkManager {
    pub fn new(default_bridge: impl Into<String>) -> Self {
        Self {
            default_bridge: default_bridge.into(),
            lock: Mutex::new(()),
        }
    }

    /// Create the TAP (and any mode-specific plumbing) for a VM.
    pub async fn setup(
        &self,
        vm_id: &str,
        request: &NetworkRequest,
    ) -> Result<NetworkAllocation, NetworkError> {
        let _guard = self.lock.lock().await;

        let tap = identity::tap_name(vm_id);
        let mac = identity::guest_mac(vm_id).to_string();

        // Steps completed so far, undone in reverse on failure.
        let mut undo: Vec<UndoStep> = Vec::new();

        let result = self
            .setup_inner(vm_id, request, &tap, &mac, &mut undo)
            .await;

        match result {
            Ok(allocation) => {
                info!(
                    vm_id = %vm_id,
                    tap = %allocation.tap_name,
                    mode = ?allocation.mode,
                    "network configured"
                );
                Ok(allocation)
            }
            Err(e) => {
                for step in undo.into_iter().rev() {
                    step.run().await;
                }
                Err(e)
            }
        }
    }

    async fn setup_inner(
        &self,
        vm_id: &str,
        request: &NetworkRequest,
        tap: &str,
        mac: &str,
        undo: &mut Vec<UndoStep>,
    ) -> Result<NetworkAllocation, NetworkError> {
        run("ip", &["tuntap", "add", tap, "mode", "tap"]).await?;
        undo.push(UndoStep::DeleteLink(tap.to_string()));

        match request.mode {
            NetworkMode::Bridge => {
                let bridge = request
                    .bridge_name
                    .clone()
                    .unwrap_or_else(|| self.default_bridge.clone());
                run("ip", &["link", "set", tap, "master", &bridge]).await?;
                run("ip", &["link", "set", tap, "up"]).await?;
                run("ip", &["link", "set", tap, "promisc", "on"]).await?;

                Ok(NetworkAllocation {
                    mode: NetworkMode::Bridge,
                    tap_name: tap.to_string(),
                    bridge_name: Some(bridge),
                    macvlan_link: None,
                    mac: mac.to_string(),
                    ip: "dhcp".to_string(),
                    nat: None,
                })
            }
            NetworkMode::Host => {
                run("ip", &["link", "set", tap, "up"]).await?;

                Ok(NetworkAllocation {
                    mode: NetworkMode::Host,
                    tap_name: tap.to_string(),
                    bridge_name: None,
                    macvlan_link: None,
                    mac: mac.to_string(),
                    ip: "dhcp".to_string(),
                    nat: None,
                })
            }
            NetworkMode::Nat => {
                let plan = request.nat_plan().map_err(NetworkError::InvalidConfig)?;

                let gateway_cidr = format!("{}/{}", plan.gateway, plan.prefix_len);
                run("ip", &["addr", "add", &gateway_cidr, "dev", tap]).await?;
                run("ip", &["link", "set", tap, "up"]).await?;
                run("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await?;

                for rule in nat_rules(tap, &plan.subnet) {
                    let add = rule.args("-A");
                    let add: Vec<&str> = add.iter().map(|s| s.as_str()).collect();
                    run("iptables", &add).await?;
                    undo.push(UndoStep::Iptables(rule.args("-D")));
                }

                Ok(NetworkAllocation {
                    mode: NetworkMode::Nat,
                    tap_name: tap.to_string(),
                    bridge_name: None,
                    macvlan_link: None,
                    mac: mac.to_string(),
                    ip: plan.guest.to_string(),
                    nat: Some(NatRules {
                        subnet: plan.subnet,
                        gateway: plan.gateway.to_string(),
                        prefix_len: plan.prefix_len,
                    }),
                })
            }
            NetworkMode::Macvlan => {
                let parent = request.parent_interface.as_deref().ok_or_else(|| {
                    NetworkError::InvalidConfig("macvlan mode requires parent_interface".to_string())
                })?;
                let link = macvlan_link_name(vm_id);

                run(
                    "ip",
                    &[
                        "link", "add", "link", parent, "name", &link, "type", "macvlan",
                        "mode", "bridge",
                    ],
                )
                .await?;
                undo.push(UndoStep::DeleteLink(link.clone()));
                run("ip", &["link", "set", &link, "up"]).await?;
                run("ip", &["link", "set", tap, "up"]).await?;

                Ok(NetworkAllocation {
                    mode: NetworkMode::Macvlan,
                    tap_name: tap.to_string(),
                    bridge_name: None,
                    macvlan_link: Some(link),
                    mac: mac.to_string(),
                    ip: "dhcp".to_string(),
                    nat: None,
                })
            }
        }
    }

    /// Undo everything `setup` allocated. Best-effort: failures are logged
    /// and swallowed so teardown never masks the error that triggered it.
    pub async fn teardown(&self, allocation: &NetworkAllocation) {
        let _guard = self.lock.lock().await;

        if let Some(nat) = &allocation.nat {
            for rule in nat_rules(&allocation.tap_name, &nat.subnet) {
                UndoStep::Iptables(rule.args("-D")).run().await;
            }
        }

        UndoStep::DeleteLink(allocation.tap_name.clone()).run().await;

        if let Some(link) = &allocation.macvlan_link {
            UndoStep::DeleteLink(link.clone()).run().await;
        }
    }

    /// Delete a TAP device that no tracked record owns. Used by startup
    /// recovery after the daemon finds stale interfaces.
    pub async fn remove_orphan_tap(&self, tap: &str) {
        let _guard = self.lock.lock().await;
        UndoStep::DeleteLink(tap.to_string()).run().await;
    }
}

enum UndoStep {
    DeleteLink(String),
    Iptables(Vec<String>),
}

impl UndoStep {
    async fn run(&self) {
        let result = match self {
            UndoStep::DeleteLink(name) => run("ip", &["link", "delete", name]).await,
            UndoStep::Iptables(args) => {
                let args: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
                run("iptables", &args).await
            }
        };
        if let Err(e) = result {
            warn!("network cleanup step failed: {}", e);
        }
    }
}

async fn run(command: &str, args: &[&str]) -> Result<(), NetworkError> {
    let output = Command::new(command)
        .args(args)
        .output()
        .await
        .map_err(|source| NetworkError::Spawn {
            command: format!("{command} {}", args.join(" ")),
            source,
        })?;

    if !output.status.success() {
        return Err(NetworkError::Command {
            command: format!("{command} {}", args.join(" ")),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn macvlan_link_name(vm_id: &str) -> String {
    // Reuse the TAP hash so the name is deterministic and fits IFNAMSIZ.
    let tap = identity::tap_name(vm_id);
    format!("mvl{}", &tap[3..])
}

/// One iptables rule, held without its -A/-D operation so the same
/// definition serves setup and teardown.
struct IptablesRule {
    table: Option<&'static str>,
    chain: &'static str,
    spec: Vec<String>,
}

impl IptablesRule {
    fn args(&self, op: &str) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(table) = self.table {
            args.push("-t".to_string());
            args.push(table.to_string());
        }
        args.push(op.to_string());
        args.push(self.chain.to_string());
        args.extend(self.spec.iter().cloned());
        args
    }
}

/// The rule set giving one NAT'd guest outbound connectivity.
fn nat_rules(tap: &str, subnet: &str) -> Vec<IptablesRule> {
    vec![
        IptablesRule {
            table: Some("nat"),
            chain: "POSTROUTING",
            spec: ["-s", subnet, "!", "-o", tap, "-j", "MASQUERADE"]
                .map(String::from)
                .to_vec(),
        },
        IptablesRule {
            table: None,
            chain: "FORWARD",
            spec: ["-i", tap, "-j", "ACCEPT"].map(String::from).to_vec(),
        },
        IptablesRule {
            table: None,
            chain: "FORWARD",
            spec: [
                "-o", tap, "-m", "state", "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT",
            ]
            .map(String::from)
            .to_vec(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macvlan_link_name_fits_interface_limit() {
        let name = macvlan_link_name("acme-ab12cdef");
        assert!(name.len() <= common::identity::MAX_INTERFACE_NAME_LEN);
        assert!(name.starts_with("mvl"));
    }

    #[test]
    fn nat_rules_compose_add_and_delete_forms() {
        let rules = nat_rules("tap0a1b2c3d", "172.30.0.0/24");
        assert_eq!(rules.len(), 3);

        let masquerade = rules[0].args("-A").join(" ");
        assert_eq!(
            masquerade,
            "-t nat -A POSTROUTING -s 172.30.0.0/24 ! -o tap0a1b2c3d -j MASQUERADE"
        );

        let delete = rules[1].args("-D").join(" ");
        assert_eq!(delete, "-D FORWARD -i tap0a1b2c3d -j ACCEPT");
    }
}
