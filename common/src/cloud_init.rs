//! First-boot configuration for runner VMs.
//!
//! The guest consumes a NoCloud volume (label `cidata`) holding three
//! documents: `user-data`, `meta-data`, `network-config`. The user-data
//! installs the CI runner, registers it with `--ephemeral --unattended`
//! against the hosting service, and starts it as a systemd unit.
//!
//! Documents are built as data and serialized with serde_yaml, then
//! validated before anything is handed to the daemon. A bundle that fails
//! validation fails the reconcile loop instead of booting a broken guest.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_DNS: [&str; 2] = ["8.8.8.8", "8.8.4.4"];

const RUNNER_USER: &str = "runner";
const RUNNER_HOME: &str = "/opt/actions-runner";
const RUNNER_ENV_FILE: &str = "/etc/actions-runner/env";

#[derive(Debug, Error)]
pub enum CloudInitError {
    #[error("failed to serialize {document}: {source}")]
    Serialize {
        document: &'static str,
        source: serde_yaml::Error,
    },

    #[error("{document} contains a control character (byte {byte:#04x} at offset {offset})")]
    ControlCharacter {
        document: &'static str,
        byte: u8,
        offset: usize,
    },

    #[error("{document} is empty")]
    Empty { document: &'static str },
}

/// Guest-side network layout, already reduced to what the guest needs to
/// know (the host-side plumbing is the daemon's problem).
#[derive(Debug, Clone, PartialEq)]
pub enum GuestNetwork {
    Dhcp,
    Static {
        /// Address in CIDR notation, e.g. `172.30.0.2/24`.
        address: String,
        gateway: String,
        dns: Vec<String>,
    },
}

/// Everything needed to render a runner's first boot.
#[derive(Debug, Clone)]
pub struct FirstBootConfig {
    pub hostname: String,
    pub github_url: String,
    pub registration_token: String,
    pub runner_name: String,
    pub labels: Vec<String>,
    pub ephemeral: bool,
    pub network: GuestNetwork,
    pub ssh_authorized_key: Option<String>,
}

/// The three rendered NoCloud documents.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CloudInitBundle {
    pub user_data: String,
    pub meta_data: String,
    pub network_config: String,
}

impl CloudInitBundle {
    /// Reject any document the in-guest parser would choke on. Only `\n`
    /// and `\t` are acceptable below 0x20; everything else (including
    /// `\r`) is treated as smuggled control data.
    pub fn validate(&self) -> Result<(), CloudInitError> {
        for (document, text) in [
            ("user-data", &self.user_data),
            ("meta-data", &self.meta_data),
            ("network-config", &self.network_config),
        ] {
            if text.trim().is_empty() {
                return Err(CloudInitError::Empty { document });
            }
            for (offset, byte) in text.bytes().enumerate() {
                if byte < 0x20 && byte != b'\n' && byte != b'\t' {
                    return Err(CloudInitError::ControlCharacter {
                        document,
                        byte,
                        offset,
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct CloudConfig {
    hostname: String,
    users: Vec<CloudConfigUser>,
    write_files: Vec<WriteFile>,
    runcmd: Vec<String>,
}

#[derive(Serialize)]
struct CloudConfigUser {
    name: String,
    shell: String,
    sudo: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_authorized_keys: Vec<String>,
}

#[derive(Serialize)]
struct WriteFile {
    path: String,
    permissions: String,
    content: String,
}

#[derive(Serialize)]
struct NetplanConfig {
    version: u8,
    ethernets: Ethernets,
}

#[derive(Serialize)]
struct Ethernets {
    eth0: EthernetConfig,
}

#[derive(Serialize)]
#[serde(untagged)]
enum EthernetConfig {
    Dhcp {
        dhcp4: bool,
    },
    Static {
        addresses: Vec<String>,
        gateway4: String,
        nameservers: Nameservers,
    },
}

#[derive(Serialize)]
struct Nameservers {
    addresses: Vec<String>,
}

impl FirstBootConfig {
    /// Render the NoCloud bundle. The result is already validated.
    pub fn render(&self, instance_id: &str) -> Result<CloudInitBundle, CloudInitError> {
        let bundle = CloudInitBundle {
            user_data: self.render_user_data()?,
            meta_data: render_meta_data(instance_id, &self.hostname),
            network_config: self.render_network_config()?,
        };
        bundle.validate()?;
        Ok(bundle)
    }

    fn render_user_data(&self) -> Result<String, CloudInitError> {
        let mut env = format!(
            "GITHUB_URL={}\nRUNNER_TOKEN={}\nRUNNER_NAME={}\nRUNNER_LABELS={}\n",
            self.github_url,
            self.registration_token,
            self.runner_name,
            self.labels.join(","),
        );
        if self.ephemeral {
            env.push_str("RUNNER_EPHEMERAL=1\n");
        }

        let config = CloudConfig {
            hostname: self.hostname.clone(),
            users: vec![CloudConfigUser {
                name: RUNNER_USER.to_string(),
                shell: "/bin/bash".to_string(),
                sudo: "ALL=(ALL) NOPASSWD:ALL".to_string(),
                ssh_authorized_keys: self.ssh_authorized_key.iter().cloned().collect(),
            }],
            write_files: vec![
                WriteFile {
                    path: RUNNER_ENV_FILE.to_string(),
                    permissions: "0600".to_string(),
                    content: env,
                },
                WriteFile {
                    path: "/usr/local/bin/setup-runner.sh".to_string(),
                    permissions: "0755".to_string(),
                    content: setup_script(self.ephemeral),
                },
                WriteFile {
                    path: "/etc/systemd/system/actions-runner.service".to_string(),
                    permissions: "0644".to_string(),
                    content: runner_unit(),
                },
            ],
            runcmd: vec![
                "/usr/local/bin/setup-runner.sh".to_string(),
                "systemctl daemon-reload".to_string(),
                "systemctl enable --now actions-runner.service".to_string(),
            ],
        };

        let body = serde_yaml::to_string(&config).map_err(|source| CloudInitError::Serialize {
            document: "user-data",
            source,
        })?;
        Ok(format!("#cloud-config\n{body}"))
    }

    fn render_network_config(&self) -> Result<String, CloudInitError> {
        let eth0 = match &self.network {
            GuestNetwork::Dhcp => EthernetConfig::Dhcp { dhcp4: true },
            GuestNetwork::Static {
                address,
                gateway,
                dns,
            } => {
                let dns = if dns.is_empty() {
                    DEFAULT_DNS.iter().map(|s| s.to_string()).collect()
                } else {
                    dns.clone()
                };
                EthernetConfig::Static {
                    addresses: vec![address.clone()],
                    gateway4: gateway.clone(),
                    nameservers: Nameservers { addresses: dns },
                }
            }
        };

        let config = NetplanConfig {
            version: 2,
            ethernets: Ethernets { eth0 },
        };

        serde_yaml::to_string(&config).map_err(|source| CloudInitError::Serialize {
            document: "network-config",
            source,
        })
    }
}

fn render_meta_data(instance_id: &str, hostname: &str) -> String {
    format!("instance-id: {instance_id}\nlocal-hostname: {hostname}\n")
}

fn setup_script(ephemeral: bool) -> String {
    let ephemeral_flag = if ephemeral { " --ephemeral" } else { "" };
    format!(
        r#"#!/bin/bash
set -euo pipefail
source {env_file}
mkdir -p {home}
cd {home}
if [ ! -x ./config.sh ]; then
    ARCH=$(uname -m | sed 's/x86_64/x64/;s/aarch64/arm64/')
    VERSION=$(curl -fsSL https://api.github.com/repos/actions/runner/releases/latest | grep '"tag_name"' | cut -d '"' -f4 | tr -d v)
    curl -fsSL -o runner.tar.gz "https://github.com/actions/runner/releases/download/v${{VERSION}}/actions-runner-linux-${{ARCH}}-${{VERSION}}.tar.gz"
    tar xzf runner.tar.gz
    rm -f runner.tar.gz
fi
chown -R {user}:{user} {home}
sudo -u {user} ./config.sh --unattended{ephemeral_flag} \
    --url "$GITHUB_URL" \
    --token "$RUNNER_TOKEN" \
    --name "$RUNNER_NAME" \
    --labels "$RUNNER_LABELS" \
    --replace
"#,
        env_file = RUNNER_ENV_FILE,
        home = RUNNER_HOME,
        user = RUNNER_USER,
        ephemeral_flag = ephemeral_flag,
    )
}

fn runner_unit() -> String {
    format!(
        r#"[Unit]
Description=CI actions runner
After=network-online.target
Wants=network-online.target

[Service]
User={user}
WorkingDirectory={home}
ExecStart={home}/run.sh
Restart=on-failure
RestartSec=5

[Install]
WantedBy=multi-user.target
"#,
        user = RUNNER_USER,
        home = RUNNER_HOME,
    )
}

#[cfg(test)]
mod tests {
    use once_cell::sync::Lazy;

    use super::*;

    static BASE: Lazy<FirstBootConfig> = Lazy::new(|| FirstBootConfig {
        hostname: "acme-17-ab12c".to_string(),
        github_url: "https://github.com/acme".to_string(),
        registration_token: "AABBCC-REGISTRATION".to_string(),
        runner_name: "acme-1700000000-ab12c".to_string(),
        labels: vec!["self-hosted".to_string(), "microvm".to_string()],
        ephemeral: true,
        network: GuestNetwork::Dhcp,
        ssh_authorized_key: None,
    });

    #[test]
    fn user_data_registers_an_ephemeral_unattended_runner() {
        let bundle = BASE.render("acme-ab12cdef").unwrap();

        assert!(bundle.user_data.starts_with("#cloud-config\n"));
        assert!(bundle.user_data.contains("--unattended --ephemeral"));
        assert!(bundle.user_data.contains("RUNNER_TOKEN=AABBCC-REGISTRATION"));
        assert!(bundle.user_data.contains("RUNNER_LABELS=self-hosted,microvm"));
        assert!(bundle.user_data.contains("GITHUB_URL=https://github.com/acme"));
    }

    #[test]
    fn non_ephemeral_runner_omits_the_flag() {
        let mut config = BASE.clone();
        config.ephemeral = false;
        let bundle = config.render("acme-ab12cdef").unwrap();
        assert!(!bundle.user_data.contains("--ephemeral"));
    }

    #[test]
    fn meta_data_carries_instance_id_and_hostname() {
        let bundle = BASE.render("acme-ab12cdef").unwrap();
        assert_eq!(
            bundle.meta_data,
            "instance-id: acme-ab12cdef\nlocal-hostname: acme-17-ab12c\n"
        );
    }

    #[test]
    fn dhcp_network_config_enables_dhcp4() {
        let bundle = BASE.render("acme-ab12cdef").unwrap();
        assert!(bundle.network_config.contains("dhcp4: true"));
        assert!(bundle.network_config.contains("version: 2"));
    }

    #[test]
    fn static_network_config_renders_address_gateway_and_default_dns() {
        let mut config = BASE.clone();
        config.network = GuestNetwork::Static {
            address: "172.30.0.2/24".to_string(),
            gateway: "172.30.0.1".to_string(),
            dns: vec![],
        };
        let bundle = config.render("acme-ab12cdef").unwrap();

        assert!(bundle.network_config.contains("172.30.0.2/24"));
        assert!(bundle.network_config.contains("gateway4: 172.30.0.1"));
        assert!(bundle.network_config.contains("8.8.8.8"));
        assert!(bundle.network_config.contains("8.8.4.4"));
    }

    #[test]
    fn validation_rejects_control_characters() {
        let bundle = CloudInitBundle {
            user_data: "#cloud-config\nhostname: a\u{0007}b\n".to_string(),
            meta_data: "instance-id: x\n".to_string(),
            network_config: "version: 2\n".to_string(),
        };
        assert!(matches!(
            bundle.validate(),
            Err(CloudInitError::ControlCharacter {
                document: "user-data",
                ..
            })
        ));
    }

    #[test]
    fn validation_rejects_carriage_returns() {
        let bundle = CloudInitBundle {
            user_data: "#cloud-config\r\nhostname: a\n".to_string(),
            meta_data: "instance-id: x\n".to_string(),
            network_config: "version: 2\n".to_string(),
        };
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn validation_rejects_empty_documents() {
        let bundle = CloudInitBundle {
            user_data: "#cloud-config\n".to_string(),
            meta_data: "  \n".to_string(),
            network_config: "version: 2\n".to_string(),
        };
        assert!(matches!(
            bundle.validate(),
            Err(CloudInitError::Empty {
                document: "meta-data"
            })
        ));
    }

    #[test]
    fn rendered_bundles_pass_validation() {
        let bundle = BASE.render("acme-ab12cdef").unwrap();
        bundle.validate().unwrap();
    }
}
