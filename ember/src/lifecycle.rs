//! Controller-side VM lifecycle orchestration.
//!
//! Holds no state of its own: everything derives from the Runner resource
//! plus whatever the daemons report. Creation runs admission preflight,
//! mints a fresh registration token, renders and validates the first-boot
//! bundle, then hands the request to the daemon. Deletion upholds one
//! invariant: no VM for this runner exists on any node we can reach;
//! unreachable nodes sweep locally.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::{info, instrument, warn};

use common::api::{CreateVmRequest, NetworkRequest, VmRecord};
use common::cloud_init::FirstBootConfig;
use common::identity;

use crate::configuration::VmSettings;
use crate::model::runners::{FirecrackerSpec, Runner};
use crate::token_broker::{TokenBroker, TokenError};
use crate::vm_client::{VmClient, VmClientError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Resource limits exceeded; terminal for this attempt.
    #[error("{message}")]
    Admission { message: String },

    /// Malformed spec or first-boot blob; terminal.
    #[error("{message}")]
    Invalid { message: String },

    /// Hosting service rejected credentials; terminal.
    #[error("{message}")]
    Unauthorized { message: String },

    /// Hosting service throttled us; requeue with backoff.
    #[error("{message}")]
    RateLimited {
        message: String,
        retry_after: Option<u64>,
    },

    /// Network failure to the daemon or the hosting service; retryable.
    #[error("{message}")]
    Transport { message: String },

    /// Privileged host operation failed on the node; retry a few times.
    #[error("{message}")]
    HostFailure { message: String },
}

impl LifecycleError {
    /// Stable reason string recorded on the Runner status.
    pub fn reason(&self) -> &'static str {
        match self {
            LifecycleError::Admission { .. } => "AdmissionDenied",
            LifecycleError::Invalid { .. } => "Invalid",
            LifecycleError::Unauthorized { .. } => "Unauthorized",
            LifecycleError::RateLimited { .. } | LifecycleError::Transport { .. } => "Transport",
            LifecycleError::HostFailure { .. } => "HostFailure",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::RateLimited { .. }
                | LifecycleError::Transport { .. }
                | LifecycleError::HostFailure { .. }
        )
    }
}

impl From<TokenError> for LifecycleError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::ScopeUnauthorized { .. } => LifecycleError::Unauthorized {
                message: e.to_string(),
            },
            TokenError::RateLimited { retry_after } => LifecycleError::RateLimited {
                message: e.to_string(),
                retry_after,
            },
            TokenError::Transport(_) => LifecycleError::Transport {
                message: e.to_string(),
            },
            TokenError::Malformed(_) => LifecycleError::Invalid {
                message: e.to_string(),
            },
        }
    }
}

impl From<VmClientError> for LifecycleError {
    fn from(e: VmClientError) -> Self {
        match e {
            VmClientError::AdmissionDenied { message } => LifecycleError::Admission { message },
            VmClientError::Invalid { message } | VmClientError::NotFound { message } => {
                LifecycleError::Invalid { message }
            }
            VmClientError::Daemon { .. } => LifecycleError::HostFailure {
                message: e.to_string(),
            },
            VmClientError::Transport { .. } => LifecycleError::Transport {
                message: e.to_string(),
            },
        }
    }
}

/// Required operations of a runtime backing. The controller dispatches on
/// the runner's runtime tag exactly once, into one of these.
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Bring the instance into existence. Returns the sticky daemon URL
    /// that owns it. Idempotent: an instance that already exists is
    /// success.
    async fn ensure_instance(&self, runner: &Runner) -> Result<String, LifecycleError>;

    /// Prove the instance absent from every reachable node.
    async fn ensure_absent(&self, runner: &Runner) -> Result<(), LifecycleError>;

    /// Current instance state, or `None` when no node has it.
    async fn observe(&self, runner: &Runner) -> Result<Option<VmRecord>, LifecycleError>;
}

pub struct VmLifecycleManager {
    client: VmClient,
    broker: std::sync::Arc<dyn TokenBroker>,
    settings: VmSettings,
    html_url: String,
}

impl VmLifecycleManager {
    pub fn new(
        client: VmClient,
        broker: std::sync::Arc<dyn TokenBroker>,
        settings: VmSettings,
        html_url: String,
    ) -> Self {
        Self {
            client,
            broker,
            settings,
            html_url,
        }
    }

    /// Mirror of the daemon's admission checks, for feedback before any
    /// token is minted. The daemon remains authoritative.
    pub fn preflight(&self, spec: &FirecrackerSpec) -> Result<(i64, i64), LifecycleError> {
        let memory = if spec.memory_mib > 0 {
            spec.memory_mib
        } else {
            self.settings.default_memory_mib
        };
        let vcpus = if spec.vcpus > 0 {
            spec.vcpus
        } else {
            self.settings.default_vcpus
        };

        if memory > self.settings.max_memory_mib {
            return Err(LifecycleError::Admission {
                message: format!(
                    "requested memory {} MiB exceeds maximum {} MiB",
                    memory, self.settings.max_memory_mib
                ),
            });
        }
        if vcpus > self.settings.max_vcpus {
            return Err(LifecycleError::Admission {
                message: format!(
                    "requested cpus {} exceeds maximum {}",
                    vcpus, self.settings.max_vcpus
                ),
            });
        }

        let network = NetworkRequest::from(&spec.network_config);
        network
            .guest_network()
            .map_err(|message| LifecycleError::Invalid { message })?;

        Ok((memory, vcpus))
    }

    fn spec_of<'a>(&self, runner: &'a Runner) -> Result<&'a FirecrackerSpec, LifecycleError> {
        runner.firecracker.as_ref().ok_or_else(|| {
            LifecycleError::Invalid {
                message: "runner has no firecracker spec".to_string(),
            }
        })
    }

    /// Search the configured endpoints for a VM when no sticky URL is
    /// known. 404s keep looking; the first hit wins.
    async fn locate(&self, name: &str) -> Result<Option<(VmRecord, String)>, LifecycleError> {
        let mut transport_errors = 0;
        for endpoint in self.settings.daemon_urls.clone() {
            match self.client.get_vm(name, Some(&endpoint)).await {
                Ok(record) => return Ok(Some((record, endpoint))),
                Err(e) if e.is_not_found() => continue,
                Err(e) if e.is_transport() => {
                    transport_errors += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if transport_errors == self.settings.daemon_urls.len() {
            return Err(LifecycleError::Transport {
                message: "all daemon endpoints unreachable".to_string(),
            });
        }
        Ok(None)
    }
}

#[async_trait]
impl RuntimeDriver for VmLifecycleManager {
    #[instrument(skip(self, runner), fields(runner = %runner.name))]
    async fn ensure_instance(&self, runner: &Runner) -> Result<String, LifecycleError> {
        let spec = self.spec_of(runner)?;
        let (memory, vcpus) = self.preflight(spec)?;

        // Fresh token per attempt: a retried create never consumes an
        // expired one.
        let token = self
            .broker
            .issue(runner.scope_kind, &runner.scope_value, &runner.name)
            .await?;

        let github_url =
            crate::token_broker::runner_config_url(&self.html_url, runner.scope_kind, &runner.scope_value);

        let vm_id = identity::vm_id(&runner.name);
        let network = NetworkRequest::from(&spec.network_config);
        let guest_network = network
            .guest_network()
            .map_err(|message| LifecycleError::Invalid { message })?;

        let first_boot = FirstBootConfig {
            hostname: vm_id.clone(),
            github_url: github_url.clone(),
            registration_token: token.value.expose_secret().clone(),
            runner_name: runner.name.clone(),
            labels: runner.labels.clone(),
            ephemeral: runner.ephemeral && spec.ephemeral_mode,
            network: guest_network,
            ssh_authorized_key: None,
        };
        let bundle = first_boot
            .render(&vm_id)
            .map_err(|e| LifecycleError::Invalid {
                message: e.to_string(),
            })?;

        let request = CreateVmRequest {
            name: runner.name.clone(),
            memory,
            cpus: vcpus,
            github_url,
            github_token: token.value.expose_secret().clone(),
            snapshot: spec.snapshot_name.clone(),
            labels: Some(runner.labels.clone()),
            kernel_image: spec.kernel_image_path.clone(),
            rootfs_image: spec.rootfs_image_path.clone(),
            network: Some(network),
            cloud_init: Some(bundle),
        };

        match self.client.create_vm(&request).await {
            Ok((_, served_by)) => {
                info!(runner = %runner.name, node = %served_by, "VM created");
                Ok(served_by)
            }
            // A VM with this identity is already live somewhere: the retry
            // has nothing left to do except find it.
            Err(VmClientError::AdmissionDenied { message }) if message.contains("already exists") => {
                match self.locate(&runner.name).await? {
                    Some((_, endpoint)) => Ok(endpoint),
                    None => Err(LifecycleError::Transport {
                        message: "VM reported as existing but not locatable".to_string(),
                    }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, runner), fields(runner = %runner.name))]
    async fn ensure_absent(&self, runner: &Runner) -> Result<(), LifecycleError> {
        let result = self
            .client
            .delete_vm(&runner.name, runner.vm_node_url.as_deref())
            .await;

        match result {
            Ok(_) => {
                info!(runner = %runner.name, "VM deleted");
                Ok(())
            }
            // Effectively complete: no VM exists for this runner on any
            // node we can reach.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) if e.is_transport() => {
                warn!(
                    runner = %runner.name,
                    "daemons unreachable during delete, treating as complete: {}", e
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, runner), fields(runner = %runner.name))]
    async fn observe(&self, runner: &Runner) -> Result<Option<VmRecord>, LifecycleError> {
        match runner.vm_node_url.as_deref() {
            Some(sticky) => match self.client.get_vm(&runner.name, Some(sticky)).await {
                Ok(record) => Ok(Some(record)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e.into()),
            },
            None => Ok(self.locate(&runner.name).await?.map(|(record, _)| record)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use secrecy::Secret;

    use crate::model::runners::{NetworkConfig, ScopeKind};
    use crate::token_broker::RegistrationToken;

    use super::*;

    struct StaticBroker;

    #[async_trait]
    impl TokenBroker for StaticBroker {
        async fn issue(
            &self,
            _scope_kind: ScopeKind,
            _scope_value: &str,
            _runner_name: &str,
        ) -> Result<RegistrationToken, TokenError> {
            Ok(RegistrationToken {
                value: Secret::new("TOKEN".to_string()),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    fn settings() -> VmSettings {
        VmSettings {
            daemon_urls: vec!["http://127.0.0.1:8350".to_string()],
            work_dir: "/var/lib/ember".to_string(),
            max_concurrent: 4,
            min_free_gib: 30,
            max_memory_mib: 8192,
            max_vcpus: 8,
            default_memory_mib: 2048,
            default_vcpus: 2,
            enable_firecracker: true,
        }
    }

    fn manager() -> VmLifecycleManager {
        VmLifecycleManager::new(
            VmClient::new(settings().daemon_urls),
            Arc::new(StaticBroker),
            settings(),
            "https://github.com".to_string(),
        )
    }

    fn spec(memory_mib: i64, vcpus: i64) -> FirecrackerSpec {
        FirecrackerSpec {
            memory_mib,
            vcpus,
            kernel_image_path: None,
            rootfs_image_path: None,
            snapshot_name: None,
            network_config: NetworkConfig::default(),
            ephemeral_mode: true,
            arc_controller_url: None,
        }
    }

    #[test]
    fn preflight_applies_defaults_for_zero_shapes() {
        let (memory, vcpus) = manager().preflight(&spec(0, 0)).unwrap();
        assert_eq!(memory, 2048);
        assert_eq!(vcpus, 2);
    }

    #[test]
    fn preflight_denies_memory_above_the_cap() {
        let err = manager().preflight(&spec(8193, 2)).unwrap_err();
        assert_eq!(err.reason(), "AdmissionDenied");
        assert!(err.to_string().contains("8192"));
    }

    #[test]
    fn preflight_denies_excess_vcpus() {
        let err = manager().preflight(&spec(2048, 9)).unwrap_err();
        assert_eq!(err.reason(), "AdmissionDenied");
    }

    #[test]
    fn preflight_rejects_invalid_network_config() {
        let mut bad = spec(2048, 2);
        bad.network_config = NetworkConfig {
            network_mode: common::api::NetworkMode::Nat,
            subnet_cidr: None,
            ..Default::default()
        };
        let err = manager().preflight(&bad).unwrap_err();
        assert_eq!(err.reason(), "Invalid");
    }

    #[test]
    fn error_reasons_partition_retryable_from_terminal() {
        assert!(
            LifecycleError::Transport {
                message: "x".to_string()
            }
            .is_retryable()
        );
        assert!(
            !LifecycleError::Admission {
                message: "x".to_string()
            }
            .is_retryable()
        );
        assert!(
            !LifecycleError::Unauthorized {
                message: "x".to_string()
            }
            .is_retryable()
        );
    }
}
