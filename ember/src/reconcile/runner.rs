//! Single-runner reconciliation.
//!
//! The phase machine:
//!
//! ```text
//! Pending -> Creating     token acquired, create accepted by a daemon
//! Creating -> Registering VM process live and reachable
//! Registering -> Ready    runner held steady through the registration grace
//! Ready -> Terminating    deletion requested, or job completed (ephemeral)
//! * -> Failed             unrecoverable error; retried after cooldown
//! ```
//!
//! The decision step is a pure function of the desired runner and the
//! observed VM record, so reconciling twice against identical state
//! produces identical actions and no extra side effects. A finalizer keeps
//! the row alive until the VM is proved absent.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::api::{VmRecord, VmStatus};

use crate::lifecycle::LifecycleError;
use crate::model::runners::{self, Runner, RunnerPhase};

use super::{Key, ReconcileContext};

/// How long a VM may sit in Creating before the attempt is declared dead.
const CREATE_TIMEOUT_SECS: i64 = 300;

/// How long a live VM must hold steady in Registering before Ready.
const REGISTER_GRACE_SECS: i64 = 15;

/// Cooldown before a Failed runner is retried.
const FAILED_COOLDOWN_SECS: i64 = 300;

/// Poll cadence for Ready runners.
const READY_POLL: Duration = Duration::from_secs(30);

/// Poll cadence while waiting on a VM to come up.
const CREATING_POLL: Duration = Duration::from_secs(10);

/// Token/create attempts before giving up on a runner.
const MAX_CREATE_ATTEMPTS: i32 = 5;

pub const REASON_LOST: &str = "Lost";

/// What the daemons report for this runner's VM.
#[derive(Debug, Clone, Copy)]
pub enum Observed<'a> {
    /// Daemons unreachable; nothing can be concluded.
    Unknown,
    Absent,
    Present(&'a VmRecord),
}

/// The single next step for a runner. Derived purely from desired and
/// observed state.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Acquire a token and ask a daemon for the VM.
    Create,
    /// VM not up yet; look again shortly.
    WaitForVm,
    MarkRegistering,
    MarkReady,
    MarkFailed {
        reason: &'static str,
        message: String,
    },
    /// Tear the VM down and clear the finalizer.
    Teardown,
    /// Healthy; poll again later.
    Poll,
    Nothing,
}

pub fn decide(runner: &Runner, observed: Observed<'_>, now: DateTime<Utc>) -> Action {
    if runner.deletion_timestamp.is_some() || runner.phase == RunnerPhase::Terminating {
        return Action::Teardown;
    }

    let phase_age = now - runner.phase_updated_at;

    match runner.phase {
        RunnerPhase::Pending => Action::Create,

        RunnerPhase::Creating => match observed {
            Observed::Present(record) if record.status == VmStatus::Running => {
                Action::MarkRegistering
            }
            Observed::Present(record) if record.status == VmStatus::Creating => Action::WaitForVm,
            Observed::Present(_) => Action::MarkFailed {
                reason: "HostFailure",
                message: "VM failed during launch".to_string(),
            },
            Observed::Absent if phase_age.num_seconds() > CREATE_TIMEOUT_SECS => {
                Action::MarkFailed {
                    reason: "HostFailure",
                    message: format!("VM did not appear within {CREATE_TIMEOUT_SECS} seconds"),
                }
            }
            Observed::Absent | Observed::Unknown => Action::WaitForVm,
        },

        RunnerPhase::Registering => match observed {
            Observed::Present(record) if record.status == VmStatus::Running => {
                if phase_age.num_seconds() >= REGISTER_GRACE_SECS {
                    Action::MarkReady
                } else {
                    Action::WaitForVm
                }
            }
            Observed::Present(_) | Observed::Absent => Action::MarkFailed {
                reason: REASON_LOST,
                message: "VM disappeared during registration".to_string(),
            },
            Observed::Unknown => Action::WaitForVm,
        },

        RunnerPhase::Ready => match observed {
            Observed::Present(record) if record.status == VmStatus::Running => Action::Poll,
            Observed::Unknown => Action::Poll,
            // An ephemeral runner shuts its VM down after the job; that is
            // completion, not loss.
            Observed::Present(_) | Observed::Absent if runner.ephemeral => Action::Teardown,
            Observed::Present(_) | Observed::Absent => Action::MarkFailed {
                reason: REASON_LOST,
                message: "VM process died unexpectedly".to_string(),
            },
        },

        RunnerPhase::Failed => {
            if phase_age.num_seconds() < FAILED_COOLDOWN_SECS {
                return Action::Nothing;
            }
            // Lost runners owned by a deployment are replaced under a new
            // name rather than revived.
            if runner.reason.as_deref() == Some(REASON_LOST) && runner.owner_deployment_id.is_some()
            {
                Action::Nothing
            } else {
                Action::Create
            }
        }

        RunnerPhase::Terminating => Action::Teardown,
    }
}

pub async fn reconcile(
    ctx: &ReconcileContext,
    namespace: &str,
    name: &str,
) -> anyhow::Result<()> {
    let Some(runner) = runners::get(&ctx.pool, namespace, name).await? else {
        debug!(namespace = %namespace, name = %name, "runner gone, nothing to do");
        return Ok(());
    };

    let Some(driver) = ctx.driver_for(runner.runtime_type) else {
        debug!(runner = %runner.name, "no driver for runtime, skipping");
        return Ok(());
    };

    // Observation is skipped for phases that never consult it.
    let observed_record = match runner.phase {
        RunnerPhase::Pending | RunnerPhase::Failed => None,
        _ => match driver.observe(&runner).await {
            Ok(record) => record,
            Err(e) if e.is_retryable() => {
                warn!(runner = %runner.name, "observe failed: {}", e);
                let action = decide(&runner, Observed::Unknown, Utc::now());
                return apply(ctx, driver, &runner, action).await;
            }
            Err(e) => {
                warn!(runner = %runner.name, "observe failed terminally: {}", e);
                None
            }
        },
    };

    let observed = match &observed_record {
        Some(record) => Observed::Present(record),
        None => Observed::Absent,
    };

    let action = decide(&runner, observed, Utc::now());
    apply(ctx, driver, &runner, action).await
}

async fn apply(
    ctx: &ReconcileContext,
    driver: &dyn crate::lifecycle::RuntimeDriver,
    runner: &Runner,
    action: Action,
) -> anyhow::Result<()> {
    let key = Key::Runner {
        namespace: runner.namespace.clone(),
        name: runner.name.clone(),
    };

    match action {
        Action::Create => match driver.ensure_instance(runner).await {
            Ok(sticky) => {
                runners::set_vm_node_url(&ctx.pool, runner.id, &sticky).await?;
                runners::set_token_attempts(&ctx.pool, runner.id, 0).await?;
                runners::update_phase(&ctx.pool, runner.id, RunnerPhase::Creating, None, None)
                    .await?;
                info!(runner = %runner.name, node = %sticky, "runner creating");
                ctx.queue.enqueue_after(key, Duration::from_secs(2));
            }
            Err(e) if e.is_retryable() => {
                let attempts = runner.token_attempts + 1;
                if attempts >= MAX_CREATE_ATTEMPTS {
                    warn!(runner = %runner.name, "giving up after {} attempts: {}", attempts, e);
                    runners::update_phase(
                        &ctx.pool,
                        runner.id,
                        RunnerPhase::Failed,
                        Some(e.reason()),
                        Some(&e.to_string()),
                    )
                    .await?;
                    notify_owner(ctx, runner);
                } else {
                    runners::set_token_attempts(&ctx.pool, runner.id, attempts).await?;
                    let delay = retry_backoff(attempts, &e);
                    debug!(
                        runner = %runner.name,
                        "create attempt {} failed, retrying in {:?}: {}", attempts, delay, e
                    );
                    ctx.queue.enqueue_after(key, delay);
                }
            }
            Err(e) => {
                warn!(runner = %runner.name, "create failed terminally: {}", e);
                runners::update_phase(
                    &ctx.pool,
                    runner.id,
                    RunnerPhase::Failed,
                    Some(e.reason()),
                    Some(&e.to_string()),
                )
                .await?;
                notify_owner(ctx, runner);
            }
        },

        Action::WaitForVm => {
            ctx.queue.enqueue_after(key, CREATING_POLL);
        }

        Action::MarkRegistering => {
            runners::update_phase(&ctx.pool, runner.id, RunnerPhase::Registering, None, None)
                .await?;
            info!(runner = %runner.name, "runner registering");
            ctx.queue
                .enqueue_after(key, Duration::from_secs(REGISTER_GRACE_SECS as u64));
        }

        Action::MarkReady => {
            runners::update_phase(&ctx.pool, runner.id, RunnerPhase::Ready, None, None).await?;
            info!(runner = %runner.name, "runner ready");
            notify_owner(ctx, runner);
            ctx.queue.enqueue_after(key, READY_POLL);
        }

        Action::MarkFailed { reason, message } => {
            warn!(runner = %runner.name, reason = %reason, "runner failed: {}", message);
            runners::update_phase(
                &ctx.pool,
                runner.id,
                RunnerPhase::Failed,
                Some(reason),
                Some(&message),
            )
            .await?;
            notify_owner(ctx, runner);
            // Eligible for retry or replacement once the cooldown passes.
            ctx.queue
                .enqueue_after(key, Duration::from_secs(FAILED_COOLDOWN_SECS as u64));
        }

        Action::Teardown => {
            if runner.phase != RunnerPhase::Terminating {
                runners::update_phase(&ctx.pool, runner.id, RunnerPhase::Terminating, None, None)
                    .await?;
            }
            match driver.ensure_absent(runner).await {
                Ok(()) => {
                    runners::clear_finalizer_and_delete(&ctx.pool, runner.id).await?;
                    info!(runner = %runner.name, "runner removed");
                    notify_owner(ctx, runner);
                }
                Err(e) => {
                    warn!(runner = %runner.name, "teardown incomplete, retrying: {}", e);
                    ctx.queue.enqueue_after(key, Duration::from_secs(5));
                }
            }
        }

        Action::Poll => {
            ctx.queue.enqueue_after(key, READY_POLL);
        }

        Action::Nothing => {}
    }

    Ok(())
}

fn notify_owner(ctx: &ReconcileContext, runner: &Runner) {
    if runner.owner_deployment_id.is_some() {
        // The deployment key is (namespace, deployment-name); runner names
        // are `<deployment>-<timestamp>-<random>`.
        if let Some(deployment_name) = owner_name_of(&runner.name) {
            ctx.queue.enqueue(Key::Deployment {
                namespace: runner.namespace.clone(),
                name: deployment_name,
            });
        }
    }
}

/// Strip the `-<timestamp>-<random>` suffix a deployment appends.
fn owner_name_of(runner_name: &str) -> Option<String> {
    let mut parts: Vec<&str> = runner_name.rsplitn(3, '-').collect();
    if parts.len() < 3 {
        return None;
    }
    parts.reverse();
    Some(parts[0].to_string())
}

/// Exponential backoff with jitter, honoring a server-provided retry-after.
fn retry_backoff(attempt: i32, error: &LifecycleError) -> Duration {
    if let LifecycleError::RateLimited {
        retry_after: Some(seconds),
        ..
    } = error
    {
        return Duration::from_secs(*seconds);
    }
    let base = 2u64.saturating_pow(attempt.max(0) as u32).min(60);
    let jitter = (Uuid::new_v4().as_u128() % 1000) as u64;
    Duration::from_secs(base) + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use common::api::NetworkMode;

    use crate::model::runners::{NetworkConfig, RuntimeKind, ScopeKind};

    use super::*;

    fn runner(phase: RunnerPhase) -> Runner {
        Runner {
            id: Uuid::new_v4(),
            namespace: "default".to_string(),
            name: "acme-1700000000-ab12c".to_string(),
            scope_kind: ScopeKind::Organization,
            scope_value: "acme".to_string(),
            labels: vec![],
            ephemeral: false,
            runtime_type: RuntimeKind::Firecracker,
            firecracker: None,
            phase,
            reason: None,
            message: None,
            owner_deployment_id: None,
            vm_node_url: Some("http://127.0.0.1:8350".to_string()),
            token_attempts: 0,
            vm_finalizer: true,
            deletion_timestamp: None,
            created_at: Utc::now(),
            phase_updated_at: Utc::now(),
        }
    }

    fn record(status: VmStatus) -> VmRecord {
        VmRecord {
            vm_id: "acme-0a1b2c3d".to_string(),
            name: "acme-1700000000-ab12c".to_string(),
            tap_name: "tap0a1b2c3d".to_string(),
            bridge_name: None,
            mac: "06:aa:bb:cc:dd:ee".to_string(),
            ip: "dhcp".to_string(),
            networking: NetworkMode::Bridge,
            memory_mib: 2048,
            vcpus: 2,
            pid: Some(4242),
            status,
            created_at: Utc::now(),
            console_log_path: String::new(),
            rootfs_path: String::new(),
            kernel_path: String::new(),
            socket_path: String::new(),
            ephemeral: true,
            kernel_source: "default".to_string(),
            rootfs_source: "default".to_string(),
        }
    }

    #[test]
    fn pending_runner_creates() {
        assert_eq!(
            decide(&runner(RunnerPhase::Pending), Observed::Absent, Utc::now()),
            Action::Create
        );
    }

    #[test]
    fn deletion_always_wins() {
        let mut r = runner(RunnerPhase::Ready);
        r.deletion_timestamp = Some(Utc::now());
        let live = record(VmStatus::Running);
        assert_eq!(decide(&r, Observed::Present(&live), Utc::now()), Action::Teardown);
    }

    #[test]
    fn creating_moves_to_registering_when_vm_runs() {
        let live = record(VmStatus::Running);
        assert_eq!(
            decide(&runner(RunnerPhase::Creating), Observed::Present(&live), Utc::now()),
            Action::MarkRegistering
        );
    }

    #[test]
    fn creating_waits_while_vm_is_absent_within_the_deadline() {
        assert_eq!(
            decide(&runner(RunnerPhase::Creating), Observed::Absent, Utc::now()),
            Action::WaitForVm
        );
    }

    #[test]
    fn creating_fails_after_the_bounded_wait() {
        let mut r = runner(RunnerPhase::Creating);
        r.phase_updated_at = Utc::now() - ChronoDuration::minutes(6);
        match decide(&r, Observed::Absent, Utc::now()) {
            Action::MarkFailed { reason, .. } => assert_eq!(reason, "HostFailure"),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn registering_holds_through_the_grace_period() {
        let live = record(VmStatus::Running);
        let fresh = runner(RunnerPhase::Registering);
        assert_eq!(
            decide(&fresh, Observed::Present(&live), Utc::now()),
            Action::WaitForVm
        );

        let mut aged = runner(RunnerPhase::Registering);
        aged.phase_updated_at = Utc::now() - ChronoDuration::seconds(20);
        assert_eq!(
            decide(&aged, Observed::Present(&live), Utc::now()),
            Action::MarkReady
        );
    }

    #[test]
    fn ready_runner_polls_while_vm_runs() {
        let live = record(VmStatus::Running);
        assert_eq!(
            decide(&runner(RunnerPhase::Ready), Observed::Present(&live), Utc::now()),
            Action::Poll
        );
    }

    #[test]
    fn killed_vm_moves_ready_runner_to_failed_lost() {
        let stopped = record(VmStatus::Stopped);
        match decide(&runner(RunnerPhase::Ready), Observed::Present(&stopped), Utc::now()) {
            Action::MarkFailed { reason, .. } => assert_eq!(reason, REASON_LOST),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn ephemeral_runner_completion_is_teardown_not_failure() {
        let mut r = runner(RunnerPhase::Ready);
        r.ephemeral = true;
        let stopped = record(VmStatus::Stopped);
        assert_eq!(
            decide(&r, Observed::Present(&stopped), Utc::now()),
            Action::Teardown
        );
    }

    #[test]
    fn failed_runner_waits_out_the_cooldown_then_retries() {
        let fresh = runner(RunnerPhase::Failed);
        assert_eq!(decide(&fresh, Observed::Absent, Utc::now()), Action::Nothing);

        let mut cooled = runner(RunnerPhase::Failed);
        cooled.phase_updated_at = Utc::now() - ChronoDuration::minutes(6);
        assert_eq!(decide(&cooled, Observed::Absent, Utc::now()), Action::Create);
    }

    #[test]
    fn lost_owned_runner_is_not_revived_in_place() {
        let mut r = runner(RunnerPhase::Failed);
        r.reason = Some(REASON_LOST.to_string());
        r.owner_deployment_id = Some(Uuid::new_v4());
        r.phase_updated_at = Utc::now() - ChronoDuration::minutes(6);
        assert_eq!(decide(&r, Observed::Absent, Utc::now()), Action::Nothing);
    }

    #[test]
    fn decide_is_idempotent_for_identical_inputs() {
        let r = runner(RunnerPhase::Creating);
        let live = record(VmStatus::Running);
        let now = Utc::now();
        assert_eq!(
            decide(&r, Observed::Present(&live), now),
            decide(&r, Observed::Present(&live), now)
        );
    }

    #[test]
    fn owner_name_strips_the_generated_suffix() {
        assert_eq!(
            owner_name_of("build-fleet-1700000000-ab12c"),
            Some("build-fleet".to_string())
        );
        assert_eq!(owner_name_of("standalone"), None);
    }

    #[test]
    fn backoff_honors_retry_after() {
        let e = LifecycleError::RateLimited {
            message: "throttled".to_string(),
            retry_after: Some(42),
        };
        assert_eq!(retry_backoff(1, &e), Duration::from_secs(42));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let e = LifecycleError::Transport {
            message: "down".to_string(),
        };
        assert!(retry_backoff(1, &e) >= Duration::from_secs(2));
        assert!(retry_backoff(10, &e) <= Duration::from_secs(61));
    }
}
