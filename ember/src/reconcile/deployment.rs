//! RunnerDeployment reconciliation: keep the set of owned runners at the
//! desired replica count.
//!
//! Scale-up stamps new runners out of the template under generated names;
//! scale-down deletes newest-first so warm runners survive. Lost runners
//! are replaced under fresh names once their cooldown passes. Deleting a
//! deployment cascades: every owned runner is marked for deletion and the
//! deployment row goes away once none remain.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::runner_deployments::{self, RunnerDeployment};
use crate::model::runners::{self, NewRunner, Runner, RunnerPhase};
use crate::reconcile::runner::REASON_LOST;

use super::{Key, ReconcileContext};

/// How long a Lost runner sits before its replacement is created.
const REPLACE_COOLDOWN_SECS: i64 = 300;

/// The computed difference between desired and actual.
#[derive(Debug, Default, PartialEq)]
pub struct ScalePlan {
    pub create: usize,
    /// Runner ids to delete, already ordered (victims first).
    pub delete: Vec<Uuid>,
}

/// Compute the plan from the owned runner list. `existing` must be sorted
/// newest first, which is what the model layer returns.
pub fn scale_plan(desired: i32, existing: &[Runner], now: DateTime<Utc>) -> ScalePlan {
    let desired = desired.max(0) as usize;

    // Runners already going away take no further part.
    let candidates: Vec<&Runner> = existing
        .iter()
        .filter(|r| r.deletion_timestamp.is_none())
        .collect();

    // Lost runners past cooldown are replaced under a new name.
    let (stale, alive): (Vec<&Runner>, Vec<&Runner>) = candidates.into_iter().partition(|r| {
        r.phase == RunnerPhase::Failed
            && r.reason.as_deref() == Some(REASON_LOST)
            && (now - r.phase_updated_at).num_seconds() >= REPLACE_COOLDOWN_SECS
    });

    let mut plan = ScalePlan {
        create: desired.saturating_sub(alive.len()),
        delete: stale.iter().map(|r| r.id).collect(),
    };

    if alive.len() > desired {
        // `alive` is newest-first already.
        plan.delete
            .extend(alive[..alive.len() - desired].iter().map(|r| r.id));
    }

    plan
}

/// `<deployment>-<unix-timestamp>-<random>`, valid as a resource name and
/// unique across rapid scale events.
pub fn generate_runner_name(deployment: &str, now: DateTime<Utc>) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string()[..5].to_string();
    format!("{}-{}-{}", deployment, now.timestamp(), suffix)
}

pub async fn reconcile(
    ctx: &ReconcileContext,
    namespace: &str,
    name: &str,
) -> anyhow::Result<()> {
    let Some(deployment) = runner_deployments::get(&ctx.pool, namespace, name).await? else {
        debug!(namespace = %namespace, name = %name, "deployment gone, nothing to do");
        return Ok(());
    };

    let owned = runners::list_by_deployment(&ctx.pool, deployment.id).await?;

    if deployment.deletion_timestamp.is_some() {
        return cascade_delete(ctx, &deployment, &owned).await;
    }

    let now = Utc::now();
    let plan = scale_plan(deployment.replicas, &owned, now);

    if plan.create > 0 || !plan.delete.is_empty() {
        info!(
            deployment = %deployment.name,
            desired = deployment.replicas,
            create = plan.create,
            delete = plan.delete.len(),
            "scaling deployment"
        );
    }

    for _ in 0..plan.create {
        let runner_name = generate_runner_name(&deployment.name, now);
        let new_runner = NewRunner {
            namespace: deployment.namespace.clone(),
            name: runner_name.clone(),
            scope_kind: deployment.template.scope_kind,
            scope_value: deployment.template.scope_value.clone(),
            labels: deployment.template.labels.clone(),
            ephemeral: deployment.template.ephemeral,
            runtime_type: deployment.template.runtime_type,
            firecracker: deployment.template.firecracker.clone(),
            owner_deployment_id: Some(deployment.id),
        };
        runners::create(&ctx.pool, &new_runner).await?;
        ctx.queue.enqueue(Key::Runner {
            namespace: deployment.namespace.clone(),
            name: runner_name,
        });
    }

    for id in &plan.delete {
        runners::mark_deleting(&ctx.pool, *id).await?;
        if let Some(victim) = owned.iter().find(|r| r.id == *id) {
            ctx.queue.enqueue(Key::Runner {
                namespace: victim.namespace.clone(),
                name: victim.name.clone(),
            });
        }
    }

    let observed = owned
        .iter()
        .filter(|r| r.deletion_timestamp.is_none() && !plan.delete.contains(&r.id))
        .count() as i32
        + plan.create as i32;
    let ready = owned
        .iter()
        .filter(|r| r.phase == RunnerPhase::Ready && r.deletion_timestamp.is_none())
        .count() as i32;
    runner_deployments::update_status(&ctx.pool, deployment.id, observed, ready).await?;

    Ok(())
}

async fn cascade_delete(
    ctx: &ReconcileContext,
    deployment: &RunnerDeployment,
    owned: &[Runner],
) -> anyhow::Result<()> {
    if owned.is_empty() {
        runner_deployments::delete(&ctx.pool, deployment.id).await?;
        info!(deployment = %deployment.name, "deployment removed");
        return Ok(());
    }

    for runner in owned {
        if runner.deletion_timestamp.is_none() {
            runners::mark_deleting(&ctx.pool, runner.id).await?;
        }
        ctx.queue.enqueue(Key::Runner {
            namespace: runner.namespace.clone(),
            name: runner.name.clone(),
        });
    }

    // Check back for the empty state.
    ctx.queue.enqueue_after(
        Key::Deployment {
            namespace: deployment.namespace.clone(),
            name: deployment.name.clone(),
        },
        Duration::from_secs(5),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use crate::model::runners::{RuntimeKind, ScopeKind};

    use super::*;

    fn owned_runner(name: &str, phase: RunnerPhase, created_secs_ago: i64) -> Runner {
        Runner {
            id: Uuid::new_v4(),
            namespace: "default".to_string(),
            name: name.to_string(),
            scope_kind: ScopeKind::Organization,
            scope_value: "acme".to_string(),
            labels: vec![],
            ephemeral: true,
            runtime_type: RuntimeKind::Firecracker,
            firecracker: None,
            phase,
            reason: None,
            message: None,
            owner_deployment_id: Some(Uuid::new_v4()),
            vm_node_url: None,
            token_attempts: 0,
            vm_finalizer: true,
            deletion_timestamp: None,
            created_at: Utc::now() - ChronoDuration::seconds(created_secs_ago),
            phase_updated_at: Utc::now(),
        }
    }

    /// Newest-first, matching the model layer's ordering.
    fn fleet(count: usize) -> Vec<Runner> {
        (0..count)
            .map(|i| owned_runner(&format!("d-{i}"), RunnerPhase::Ready, (i as i64) * 60))
            .collect()
    }

    #[test]
    fn converges_to_zero_replicas() {
        let existing = fleet(4);
        let plan = scale_plan(0, &existing, Utc::now());
        assert_eq!(plan.create, 0);
        assert_eq!(plan.delete.len(), 4);
    }

    #[test]
    fn scales_up_by_the_difference() {
        let existing = fleet(2);
        let plan = scale_plan(5, &existing, Utc::now());
        assert_eq!(plan.create, 3);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn scales_down_newest_first() {
        let existing = fleet(5);
        let plan = scale_plan(1, &existing, Utc::now());
        assert_eq!(plan.create, 0);
        // The four newest (lowest created_secs_ago) go; the oldest stays.
        let expected: Vec<Uuid> = existing[..4].iter().map(|r| r.id).collect();
        assert_eq!(plan.delete, expected);
    }

    #[test]
    fn already_deleting_runners_do_not_count() {
        let mut existing = fleet(3);
        existing[0].deletion_timestamp = Some(Utc::now());
        let plan = scale_plan(3, &existing, Utc::now());
        assert_eq!(plan.create, 1);
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn lost_runners_are_replaced_after_cooldown() {
        let mut existing = fleet(3);
        existing[1].phase = RunnerPhase::Failed;
        existing[1].reason = Some(REASON_LOST.to_string());
        existing[1].phase_updated_at = Utc::now() - ChronoDuration::minutes(6);

        let plan = scale_plan(3, &existing, Utc::now());
        assert_eq!(plan.create, 1);
        assert_eq!(plan.delete, vec![existing[1].id]);
    }

    #[test]
    fn lost_runners_within_cooldown_are_left_alone() {
        let mut existing = fleet(3);
        existing[1].phase = RunnerPhase::Failed;
        existing[1].reason = Some(REASON_LOST.to_string());

        let plan = scale_plan(3, &existing, Utc::now());
        assert_eq!(plan, ScalePlan::default());
    }

    #[test]
    fn steady_state_is_a_no_op() {
        let existing = fleet(3);
        let plan = scale_plan(3, &existing, Utc::now());
        assert_eq!(plan, ScalePlan::default());
    }

    #[test]
    fn generated_names_are_valid_and_distinct() {
        let now = Utc::now();
        let a = generate_runner_name("build-fleet", now);
        let b = generate_runner_name("build-fleet", now);

        assert_ne!(a, b);
        assert!(a.starts_with("build-fleet-"));
        assert!(a.len() <= 63);
        crate::model::runners::validate_resource_name(&a).unwrap();
    }
}
