use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Type, types::Json};
use strum_macros::{Display, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use common::api::NetworkMode;

/// Reconciliation phase of a runner. Transitions are monotonic except
/// `Failed -> Creating` on retry after cooldown.
#[derive(
    Deserialize, Serialize, Debug, Clone, Copy, Eq, PartialEq, Type, EnumString, Display, ToSchema,
)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "runner_phase")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunnerPhase {
    Pending,
    Creating,
    Registering,
    Ready,
    Terminating,
    Failed,
}

/// Which level of the hosting service the runner registers against.
#[derive(
    Deserialize, Serialize, Debug, Clone, Copy, Eq, PartialEq, Type, EnumString, Display, ToSchema,
)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "scope_kind")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScopeKind {
    Enterprise,
    Organization,
    Repository,
}

#[derive(
    Deserialize, Serialize, Debug, Clone, Copy, Eq, PartialEq, Type, EnumString, Display, ToSchema,
)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "runtime_kind")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RuntimeKind {
    Container,
    Firecracker,
}

/// Guest networking shape inside the firecracker runtime spec.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub network_mode: NetworkMode,
    pub bridge_name: Option<String>,
    pub parent_interface: Option<String>,
    pub subnet_cidr: Option<String>,
    pub gateway: Option<String>,
    pub dhcp_enabled: Option<bool>,
}

impl From<&NetworkConfig> for common::api::NetworkRequest {
    fn from(config: &NetworkConfig) -> Self {
        common::api::NetworkRequest {
            mode: config.network_mode,
            bridge_name: config.bridge_name.clone(),
            parent_interface: config.parent_interface.clone(),
            subnet_cidr: config.subnet_cidr.clone(),
            gateway: config.gateway.clone(),
            dhcp_enabled: config.dhcp_enabled,
        }
    }
}

/// The firecracker variant of the runtime tag.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FirecrackerSpec {
    pub memory_mib: i64,
    pub vcpus: i64,
    pub kernel_image_path: Option<String>,
    pub rootfs_image_path: Option<String>,
    pub snapshot_name: Option<String>,
    #[serde(default)]
    pub network_config: NetworkConfig,
    #[serde(default = "default_true")]
    pub ephemeral_mode: bool,
    pub arc_controller_url: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct Runner {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    pub scope_kind: ScopeKind,
    pub scope_value: String,
    pub labels: Vec<String>,
    pub ephemeral: bool,
    pub runtime_type: RuntimeKind,
    #[schema(value_type = Object)]
    pub firecracker: Option<FirecrackerSpec>,
    pub phase: RunnerPhase,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub owner_deployment_id: Option<Uuid>,
    /// Daemon endpoint that served the create; sticky for status and delete.
    pub vm_node_url: Option<String>,
    pub token_attempts: i32,
    pub vm_finalizer: bool,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub phase_updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub struct RunnerRow {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    pub scope_kind: ScopeKind,
    pub scope_value: String,
    pub labels: Vec<String>,
    pub ephemeral: bool,
    pub runtime_type: RuntimeKind,
    pub firecracker: Option<Json<FirecrackerSpec>>,
    pub phase: RunnerPhase,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub owner_deployment_id: Option<Uuid>,
    pub vm_node_url: Option<String>,
    pub token_attempts: i32,
    pub vm_finalizer: bool,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub phase_updated_at: DateTime<Utc>,
}

impl From<RunnerRow> for Runner {
    fn from(row: RunnerRow) -> Self {
        Runner {
            id: row.id,
            namespace: row.namespace,
            name: row.name,
            scope_kind: row.scope_kind,
            scope_value: row.scope_value,
            labels: row.labels,
            ephemeral: row.ephemeral,
            runtime_type: row.runtime_type,
            firecracker: row.firecracker.map(|f| f.0),
            phase: row.phase,
            reason: row.reason,
            message: row.message,
            owner_deployment_id: row.owner_deployment_id,
            vm_node_url: row.vm_node_url,
            token_attempts: row.token_attempts,
            vm_finalizer: row.vm_finalizer,
            deletion_timestamp: row.deletion_timestamp,
            created_at: row.created_at,
            phase_updated_at: row.phase_updated_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Validate, ToSchema)]
#[validate(schema(function = "validate_new_runner"))]
pub struct NewRunner {
    #[validate(length(min = 1, max = 63), custom = "validate_resource_name")]
    pub namespace: String,
    #[validate(length(min = 1, max = 63), custom = "validate_resource_name")]
    pub name: String,
    pub scope_kind: ScopeKind,
    #[validate(length(min = 1))]
    pub scope_value: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_true")]
    pub ephemeral: bool,
    pub runtime_type: RuntimeKind,
    #[schema(value_type = Object)]
    pub firecracker: Option<FirecrackerSpec>,
    pub owner_deployment_id: Option<Uuid>,
}

pub fn validate_resource_name(name: &str) -> Result<(), ValidationError> {
    let valid = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_resource_name"))
    }
}

fn validate_new_runner(runner: &NewRunner) -> Result<(), ValidationError> {
    match runner.runtime_type {
        RuntimeKind::Firecracker if runner.firecracker.is_none() => {
            Err(ValidationError::new("firecracker_spec_required"))
        }
        RuntimeKind::Container if runner.firecracker.is_some() => {
            Err(ValidationError::new("firecracker_spec_forbidden"))
        }
        _ => Ok(()),
    }
}

const RUNNER_COLUMNS: &str = r#"
SELECT id, namespace, name, scope_kind, scope_value, labels, ephemeral,
       runtime_type, firecracker, phase, reason, message,
       owner_deployment_id, vm_node_url, token_attempts, vm_finalizer,
       deletion_timestamp, created_at, phase_updated_at
FROM runners
"#;

pub async fn list(pool: &PgPool) -> Result<Vec<Runner>, sqlx::Error> {
    let rows: Vec<RunnerRow> = sqlx::query_as(RUNNER_COLUMNS).fetch_all(pool).await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn get(pool: &PgPool, namespace: &str, name: &str) -> Result<Option<Runner>, sqlx::Error> {
    let row: Option<RunnerRow> =
        sqlx::query_as(&format!("{RUNNER_COLUMNS} WHERE namespace = $1 AND name = $2"))
            .bind(namespace)
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(Into::into))
}

pub async fn get_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Runner>, sqlx::Error> {
    let row: Option<RunnerRow> = sqlx::query_as(&format!("{RUNNER_COLUMNS} WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Into::into))
}

/// Owned runners, newest first (the scale-down victim order).
pub async fn list_by_deployment(
    pool: &PgPool,
    deployment_id: Uuid,
) -> Result<Vec<Runner>, sqlx::Error> {
    let rows: Vec<RunnerRow> = sqlx::query_as(&format!(
        "{RUNNER_COLUMNS} WHERE owner_deployment_id = $1 ORDER BY created_at DESC"
    ))
    .bind(deployment_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// (namespace, name) of every runner; used by the periodic resync.
pub async fn list_keys(pool: &PgPool) -> Result<Vec<(String, String)>, sqlx::Error> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT namespace, name FROM runners")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn create(pool: &PgPool, runner: &NewRunner) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    let firecracker = runner.firecracker.as_ref().map(Json);

    sqlx::query(
        r#"
INSERT INTO runners (
    id, namespace, name, scope_kind, scope_value, labels, ephemeral,
    runtime_type, firecracker, owner_deployment_id
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(id)
    .bind(&runner.namespace)
    .bind(&runner.name)
    .bind(runner.scope_kind)
    .bind(&runner.scope_value)
    .bind(&runner.labels)
    .bind(runner.ephemeral)
    .bind(runner.runtime_type)
    .bind(firecracker)
    .bind(runner.owner_deployment_id)
    .execute(pool)
    .await?;

    Ok(id)
}

pub async fn update_phase(
    pool: &PgPool,
    id: Uuid,
    phase: RunnerPhase,
    reason: Option<&str>,
    message: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
UPDATE runners
SET phase = $1, reason = $2, message = $3, phase_updated_at = now()
WHERE id = $4
        "#,
    )
    .bind(phase)
    .bind(reason)
    .bind(message)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn set_vm_node_url(pool: &PgPool, id: Uuid, url: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE runners SET vm_node_url = $1 WHERE id = $2")
        .bind(url)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_token_attempts(pool: &PgPool, id: Uuid, attempts: i32) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE runners SET token_attempts = $1 WHERE id = $2")
        .bind(attempts)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Request deletion. The reconciler tears the VM down and removes the row
/// once the finalizer clears; idempotent for already-deleting runners.
pub async fn mark_deleting(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE runners SET deletion_timestamp = now() WHERE id = $1 AND deletion_timestamp IS NULL",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Final removal after the VM is proved absent.
pub async fn clear_finalizer_and_delete(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM runners WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn firecracker_spec() -> FirecrackerSpec {
        FirecrackerSpec {
            memory_mib: 2048,
            vcpus: 2,
            kernel_image_path: None,
            rootfs_image_path: None,
            snapshot_name: None,
            network_config: NetworkConfig::default(),
            ephemeral_mode: true,
            arc_controller_url: None,
        }
    }

    fn new_runner() -> NewRunner {
        NewRunner {
            namespace: "default".to_string(),
            name: "acme-1700000000-ab12c".to_string(),
            scope_kind: ScopeKind::Organization,
            scope_value: "acme".to_string(),
            labels: vec!["self-hosted".to_string()],
            ephemeral: true,
            runtime_type: RuntimeKind::Firecracker,
            firecracker: Some(firecracker_spec()),
            owner_deployment_id: None,
        }
    }

    #[test]
    fn valid_runner_passes_validation() {
        new_runner().validate().unwrap();
    }

    #[test]
    fn firecracker_runtime_requires_a_spec() {
        let mut runner = new_runner();
        runner.firecracker = None;
        assert!(runner.validate().is_err());
    }

    #[test]
    fn container_runtime_rejects_a_firecracker_spec() {
        let mut runner = new_runner();
        runner.runtime_type = RuntimeKind::Container;
        assert!(runner.validate().is_err());
    }

    #[test]
    fn resource_names_reject_uppercase_and_edge_dashes() {
        assert!(validate_resource_name("ok-name-1").is_ok());
        assert!(validate_resource_name("Bad").is_err());
        assert!(validate_resource_name("-leading").is_err());
        assert!(validate_resource_name("trailing-").is_err());
        assert!(validate_resource_name("under_score").is_err());
    }

    #[test]
    fn firecracker_spec_defaults_ephemeral_mode() {
        let spec: FirecrackerSpec = serde_json::from_str(
            r#"{"memory_mib": 1024, "vcpus": 1}"#,
        )
        .unwrap();
        assert!(spec.ephemeral_mode);
        assert_eq!(spec.network_config.network_mode, NetworkMode::Bridge);
    }
}
