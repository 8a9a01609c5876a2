use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, types::Json};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use super::runners::{FirecrackerSpec, RuntimeKind, ScopeKind, validate_resource_name};

/// The runner shape stamped out for every replica.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunnerTemplate {
    pub scope_kind: ScopeKind,
    pub scope_value: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_true")]
    pub ephemeral: bool,
    pub runtime_type: RuntimeKind,
    pub firecracker: Option<FirecrackerSpec>,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct RunnerDeployment {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    pub replicas: i32,
    #[schema(value_type = Object)]
    pub template: RunnerTemplate,
    pub observed_replicas: i32,
    pub ready_replicas: i32,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub struct RunnerDeploymentRow {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    pub replicas: i32,
    pub template: Json<RunnerTemplate>,
    pub observed_replicas: i32,
    pub ready_replicas: i32,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<RunnerDeploymentRow> for RunnerDeployment {
    fn from(row: RunnerDeploymentRow) -> Self {
        RunnerDeployment {
            id: row.id,
            namespace: row.namespace,
            name: row.name,
            replicas: row.replicas,
            template: row.template.0,
            observed_replicas: row.observed_replicas,
            ready_replicas: row.ready_replicas,
            deletion_timestamp: row.deletion_timestamp,
            created_at: row.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Validate, ToSchema)]
pub struct NewRunnerDeployment {
    #[validate(length(min = 1, max = 63), custom = "validate_resource_name")]
    pub namespace: String,
    #[validate(length(min = 1, max = 63), custom = "validate_resource_name")]
    pub name: String,
    #[validate(range(min = 0))]
    pub replicas: i32,
    #[schema(value_type = Object)]
    pub template: RunnerTemplate,
}

#[derive(Serialize, Deserialize, Debug, Clone, Validate, ToSchema)]
pub struct ScaleRequest {
    #[validate(range(min = 0))]
    pub replicas: i32,
}

const DEPLOYMENT_COLUMNS: &str = r#"
SELECT id, namespace, name, replicas, template, observed_replicas,
       ready_replicas, deletion_timestamp, created_at
FROM runner_deployments
"#;

pub async fn list(pool: &PgPool) -> Result<Vec<RunnerDeployment>, sqlx::Error> {
    let rows: Vec<RunnerDeploymentRow> =
        sqlx::query_as(DEPLOYMENT_COLUMNS).fetch_all(pool).await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn get(
    pool: &PgPool,
    namespace: &str,
    name: &str,
) -> Result<Option<RunnerDeployment>, sqlx::Error> {
    let row: Option<RunnerDeploymentRow> =
        sqlx::query_as(&format!("{DEPLOYMENT_COLUMNS} WHERE namespace = $1 AND name = $2"))
            .bind(namespace)
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(Into::into))
}

pub async fn list_keys(pool: &PgPool) -> Result<Vec<(String, String)>, sqlx::Error> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT namespace, name FROM runner_deployments")
            .fetch_all(pool)
            .await?;
    Ok(rows)
}

pub async fn create(
    pool: &PgPool,
    deployment: &NewRunnerDeployment,
) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
INSERT INTO runner_deployments (id, namespace, name, replicas, template)
VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id)
    .bind(&deployment.namespace)
    .bind(&deployment.name)
    .bind(deployment.replicas)
    .bind(Json(&deployment.template))
    .execute(pool)
    .await?;

    Ok(id)
}

pub async fn update_replicas(pool: &PgPool, id: Uuid, replicas: i32) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE runner_deployments SET replicas = $1 WHERE id = $2")
        .bind(replicas)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_status(
    pool: &PgPool,
    id: Uuid,
    observed_replicas: i32,
    ready_replicas: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE runner_deployments SET observed_replicas = $1, ready_replicas = $2 WHERE id = $3",
    )
    .bind(observed_replicas)
    .bind(ready_replicas)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_deleting(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE runner_deployments SET deletion_timestamp = now() WHERE id = $1 AND deletion_timestamp IS NULL",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Final removal; only valid once no owned runners remain.
pub async fn delete(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM runner_deployments WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
