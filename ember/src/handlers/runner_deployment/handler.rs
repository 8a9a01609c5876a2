use axum::{Extension, Json, extract::Path};
use http::StatusCode;
use tracing::instrument;
use validator::Validate;

use crate::{
    App,
    errors::Error,
    model::runner_deployments::{self, NewRunnerDeployment, RunnerDeployment, ScaleRequest},
    reconcile::Key,
};

use super::super::{ApiResponse, Result};

#[utoipa::path(
    get,
    path = "/runner-deployments",
    responses(
        (status = 200, description = "List all runner deployments", body = Vec<RunnerDeployment>),
        (status = 500, description = "Internal server error")
    ),
    tag = "runner-deployments"
)]
#[instrument(skip(env))]
pub async fn list(Extension(env): Extension<App>) -> Result<ApiResponse<Vec<RunnerDeployment>>> {
    let deployments = runner_deployments::list(env.pool()).await?;
    Ok(ApiResponse::new(deployments, StatusCode::OK))
}

#[utoipa::path(
    get,
    path = "/runner-deployments/{namespace}/{name}",
    params(
        ("namespace" = String, Path, description = "Deployment namespace"),
        ("name" = String, Path, description = "Deployment name")
    ),
    responses(
        (status = 200, description = "Deployment details", body = RunnerDeployment),
        (status = 404, description = "Deployment not found")
    ),
    tag = "runner-deployments"
)]
#[instrument(skip(env))]
pub async fn get(
    Extension(env): Extension<App>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<ApiResponse<RunnerDeployment>> {
    let deployment = runner_deployments::get(env.pool(), &namespace, &name)
        .await?
        .ok_or(Error::NotFound)?;
    Ok(ApiResponse::new(deployment, StatusCode::OK))
}

#[utoipa::path(
    post,
    path = "/runner-deployments",
    request_body = NewRunnerDeployment,
    responses(
        (status = 201, description = "Deployment created", body = RunnerDeployment),
        (status = 409, description = "Deployment already exists"),
        (status = 422, description = "Validation error")
    ),
    tag = "runner-deployments"
)]
#[instrument(skip(env, deployment), fields(name = %deployment.name))]
pub async fn create(
    Extension(env): Extension<App>,
    Json(deployment): Json<NewRunnerDeployment>,
) -> Result<ApiResponse<RunnerDeployment>> {
    deployment.validate()?;

    runner_deployments::create(env.pool(), &deployment).await?;
    env.queue().enqueue(Key::Deployment {
        namespace: deployment.namespace.clone(),
        name: deployment.name.clone(),
    });

    let created = runner_deployments::get(env.pool(), &deployment.namespace, &deployment.name)
        .await?
        .ok_or(Error::InternalServerError)?;
    Ok(ApiResponse::new(created, StatusCode::CREATED))
}

#[utoipa::path(
    patch,
    path = "/runner-deployments/{namespace}/{name}/scale",
    request_body = ScaleRequest,
    params(
        ("namespace" = String, Path, description = "Deployment namespace"),
        ("name" = String, Path, description = "Deployment name")
    ),
    responses(
        (status = 200, description = "Replica count updated", body = RunnerDeployment),
        (status = 404, description = "Deployment not found")
    ),
    tag = "runner-deployments"
)]
#[instrument(skip(env))]
pub async fn scale(
    Extension(env): Extension<App>,
    Path((namespace, name)): Path<(String, String)>,
    Json(request): Json<ScaleRequest>,
) -> Result<ApiResponse<RunnerDeployment>> {
    request.validate()?;

    let deployment = runner_deployments::get(env.pool(), &namespace, &name)
        .await?
        .ok_or(Error::NotFound)?;
    runner_deployments::update_replicas(env.pool(), deployment.id, request.replicas).await?;
    env.queue().enqueue(Key::Deployment {
        namespace: namespace.clone(),
        name: name.clone(),
    });

    let updated = runner_deployments::get(env.pool(), &namespace, &name)
        .await?
        .ok_or(Error::NotFound)?;
    Ok(ApiResponse::new(updated, StatusCode::OK))
}

#[utoipa::path(
    delete,
    path = "/runner-deployments/{namespace}/{name}",
    params(
        ("namespace" = String, Path, description = "Deployment namespace"),
        ("name" = String, Path, description = "Deployment name")
    ),
    responses(
        (status = 202, description = "Deletion requested"),
        (status = 404, description = "Deployment not found")
    ),
    tag = "runner-deployments"
)]
#[instrument(skip(env))]
pub async fn delete(
    Extension(env): Extension<App>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<ApiResponse<()>> {
    let deployment = runner_deployments::get(env.pool(), &namespace, &name)
        .await?
        .ok_or(Error::NotFound)?;

    runner_deployments::mark_deleting(env.pool(), deployment.id).await?;
    env.queue().enqueue(Key::Deployment { namespace, name });

    Ok(ApiResponse::new((), StatusCode::ACCEPTED))
}
