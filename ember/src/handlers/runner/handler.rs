use axum::{Extension, extract::Path};
use http::StatusCode;
use tracing::instrument;

use crate::{
    App,
    errors::Error,
    model::runners::{self, Runner},
    reconcile::Key,
};

use super::super::{ApiResponse, Result};

#[utoipa::path(
    get,
    path = "/runners",
    responses(
        (status = 200, description = "List all runners", body = Vec<Runner>),
        (status = 500, description = "Internal server error")
    ),
    tag = "runners"
)]
#[instrument(skip(env))]
pub async fn list(Extension(env): Extension<App>) -> Result<ApiResponse<Vec<Runner>>> {
    let runners = runners::list(env.pool()).await?;
    Ok(ApiResponse::new(runners, StatusCode::OK))
}

#[utoipa::path(
    get,
    path = "/runners/{namespace}/{name}",
    params(
        ("namespace" = String, Path, description = "Runner namespace"),
        ("name" = String, Path, description = "Runner name")
    ),
    responses(
        (status = 200, description = "Runner details", body = Runner),
        (status = 404, description = "Runner not found")
    ),
    tag = "runners"
)]
#[instrument(skip(env))]
pub async fn get(
    Extension(env): Extension<App>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<ApiResponse<Runner>> {
    let runner = runners::get(env.pool(), &namespace, &name)
        .await?
        .ok_or(Error::NotFound)?;
    Ok(ApiResponse::new(runner, StatusCode::OK))
}

#[utoipa::path(
    delete,
    path = "/runners/{namespace}/{name}",
    params(
        ("namespace" = String, Path, description = "Runner namespace"),
        ("name" = String, Path, description = "Runner name")
    ),
    responses(
        (status = 202, description = "Deletion requested"),
        (status = 404, description = "Runner not found")
    ),
    tag = "runners"
)]
#[instrument(skip(env))]
pub async fn delete(
    Extension(env): Extension<App>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<ApiResponse<()>> {
    let runner = runners::get(env.pool(), &namespace, &name)
        .await?
        .ok_or(Error::NotFound)?;

    // The finalizer keeps the row until the reconciler proves the VM gone.
    runners::mark_deleting(env.pool(), runner.id).await?;
    env.queue().enqueue(Key::Runner { namespace, name });

    Ok(ApiResponse::new((), StatusCode::ACCEPTED))
}
