//! Daemon HTTP surface.
//!
//! All bodies are JSON; every non-2xx response carries `{"error": ...}` so
//! callers can surface the daemon's message verbatim.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::Path,
    response::{IntoResponse, Response},
    routing::get,
};
use http::StatusCode;
use tracing::{error, info, instrument};

use common::api::{
    CreateVmRequest, CreateVmResponse, DeleteVmResponse, ErrorBody, HealthResponse,
    ListVmsResponse, VmRecord,
};

use crate::vm::{VmManager, VmManagerError};

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

pub struct Error(VmManagerError);

impl From<VmManagerError> for Error {
    fn from(e: VmManagerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            VmManagerError::AdmissionDenied(_) | VmManagerError::AlreadyExists(_) => {
                StatusCode::CONFLICT
            }
            VmManagerError::NotFound(_) => StatusCode::NOT_FOUND,
            VmManagerError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            VmManagerError::HostFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        error!("API error: {}", self.0);
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn app(manager: Arc<VmManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/vms", get(list).post(create))
        .route("/api/vms/{name}", get(get_vm).delete(delete_vm))
        .layer(Extension(manager))
}

#[instrument(skip(manager))]
async fn health(
    Extension(manager): Extension<Arc<VmManager>>,
) -> Result<Json<HealthResponse>> {
    manager.self_check().await?;
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
    }))
}

#[instrument(skip(manager))]
async fn list(Extension(manager): Extension<Arc<VmManager>>) -> Json<ListVmsResponse> {
    let vms: BTreeMap<String, VmRecord> = manager.list_vms().await.into_iter().collect();
    Json(ListVmsResponse { vms })
}

#[instrument(skip(manager))]
async fn get_vm(
    Extension(manager): Extension<Arc<VmManager>>,
    Path(name): Path<String>,
) -> Result<Json<VmRecord>> {
    match manager.get_vm(&name).await {
        Some(record) => Ok(Json(record)),
        None => Err(VmManagerError::NotFound(name).into()),
    }
}

#[instrument(skip(manager, request), fields(name = %request.name))]
async fn create(
    Extension(manager): Extension<Arc<VmManager>>,
    Json(request): Json<CreateVmRequest>,
) -> Result<(StatusCode, Json<CreateVmResponse>)> {
    info!("create VM request for {}", request.name);
    let record = manager.create_vm(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateVmResponse {
            vm_name: record.name,
            status: "creating".to_string(),
        }),
    ))
}

#[instrument(skip(manager))]
async fn delete_vm(
    Extension(manager): Extension<Arc<VmManager>>,
    Path(name): Path<String>,
) -> Result<Json<DeleteVmResponse>> {
    manager.delete_vm(&name).await?;
    Ok(Json(DeleteVmResponse { success: true }))
}
