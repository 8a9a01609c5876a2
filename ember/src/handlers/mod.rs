use crate::{App, errors::Error};
use axum::{
    Extension, Json, Router,
    body::Body,
    response::{self, IntoResponse, Response},
    routing::{get, patch},
};
use http::{Request, StatusCode, header::HeaderName};
use serde::Serialize;
use serde_with::DisplayFromStr;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use validator::ValidationErrors;

mod runner;
mod runner_deployment;

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

#[derive(OpenApi)]
#[openapi(
    paths(
        runner_deployment::handler::list,
        runner_deployment::handler::get,
        runner_deployment::handler::create,
        runner_deployment::handler::scale,
        runner_deployment::handler::delete,
        runner::handler::list,
        runner::handler::get,
        runner::handler::delete,
    ),
    components(
        schemas(
            crate::model::runner_deployments::RunnerDeployment,
            crate::model::runner_deployments::NewRunnerDeployment,
            crate::model::runner_deployments::ScaleRequest,
            crate::model::runners::Runner,
            crate::model::runners::RunnerPhase,
            crate::model::runners::ScopeKind,
            crate::model::runners::RuntimeKind,
        )
    ),
    tags(
        (name = "runner-deployments", description = "Runner deployment management endpoints"),
        (name = "runners", description = "Runner management endpoints")
    ),
    info(
        title = "Ember API",
        version = "0.1.0",
        description = "REST API for managing microVM-backed CI runners"
    )
)]
pub struct ApiDoc;

pub fn app(env: App) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");
    Router::new()
        .route("/", get(|| async { "hello" }))
        .merge(runner_deployments())
        .merge(runners())
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
                .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                        let request_id = request
                            .extensions()
                            .get::<RequestId>()
                            .map(|value| value.header_value().to_str().unwrap_or_default())
                            .unwrap_or_default();

                        tracing::info_span!(
                            "HTTP",
                            http.method = %request.method(),
                            http.url = %request.uri(),
                            request_id = %request_id,
                        )
                    }),
                ),
        )
        .layer(Extension(env))
}

fn runner_deployments() -> Router {
    Router::new()
        .route(
            "/runner-deployments",
            get(runner_deployment::handler::list).post(runner_deployment::handler::create),
        )
        .route(
            "/runner-deployments/{namespace}/{name}",
            get(runner_deployment::handler::get).delete(runner_deployment::handler::delete),
        )
        .route(
            "/runner-deployments/{namespace}/{name}/scale",
            patch(runner_deployment::handler::scale),
        )
}

fn runners() -> Router {
    Router::new()
        .route("/runners", get(runner::handler::list))
        .route(
            "/runners/{namespace}/{name}",
            get(runner::handler::get).delete(runner::handler::delete),
        )
}

pub struct ApiResponse<T> {
    data: T,
    code: StatusCode,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T, code: StatusCode) -> Self {
        Self { data, code }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Send + Sync + Serialize,
{
    fn into_response(self) -> Response {
        let mut response = response::Json(self.data).into_response();

        *response.status_mut() = self.code;
        response
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        #[serde_with::serde_as]
        #[serde_with::skip_serializing_none]
        #[derive(serde::Serialize)]
        struct ErrorResponse<'a> {
            // Serialize the `Display` output as the error message
            #[serde_as(as = "DisplayFromStr")]
            message: &'a Error,

            errors: Option<&'a ValidationErrors>,
        }

        let errors = match &self {
            Error::InvalidEntity(errors) => Some(errors),
            _ => None,
        };

        tracing::error!("API error: {:?}", self);
        (
            self.status_code(),
            Json(ErrorResponse {
                message: &self,
                errors,
            }),
        )
            .into_response()
    }
}

impl Error {
    fn status_code(&self) -> StatusCode {
        use Error::*;

        match self {
            Sqlx(_) | InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            InvalidEntity(_) | UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Conflict(_) => StatusCode::CONFLICT,
            NotFound => StatusCode::NOT_FOUND,
        }
    }
}
