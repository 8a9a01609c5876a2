//! HTTP client for the node daemons.
//!
//! Calls iterate a candidate URL list: a sticky URL (when the caller knows
//! which node owns the VM) is the only candidate, otherwise the configured
//! endpoints are tried in order. Each attempt rebuilds the request body and
//! runs under its own timeout. The first HTTP response — any status — ends
//! the iteration; non-2xx statuses become typed errors and are never
//! retried. Only transport-level failures move to the next candidate.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use common::api::{
    CreateVmRequest, CreateVmResponse, DeleteVmResponse, ErrorBody, ListVmsResponse, VmRecord,
};

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum VmClientError {
    /// The daemon refused the request at admission; terminal for this
    /// attempt.
    #[error("admission denied: {message}")]
    AdmissionDenied { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("invalid request: {message}")]
    Invalid { message: String },

    /// Any other daemon-reported failure, preserved verbatim.
    #[error("daemon error (HTTP {status}): {message}")]
    Daemon { status: u16, message: String },

    /// Every candidate failed at the transport level.
    #[error("all {attempts} daemon endpoint(s) unreachable, last error: {last}")]
    Transport { attempts: usize, last: String },
}

impl VmClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VmClientError::NotFound { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, VmClientError::Transport { .. })
    }
}

pub struct VmClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
    attempt_timeout: Duration,
}

impl VmClient {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self::with_timeout(endpoints, DEFAULT_ATTEMPT_TIMEOUT)
    }

    pub fn with_timeout(endpoints: Vec<String>, attempt_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoints,
            attempt_timeout,
        }
    }

    /// Create a VM. Returns the response plus the endpoint that served it,
    /// which callers persist as the sticky URL.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_vm(
        &self,
        request: &CreateVmRequest,
    ) -> Result<(CreateVmResponse, String), VmClientError> {
        self.request(Method::POST, "/api/vms", Some(request), None)
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_vm(
        &self,
        name: &str,
        sticky: Option<&str>,
    ) -> Result<VmRecord, VmClientError> {
        let (record, _) = self
            .request::<VmRecord, ()>(Method::GET, &format!("/api/vms/{name}"), None, sticky)
            .await?;
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn delete_vm(
        &self,
        name: &str,
        sticky: Option<&str>,
    ) -> Result<DeleteVmResponse, VmClientError> {
        let (response, _) = self
            .request::<DeleteVmResponse, ()>(
                Method::DELETE,
                &format!("/api/vms/{name}"),
                None,
                sticky,
            )
            .await?;
        Ok(response)
    }

    #[instrument(skip(self))]
    pub async fn list_vms(&self, endpoint: &str) -> Result<ListVmsResponse, VmClientError> {
        let (response, _) = self
            .request::<ListVmsResponse, ()>(Method::GET, "/api/vms", None, Some(endpoint))
            .await?;
        Ok(response)
    }

    async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        sticky: Option<&str>,
    ) -> Result<(T, String), VmClientError>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let sticky_holder;
        let candidates: &[String] = match sticky {
            Some(url) => {
                sticky_holder = [url.to_string()];
                &sticky_holder
            }
            None => &self.endpoints,
        };

        let mut last_error = String::from("no endpoints configured");

        for endpoint in candidates {
            let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
            // Bodies are consumed once; rebuild per candidate.
            let mut builder = self
                .http
                .request(method.clone(), &url)
                .timeout(self.attempt_timeout);
            if let Some(body) = body {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(response) => {
                    debug!(endpoint = %endpoint, status = %response.status(), "daemon responded");
                    return decode_response(response)
                        .await
                        .map(|value| (value, endpoint.clone()));
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, "daemon unreachable: {}", e);
                    last_error = e.to_string();
                }
            }
        }

        Err(VmClientError::Transport {
            attempts: candidates.len(),
            last: last_error,
        })
    }
}

/// A response — any status — ends the failover loop; map it here.
async fn decode_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, VmClientError> {
    let status = response.status();

    if status.is_success() {
        return response.json::<T>().await.map_err(|e| VmClientError::Daemon {
            status: status.as_u16(),
            message: format!("undecodable success body: {e}"),
        });
    }

    // Non-2xx bodies should carry `{error}` but callers must tolerate
    // anything.
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => format!("HTTP {status}"),
    };

    Err(match status {
        StatusCode::CONFLICT => VmClientError::AdmissionDenied { message },
        StatusCode::NOT_FOUND => VmClientError::NotFound { message },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            VmClientError::Invalid { message }
        }
        other => VmClientError::Daemon {
            status: other.as_u16(),
            message,
        },
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{Json, Router, routing::post};
    use http::StatusCode;

    use common::api::ErrorBody;

    use super::*;

    fn sample_request() -> CreateVmRequest {
        CreateVmRequest {
            name: "acme-1700000000-ab12c".to_string(),
            memory: 2048,
            cpus: 2,
            github_url: "https://github.com/acme".to_string(),
            github_token: "TOKEN".to_string(),
            snapshot: None,
            labels: None,
            kernel_image: None,
            rootfs_image: None,
            network: None,
            cloud_init: None,
        }
    }

    async fn spawn_daemon(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });
        format!("http://{addr}")
    }

    /// An address nothing listens on: bind, read the port, drop the
    /// listener.
    async fn dead_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    fn accepting_router(hits: Arc<AtomicUsize>) -> Router {
        Router::new().route(
            "/api/vms",
            post(move |Json(req): Json<CreateVmRequest>| {
                hits.fetch_add(1, Ordering::SeqCst);
                async move {
                    (
                        StatusCode::CREATED,
                        Json(CreateVmResponse {
                            vm_name: req.name,
                            status: "creating".to_string(),
                        }),
                    )
                }
            }),
        )
    }

    #[tokio::test]
    async fn failover_reaches_the_healthy_endpoint() {
        let hits = Arc::new(AtomicUsize::new(0));
        let dead = dead_endpoint().await;
        let live = spawn_daemon(accepting_router(hits.clone())).await;

        let client = VmClient::with_timeout(vec![dead, live.clone()], Duration::from_secs(2));
        let (response, served_by) = client.create_vm(&sample_request()).await.unwrap();

        assert_eq!(response.status, "creating");
        assert_eq!(served_by, live);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn admission_denial_is_not_retried_on_other_endpoints() {
        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));

        let denying = {
            let hits = first_hits.clone();
            Router::new().route(
                "/api/vms",
                post(move |Json(_): Json<CreateVmRequest>| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    async move {
                        (
                            StatusCode::CONFLICT,
                            Json(ErrorBody {
                                error: "maximum concurrent VMs reached (2/2)".to_string(),
                            }),
                        )
                    }
                }),
            )
        };

        let first = spawn_daemon(denying).await;
        let second = spawn_daemon(accepting_router(second_hits.clone())).await;

        let client = VmClient::with_timeout(vec![first, second], Duration::from_secs(2));
        let err = client.create_vm(&sample_request()).await.unwrap_err();

        match err {
            VmClientError::AdmissionDenied { message } => {
                assert_eq!(message, "maximum concurrent VMs reached (2/2)");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sticky_url_is_the_only_candidate() {
        let hits = Arc::new(AtomicUsize::new(0));
        let configured = spawn_daemon(accepting_router(hits.clone())).await;
        let sticky = dead_endpoint().await;

        let client = VmClient::with_timeout(vec![configured], Duration::from_secs(2));
        let err = client.get_vm("some-vm", Some(&sticky)).await.unwrap_err();

        assert!(err.is_transport(), "expected transport error, got {err:?}");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_endpoints_down_aggregates_into_transport_error() {
        let client = VmClient::with_timeout(
            vec![dead_endpoint().await, dead_endpoint().await],
            Duration::from_secs(2),
        );
        let err = client.create_vm(&sample_request()).await.unwrap_err();

        match err {
            VmClientError::Transport { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
