//! Firecracker process launch and API-socket driver.
//!
//! The daemon does not embed a VMM; it spawns the firecracker binary with
//! an API socket, redirects the console to an append-only log file, then
//! configures the machine over HTTP/unix-socket and issues InstanceStart.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Per-request deadline on the API socket.
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the API socket to appear after spawn.
const SOCKET_WAIT: Duration = Duration::from_secs(5);
const SOCKET_POLL: Duration = Duration::from_millis(100);

const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

#[derive(Debug, Error)]
pub enum FirecrackerError {
    #[error("failed to spawn firecracker: {0}")]
    Spawn(std::io::Error),

    #[error("API socket {0} did not appear within {1:?}")]
    SocketTimeout(PathBuf, Duration),

    #[error("API request {method} {path} failed: {message}")]
    Api {
        method: &'static str,
        path: String,
        message: String,
    },

    #[error("API request {method} {path} timed out")]
    ApiTimeout { method: &'static str, path: String },
}

/// What the manager needs to boot one VM.
pub struct LaunchSpec<'a> {
    pub vm_id: &'a str,
    pub socket_path: &'a Path,
    pub console_log_path: &'a Path,
    pub kernel_path: &'a Path,
    pub rootfs_path: &'a Path,
    pub cloud_init_iso: &'a Path,
    pub tap_name: &'a str,
    pub guest_mac: &'a str,
    pub vcpus: i64,
    pub memory_mib: i64,
}

pub struct FirecrackerLauncher {
    binary: PathBuf,
}

#[derive(Serialize)]
struct MachineConfigBody {
    vcpu_count: i64,
    mem_size_mib: i64,
    smt: bool,
}

#[derive(Serialize)]
struct BootSourceBody {
    kernel_image_path: String,
    boot_args: String,
}

#[derive(Serialize)]
struct DriveBody {
    drive_id: String,
    path_on_host: String,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Serialize)]
struct NetworkInterfaceBody {
    iface_id: String,
    guest_mac: String,
    host_dev_name: String,
}

#[derive(Serialize)]
struct ActionBody {
    action_type: &'static str,
}

impl FirecrackerLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Spawn the monitor process and wait for its API socket. Returns the
    /// PID; the process is intentionally detached from the child handle so
    /// VMs survive a daemon restart.
    pub async fn spawn(&self, spec: &LaunchSpec<'_>) -> Result<i32, FirecrackerError> {
        if spec.socket_path.exists() {
            let _ = tokio::fs::remove_file(spec.socket_path).await;
        }

        let console = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(spec.console_log_path)
            .map_err(FirecrackerError::Spawn)?;
        let console_err = console.try_clone().map_err(FirecrackerError::Spawn)?;

        let mut child = Command::new(&self.binary)
            .arg("--api-sock")
            .arg(spec.socket_path)
            .arg("--id")
            .arg(spec.vm_id)
            .stdin(std::process::Stdio::null())
            .stdout(console)
            .stderr(console_err)
            .spawn()
            .map_err(FirecrackerError::Spawn)?;

        let pid = child.id().ok_or_else(|| {
            FirecrackerError::Spawn(std::io::Error::other("firecracker exited immediately"))
        })? as i32;

        info!(vm_id = %spec.vm_id, pid = pid, "firecracker process started");

        // Reap the child when it exits; liveness tracking goes by PID.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
        while !spec.socket_path.exists() {
            if tokio::time::Instant::now() >= deadline {
                return Err(FirecrackerError::SocketTimeout(
                    spec.socket_path.to_path_buf(),
                    SOCKET_WAIT,
                ));
            }
            tokio::time::sleep(SOCKET_POLL).await;
        }

        Ok(pid)
    }

    /// Apply the full configuration sequence and start the instance.
    pub async fn configure_and_start(&self, spec: &LaunchSpec<'_>) -> Result<(), FirecrackerError> {
        let client = ApiClient::new(spec.socket_path);

        client
            .put(
                "/machine-config",
                &MachineConfigBody {
                    vcpu_count: spec.vcpus,
                    mem_size_mib: spec.memory_mib,
                    smt: false,
                },
            )
            .await?;

        client
            .put(
                "/boot-source",
                &BootSourceBody {
                    kernel_image_path: spec.kernel_path.display().to_string(),
                    boot_args: BOOT_ARGS.to_string(),
                },
            )
            .await?;

        client
            .put(
                "/drives/rootfs",
                &DriveBody {
                    drive_id: "rootfs".to_string(),
                    path_on_host: spec.rootfs_path.display().to_string(),
                    is_root_device: true,
                    is_read_only: false,
                },
            )
            .await?;

        client
            .put(
                "/drives/cloudinit",
                &DriveBody {
                    drive_id: "cloudinit".to_string(),
                    path_on_host: spec.cloud_init_iso.display().to_string(),
                    is_root_device: false,
                    is_read_only: true,
                },
            )
            .await?;

        client
            .put(
                "/network-interfaces/eth0",
                &NetworkInterfaceBody {
                    iface_id: "eth0".to_string(),
                    guest_mac: spec.guest_mac.to_string(),
                    host_dev_name: spec.tap_name.to_string(),
                },
            )
            .await?;

        client
            .put(
                "/actions",
                &ActionBody {
                    action_type: "InstanceStart",
                },
            )
            .await?;

        info!(vm_id = %spec.vm_id, "instance started");
        Ok(())
    }
}

/// Minimal HTTP client over the firecracker API socket.
pub struct ApiClient {
    socket_path: PathBuf,
}

impl ApiClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<(), FirecrackerError> {
        let payload = serde_json::to_string(body).map_err(|e| FirecrackerError::Api {
            method: "PUT",
            path: path.to_string(),
            message: e.to_string(),
        })?;
        debug!(path = %path, "firecracker API request");

        match tokio::time::timeout(API_TIMEOUT, self.send("PUT", path, payload)).await {
            Ok(result) => result,
            Err(_) => Err(FirecrackerError::ApiTimeout {
                method: "PUT",
                path: path.to_string(),
            }),
        }
    }

    async fn send(
        &self,
        method: &'static str,
        path: &str,
        payload: String,
    ) -> Result<(), FirecrackerError> {
        let api_error = |message: String| FirecrackerError::Api {
            method,
            path: path.to_string(),
            message,
        };

        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| api_error(e.to_string()))?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| api_error(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!("firecracker API connection error: {}", e);
            }
        });

        let request = Request::builder()
            .method(method)
            .uri(format!("http://localhost{path}"))
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| api_error(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| api_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|b| String::from_utf8_lossy(&b.to_bytes()).to_string())
                .unwrap_or_default();
            return Err(api_error(format!("HTTP {status}: {body}")));
        }

        Ok(())
    }
}
