//! On-disk instance state.
//!
//! Layout under the working directory:
//!
//! ```text
//! <workdir>/instances/<vm_id>/
//!     info.json           VmRecord projection
//!     rootfs.ext4         sparse copy of the source image
//!     vmlinux             symlink to the kernel
//!     ssh_key, ssh_key.pub
//!     cloud-init/{user-data, meta-data, network-config}
//!     cloud-init.iso
//!     firecracker.socket
//!     console.log
//! ```
//!
//! The rootfs is a sparse copy and the kernel a symlink; both savings keep
//! the disk floor honest under many concurrent instances.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use common::api::VmRecord;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("source image {0} does not exist")]
    MissingImage(PathBuf),

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("failed to read VM record {path}: {message}")]
    Record { path: String, message: String },

    #[error("failed to stat working mount: {0}")]
    Statvfs(nix::errno::Errno),
}

/// Where the rootfs for a VM comes from.
#[derive(Debug, Clone)]
pub enum RootfsSource {
    Default,
    Image(PathBuf),
    Snapshot(String),
}

impl RootfsSource {
    pub fn describe(&self) -> String {
        match self {
            RootfsSource::Default => "default".to_string(),
            RootfsSource::Image(path) => format!("image:{}", path.display()),
            RootfsSource::Snapshot(name) => format!("snapshot:{name}"),
        }
    }
}

/// Paths of one instance directory.
#[derive(Debug, Clone)]
pub struct InstancePaths {
    pub dir: PathBuf,
    pub rootfs: PathBuf,
    pub kernel: PathBuf,
    pub cloud_init_dir: PathBuf,
    pub cloud_init_iso: PathBuf,
    pub socket: PathBuf,
    pub console_log: PathBuf,
    pub info: PathBuf,
    pub ssh_key: PathBuf,
}

pub struct InstanceStore {
    work_dir: PathBuf,
}

impl InstanceStore {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.work_dir.join("instances")
    }

    pub fn paths(&self, vm_id: &str) -> InstancePaths {
        let dir = self.instances_dir().join(vm_id);
        InstancePaths {
            rootfs: dir.join("rootfs.ext4"),
            kernel: dir.join("vmlinux"),
            cloud_init_dir: dir.join("cloud-init"),
            cloud_init_iso: dir.join("cloud-init.iso"),
            socket: dir.join("firecracker.socket"),
            console_log: dir.join("console.log"),
            info: dir.join("info.json"),
            ssh_key: dir.join("ssh_key"),
            dir,
        }
    }

    /// Create the instance directory and populate rootfs, kernel, and ssh
    /// keypair. Idempotent for an already-prepared directory.
    pub async fn prepare(
        &self,
        vm_id: &str,
        rootfs_source: &Path,
        kernel_source: &Path,
    ) -> Result<InstancePaths, StorageError> {
        let paths = self.paths(vm_id);

        tokio::fs::create_dir_all(&paths.cloud_init_dir)
            .await
            .map_err(|source| io_err(&paths.cloud_init_dir, source))?;

        if !rootfs_source.exists() {
            return Err(StorageError::MissingImage(rootfs_source.to_path_buf()));
        }
        if !kernel_source.exists() {
            return Err(StorageError::MissingImage(kernel_source.to_path_buf()));
        }

        if !paths.rootfs.exists() {
            sparse_copy(rootfs_source, &paths.rootfs).await?;
            info!(
                vm_id = %vm_id,
                source = %rootfs_source.display(),
                "rootfs prepared"
            );
        }

        if !paths.kernel.exists() {
            tokio::fs::symlink(kernel_source, &paths.kernel)
                .await
                .map_err(|source| io_err(&paths.kernel, source))?;
        }

        if !paths.ssh_key.exists() {
            generate_ssh_keypair(&paths.ssh_key, vm_id).await?;
        }

        Ok(paths)
    }

    pub async fn read_ssh_public_key(&self, vm_id: &str) -> Option<String> {
        let pub_path = self.paths(vm_id).ssh_key.with_extension("pub");
        match tokio::fs::read_to_string(&pub_path).await {
            Ok(key) => Some(key.trim().to_string()),
            Err(e) => {
                warn!(vm_id = %vm_id, "failed to read ssh public key: {}", e);
                None
            }
        }
    }

    pub async fn write_record(&self, record: &VmRecord) -> Result<(), StorageError> {
        let path = self.paths(&record.vm_id).info;
        let body = serde_json::to_vec_pretty(record).map_err(|e| StorageError::Record {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|source| io_err(&path, source))
    }

    pub async fn load_record(&self, path: &Path) -> Result<VmRecord, StorageError> {
        let body = tokio::fs::read(path)
            .await
            .map_err(|source| io_err(path, source))?;
        serde_json::from_slice(&body).map_err(|e| StorageError::Record {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Load every persisted record under the instances directory, skipping
    /// entries that fail to parse.
    pub async fn load_all_records(&self) -> Vec<VmRecord> {
        let mut records = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(self.instances_dir()).await {
            Ok(rd) => rd,
            Err(e) => {
                warn!("failed to read instances dir for recovery: {}", e);
                return records;
            }
        };

        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let info = entry.path().join("info.json");
            if !info.exists() {
                continue;
            }
            match self.load_record(&info).await {
                Ok(record) => records.push(record),
                Err(e) => warn!("skipping unreadable record: {}", e),
            }
        }
        records
    }

    pub async fn remove(&self, vm_id: &str) -> Result<(), StorageError> {
        let dir = self.paths(vm_id).dir;
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|source| io_err(&dir, source))?;
        }
        Ok(())
    }

    /// Free space on the working mount, in GiB.
    pub fn free_disk_gib(&self) -> Result<u64, StorageError> {
        let stat = nix::sys::statvfs::statvfs(&self.work_dir).map_err(StorageError::Statvfs)?;
        let bytes = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Ok(bytes / (1024 * 1024 * 1024))
    }

    /// Writability self-check for `/health`.
    pub async fn self_check(&self) -> Result<(), StorageError> {
        let probe = self.work_dir.join(".healthcheck");
        tokio::fs::write(&probe, b"ok")
            .await
            .map_err(|source| io_err(&probe, source))?;
        let _ = tokio::fs::remove_file(&probe).await;
        Ok(())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Copy preserving holes; a freshly-built rootfs image is mostly empty and
/// a plain copy would defeat the disk floor.
async fn sparse_copy(source: &Path, dest: &Path) -> Result<(), StorageError> {
    let output = Command::new("cp")
        .arg("--sparse=always")
        .arg("--reflink=auto")
        .arg(source)
        .arg(dest)
        .output()
        .await
        .map_err(|source| io_err(Path::new("cp"), source))?;

    if !output.status.success() {
        return Err(StorageError::Command {
            command: format!("cp --sparse=always {} {}", source.display(), dest.display()),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

async fn generate_ssh_keypair(key_path: &Path, vm_id: &str) -> Result<(), StorageError> {
    let output = Command::new("ssh-keygen")
        .args(["-t", "ed25519", "-N", "", "-q", "-C"])
        .arg(vm_id)
        .arg("-f")
        .arg(key_path)
        .output()
        .await
        .map_err(|source| io_err(Path::new("ssh-keygen"), source))?;

    if !output.status.success() {
        return Err(StorageError::Command {
            command: format!("ssh-keygen -f {}", key_path.display()),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use common::api::{NetworkMode, VmStatus};
    use tempfile::TempDir;

    use super::*;

    fn sample_record(vm_id: &str, paths: &InstancePaths) -> VmRecord {
        VmRecord {
            vm_id: vm_id.to_string(),
            name: "acme-1700000000-ab12c".to_string(),
            tap_name: "tap0a1b2c3d".to_string(),
            bridge_name: Some("embr0".to_string()),
            mac: "06:aa:bb:cc:dd:ee".to_string(),
            ip: "dhcp".to_string(),
            networking: NetworkMode::Bridge,
            memory_mib: 2048,
            vcpus: 2,
            pid: Some(4242),
            status: VmStatus::Running,
            created_at: Utc::now(),
            console_log_path: paths.console_log.display().to_string(),
            rootfs_path: paths.rootfs.display().to_string(),
            kernel_path: paths.kernel.display().to_string(),
            socket_path: paths.socket.display().to_string(),
            ephemeral: true,
            kernel_source: "default".to_string(),
            rootfs_source: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn record_round_trips_through_info_json() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path());
        let vm_id = "acme-0a1b2c3d";
        let paths = store.paths(vm_id);
        tokio::fs::create_dir_all(&paths.dir).await.unwrap();

        let record = sample_record(vm_id, &paths);
        store.write_record(&record).await.unwrap();

        let loaded = store.load_record(&paths.info).await.unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn load_all_records_skips_broken_entries() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path());

        let good = store.paths("good-00000000");
        tokio::fs::create_dir_all(&good.dir).await.unwrap();
        store
            .write_record(&sample_record("good-00000000", &good))
            .await
            .unwrap();

        let bad = store.paths("bad-11111111");
        tokio::fs::create_dir_all(&bad.dir).await.unwrap();
        tokio::fs::write(&bad.info, b"{not json").await.unwrap();

        let records = store.load_all_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].vm_id, "good-00000000");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path());
        store.remove("never-created").await.unwrap();
    }

    #[tokio::test]
    async fn prepare_rejects_missing_source_image() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path());
        let missing = dir.path().join("nope.ext4");
        let kernel = dir.path().join("vmlinux");
        tokio::fs::write(&kernel, b"kernel").await.unwrap();

        let err = store
            .prepare("acme-0a1b2c3d", &missing, &kernel)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingImage(_)));
    }

    #[tokio::test]
    async fn self_check_passes_on_writable_dir() {
        let dir = TempDir::new().unwrap();
        let store = InstanceStore::new(dir.path());
        store.self_check().await.unwrap();
    }
}
