//! Writes the NoCloud documents into an instance directory and packs them
//! into the `cidata` ISO firecracker attaches as a read-only drive.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use common::cloud_init::CloudInitBundle;

#[derive(Debug, Error)]
pub enum CloudInitWriteError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("genisoimage failed: {0}")]
    Iso(String),
}

/// Write the three documents and build the ISO. Returns the ISO path.
pub async fn write_bundle(
    vm_id: &str,
    cloud_init_dir: &Path,
    iso_path: &Path,
    bundle: &CloudInitBundle,
) -> Result<PathBuf, CloudInitWriteError> {
    let documents = [
        ("user-data", &bundle.user_data),
        ("meta-data", &bundle.meta_data),
        ("network-config", &bundle.network_config),
    ];

    for (name, content) in &documents {
        let path = cloud_init_dir.join(name);
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| CloudInitWriteError::Write {
                path: path.display().to_string(),
                source,
            })?;
    }

    let output = Command::new("genisoimage")
        .arg("-output")
        .arg(iso_path)
        .args(["-volid", "cidata", "-joliet", "-rock"])
        .arg(cloud_init_dir.join("user-data"))
        .arg(cloud_init_dir.join("meta-data"))
        .arg(cloud_init_dir.join("network-config"))
        .output()
        .await
        .map_err(|e| CloudInitWriteError::Iso(e.to_string()))?;

    if !output.status.success() {
        return Err(CloudInitWriteError::Iso(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    info!(vm_id = %vm_id, iso = %iso_path.display(), "cloud-init ISO created");
    Ok(iso_path.to_path_buf())
}
