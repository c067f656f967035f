//! Job directories
//!
//! Each job gets `<basedir>/<hash>/{run,keys,tmp,hooks}`, where `<hash>` is
//! derived from the job name. All directories are private to the worker
//! user, and a leftover directory from a previous run is removed first.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info};

use crate::context::JobDirectories;

const DIR_MODE: u32 = 0o700;

/// Directory name derived from a job name
pub fn directory_name(job_name: &str) -> String {
    let digest = hex::encode(Sha256::digest(job_name.as_bytes()));
    digest[..32].to_string()
}

/// Creates clean working, keys, tmp and hooks directories for `job_name`
pub async fn setup(basedir: &Path, job_name: &str) -> Result<JobDirectories> {
    tokio::fs::create_dir_all(basedir)
        .await
        .with_context(|| format!("Failed to create base directory {}", basedir.display()))?;
    let basedir = tokio::fs::canonicalize(basedir)
        .await
        .with_context(|| format!("Failed to resolve {}", basedir.display()))?;

    let root = basedir.join(directory_name(job_name));
    if tokio::fs::try_exists(&root).await.unwrap_or(false) {
        info!("Removing leftover job directory {}", root.display());
        tokio::fs::remove_dir_all(&root)
            .await
            .with_context(|| format!("Failed to clean {}", root.display()))?;
    }

    let dirs = JobDirectories {
        working: root.join("run"),
        keys: root.join("keys"),
        tmp: root.join("tmp"),
        hooks: root.join("hooks"),
        root,
    };

    for dir in [&dirs.root, &dirs.working, &dirs.keys, &dirs.tmp, &dirs.hooks] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(DIR_MODE))
            .await
            .with_context(|| format!("Failed to set permissions on {}", dir.display()))?;
    }

    debug!("Job directories ready under {}", dirs.root.display());
    Ok(dirs)
}

/// Removes every directory of the job
pub async fn teardown(dirs: &JobDirectories) -> Result<()> {
    tokio::fs::remove_dir_all(&dirs.root)
        .await
        .with_context(|| format!("Failed to remove {}", dirs.root.display()))
}
