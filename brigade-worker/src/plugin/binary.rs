//! Plugin binary resolution and local cache
//!
//! Binaries are cached per plugin under `<basedir>/plugins/<name>` and
//! reused across jobs while their executable is present.

use brigade_core::domain::plugin::PluginBinary;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::PluginError;
use crate::context::JobContext;
use crate::repository::PluginRepository;

/// A plugin ready to be spawned
#[derive(Debug, Clone)]
pub struct ResolvedPlugin {
    pub binary: PluginBinary,
    /// Cache directory of the plugin, also its companion files location
    pub dir: PathBuf,
    pub executable: PathBuf,
}

/// Resolves plugin `name` for the worker's platform, downloading it if needed
pub async fn resolve(ctx: &JobContext, name: &str) -> Result<ResolvedPlugin, PluginError> {
    let binary = ctx
        .repos
        .plugins
        .plugin_binary(name, &ctx.platform)
        .await
        .map_err(|e| PluginError::Resolve {
            plugin: name.to_string(),
            message: format!("{:#}", e),
        })?
        .ok_or_else(|| PluginError::NotFound {
            plugin: name.to_string(),
            platform: ctx.platform.to_string(),
        })?;

    let dir = ctx.plugin_dir.join(safe_file_name(name));

    if let Some(executable) = cached_executable(&binary.cmd, &dir) {
        debug!("Using cached plugin {} at {}", name, executable.display());
        return Ok(ResolvedPlugin {
            binary,
            dir,
            executable,
        });
    }

    info!("Downloading plugin {} for {}", name, ctx.platform);
    if let Err(e) = download(ctx.repos.plugins.as_ref(), &binary, &dir).await {
        // No half-populated cache entry
        if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
            debug!("Cannot clean plugin directory {}: {}", dir.display(), cleanup);
        }
        return Err(e);
    }

    let executable = locate_executable(&binary.cmd, &dir).ok_or_else(|| {
        PluginError::MissingBinary {
            plugin: name.to_string(),
            cmd: binary.cmd.clone(),
        }
    })?;

    Ok(ResolvedPlugin {
        binary,
        dir,
        executable,
    })
}

/// Downloads the artifact and companion files of `binary` into `dir`
pub async fn download(
    repository: &dyn PluginRepository,
    binary: &PluginBinary,
    dir: &Path,
) -> Result<(), PluginError> {
    let download_error = |message: String| PluginError::Download {
        plugin: binary.plugin.clone(),
        message,
    };

    if dir.exists() {
        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| download_error(format!("cannot clean {}: {}", dir.display(), e)))?;
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| download_error(format!("cannot create {}: {}", dir.display(), e)))?;

    let mut files = vec![(binary.filename.as_str(), binary.perm)];
    files.extend(binary.companion_files.iter().map(|f| (f.as_str(), 0o644)));

    for (filename, perm) in files {
        let path = dir.join(safe_file_name(filename));

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| download_error(format!("cannot create {}: {}", path.display(), e)))?;
        let written = repository
            .download_plugin_file(binary, filename, &mut file)
            .await
            .map_err(|e| download_error(format!("{:#}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| download_error(format!("cannot write {}: {}", path.display(), e)))?;
        drop(file);

        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(perm))
            .await
            .map_err(|e| download_error(format!("cannot chmod {}: {}", path.display(), e)))?;

        debug!("Stored {} ({} bytes, mode {:o})", path.display(), written, perm);
    }

    if binary.is_archive() {
        let archive = dir.join(safe_file_name(&binary.filename));
        extract(&archive, dir)
            .await
            .map_err(|message| PluginError::Extract {
                plugin: binary.plugin.clone(),
                message,
            })?;
        if let Err(e) = tokio::fs::remove_file(&archive).await {
            warn!("Cannot remove archive {}: {}", archive.display(), e);
        }
    }

    Ok(())
}

/// Extracts a tar or gzip-tar archive into `dir` with the system `tar`
async fn extract(archive: &Path, dir: &Path) -> Result<(), String> {
    let name = archive.to_string_lossy();
    let flags = if name.ends_with(".gz") || name.ends_with(".tgz") {
        "-xzf"
    } else {
        "-xf"
    };

    let output = Command::new("tar")
        .arg(flags)
        .arg(archive)
        .arg("-C")
        .arg(dir)
        .output()
        .await
        .map_err(|e| format!("cannot run tar: {}", e))?;

    if !output.status.success() {
        return Err(format!(
            "tar exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    Ok(())
}

/// The executable of a plugin already in the cache
pub fn cached_executable(cmd: &str, dir: &Path) -> Option<PathBuf> {
    let path = Path::new(cmd);
    let candidate = if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    };
    is_executable(&candidate).then_some(candidate)
}

/// Finds `cmd` in the plugin directory, then on `PATH`
pub fn locate_executable(cmd: &str, dir: &Path) -> Option<PathBuf> {
    if let Some(found) = cached_executable(cmd, dir) {
        return Some(found);
    }
    if cmd.contains('/') {
        return None;
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|entry| entry.join(cmd))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Last path component of a controller-provided name
fn safe_file_name(name: &str) -> &str {
    name.rsplit('/').find(|part| !part.is_empty() && *part != "..").unwrap_or("plugin")
}
