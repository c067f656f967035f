//! Worker hooks
//!
//! Hook scripts live on the worker host, under `<hooks_dir>/setup` and
//! `<hooks_dir>/teardown`, and are copied into the job's own hooks
//! directory before the first step. Setup scripts are sourced one by one;
//! the variables a script exports reach every step of the job. Teardown
//! scripts run once the job is over. Scripts run in file name order, so a
//! numeric prefix sets their priority.

use anyhow::{Context, Result, bail};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ENV_PREFIX;

const SETUP: &str = "setup";
const TEARDOWN: &str = "teardown";

/// Printed between a setup script's own output and the resulting environment
const ENV_MARKER: &str = "<<<ENVIRONMENT>>>";

/// Maintained by the shell itself
const SHELL_VARIABLES: &[&str] = &["PWD", "OLDPWD", "SHLVL", "_"];

/// Copies the worker's hook scripts from `source` into `target`
pub async fn install(source: &Path, target: &Path) -> Result<()> {
    for phase in [SETUP, TEARDOWN] {
        let to = target.join(phase);
        tokio::fs::create_dir_all(&to)
            .await
            .with_context(|| format!("Failed to create {}", to.display()))?;

        for script in scripts(&source.join(phase)).await? {
            let Some(name) = script.file_name() else {
                continue;
            };
            tokio::fs::copy(&script, to.join(name))
                .await
                .with_context(|| format!("Failed to copy hook {}", script.display()))?;
            debug!("Installed {} hook {}", phase, script.display());
        }
    }
    Ok(())
}

/// Sources every setup script and returns the variables they exported
pub async fn run_setup(
    hooks: &Path,
    working_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<(String, String)>> {
    let base: HashMap<String, String> = inherited_env().into_iter().collect();
    let mut exported = BTreeMap::new();

    for script in scripts(&hooks.join(SETUP)).await? {
        info!("Running setup hook {}", script.display());
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(format!(". \"$0\"; echo '{}'; env", ENV_MARKER))
            .arg(&script);
        let output = run(command, &script, working_dir, cancel).await?;

        for (name, value) in exported_variables(&output, &base) {
            info!("Hook {} exported {}", script.display(), name);
            exported.insert(name, value);
        }
    }

    Ok(exported.into_iter().collect())
}

/// Runs every teardown script, stopping at the first failure
pub async fn run_teardown(
    hooks: &Path,
    working_dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    for script in scripts(&hooks.join(TEARDOWN)).await? {
        info!("Running teardown hook {}", script.display());
        let mut command = Command::new("/bin/sh");
        command.arg(&script);
        run(command, &script, working_dir, cancel).await?;
    }
    Ok(())
}

/// Regular files of `dir` sorted by name; a missing directory has none
async fn scripts(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };

    let mut scripts = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to list {}", dir.display()))?
    {
        let path = entry.path();
        if tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
            scripts.push(path);
        }
    }
    scripts.sort();
    Ok(scripts)
}

/// Runs one hook to completion and returns its standard output
async fn run(
    mut command: Command,
    script: &Path,
    working_dir: &Path,
    cancel: &CancellationToken,
) -> Result<String> {
    command
        .current_dir(working_dir)
        .env_clear()
        .envs(inherited_env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::select! {
        output = command.output() => output
            .with_context(|| format!("Failed to start hook {}", script.display()))?,
        _ = cancel.cancelled() => bail!("hook {} interrupted", script.display()),
    };

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        debug!("Hook {} stderr: {}", script.display(), stderr.trim_end());
    }
    if !output.status.success() {
        bail!("hook {} failed with {}", script.display(), output.status);
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Worker environment without its internal variables
fn inherited_env() -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(name, _)| !name.starts_with(ENV_PREFIX))
        .collect()
}

/// Variables after the marker line that differ from `base`
fn exported_variables(output: &str, base: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut lines = output.lines();
    for line in lines.by_ref() {
        if line == ENV_MARKER {
            break;
        }
        info!("{}", line);
    }

    lines
        .filter_map(|line| line.split_once('='))
        .filter(|(name, _)| !name.is_empty() && !SHELL_VARIABLES.contains(name))
        .filter(|(name, value)| base.get(*name).map(String::as_str) != Some(*value))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}
