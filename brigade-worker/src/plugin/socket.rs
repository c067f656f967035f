//! Plugin process management
//!
//! Spawns a resolved plugin, reads the socket address it announces on the
//! first line of its standard output, and forwards the rest of its output
//! to the step's logs until the process is torn down.

use brigade_core::domain::log::LogLevel;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::PluginError;
use super::binary::ResolvedPlugin;
use crate::context::StepContext;
use crate::service::forward_lines;

/// How long a plugin may take to announce its socket
pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a stopped plugin may take to exit before it is killed
pub const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Linux and macOS `ETXTBSY`
const TEXT_FILE_BUSY: i32 = 26;

/// One running plugin process
///
/// Dropping it kills the process and stops its log drainer; call
/// [`PluginSocket::shutdown`] for an orderly teardown that flushes output.
pub struct PluginSocket {
    pub plugin: String,
    /// Unix socket the plugin serves its RPC endpoint on
    pub address: PathBuf,
    child: Child,
    drain: Option<JoinHandle<()>>,
    drain_stop: CancellationToken,
}

impl PluginSocket {
    /// Spawns `plugin` in the step's working directory
    pub async fn start(
        ctx: &StepContext<'_>,
        name: &str,
        plugin: &ResolvedPlugin,
        announce_timeout: Duration,
    ) -> Result<Self, PluginError> {
        let spawn_error = |message: String| PluginError::Spawn {
            plugin: name.to_string(),
            message,
        };

        let mut child = spawn(ctx, plugin)
            .await
            .map_err(|e| spawn_error(format!("{}: {}", plugin.executable.display(), e)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(spawn_error("no output pipes".to_string()));
        };
        let mut stdout = BufReader::new(stdout);

        let mut announce = String::new();
        let read = time::timeout(announce_timeout, stdout.read_line(&mut announce)).await;
        let address = match read {
            Ok(Ok(n)) if n > 0 => announce.split_whitespace().next().map(PathBuf::from),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => return Err(spawn_error(format!("cannot read announcement: {}", e))),
            Err(_) => {
                return Err(spawn_error(format!(
                    "no socket announced after {:?}",
                    announce_timeout
                )));
            }
        };
        let Some(address) = address else {
            return Err(spawn_error(
                "exited before announcing its socket".to_string(),
            ));
        };

        debug!("Plugin {} listening on {}", name, address.display());

        let drain_stop = CancellationToken::new();
        let logs = ctx.job.logs.clone();
        let step_order = ctx.step_order;
        let stop = drain_stop.clone();
        let drain = tokio::spawn(async move {
            tokio::join!(
                forward_lines(stdout, logs.clone(), step_order, LogLevel::Info),
                forward_lines(stderr, logs, step_order, LogLevel::Info),
            );
            stop.cancelled().await;
        });

        Ok(Self {
            plugin: name.to_string(),
            address,
            child,
            drain: Some(drain),
            drain_stop,
        })
    }

    /// Waits for the process to exit, killing it after `grace`, then
    /// stops the drainer once all output is forwarded
    pub async fn shutdown(&mut self, grace: Duration) {
        match time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Plugin {} exited with {}", self.plugin, status),
            Ok(Err(e)) => warn!("Cannot wait for plugin {}: {}", self.plugin, e),
            Err(_) => {
                warn!("Plugin {} still running after {:?}, killing it", self.plugin, grace);
                if let Err(e) = self.child.kill().await {
                    warn!("Cannot kill plugin {}: {}", self.plugin, e);
                }
            }
        }

        self.drain_stop.cancel();
        if let Some(mut drain) = self.drain.take() {
            // Output pipes may be held open by a process the plugin forked
            if time::timeout(grace, &mut drain).await.is_err() {
                warn!("Output of plugin {} not drained after {:?}", self.plugin, grace);
                drain.abort();
            }
        }
    }
}

impl Drop for PluginSocket {
    fn drop(&mut self) {
        self.drain_stop.cancel();
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
        if let Err(e) = self.child.start_kill() {
            debug!("Plugin {} already gone: {}", self.plugin, e);
        }
    }
}

async fn spawn(ctx: &StepContext<'_>, plugin: &ResolvedPlugin) -> std::io::Result<Child> {
    let mut attempts = 0;
    loop {
        let spawned = Command::new(&plugin.executable)
            .args(&plugin.binary.args)
            .current_dir(ctx.working_dir())
            .env_clear()
            .envs(ctx.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            // A freshly written executable can be briefly busy
            Err(e) if e.raw_os_error() == Some(TEXT_FILE_BUSY) && attempts < 5 => {
                attempts += 1;
                time::sleep(Duration::from_millis(50)).await;
            }
            other => return other,
        }
    }
}
