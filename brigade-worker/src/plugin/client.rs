//! Plugin client
//!
//! Drives one plugin invocation: start the process, connect, advertise the
//! worker's callback port, handshake, run, and stop.

use brigade_core::domain::log::LogLevel;
use brigade_core::domain::plugin::{PluginManifest, PluginResult};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::binary;
use super::rpc::{RpcClient, RpcError};
use super::socket::{ANNOUNCE_TIMEOUT, EXIT_GRACE, PluginSocket};
use super::PluginError;
use crate::context::StepContext;

/// Timeout of every plugin call except `run`
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Exit grace of a plugin whose run was interrupted
pub const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// A started and handshaken plugin
pub struct PluginClient {
    pub manifest: PluginManifest,
    socket: PluginSocket,
    rpc: RpcClient,
    /// Set when a call was abandoned midway; the connection is out of sync
    poisoned: bool,
}

impl PluginClient {
    /// Resolves, spawns and handshakes plugin `name`
    ///
    /// The process is stopped if any step after spawning fails.
    pub async fn start(ctx: &StepContext<'_>, name: &str) -> Result<Self, PluginError> {
        let resolved = binary::resolve(ctx.job, name).await?;
        let mut socket = PluginSocket::start(ctx, name, &resolved, ANNOUNCE_TIMEOUT).await?;

        match handshake(&socket.address, ctx.job.http_port).await {
            Ok((rpc, manifest)) => {
                info!(
                    "Plugin {} version {} started for job {}",
                    manifest.name, manifest.version, ctx.job.job_id
                );
                ctx.send_log(
                    LogLevel::Info,
                    format!("Plugin {} version {} is ready", manifest.name, manifest.version),
                );
                Ok(Self {
                    manifest,
                    socket,
                    rpc,
                    poisoned: false,
                })
            }
            Err(source) => {
                socket.shutdown(Duration::ZERO).await;
                Err(PluginError::Handshake {
                    plugin: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Runs the plugin with `options`; the status is normalized
    pub async fn run(
        &mut self,
        options: HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<PluginResult, PluginError> {
        let plugin = self.socket.plugin.clone();

        let result = tokio::select! {
            result = self.rpc.run(options) => result,
            _ = cancel.cancelled() => {
                self.poisoned = true;
                return Err(PluginError::Cancelled { plugin });
            }
        };

        let mut result = result.map_err(|source| PluginError::Rpc {
            plugin: plugin.clone(),
            source,
        })?;
        result.status = result.normalized_status().as_str().to_string();
        Ok(result)
    }

    /// Stops the plugin and waits until its output is flushed
    ///
    /// Stop errors are logged, never returned: the run outcome is already known.
    /// An interrupted plugin gets no stop request and a short exit grace.
    pub async fn close(mut self) {
        if self.poisoned {
            debug!("Plugin {} was interrupted, not sending stop", self.socket.plugin);
            self.socket.shutdown(CANCEL_GRACE).await;
            return;
        }

        if let Err(e) = stop(&mut self.rpc).await {
            warn!("Cannot stop plugin {}: {}", self.socket.plugin, e);
        }
        self.socket.shutdown(EXIT_GRACE).await;
    }
}

/// Sends the stop request; a transport already closing counts as stopped
pub async fn stop(rpc: &mut RpcClient) -> Result<(), RpcError> {
    match rpc.stop().await {
        Err(e) if e.is_transport_closing() => {
            debug!("Plugin transport already closing on stop: {}", e);
            Ok(())
        }
        other => other,
    }
}

async fn handshake(address: &Path, http_port: u16) -> Result<(RpcClient, PluginManifest), RpcError> {
    let mut rpc = connect(address).await?;
    rpc.worker_http_port(http_port).await?;
    let manifest = rpc.manifest().await?;
    Ok((rpc, manifest))
}

/// The socket may appear shortly after it is announced
async fn connect(address: &Path) -> Result<RpcClient, RpcError> {
    let mut attempt = 1;
    loop {
        match RpcClient::connect(address, CALL_TIMEOUT).await {
            Ok(rpc) => return Ok(rpc),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                debug!("Plugin socket {} not ready: {}", address.display(), e);
                attempt += 1;
                tokio::time::sleep(CONNECT_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}
