//! External plugins
//!
//! A plugin is a binary fetched from the controller, cached locally, and
//! run as a subprocess that serves a small request/response protocol over
//! a Unix domain socket. Every invocation owns its process and socket and
//! tears both down before returning.

pub mod binary;
pub mod client;
pub mod rpc;
pub mod socket;

use brigade_core::domain::plugin::PluginResult;
use std::collections::HashMap;
use thiserror::Error;

use crate::context::StepContext;

pub use client::PluginClient;
pub use rpc::{PluginRequest, RpcClient, RpcError};
pub use socket::PluginSocket;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {plugin} has no binary for {platform}")]
    NotFound { plugin: String, platform: String },

    #[error("cannot resolve plugin {plugin}: {message}")]
    Resolve { plugin: String, message: String },

    #[error("cannot download plugin {plugin}: {message}")]
    Download { plugin: String, message: String },

    #[error("cannot extract plugin {plugin}: {message}")]
    Extract { plugin: String, message: String },

    #[error("executable {cmd} of plugin {plugin} not found")]
    MissingBinary { plugin: String, cmd: String },

    #[error("cannot start plugin {plugin}: {message}")]
    Spawn { plugin: String, message: String },

    #[error("plugin {plugin} handshake failed: {source}")]
    Handshake {
        plugin: String,
        #[source]
        source: RpcError,
    },

    #[error("plugin {plugin} failed: {source}")]
    Rpc {
        plugin: String,
        #[source]
        source: RpcError,
    },

    #[error("plugin {plugin} interrupted")]
    Cancelled { plugin: String },
}

/// Runs plugin `name` once with `options`
///
/// The plugin process is started, handshaken, run, and stopped; its output
/// is fully flushed to the step's logs before this returns. The returned
/// status is normalized to `success` or `fail`.
pub async fn invoke(
    ctx: &StepContext<'_>,
    name: &str,
    options: HashMap<String, String>,
) -> Result<PluginResult, PluginError> {
    let mut client = PluginClient::start(ctx, name).await?;
    let result = client.run(options, ctx.cancellation()).await;
    client.close().await;
    result
}
