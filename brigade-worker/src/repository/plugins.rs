//! Plugins repository
//!
//! Resolves plugin binary metadata and streams plugin files from the
//! controller.

use anyhow::{Context, Result};
use async_trait::async_trait;
use brigade_client::ControllerClient;
use brigade_core::domain::plugin::{Platform, PluginBinary};
use std::sync::Arc;
use tokio::io::AsyncWrite;

/// Repository trait for plugin binaries
#[async_trait]
pub trait PluginRepository: Send + Sync {
    /// Resolves the binary of `plugin` for `platform`
    ///
    /// Returns `None` when no binary matches the platform.
    async fn plugin_binary(&self, plugin: &str, platform: &Platform)
    -> Result<Option<PluginBinary>>;

    /// Streams one file of `binary` into `dest`, returning the bytes written
    async fn download_plugin_file(
        &self,
        binary: &PluginBinary,
        filename: &str,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;
}

/// HTTP implementation of PluginRepository
pub struct HttpPluginRepository {
    client: Arc<ControllerClient>,
}

impl HttpPluginRepository {
    pub fn new(client: Arc<ControllerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PluginRepository for HttpPluginRepository {
    async fn plugin_binary(
        &self,
        plugin: &str,
        platform: &Platform,
    ) -> Result<Option<PluginBinary>> {
        match self.client.plugin_binary(plugin, platform).await {
            Ok(binary) => Ok(Some(binary)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to resolve plugin {}", plugin)),
        }
    }

    async fn download_plugin_file(
        &self,
        binary: &PluginBinary,
        filename: &str,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        self.client
            .download_plugin_file(binary, filename, dest)
            .await
            .with_context(|| format!("Failed to download {} of plugin {}", filename, binary.plugin))
    }
}
