//! Plugin binary endpoints

use crate::ControllerClient;
use crate::error::{ClientError, Result};
use brigade_core::domain::plugin::{Platform, PluginBinary};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

impl ControllerClient {
    /// Get the binary metadata of a plugin for a platform
    ///
    /// A 404 is reported as [`ClientError::NotFound`].
    pub async fn plugin_binary(&self, plugin: &str, platform: &Platform) -> Result<PluginBinary> {
        let response = self
            .get(&format!(
                "/plugins/{}/binary/{}/{}/infos",
                plugin, platform.os, platform.arch
            ))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(format!(
                "plugin {} for {}",
                plugin, platform
            )));
        }

        self.handle_response(response).await
    }

    /// Stream one file of a plugin binary into `dest`
    ///
    /// Returns the number of bytes written.
    pub async fn download_plugin_file<W>(
        &self,
        binary: &PluginBinary,
        filename: &str,
        dest: &mut W,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let response = self
            .get(&format!(
                "/plugins/{}/binary/{}/{}",
                binary.plugin, binary.os, binary.arch
            ))
            .query(&[("filename", filename)])
            .send()
            .await?;

        let mut response = self.check_status(response).await?;

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            dest.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        dest.flush().await?;

        debug!(
            "Downloaded {} bytes of {} for plugin {}",
            written, filename, binary.plugin
        );
        Ok(written)
    }
}
