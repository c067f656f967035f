//! Plugin domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::job::Status;

/// Operating system and architecture a plugin binary is built for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// The platform this worker runs on
    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// Metadata of a plugin binary for one platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginBinary {
    pub plugin: String,
    pub os: String,
    pub arch: String,
    /// File name of the downloaded artifact (may be a tar or gzip-tar archive)
    pub filename: String,
    /// Unix file mode the artifact is persisted with
    #[serde(default = "default_perm")]
    pub perm: u32,
    /// Executable entry point, relative to the plugin directory or looked up on PATH
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra files the plugin needs next to its binary
    #[serde(default)]
    pub companion_files: Vec<String>,
}

fn default_perm() -> u32 {
    0o755
}

impl PluginBinary {
    /// Whether the artifact must be extracted after download
    pub fn is_archive(&self) -> bool {
        is_archive_name(&self.filename)
    }
}

/// Whether a file name denotes a tar or gzip-tar archive
pub fn is_archive_name(filename: &str) -> bool {
    filename.ends_with(".tar") || filename.ends_with(".tar.gz") || filename.ends_with(".tgz")
}

/// Plugin handshake response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
}

/// Result returned by a plugin's run operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginResult {
    pub status: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub outputs: HashMap<String, String>,
}

impl PluginResult {
    /// Normalized status: `success` (any case) or `fail`
    pub fn normalized_status(&self) -> Status {
        if self.status.eq_ignore_ascii_case("success") {
            Status::Success
        } else {
            Status::Fail
        }
    }
}
