use crate::utils::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File system operations interface
#[async_trait]
pub trait FileSystemService: Send + Sync {
    async fn read_bytes(&self, path: &Path) -> Result<Vec<u8>>;
    async fn write_bytes(&self, path: &Path, content: &[u8]) -> Result<()>;
    async fn create_directory(&self, path: &Path) -> Result<()>;
    async fn canonicalize(&self, path: &Path) -> Result<PathBuf>;
    async fn is_file(&self, path: &Path) -> bool;
    async fn is_dir(&self, path: &Path) -> bool;
}

/// One message pushed to a running client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LiveUpdateMessage {
    /// New contents of one changed file
    #[serde(rename_all = "camelCase")]
    Update { file_path: PathBuf, contents: String },
    /// Every path a rebuild changed
    #[serde(rename_all = "camelCase")]
    Changed { changed_paths: Vec<PathBuf> },
    /// A rebuild failed; the previous build is still being served
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

/// Transport for live updates (socket push, in-process broadcast, ...)
pub trait LiveUpdateChannel: Send + Sync {
    fn publish(&self, message: LiveUpdateMessage);
}
