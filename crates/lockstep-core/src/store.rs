use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::types::VideoFile;

// MARK: - FileStore trait

/// Where video files are read from on the master and written to on a slave.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Videos currently present in `dir`, sorted by name.
    async fn list_videos(&self, dir: &Path) -> std::io::Result<Vec<VideoFile>>;

    /// Destination for a file named `name` received from the master.
    fn resolve_write_path(&self, dir: &Path, name: &str) -> std::io::Result<PathBuf>;
}

// MARK: - LocalFileStore

/// Plain directory on the local filesystem, filtered by file extension.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    extensions: Vec<String>,
}

impl LocalFileStore {
    pub fn new(extensions: Vec<String>) -> Self {
        Self { extensions }
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map_or(false, |ext| {
                self.extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
    }
}

impl Default for LocalFileStore {
    fn default() -> Self {
        Self::new(vec!["mp4".to_owned(), "mkv".to_owned()])
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn list_videos(&self, dir: &Path) -> std::io::Result<Vec<VideoFile>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut videos = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() || !self.accepts(&path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                debug!("[Store] Skipping non UTF-8 file name: {}", path.display());
                continue;
            };
            let size = entry.metadata().await?.len();
            videos.push(VideoFile::new(name, path, size));
        }
        videos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(videos)
    }

    fn resolve_write_path(&self, dir: &Path, name: &str) -> std::io::Result<PathBuf> {
        // Only the last normal component survives: "../../x.mp4" lands as "x.mp4".
        let file_name = Path::new(name)
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part),
                _ => None,
            })
            .last()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("received file name has no usable component: {name:?}"),
                )
            })?;
        Ok(dir.join(file_name))
    }
}
