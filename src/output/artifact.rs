/// Spilled output artifacts.
///
/// Output too large to send inline is written in full to a file under the
/// configured artifact directory, with a UUID prefix to prevent
/// collisions between concurrent requests. The returned [`ArtifactRef`]
/// owns the file: it is deleted when the reference is removed or dropped.
///
/// Writes use `tokio::fs`; only the fallback removal in `Drop` is blocking.
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tracing::{debug, info, warn};

pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `content` completely, then hands back the owning reference.
    ///
    /// `preview_chars` > 0 keeps the first characters as a preview for the
    /// delivery message.
    pub async fn write(&self, filename: &str, content: &str, preview_chars: usize) -> Result<ArtifactRef> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating artifact directory {}", self.dir.display()))?;

        let uuid = uuid::Uuid::new_v4();
        let safe_filename = sanitize_filename(filename);
        let path = self.dir.join(format!("{uuid}_{safe_filename}"));
        tokio::fs::write(&path, content.as_bytes())
            .await
            .with_context(|| format!("writing artifact {}", path.display()))?;

        let size = content.len() as u64;
        info!("Spilled {} of output → {}", format_size(size), path.display());

        let preview = (preview_chars > 0).then(|| content.chars().take(preview_chars).collect());
        Ok(ArtifactRef {
            path,
            filename: safe_filename,
            size,
            preview,
            removed: false,
        })
    }
}

/// A spilled output file, deleted when this reference goes away.
#[derive(Debug)]
pub struct ArtifactRef {
    path: PathBuf,
    filename: String,
    size: u64,
    preview: Option<String>,
    removed: bool,
}

impl ArtifactRef {
    /// Absolute path of the artifact on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Filename suggested to the recipient (without the UUID prefix)
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns a human-readable size string (e.g., "45KB", "1.2MB")
    pub fn human_size(&self) -> String {
        format_size(self.size)
    }

    pub fn preview(&self) -> Option<&str> {
        self.preview.as_deref()
    }

    pub fn preview_omitted(&self) -> bool {
        self.preview.is_none()
    }

    /// Deletes the artifact now. A file that is already gone is not an error.
    pub async fn remove(mut self) -> Result<()> {
        self.removed = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Removed artifact {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing artifact {}", self.path.display())),
        }
    }
}

impl Drop for ArtifactRef {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove artifact {}: {e}", self.path.display());
            }
        }
    }
}

/// Sanitizes a filename for safe disk storage.
fn sanitize_filename(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if safe.is_empty() {
        "output.txt".to_string()
    } else {
        safe
    }
}

/// Formats a byte size as a human-readable string.
fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}B")
    } else if bytes < 1024 * 1024 {
        format!("{}KB", bytes / 1024)
    } else {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("output.txt"), "output.txt");
        assert_eq!(sanitize_filename("my result (1).json"), "my_result__1_.json");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename(""), "output.txt");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500B");
        assert_eq!(format_size(1536), "1KB");
        assert_eq!(format_size(5 * 1024 * 1024 + 512 * 1024), "5.5MB");
    }

    #[tokio::test]
    async fn test_write_stores_full_content() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("artifacts"));
        let content = "x".repeat(5000);

        let artifact = store.write("output.txt", &content, 0).await.unwrap();
        assert!(artifact.path().starts_with(store.dir()));
        assert!(artifact
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_output.txt"));
        assert_eq!(artifact.filename(), "output.txt");
        assert_eq!(artifact.size(), 5000);
        assert!(artifact.preview_omitted());

        let on_disk = tokio::fs::read_to_string(artifact.path()).await.unwrap();
        assert_eq!(on_disk, content);
    }

    #[tokio::test]
    async fn test_concurrent_writes_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let a = store.write("output.txt", "a", 0).await.unwrap();
        let b = store.write("output.txt", "b", 0).await.unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[tokio::test]
    async fn test_preview_counts_characters() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let artifact = store.write("out.txt", "héllo wörld", 5).await.unwrap();
        assert_eq!(artifact.preview(), Some("héllo"));
        assert!(!artifact.preview_omitted());
    }

    #[tokio::test]
    async fn test_remove_deletes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let artifact = store.write("out.txt", "data", 0).await.unwrap();
        let path = artifact.path().to_path_buf();

        artifact.remove().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_drop_deletes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let artifact = store.write("out.txt", "data", 0).await.unwrap();
        let path = artifact.path().to_path_buf();
        assert!(path.exists());

        drop(artifact);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_remove_tolerates_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let artifact = store.write("out.txt", "data", 0).await.unwrap();
        std::fs::remove_file(artifact.path()).unwrap();
        assert!(artifact.remove().await.is_ok());
    }
}
