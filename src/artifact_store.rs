use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, warn};

pub async fn ensure_image_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create image directory at {}", path.display()))
}

pub fn artifact_path(image_dir: &Path, job_id: &str) -> PathBuf {
    image_dir.join(format!("{job_id}.png"))
}

pub fn temp_source_path(image_dir: &Path, job_id: &str) -> PathBuf {
    image_dir.join(format!("tmp_{job_id}.png"))
}

pub async fn delete_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

/// A decoded source image written for one job. The owning task calls
/// [`TempSourceImage::remove`] once the job ends; dropping the guard without it
/// still deletes the file.
#[derive(Debug)]
pub struct TempSourceImage {
    path: PathBuf,
    removed: bool,
}

impl TempSourceImage {
    pub async fn write(image_dir: &Path, job_id: &str, bytes: &[u8]) -> Result<Self> {
        let path = temp_source_path(image_dir, job_id);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write source image {}", path.display()))?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        self.removed = true;
        match delete_file_if_exists(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Removed temporary source image"),
            Err(err) => warn!("Failed to remove temporary source image: {err:#}"),
        }
    }
}

impl Drop for TempSourceImage {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed temporary source image"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "Failed to remove temporary source image {}: {err}",
                self.path.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_keyed_by_job_id() {
        let dir = Path::new("public/images");
        assert_eq!(
            artifact_path(dir, "abc"),
            PathBuf::from("public/images/abc.png")
        );
        assert_eq!(
            temp_source_path(dir, "abc"),
            PathBuf::from("public/images/tmp_abc.png")
        );
    }

    #[tokio::test]
    async fn temp_source_is_removed_on_drop_only_for_its_job() {
        let dir = tempfile::tempdir().unwrap();
        let other = artifact_path(dir.path(), "abc");
        fs::write(&other, b"keep").await.unwrap();

        let temp = TempSourceImage::write(dir.path(), "abc", b"png").await.unwrap();
        let path = temp.path().to_path_buf();
        assert!(path.exists());
        drop(temp);

        assert!(!path.exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn remove_deletes_file_and_disarms_drop() {
        let dir = tempfile::tempdir().unwrap();
        let temp = TempSourceImage::write(dir.path(), "abc", b"png").await.unwrap();
        let path = temp.path().to_path_buf();

        temp.remove().await;
        assert!(!path.exists());

        // A later file at the same path belongs to someone else.
        fs::write(&path, b"new").await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn deleting_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        delete_file_if_exists(&dir.path().join("nope.png"))
            .await
            .unwrap();
    }
}
