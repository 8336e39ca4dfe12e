//! Resolution of input file references.
//!
//! Submissions and stage payloads carry paths to uploaded photos. Before a
//! job is admitted, and again when a handler picks it up, every path is
//! checked to exist under the data root as a readable regular file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{PipelineError, Result};

/// Photo extensions accepted at admission, lowercase.
pub const ACCEPTED_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Largest photo accepted at admission.
pub const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

/// A verified input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    /// Canonical path of the file.
    pub path: PathBuf,
    /// Size in bytes at resolution time.
    pub size: u64,
}

impl BlobRef {
    /// Final path component, used as the upload file name.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Checks that the file is an accepted photo type within the size cap.
    pub fn check_image(&self) -> Result<()> {
        let extension = self
            .path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if !ACCEPTED_IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            return Err(PipelineError::InputValidation {
                message: format!(
                    "{} is not an accepted image type ({})",
                    self.file_name(),
                    ACCEPTED_IMAGE_EXTENSIONS.join(", ")
                ),
                field: Some("extension".to_string()),
            });
        }
        if self.size > MAX_IMAGE_BYTES {
            return Err(PipelineError::InputValidation {
                message: format!(
                    "{} is {} bytes, above the {MAX_IMAGE_BYTES} byte limit",
                    self.file_name(),
                    self.size
                ),
                field: Some("size".to_string()),
            });
        }
        Ok(())
    }
}

/// Checks file references against a data root.
#[derive(Debug, Clone)]
pub struct BlobResolver {
    root: PathBuf,
}

impl BlobResolver {
    /// Creates a resolver for files under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The configured data root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves one path. Relative paths are taken from the data root.
    pub async fn resolve(&self, path: impl AsRef<Path>) -> Result<BlobRef> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(PipelineError::missing_field("path"));
        }

        let root = tokio::fs::canonicalize(&self.root).await.map_err(|e| {
            PipelineError::Configuration(format!(
                "data root {} is not accessible: {e}",
                self.root.display()
            ))
        })?;

        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let canonical = tokio::fs::canonicalize(&candidate)
            .await
            .map_err(|_| PipelineError::blob_not_found(&candidate))?;

        if !canonical.starts_with(&root) {
            return Err(PipelineError::InputValidation {
                message: format!(
                    "{} is outside the data root {}",
                    canonical.display(),
                    root.display()
                ),
                field: Some("path".to_string()),
            });
        }

        let metadata = tokio::fs::metadata(&canonical)
            .await
            .map_err(|_| PipelineError::blob_not_found(&canonical))?;
        if !metadata.is_file() {
            return Err(PipelineError::blob_not_found(&canonical));
        }
        tokio::fs::File::open(&canonical)
            .await
            .map_err(|_| PipelineError::blob_not_found(&canonical))?;

        debug!(path = %canonical.display(), size = metadata.len(), "Resolved blob");
        Ok(BlobRef {
            path: canonical,
            size: metadata.len(),
        })
    }

    /// Resolves an uploaded photo and applies [`BlobRef::check_image`].
    pub async fn resolve_image(&self, path: impl AsRef<Path>) -> Result<BlobRef> {
        let blob = self.resolve(path).await?;
        blob.check_image()?;
        Ok(blob)
    }

    /// Resolves several paths, failing on the first unresolvable one.
    pub async fn resolve_all<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Vec<BlobRef>> {
        let mut resolved = Vec::with_capacity(paths.len());
        for path in paths {
            resolved.push(self.resolve(path).await?);
        }
        Ok(resolved)
    }
}
