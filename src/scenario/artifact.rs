//! On-disk artifacts checked after a scenario

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use super::error::ArtifactError;

/// A file a scenario expects the server to leave behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// The file must exist
    Exists(PathBuf),
    /// The file must exist, is deleted, and must then be gone
    Cleanup(PathBuf),
}

impl Artifact {
    pub fn path(&self) -> &Path {
        match self {
            Artifact::Exists(path) | Artifact::Cleanup(path) => path,
        }
    }

    pub fn verify(&self) -> Result<(), ArtifactError> {
        let path = self.path();
        if !path.exists() {
            return Err(ArtifactError::Missing(path.to_path_buf()));
        }

        if let Artifact::Cleanup(path) = self {
            fs::remove_file(path).map_err(|source| ArtifactError::Remove {
                path: path.clone(),
                source,
            })?;
            if path.exists() {
                return Err(ArtifactError::StillPresent(path.clone()));
            }
            info!("Removed recording {}", path.display());
        }
        Ok(())
    }
}
