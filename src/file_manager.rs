// src/file_manager.rs - Upload and profile storage
use crate::config::PathsConfig;
use crate::pipeline::naming::sanitize_filename;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Form value that disables slicing.
pub const NO_SLICING: &str = "no_slicing";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FileManagerError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Invalid file name '{0}'")]
    InvalidName(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
}

/// The service's on-disk state: uploaded models, produced artifacts and
/// slicer profiles. There is no database; the path is the state.
#[derive(Debug, Clone)]
pub struct FileManager {
    uploads_dir: PathBuf,
    profiles_dir: PathBuf,
    default_profile: PathBuf,
}

impl FileManager {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            uploads_dir: paths.uploads_dir.clone(),
            profiles_dir: paths.profiles_dir.clone(),
            default_profile: paths.default_profile_path(),
        }
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    pub fn profiles_dir(&self) -> &Path {
        &self.profiles_dir
    }

    /// Create the uploads and profiles directories if needed.
    pub async fn ensure_dirs(&self) -> Result<(), FileManagerError> {
        for dir in [&self.uploads_dir, &self.profiles_dir] {
            fs::create_dir_all(dir).await.map_err(|e| FileManagerError::Io(e.to_string()))?;
        }
        Ok(())
    }

    /// Store an uploaded model under its sanitized name.
    pub async fn save_upload(&self, name: &str, content: &[u8]) -> Result<PathBuf, FileManagerError> {
        let path = self.uploads_dir.join(safe_name(name)?);
        fs::write(&path, content).await.map_err(|e| FileManagerError::Io(e.to_string()))?;
        tracing::info!("Saved model to '{}'", path.display());
        Ok(path)
    }

    /// Store an uploaded profile under its sanitized name.
    pub async fn save_profile(&self, name: &str, content: &[u8]) -> Result<PathBuf, FileManagerError> {
        let path = self.profiles_dir.join(safe_name(name)?);
        fs::write(&path, content).await.map_err(|e| FileManagerError::Io(e.to_string()))?;
        tracing::info!("Uploaded new profile: '{}'", path.display());
        Ok(path)
    }

    /// Map a profile named in a form field to a path.
    ///
    /// `no_slicing` or an empty value means no profile; an unknown name falls
    /// back to the default profile.
    pub fn resolve_named_profile(&self, name: &str) -> Option<PathBuf> {
        let name = name.trim();
        if name.is_empty() || name == NO_SLICING {
            return None;
        }
        let candidate = sanitize_filename(name).map(|n| self.profiles_dir.join(n));
        match candidate {
            Some(path) if path.is_file() => Some(path),
            _ => {
                tracing::info!(
                    "Profile '{}' not found, using default profile '{}'",
                    name,
                    self.default_profile.display()
                );
                Some(self.default_profile.clone())
            }
        }
    }

    /// Profiles available to callers, sorted by name.
    pub async fn list_profiles(&self) -> Result<Vec<FileInfo>, FileManagerError> {
        let mut files = self.list_files(&self.profiles_dir).await?;
        files.retain(|f| !f.is_directory);
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// List files in a directory.
    pub async fn list_files(&self, path: &Path) -> Result<Vec<FileInfo>, FileManagerError> {
        let mut entries = fs::read_dir(path).await.map_err(|e| FileManagerError::Io(e.to_string()))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| FileManagerError::Io(e.to_string()))? {
            let path = entry.path();
            if let Some(file_name) = path.file_name() {
                if let Some(name_str) = file_name.to_str() {
                    let metadata = entry.metadata().await.map_err(|e| FileManagerError::Io(e.to_string()))?;
                    files.push(FileInfo {
                        name: name_str.to_string(),
                        size: metadata.len(),
                        is_directory: metadata.is_dir(),
                    });
                }
            }
        }
        Ok(files)
    }
}

fn safe_name(name: &str) -> Result<String, FileManagerError> {
    sanitize_filename(name).ok_or_else(|| FileManagerError::InvalidName(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(root: &Path) -> FileManager {
        FileManager::new(&PathsConfig {
            uploads_dir: root.join("uploads"),
            profiles_dir: root.join("profiles"),
            default_profile: "default.ini".to_string(),
        })
    }

    #[tokio::test]
    async fn test_save_and_list() {
        let dir = tempdir().unwrap();
        let fm = manager(dir.path());
        fm.ensure_dirs().await.unwrap();
        let model = fm.save_upload("../evil/demo part.stl", b"solid").await.unwrap();
        assert_eq!(model, dir.path().join("uploads").join("demo_part.stl"));
        fm.save_profile("b.ini", b"x").await.unwrap();
        fm.save_profile("a.ini", b"y").await.unwrap();
        let names: Vec<_> = fm.list_profiles().await.unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["a.ini", "b.ini"]);
    }

    #[tokio::test]
    async fn test_listing_serializes_name_size_kind() {
        let dir = tempdir().unwrap();
        let fm = manager(dir.path());
        fm.ensure_dirs().await.unwrap();
        fm.save_profile("fine.ini", b"abc").await.unwrap();
        let listing = serde_json::to_value(fm.list_profiles().await.unwrap()).unwrap();
        assert_eq!(
            listing,
            serde_json::json!([{ "name": "fine.ini", "size": 3, "is_directory": false }])
        );
    }

    #[tokio::test]
    async fn test_invalid_upload_name() {
        let dir = tempdir().unwrap();
        let fm = manager(dir.path());
        fm.ensure_dirs().await.unwrap();
        let err = fm.save_upload("///", b"").await.unwrap_err();
        assert!(matches!(err, FileManagerError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_resolve_named_profile() {
        let dir = tempdir().unwrap();
        let fm = manager(dir.path());
        fm.ensure_dirs().await.unwrap();
        let stored = fm.save_profile("fine.ini", b"layer_height = 0.1").await.unwrap();
        assert_eq!(fm.resolve_named_profile("no_slicing"), None);
        assert_eq!(fm.resolve_named_profile(""), None);
        assert_eq!(fm.resolve_named_profile("fine.ini"), Some(stored));
        assert_eq!(
            fm.resolve_named_profile("missing.ini"),
            Some(dir.path().join("profiles").join("default.ini"))
        );
    }
}
