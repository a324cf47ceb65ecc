use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tempfile::Builder;

use crate::domain::EventId;
use crate::error::StormsightError;

/// Sidecar persisted next to a partial download. `bytes_confirmed` only
/// advances after the bytes it covers are in the destination file, so a
/// resume offset derived from it never overshoots the written data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub url: String,
    pub etag: Option<String>,
    pub bytes_confirmed: u64,
    pub updated_at: String,
}

/// Record written next to a completed download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub event_id: String,
    pub item_id: String,
    pub role: String,
    pub url: String,
    pub bytes: u64,
    pub sha256: Option<String>,
    pub verified: bool,
    pub completed_at: String,
    pub tool: String,
}

#[derive(Debug, Clone)]
pub struct Store {
    staging_root: Utf8PathBuf,
}

impl Store {
    pub fn new(staging_override: Option<&Utf8Path>) -> Result<Self, StormsightError> {
        if let Some(root) = staging_override {
            return Ok(Self {
                staging_root: root.to_owned(),
            });
        }
        let staging_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("stormsight")).ok()
            })
            .ok_or_else(|| {
                StormsightError::Filesystem("unable to resolve staging directory".to_string())
            })?;
        Ok(Self { staging_root })
    }

    pub fn staging_root(&self) -> &Utf8Path {
        &self.staging_root
    }

    /// Default destination directory when the caller names none.
    pub fn download_dir(&self, event: &EventId) -> Utf8PathBuf {
        self.staging_root.join("downloads").join(event.as_str())
    }

    pub fn sidecar_path(dest: &Utf8Path) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{dest}.part.json"))
    }

    pub fn record_path(dest: &Utf8Path) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{dest}.meta.json"))
    }

    /// A destination is complete when the file exists and no sidecar
    /// remains beside it.
    pub fn is_complete(dest: &Utf8Path) -> bool {
        dest.as_std_path().exists() && !Self::sidecar_path(dest).as_std_path().exists()
    }

    pub fn ensure_parent(path: &Utf8Path) -> Result<(), StormsightError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| StormsightError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn load_resume_state(dest: &Utf8Path) -> Result<Option<ResumeState>, StormsightError> {
        Self::read_json_opt(&Self::sidecar_path(dest))
    }

    pub fn save_resume_state(dest: &Utf8Path, state: &ResumeState) -> Result<(), StormsightError> {
        Self::write_json_atomic(&Self::sidecar_path(dest), state)
    }

    pub fn clear_resume_state(dest: &Utf8Path) -> Result<(), StormsightError> {
        remove_if_present(&Self::sidecar_path(dest))
    }

    pub fn write_record(dest: &Utf8Path, record: &DownloadRecord) -> Result<(), StormsightError> {
        Self::write_json_atomic(&Self::record_path(dest), record)
    }

    pub fn load_record(dest: &Utf8Path) -> Result<Option<DownloadRecord>, StormsightError> {
        Self::read_json_opt(&Self::record_path(dest))
    }

    /// Removes the destination file and its sidecar.
    pub fn remove_artifacts(dest: &Utf8Path) -> Result<(), StormsightError> {
        remove_if_present(dest)?;
        remove_if_present(&Self::sidecar_path(dest))
    }

    fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), StormsightError> {
        let parent = path
            .parent()
            .ok_or_else(|| StormsightError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| StormsightError::Filesystem(err.to_string()))?;
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| StormsightError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".stormsight")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| StormsightError::Filesystem(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| StormsightError::Filesystem(err.to_string()))?;
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path())
                .map_err(|err| StormsightError::Filesystem(err.to_string()))?;
        }
        temp.persist(path.as_std_path())
            .map_err(|err| StormsightError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Missing files and unreadable JSON both come back as `None`; a
    /// sidecar we cannot trust is the same as no sidecar at all.
    fn read_json_opt<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, StormsightError> {
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StormsightError::Filesystem(err.to_string())),
        };
        Ok(serde_json::from_str(&content).ok())
    }
}

fn remove_if_present(path: &Utf8Path) -> Result<(), StormsightError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StormsightError::Filesystem(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_layout() {
        let dest = Utf8Path::new("/data/storm/20240214_tile.tif");
        assert_eq!(
            Store::sidecar_path(dest),
            "/data/storm/20240214_tile.tif.part.json"
        );
        assert_eq!(
            Store::record_path(dest),
            "/data/storm/20240214_tile.tif.meta.json"
        );
    }

    #[test]
    fn download_dir_layout() {
        let store = Store::new(Some(Utf8Path::new("/tmp/staging"))).unwrap();
        let event: EventId = "hurricane-ian".parse().unwrap();
        assert_eq!(
            store.download_dir(&event),
            "/tmp/staging/downloads/hurricane-ian"
        );
    }
}
