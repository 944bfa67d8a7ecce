use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::config::Settings;
use crate::domain::Identity;
use crate::error::ExportError;

pub const ACCESS_FILE: &str = ".access";
pub const ANYONE: &str = "*";

/// Per-job output directories under the service storage root.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(settings: &Settings) -> Self {
        Self::new_with_root(settings.storage_root.clone())
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn job_dir(&self, id: &Uuid) -> Utf8PathBuf {
        self.root.join(id.to_string())
    }

    /// Creates a fresh directory keyed by a random id. Ids are never reused.
    pub fn create_job_dir(&self) -> Result<(Uuid, Utf8PathBuf), ExportError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| ExportError::Storage(format!("create {}: {err}", self.root)))?;
        loop {
            let id = Uuid::new_v4();
            let dir = self.job_dir(&id);
            match fs::create_dir(dir.as_std_path()) {
                Ok(()) => {
                    debug!(path = %dir, "job directory created");
                    return Ok((id, dir));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(ExportError::Storage(format!("create {dir}: {err}")));
                }
            }
        }
    }

    /// Records who may read the job output: the identity id, else the login
    /// username, else anyone.
    pub fn write_access_descriptor(
        dir: &Utf8Path,
        identity: Option<&Identity>,
        username: Option<&str>,
    ) -> Result<(), ExportError> {
        let owner = identity
            .map(|identity| identity.id.as_str())
            .filter(|id| !id.is_empty())
            .or(username)
            .unwrap_or(ANYONE);
        write_bytes_atomic(&dir.join(ACCESS_FILE), format!("{owner}\n").as_bytes())
    }

    /// Whether a caller holding `attributes` may read `dir`.
    ///
    /// Without authentication everything is readable. Otherwise the access
    /// descriptor must exist and contain `*` or one of the caller's attributes.
    pub fn check_access(
        dir: &Utf8Path,
        attributes: &[String],
        authentication: bool,
    ) -> Result<bool, ExportError> {
        if !authentication {
            return Ok(true);
        }
        let content = match fs::read_to_string(dir.join(ACCESS_FILE).as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(ExportError::Storage(err.to_string())),
        };
        Ok(content.lines().map(str::trim).any(|line| {
            line == ANYONE || attributes.iter().any(|attribute| attribute == line)
        }))
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), ExportError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ExportError::Storage(err.to_string()))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| ExportError::Storage(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| ExportError::Storage(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_dirs_are_unique() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("storage")).unwrap();
        let store = Store::new_with_root(root.clone());
        let (first_id, first) = store.create_job_dir().unwrap();
        let (second_id, second) = store.create_job_dir().unwrap();
        assert_ne!(first_id, second_id);
        assert_eq!(first, root.join(first_id.to_string()));
        assert!(first.as_std_path().is_dir());
        assert!(second.as_std_path().is_dir());
    }
}
