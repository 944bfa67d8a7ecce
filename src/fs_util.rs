use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::domain::Archiver;
use crate::error::ExportError;

/// A file that is removed when the guard goes out of scope, whatever the outcome.
#[derive(Debug)]
pub struct TransientFile {
    path: PathBuf,
}

impl TransientFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransientFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove transient file");
            }
        }
    }
}

/// Joins `relative` onto `base`, refusing absolute paths and `..` components.
pub fn safe_join(base: &Path, relative: &str) -> Option<PathBuf> {
    let mut joined = base.to_path_buf();
    let mut pushed = false;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                joined.push(part);
                pushed = true;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    pushed.then_some(joined)
}

/// All regular files below `root`, sorted by path.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>, ExportError> {
    walk(root).map(|(_, files)| files)
}

/// All directories below `root` (excluding `root`), sorted by path.
pub fn walk_dirs(root: &Path) -> Result<Vec<PathBuf>, ExportError> {
    walk(root).map(|(dirs, _)| dirs)
}

fn walk(root: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), ExportError> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    if !root.exists() {
        return Ok((dirs, files));
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| ExportError::Storage(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| ExportError::Storage(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
                dirs.push(path);
            } else {
                files.push(path);
            }
        }
    }
    dirs.sort();
    files.sort();
    Ok((dirs, files))
}

/// `path` relative to `root` with `/` separators on every platform.
pub fn relative_slash_path(root: &Path, path: &Path) -> Result<String, ExportError> {
    let relative = path.strip_prefix(root).map_err(|_| {
        ExportError::Storage(format!(
            "{} is not inside {}",
            path.display(),
            root.display()
        ))
    })?;
    let parts = relative
        .components()
        .map(|component| {
            component.as_os_str().to_str().map(str::to_string).ok_or_else(|| {
                ExportError::Storage(format!("non-utf8 path: {}", relative.display()))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join("/"))
}

/// Writes `dir` into `<dir>.<ext>` with the directory name as the top-level entry.
pub fn archive_dir(dir: &Path, archiver: Archiver) -> Result<PathBuf, ExportError> {
    let name = dir
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ExportError::Storage(format!("invalid package path {}", dir.display())))?
        .to_string();
    let archive_path = dir.with_file_name(format!("{name}.{}", archiver.extension()));
    let file = File::create(&archive_path)
        .map_err(|err| ExportError::Storage(format!("create {}: {err}", archive_path.display())))?;

    let written = match archiver {
        Archiver::Zip => write_zip(dir, &name, file),
        Archiver::Tar => write_tar(dir, &name, file).map(drop),
        Archiver::Tgz => write_tar(dir, &name, GzEncoder::new(file, Compression::default()))
            .and_then(|encoder| {
                encoder
                    .finish()
                    .map(drop)
                    .map_err(|err| ExportError::Storage(err.to_string()))
            }),
    };
    if let Err(err) = written {
        let _ = fs::remove_file(&archive_path);
        return Err(err);
    }
    Ok(archive_path)
}

fn write_tar<W: io::Write>(dir: &Path, name: &str, writer: W) -> Result<W, ExportError> {
    let mut builder = tar::Builder::new(writer);
    builder
        .append_dir_all(name, dir)
        .map_err(|err| ExportError::Storage(err.to_string()))?;
    builder
        .into_inner()
        .map_err(|err| ExportError::Storage(err.to_string()))
}

fn write_zip(dir: &Path, name: &str, file: File) -> Result<(), ExportError> {
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    writer
        .add_directory(format!("{name}/"), options)
        .map_err(|err| ExportError::Storage(err.to_string()))?;
    // Explicit entries keep empty directories, such as a fetch-only payload.
    for path in walk_dirs(dir)? {
        writer
            .add_directory(format!("{name}/{}/", relative_slash_path(dir, &path)?), options)
            .map_err(|err| ExportError::Storage(err.to_string()))?;
    }
    for path in walk_files(dir)? {
        let entry_name = format!("{name}/{}", relative_slash_path(dir, &path)?);
        writer
            .start_file(entry_name, options)
            .map_err(|err| ExportError::Storage(err.to_string()))?;
        let mut source = File::open(&path).map_err(|err| ExportError::Storage(err.to_string()))?;
        io::copy(&mut source, &mut writer).map_err(|err| ExportError::Storage(err.to_string()))?;
    }
    writer
        .finish()
        .map_err(|err| ExportError::Storage(err.to_string()))?;
    Ok(())
}

/// Unpacks a zip, tar or gzipped tar archive into `target_dir`.
pub fn extract_archive(archive: &Path, target_dir: &Path) -> Result<(), ExportError> {
    let name = archive
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_lowercase();
    if name.ends_with(".zip") {
        extract_zip(archive, target_dir)
    } else if name.ends_with(".tgz") || name.ends_with(".tar.gz") {
        let file = File::open(archive)
            .map_err(|err| ExportError::Storage(format!("open {}: {err}", archive.display())))?;
        tar::Archive::new(GzDecoder::new(file))
            .unpack(target_dir)
            .map_err(|err| ExportError::Storage(err.to_string()))
    } else if name.ends_with(".tar") {
        let file = File::open(archive)
            .map_err(|err| ExportError::Storage(format!("open {}: {err}", archive.display())))?;
        tar::Archive::new(file)
            .unpack(target_dir)
            .map_err(|err| ExportError::Storage(err.to_string()))
    } else {
        Err(ExportError::Configuration(format!(
            "unrecognised archive type: {}",
            archive.display()
        )))
    }
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), ExportError> {
    let file = File::open(zip_path)
        .map_err(|err| ExportError::Storage(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| ExportError::Storage(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| ExportError::Storage(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(ExportError::Storage(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path).map_err(|err| ExportError::Storage(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| ExportError::Storage(err.to_string()))?;
        }
        let mut outfile =
            File::create(&entry_path).map_err(|err| ExportError::Storage(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| ExportError::Storage(err.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_rejects_escape() {
        let base = Path::new("/pkg/data");
        assert_eq!(
            safe_join(base, "sub/file.txt"),
            Some(PathBuf::from("/pkg/data/sub/file.txt"))
        );
        assert_eq!(safe_join(base, "../etc/passwd"), None);
        assert_eq!(safe_join(base, "/etc/passwd"), None);
        assert_eq!(safe_join(base, ""), None);
    }

    #[test]
    fn transient_file_removed_on_drop() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("manifest.json");
        fs::write(&path, b"{}").unwrap();
        {
            let guard = TransientFile::new(&path);
            assert!(guard.path().exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn walk_is_sorted_and_relative_uses_slashes() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("b/c")).unwrap();
        fs::write(temp.path().join("b/c/z.txt"), b"z").unwrap();
        fs::write(temp.path().join("a.txt"), b"a").unwrap();
        let files = walk_files(temp.path()).unwrap();
        let relative = files
            .iter()
            .map(|path| relative_slash_path(temp.path(), path).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(relative, vec!["a.txt", "b/c/z.txt"]);

        fs::create_dir_all(temp.path().join("empty")).unwrap();
        let dirs = walk_dirs(temp.path())
            .unwrap()
            .iter()
            .map(|path| relative_slash_path(temp.path(), path).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(dirs, vec!["b", "b/c", "empty"]);
    }

    #[test]
    fn zip_keeps_empty_directories() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("pkg");
        fs::create_dir_all(dir.join("data")).unwrap();
        fs::write(dir.join("bagit.txt"), b"BagIt-Version: 0.97\n").unwrap();

        let archive = archive_dir(&dir, Archiver::Zip).unwrap();
        let out = temp.path().join("out");
        extract_zip(&archive, &out).unwrap();

        assert!(out.join("pkg/data").is_dir());
        assert_eq!(fs::read(out.join("pkg/bagit.txt")).unwrap(), b"BagIt-Version: 0.97\n");
    }
}
