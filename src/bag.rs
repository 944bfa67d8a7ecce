//! BagIt package assembly: payload directory, checksum manifest, declaration,
//! deferred references, metadata, and optional archiving.
//!
//! The declaration is written as `bagit.txt`, the name BagIt validators look
//! for, rather than a `bagit-declaration` file.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::domain::{Archiver, RemoteFileRef};
use crate::error::ExportError;
use crate::fs_util;
use crate::provenance::ProvenanceDocument;

pub const PAYLOAD_DIR: &str = "data";
pub const METADATA_DIR: &str = "metadata";
pub const MANIFEST_FILE: &str = "manifest-sha256.txt";
pub const DECLARATION_FILE: &str = "bagit.txt";
pub const BAG_INFO_FILE: &str = "bag-info.txt";
pub const FETCH_MANIFEST_FILE: &str = "fetch-manifest";
pub const PROVENANCE_FILE: &str = "manifest.json";
pub const BAGIT_VERSION: &str = "0.97";
pub const TAG_FILE_ENCODING: &str = "UTF-8";
pub const SENDER_ID_KEY: &str = "Internal-Sender-Identifier";
pub const PROFILE_KEY: &str = "BagIt-Profile-Identifier";

/// A package under construction.
///
/// The directory is owned by this value: unless [`Package::finalize`] completes,
/// dropping it removes the whole tree.
#[derive(Debug)]
pub struct Package {
    root: PathBuf,
    metadata: BTreeMap<String, String>,
    armed: bool,
}

impl Package {
    pub fn begin(root: &Path, metadata: BTreeMap<String, String>) -> Result<Self, ExportError> {
        let payload = root.join(PAYLOAD_DIR);
        fs::create_dir_all(&payload).map_err(|err| {
            ExportError::Storage(format!("create package {}: {err}", payload.display()))
        })?;
        info!(path = %root.display(), "package started");
        Ok(Self {
            root: root.to_path_buf(),
            metadata,
            armed: true,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn payload_dir(&self) -> PathBuf {
        self.root.join(PAYLOAD_DIR)
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Writes every tag file, then archives the package if asked to.
    ///
    /// Returns the archive path, or the package directory when no archiver is set.
    pub fn finalize(
        mut self,
        deferred: &[RemoteFileRef],
        provenance: Option<ProvenanceDocument>,
        archiver: Option<Archiver>,
    ) -> Result<PathBuf, ExportError> {
        if let Some(document) = provenance {
            document.write(&self.root.join(METADATA_DIR).join(PROVENANCE_FILE))?;
        }
        let entries = write_checksum_manifest(&self.root)?;
        write_declaration(&self.root)?;
        if !deferred.is_empty() {
            write_remote_refs(&self.root.join(FETCH_MANIFEST_FILE), deferred)?;
        }
        write_bag_info(&self.root, &self.metadata, &entries)?;
        info!(path = %self.root.display(), files = entries.len(), "package finalized");

        let result = match archiver {
            Some(archiver) => {
                let archive = fs_util::archive_dir(&self.root, archiver)?;
                fs::remove_dir_all(&self.root)
                    .map_err(|err| ExportError::Storage(err.to_string()))?;
                info!(path = %archive.display(), %archiver, "package archived");
                archive
            }
            None => self.root.clone(),
        };
        self.armed = false;
        Ok(result)
    }

    /// Removes the package directory now.
    pub fn abort(mut self) {
        self.remove();
        self.armed = false;
    }

    fn remove(&self) {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => info!(path = %self.root.display(), "package removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => error!(path = %self.root.display(), error = %err, "failed to remove package"),
        }
    }
}

impl Drop for Package {
    fn drop(&mut self) {
        if self.armed {
            self.remove();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Path relative to the package root, `/`-separated.
    pub path: String,
    pub digest: String,
    pub bytes: u64,
}

pub fn sha256_file(path: &Path) -> Result<(String, u64), ExportError> {
    let mut file = File::open(path)
        .map_err(|err| ExportError::Storage(format!("open {}: {err}", path.display())))?;
    let mut hasher = Sha256::new();
    let bytes =
        io::copy(&mut file, &mut hasher).map_err(|err| ExportError::Storage(err.to_string()))?;
    Ok((format!("{:x}", hasher.finalize()), bytes))
}

/// Digests every payload file, sorted by path.
pub fn compute_manifest(root: &Path) -> Result<Vec<ManifestEntry>, ExportError> {
    let mut entries = Vec::new();
    for path in fs_util::walk_files(&root.join(PAYLOAD_DIR))? {
        let (digest, bytes) = sha256_file(&path)?;
        entries.push(ManifestEntry {
            path: fs_util::relative_slash_path(root, &path)?,
            digest,
            bytes,
        });
    }
    Ok(entries)
}

/// Regenerates the checksum manifest from the current payload.
pub fn write_checksum_manifest(root: &Path) -> Result<Vec<ManifestEntry>, ExportError> {
    let entries = compute_manifest(root)?;
    let content = entries
        .iter()
        .map(|entry| format!("{}  {}\n", entry.digest, entry.path))
        .collect::<String>();
    fs::write(root.join(MANIFEST_FILE), content)
        .map_err(|err| ExportError::Storage(err.to_string()))?;
    Ok(entries)
}

fn write_declaration(root: &Path) -> Result<(), ExportError> {
    let content = format!(
        "BagIt-Version: {BAGIT_VERSION}\nTag-File-Character-Encoding: {TAG_FILE_ENCODING}\n"
    );
    fs::write(root.join(DECLARATION_FILE), content)
        .map_err(|err| ExportError::Storage(err.to_string()))
}

fn write_bag_info(
    root: &Path,
    metadata: &BTreeMap<String, String>,
    entries: &[ManifestEntry],
) -> Result<(), ExportError> {
    let total: u64 = entries.iter().map(|entry| entry.bytes).sum();
    let mut content = String::new();
    for (key, value) in metadata {
        content.push_str(&format!("{key}: {value}\n"));
    }
    content.push_str(&format!(
        "Bagging-Date: {}\n",
        chrono::Local::now().format("%Y-%m-%d")
    ));
    content.push_str(&format!("Payload-Oxum: {total}.{}\n", entries.len()));
    fs::write(root.join(BAG_INFO_FILE), content)
        .map_err(|err| ExportError::Storage(err.to_string()))
}

/// Writes one JSON object per line, the same shape the catalog uses for manifests.
pub fn write_remote_refs(path: &Path, refs: &[RemoteFileRef]) -> Result<(), ExportError> {
    let file = File::create(path)
        .map_err(|err| ExportError::Storage(format!("create {}: {err}", path.display())))?;
    let mut writer = BufWriter::new(file);
    for entry in refs {
        serde_json::to_writer(&mut writer, entry)
            .map_err(|err| ExportError::Storage(err.to_string()))?;
        writer
            .write_all(b"\n")
            .map_err(|err| ExportError::Storage(err.to_string()))?;
    }
    writer
        .flush()
        .map_err(|err| ExportError::Storage(err.to_string()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub verified: usize,
    pub missing: Vec<String>,
    pub extra: Vec<String>,
    pub mismatched: Vec<String>,
}

impl VerificationReport {
    pub fn is_valid(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.mismatched.is_empty()
    }
}

/// Recomputes payload digests and compares them against the checksum manifest.
pub fn verify_package(root: &Path) -> Result<VerificationReport, ExportError> {
    if !root.join(DECLARATION_FILE).is_file() {
        return Err(ExportError::Integrity(format!(
            "{} has no {DECLARATION_FILE}",
            root.display()
        )));
    }
    let manifest_path = root.join(MANIFEST_FILE);
    let file = File::open(&manifest_path).map_err(|err| {
        ExportError::Integrity(format!("open {}: {err}", manifest_path.display()))
    })?;
    let mut listed = BTreeMap::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|err| ExportError::Storage(err.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let (digest, path) = line.split_once(char::is_whitespace).ok_or_else(|| {
            ExportError::Integrity(format!("malformed manifest line: {line}"))
        })?;
        let path = path.trim_start().to_string();
        if listed.insert(path.clone(), digest.to_lowercase()).is_some() {
            return Err(ExportError::Integrity(format!(
                "duplicate manifest entry: {path}"
            )));
        }
    }

    let mut report = VerificationReport::default();
    for entry in compute_manifest(root)? {
        match listed.remove(&entry.path) {
            Some(digest) if digest == entry.digest => report.verified += 1,
            Some(_) => report.mismatched.push(entry.path),
            None => report.extra.push(entry.path),
        }
    }
    report.missing = listed.into_keys().collect();
    Ok(report)
}

/// Verifies a package directory or an archived package.
///
/// Archives are unpacked into a scratch directory that must hold exactly one
/// top-level package directory.
pub fn verify_path(path: &Path) -> Result<VerificationReport, ExportError> {
    if path.is_dir() {
        return verify_package(path);
    }
    let scratch = tempfile::tempdir().map_err(|err| ExportError::Storage(err.to_string()))?;
    fs_util::extract_archive(path, scratch.path())?;
    let mut roots = fs::read_dir(scratch.path())
        .map_err(|err| ExportError::Storage(err.to_string()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|entry| entry.is_dir())
        .collect::<Vec<_>>();
    match (roots.pop(), roots.is_empty()) {
        (Some(root), true) => verify_package(&root),
        _ => Err(ExportError::Integrity(format!(
            "{} does not contain a single package directory",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha256_hex(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    #[test]
    fn finalize_writes_tag_files() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("pkg");
        let mut metadata = BTreeMap::new();
        metadata.insert(SENDER_ID_KEY.to_string(), "export:abc".to_string());
        let package = Package::begin(&root, metadata).unwrap();
        fs::create_dir_all(package.payload_dir().join("t")).unwrap();
        fs::write(package.payload_dir().join("t/a.csv"), b"x,y\n1,2\n").unwrap();
        fs::write(package.payload_dir().join("b.txt"), b"hello").unwrap();

        let refs = vec![RemoteFileRef::new("https://h/f.bin", 3, "f.bin")];
        let result = package.finalize(&refs, None, None).unwrap();
        assert_eq!(result, root);

        let manifest = fs::read_to_string(root.join(MANIFEST_FILE)).unwrap();
        assert_eq!(
            manifest,
            format!(
                "{}  data/b.txt\n{}  data/t/a.csv\n",
                sha256_hex(b"hello"),
                sha256_hex(b"x,y\n1,2\n")
            )
        );
        let declaration = fs::read_to_string(root.join("bagit.txt")).unwrap();
        assert!(declaration.contains("BagIt-Version: 0.97"));
        let info = fs::read_to_string(root.join(BAG_INFO_FILE)).unwrap();
        assert!(info.contains("Internal-Sender-Identifier: export:abc\n"));
        assert!(info.contains("Payload-Oxum: 13.2\n"));
        let fetch = fs::read_to_string(root.join(FETCH_MANIFEST_FILE)).unwrap();
        assert_eq!(fetch.lines().count(), 1);
        assert!(verify_package(&root).unwrap().is_valid());
    }

    #[test]
    fn dropping_unfinished_package_removes_it() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("pkg");
        {
            let package = Package::begin(&root, BTreeMap::new()).unwrap();
            fs::write(package.payload_dir().join("a.txt"), b"a").unwrap();
        }
        assert!(!root.exists());
    }

    #[test]
    fn abort_removes_package() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("pkg");
        let package = Package::begin(&root, BTreeMap::new()).unwrap();
        assert!(root.join(PAYLOAD_DIR).is_dir());
        package.abort();
        assert!(!root.exists());
    }

    #[test]
    fn archived_package_round_trips() {
        for archiver in [Archiver::Zip, Archiver::Tar, Archiver::Tgz] {
            let temp = tempfile::tempdir().unwrap();
            let root = temp.path().join("pkg");
            let package = Package::begin(&root, BTreeMap::new()).unwrap();
            fs::write(package.payload_dir().join("a.txt"), b"abc").unwrap();
            let archive = package.finalize(&[], None, Some(archiver)).unwrap();

            assert_eq!(
                archive,
                temp.path().join(format!("pkg.{}", archiver.extension()))
            );
            assert!(!root.exists());
            let report = verify_path(&archive).unwrap();
            assert!(report.is_valid());
            assert_eq!(report.verified, 1);
        }
    }

    #[test]
    fn verify_detects_tampering() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("pkg");
        let package = Package::begin(&root, BTreeMap::new()).unwrap();
        fs::write(package.payload_dir().join("a.txt"), b"a").unwrap();
        fs::write(package.payload_dir().join("b.txt"), b"b").unwrap();
        package.finalize(&[], None, None).unwrap();

        fs::write(root.join("data/a.txt"), b"changed").unwrap();
        fs::remove_file(root.join("data/b.txt")).unwrap();
        fs::write(root.join("data/c.txt"), b"c").unwrap();

        let report = verify_package(&root).unwrap();
        assert!(!report.is_valid());
        assert_eq!(report.mismatched, vec!["data/a.txt"]);
        assert_eq!(report.missing, vec!["data/b.txt"]);
        assert_eq!(report.extra, vec!["data/c.txt"]);
    }

    fn layout(root: &Path) -> Vec<String> {
        let mut entries = fs_util::walk_dirs(root)
            .unwrap()
            .iter()
            .map(|path| format!("{}/", fs_util::relative_slash_path(root, path).unwrap()))
            .collect::<Vec<_>>();
        for path in fs_util::walk_files(root).unwrap() {
            entries.push(fs_util::relative_slash_path(root, &path).unwrap());
        }
        entries.sort();
        entries
    }

    #[test]
    fn fetch_only_zip_keeps_payload_directory() {
        let refs = vec![RemoteFileRef::new("https://h/f.bin", 3, "f.bin")];
        let temp = tempfile::tempdir().unwrap();

        let plain_root = temp.path().join("plain/pkg");
        let plain = Package::begin(&plain_root, BTreeMap::new())
            .unwrap()
            .finalize(&refs, None, None)
            .unwrap();

        let zipped_root = temp.path().join("zipped/pkg");
        let archive = Package::begin(&zipped_root, BTreeMap::new())
            .unwrap()
            .finalize(&refs, None, Some(Archiver::Zip))
            .unwrap();
        assert!(verify_path(&archive).unwrap().is_valid());

        let out = temp.path().join("out");
        fs_util::extract_zip(&archive, &out).unwrap();
        let extracted = out.join("pkg");

        assert!(extracted.join(PAYLOAD_DIR).is_dir());
        assert!(layout(&extracted).contains(&"data/".to_string()));
        assert_eq!(layout(&extracted), layout(&plain));
    }
}
