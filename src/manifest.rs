//! Prefetch and fetch manifest handling.
//!
//! The catalog answers a prefetch/fetch query with one JSON object per line,
//! each describing a remote file. Prefetch entries are downloaded into the
//! payload right away; fetch entries are only recorded for the package's
//! deferred-reference list.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::domain::RemoteFileRef;
use crate::error::ExportError;
use crate::fs_util::{self, TransientFile};
use crate::media;
use crate::provenance::{ProvenanceRecorder, payload_uri};
use crate::session::CatalogSession;

pub fn read_remote_refs(path: &Path) -> Result<Vec<RemoteFileRef>, ExportError> {
    let file = File::open(path)
        .map_err(|err| ExportError::Storage(format!("open {}: {err}", path.display())))?;
    let mut refs = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| ExportError::Storage(err.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: RemoteFileRef = serde_json::from_str(&line).map_err(|err| {
            ExportError::UpstreamHttp(format!(
                "malformed manifest entry {} in {}: {err}",
                index + 1,
                path.display()
            ))
        })?;
        refs.push(entry);
    }
    Ok(refs)
}

/// Downloads every entry of the manifest into `payload_dir/subdir/<filename>`.
///
/// The manifest file is removed when this returns, whether or not the
/// downloads succeeded.
pub fn prefetch<S: CatalogSession + ?Sized>(
    session: &S,
    manifest: TransientFile,
    payload_dir: &Path,
    subdir: &str,
    mut recorder: Option<&mut ProvenanceRecorder>,
) -> Result<Vec<PathBuf>, ExportError> {
    let refs = read_remote_refs(manifest.path())?;
    info!(entries = refs.len(), subdir, "prefetching manifest entries");

    let mut written = Vec::with_capacity(refs.len());
    for entry in &refs {
        let relative = payload_relative(subdir, &entry.filename);
        let destination = fs_util::safe_join(payload_dir, &relative).ok_or_else(|| {
            ExportError::Integrity(format!(
                "manifest filename escapes the payload directory: {}",
                entry.filename
            ))
        })?;
        let bytes = session.fetch(&entry.url, &destination, None)?;
        if bytes != entry.length {
            return Err(ExportError::Integrity(format!(
                "file size of {} does not match expected size of {} for file {}",
                bytes, entry.length, entry.url
            )));
        }
        debug!(url = %entry.url, path = %destination.display(), bytes, "prefetched");

        if let Some(recorder) = recorder.as_deref_mut() {
            let (mediatype, conforms_to) = media::describe(&entry.url, &entry.filename);
            recorder.add_aggregate(payload_uri(&relative), mediatype, conforms_to, &entry.url);
        }
        written.push(destination);
    }
    drop(manifest);
    Ok(written)
}

/// Copies every entry of the manifest into `deferred` without downloading it.
pub fn defer(
    manifest: TransientFile,
    deferred: &mut Vec<RemoteFileRef>,
    recorder: Option<&mut ProvenanceRecorder>,
) -> Result<usize, ExportError> {
    let refs = read_remote_refs(manifest.path())?;
    for entry in &refs {
        if fs_util::safe_join(Path::new(""), &entry.filename).is_none() {
            return Err(ExportError::Integrity(format!(
                "manifest filename escapes the payload directory: {}",
                entry.filename
            )));
        }
    }
    if let Some(recorder) = recorder {
        for entry in &refs {
            let (mediatype, conforms_to) = media::describe(&entry.url, &entry.filename);
            recorder.add_aggregate(
                payload_uri(&entry.filename),
                mediatype,
                conforms_to,
                &entry.url,
            );
        }
    }
    let count = refs.len();
    deferred.extend(refs);
    info!(entries = count, "recorded deferred references");
    Ok(count)
}

fn payload_relative(subdir: &str, filename: &str) -> String {
    let subdir = subdir.trim_matches('/');
    if subdir.is_empty() {
        filename.to_string()
    } else {
        format!("{subdir}/{filename}")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use assert_matches::assert_matches;

    use super::*;

    struct CannedSession {
        bodies: HashMap<String, Vec<u8>>,
    }

    impl CatalogSession for CannedSession {
        fn fetch(
            &self,
            url: &str,
            destination: &Path,
            _accept: Option<&str>,
        ) -> Result<u64, ExportError> {
            let body = self
                .bodies
                .get(url)
                .ok_or_else(|| ExportError::UpstreamHttp(format!("no body for {url}")))?;
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(destination, body).unwrap();
            Ok(body.len() as u64)
        }
    }

    fn write_manifest(dir: &Path, lines: &[&str]) -> TransientFile {
        let path = dir.join("prefetch-manifest.json");
        fs::write(&path, lines.join("\n")).unwrap();
        TransientFile::new(path)
    }

    #[test]
    fn prefetch_downloads_and_records() {
        let temp = tempfile::tempdir().unwrap();
        let payload = temp.path().join("data");
        let session = CannedSession {
            bodies: HashMap::from([("https://h/a.txt".to_string(), b"hello".to_vec())]),
        };
        let manifest = write_manifest(
            temp.path(),
            &[r#"{"url":"https://h/a.txt","length":5,"filename":"a.txt"}"#],
        );
        let manifest_path = manifest.path().to_path_buf();
        let mut recorder = ProvenanceRecorder::new(None);

        let written =
            prefetch(&session, manifest, &payload, "files", Some(&mut recorder)).unwrap();
        assert_eq!(written, vec![payload.join("files/a.txt")]);
        assert!(!manifest_path.exists());
        let aggregate = &recorder.document().aggregates[0];
        assert_eq!(aggregate.uri, "../data/files/a.txt");
        assert_eq!(aggregate.mediatype.as_deref(), Some("text/plain"));
        assert_eq!(aggregate.retrieved_from, "https://h/a.txt");
    }

    #[test]
    fn prefetch_size_mismatch_is_integrity_error() {
        let temp = tempfile::tempdir().unwrap();
        let session = CannedSession {
            bodies: HashMap::from([("https://h/a.txt".to_string(), b"hello".to_vec())]),
        };
        let manifest = write_manifest(
            temp.path(),
            &[r#"{"url":"https://h/a.txt","length":6,"filename":"a.txt"}"#],
        );
        let manifest_path = manifest.path().to_path_buf();
        let err = prefetch(&session, manifest, &temp.path().join("data"), "", None).unwrap_err();
        assert_matches!(err, ExportError::Integrity(_));
        assert!(!manifest_path.exists());
    }

    #[test]
    fn prefetch_rejects_escaping_filename() {
        let temp = tempfile::tempdir().unwrap();
        let session = CannedSession {
            bodies: HashMap::new(),
        };
        let manifest = write_manifest(
            temp.path(),
            &[r#"{"url":"https://h/a.txt","length":1,"filename":"../../a.txt"}"#],
        );
        let err = prefetch(&session, manifest, &temp.path().join("data"), "x", None).unwrap_err();
        assert_matches!(err, ExportError::Integrity(_));
    }

    #[test]
    fn defer_copies_entries_verbatim() {
        let temp = tempfile::tempdir().unwrap();
        let manifest = write_manifest(
            temp.path(),
            &[
                r#"{"url":"https://h/a.csv","length":"10","filename":"a.csv","sha256":"ff"}"#,
                "",
                r#"{"url":"https://h/b.bin","length":3,"filename":"b.bin"}"#,
            ],
        );
        let manifest_path = manifest.path().to_path_buf();
        let mut deferred = Vec::new();
        let mut recorder = ProvenanceRecorder::new(None);
        let count = defer(manifest, &mut deferred, Some(&mut recorder)).unwrap();

        assert_eq!(count, 2);
        assert_eq!(deferred[0].length, 10);
        assert_eq!(
            deferred[0].extra.get("sha256").and_then(|value| value.as_str()),
            Some("ff")
        );
        assert_eq!(recorder.document().aggregates.len(), 2);
        assert_eq!(recorder.document().aggregates[0].uri, "../data/a.csv");
        assert!(!manifest_path.exists());
    }
}
