use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, error, info, info_span};
use uuid::Uuid;

use crate::bag::{PROFILE_KEY, Package, SENDER_ID_KEY};
use crate::config::ResolvedJob;
use crate::domain::{CatalogEndpoint, Credentials, Identity, QuerySpec, RemoteFileRef};
use crate::error::ExportError;
use crate::format::{self, ACCEPT_JSON, PostProcess};
use crate::fs_util::{self, TransientFile};
use crate::provenance::{ProvenanceRecorder, RO_PROFILE_ID, payload_uri};
use crate::session::{CatalogSession, Connector};
use crate::store::Store;
use crate::{fasta, manifest, media};

const PREFETCH_MANIFEST_NAME: &str = "prefetch-manifest";
const FETCH_MANIFEST_NAME: &str = "fetch-manifest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Retrieving(usize),
    Finalizing,
    Archived,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Created => write!(f, "created"),
            JobState::Retrieving(index) => write!(f, "retrieving({index})"),
            JobState::Finalizing => write!(f, "finalizing"),
            JobState::Archived => write!(f, "archived"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub state: JobState,
    pub message: String,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// One export request, bound to the directory its output goes into.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub id: Uuid,
    pub output_dir: Utf8PathBuf,
    pub identity: Option<Identity>,
    pub credentials: Credentials,
    pub config: ResolvedJob,
}

impl ExportJob {
    pub fn new(
        id: Uuid,
        output_dir: Utf8PathBuf,
        identity: Option<Identity>,
        config: ResolvedJob,
    ) -> Self {
        let credentials = config.credentials.clone();
        Self {
            id,
            output_dir,
            identity,
            credentials,
            config,
        }
    }

    /// Forwards the caller's session cookie when the job itself carries no credentials.
    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        let cookie = cookie.filter(|cookie| !cookie.trim().is_empty());
        if let Some(cookie) = cookie
            && self.credentials == Credentials::Anonymous
        {
            self.credentials = Credentials::Cookie(cookie);
        }
        self
    }

    fn username(&self) -> Option<&str> {
        self.credentials.username()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportOutcome {
    Archive(PathBuf),
    Directory(PathBuf),
    Files(Vec<PathBuf>),
}

#[derive(Clone)]
pub struct Pipeline<C: Connector> {
    connector: C,
}

impl<C: Connector> Pipeline<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    /// Runs every query into a fresh package and finalizes it.
    ///
    /// Any failure removes the package directory before the error is returned.
    pub fn export_bag(
        &self,
        job: &ExportJob,
        sink: &dyn ProgressSink,
    ) -> Result<ExportOutcome, ExportError> {
        let span = info_span!("export", job = %job.id);
        let _enter = span.enter();
        self.tracked(job, sink, |pipeline| pipeline.run_bag(job, sink))
    }

    /// Writes csv/json/fasta results straight into the job directory.
    ///
    /// All-or-nothing: on failure every file written so far is removed.
    pub fn export_files(
        &self,
        job: &ExportJob,
        sink: &dyn ProgressSink,
    ) -> Result<ExportOutcome, ExportError> {
        let span = info_span!("export", job = %job.id);
        let _enter = span.enter();
        self.tracked(job, sink, |pipeline| pipeline.run_files(job, sink))
    }

    fn tracked<F>(
        &self,
        job: &ExportJob,
        sink: &dyn ProgressSink,
        run: F,
    ) -> Result<ExportOutcome, ExportError>
    where
        F: FnOnce(&Self) -> Result<ExportOutcome, ExportError>,
    {
        let started = Instant::now();
        notify(sink, job, JobState::Created, "job accepted");
        match run(self) {
            Ok(outcome) => {
                info!(elapsed = ?started.elapsed(), "export complete");
                notify(sink, job, JobState::Archived, "export complete");
                Ok(outcome)
            }
            Err(err) => {
                error!(kind = err.kind(), error = %err, "export failed");
                notify(sink, job, JobState::Failed, &err.to_string());
                Err(err)
            }
        }
    }

    fn run_bag(&self, job: &ExportJob, sink: &dyn ProgressSink) -> Result<ExportOutcome, ExportError> {
        let config = &job.config;
        let root = fs_util::safe_join(job.output_dir.as_std_path(), &config.package.name)
            .ok_or_else(|| {
                ExportError::Configuration(format!(
                    "invalid package name: {}",
                    config.package.name
                ))
            })?;
        Store::write_access_descriptor(&job.output_dir, job.identity.as_ref(), job.username())?;

        let session = self.connector.connect(&config.endpoint.host, &job.credentials)?;
        info!(host = %config.endpoint.host, "catalog session opened");

        let package = Package::begin(&root, package_metadata(job))?;
        let mut recorder = config
            .package
            .create_ro_metadata
            .then(|| ProvenanceRecorder::for_caller(job.identity.as_ref(), job.username()));
        let mut deferred = Vec::new();

        for (index, query) in config.queries.iter().enumerate() {
            notify(sink, job, JobState::Retrieving(index), &query.query_path);
            retrieve_into_package(
                &session,
                &config.endpoint,
                query,
                &package,
                recorder.as_mut(),
                &mut deferred,
            )?;
        }

        notify(sink, job, JobState::Finalizing, "writing package");
        let archiver = config.package.archiver;
        let path = package.finalize(
            &deferred,
            recorder.map(ProvenanceRecorder::into_document),
            archiver,
        )?;
        Ok(match archiver {
            Some(_) => ExportOutcome::Archive(path),
            None => ExportOutcome::Directory(path),
        })
    }

    fn run_files(&self, job: &ExportJob, sink: &dyn ProgressSink) -> Result<ExportOutcome, ExportError> {
        let config = &job.config;
        if let Some(query) = config
            .queries
            .iter()
            .find(|query| format::plan(query.output_format).is_manifest())
        {
            return Err(ExportError::UnsupportedFormat(format!(
                "{} is not available for file export",
                query.output_format
            )));
        }
        Store::write_access_descriptor(&job.output_dir, job.identity.as_ref(), job.username())?;

        let session = self.connector.connect(&config.endpoint.host, &job.credentials)?;
        info!(host = %config.endpoint.host, "catalog session opened");

        let base = job.output_dir.as_std_path();
        let mut written = WrittenFiles::default();
        for (index, query) in config.queries.iter().enumerate() {
            notify(sink, job, JobState::Retrieving(index), &query.query_path);
            retrieve_data_file(&session, &config.endpoint, query, base, &mut written.paths)?;
            if let Some(schema_path) = &query.schema_path {
                retrieve_schema(
                    &session,
                    &config.endpoint,
                    query,
                    schema_path,
                    base,
                    &mut written.paths,
                )?;
            }
        }
        notify(sink, job, JobState::Finalizing, "files written");
        Ok(ExportOutcome::Files(written.commit()))
    }
}

fn notify(sink: &dyn ProgressSink, job: &ExportJob, state: JobState, message: &str) {
    debug!(%state, message, "job state");
    sink.event(ProgressEvent {
        job_id: job.id,
        state,
        message: message.to_string(),
    });
}

/// Caller metadata, or the sender identifier when none was supplied, plus the
/// profile tag when provenance is written.
fn package_metadata(job: &ExportJob) -> BTreeMap<String, String> {
    let mut metadata = job.config.package.metadata.clone();
    if metadata.is_empty() {
        metadata.insert(SENDER_ID_KEY.to_string(), format!("export:{}", job.id));
    }
    if job.config.package.create_ro_metadata {
        metadata
            .entry(PROFILE_KEY.to_string())
            .or_insert_with(|| RO_PROFILE_ID.to_string());
    }
    metadata
}

fn retrieve_into_package<S: CatalogSession>(
    session: &S,
    endpoint: &CatalogEndpoint,
    query: &QuerySpec,
    package: &Package,
    mut recorder: Option<&mut ProvenanceRecorder>,
    deferred: &mut Vec<RemoteFileRef>,
) -> Result<(), ExportError> {
    let plan = format::plan(query.output_format);
    let url = endpoint.url_for(&query.query_path);
    let payload = package.payload_dir();

    let about = match plan.post {
        PostProcess::None | PostProcess::Fasta => {
            let (relative, _) =
                retrieve_data_file(session, endpoint, query, &payload, &mut Vec::new())?;
            if let Some(recorder) = recorder.as_deref_mut() {
                let (mediatype, conforms_to) = media::describe(&relative, &relative);
                recorder.add_aggregate(payload_uri(&relative), mediatype, conforms_to, &url);
            }
            relative
        }
        PostProcess::Prefetch => {
            let manifest = fetch_manifest(session, &url, query, package, PREFETCH_MANIFEST_NAME)?;
            manifest::prefetch(
                session,
                manifest,
                &payload,
                &query.output_path,
                recorder.as_deref_mut(),
            )?;
            query.output_path.clone()
        }
        PostProcess::Defer => {
            let manifest = fetch_manifest(session, &url, query, package, FETCH_MANIFEST_NAME)?;
            manifest::defer(manifest, deferred, recorder.as_deref_mut())?;
            query.output_path.clone()
        }
    };

    if let Some(schema_path) = &query.schema_path {
        let (schema_relative, _) =
            retrieve_schema(session, endpoint, query, schema_path, &payload, &mut Vec::new())?;
        if let Some(recorder) = recorder {
            recorder.add_aggregate(
                payload_uri(&schema_relative),
                Some(ACCEPT_JSON.to_string()),
                media::conforms_to("json"),
                &endpoint.url_for(schema_path),
            );
            recorder.add_annotation(payload_uri(&about), payload_uri(&schema_relative));
        }
    }
    Ok(())
}

/// Downloads a csv/json/fasta result below `base`, returning its relative and absolute path.
///
/// Every path is appended to `produced` before it is written.
fn retrieve_data_file<S: CatalogSession>(
    session: &S,
    endpoint: &CatalogEndpoint,
    query: &QuerySpec,
    base: &Path,
    produced: &mut Vec<PathBuf>,
) -> Result<(String, PathBuf), ExportError> {
    let plan = format::plan(query.output_format);
    let extension = plan.extension.unwrap_or_default();
    let url = endpoint.url_for(&query.query_path);
    let relative = query.final_output_path(extension);
    let destination = resolve_output(base, &relative)?;

    if plan.post != PostProcess::Fasta {
        produced.push(destination.clone());
        let bytes = session.fetch(&url, &destination, Some(plan.accept))?;
        info!(url = %url, path = %relative, bytes, "query result retrieved");
        return Ok((relative, destination));
    }

    let intermediate = TransientFile::new(&destination);
    let bytes = session.fetch(&url, intermediate.path(), Some(plan.accept))?;
    debug!(url = %url, bytes, "fasta input retrieved");
    let fasta_relative = query.final_output_path(".fasta");
    let fasta_destination = resolve_output(base, &fasta_relative)?;
    produced.push(fasta_destination.clone());
    fasta::convert_file(intermediate.path(), &fasta_destination, &query.format_params)?;
    info!(url = %url, path = %fasta_relative, "fasta written");
    Ok((fasta_relative, fasta_destination))
}

fn retrieve_schema<S: CatalogSession>(
    session: &S,
    endpoint: &CatalogEndpoint,
    query: &QuerySpec,
    schema_path: &str,
    base: &Path,
    produced: &mut Vec<PathBuf>,
) -> Result<(String, PathBuf), ExportError> {
    let url = endpoint.url_for(schema_path);
    let relative = query.schema_file_name();
    let destination = resolve_output(base, &relative)?;
    produced.push(destination.clone());
    session.fetch(&url, &destination, Some(ACCEPT_JSON))?;
    info!(url = %url, path = %relative, "schema retrieved");
    Ok((relative, destination))
}

fn fetch_manifest<S: CatalogSession>(
    session: &S,
    url: &str,
    query: &QuerySpec,
    package: &Package,
    default_name: &str,
) -> Result<TransientFile, ExportError> {
    let name = format!("{}.json", query.output_name.as_deref().unwrap_or(default_name));
    let manifest = TransientFile::new(resolve_output(package.root(), &name)?);
    session.fetch(url, manifest.path(), Some(format::ACCEPT_JSON_STREAM))?;
    Ok(manifest)
}

fn resolve_output(base: &Path, relative: &str) -> Result<PathBuf, ExportError> {
    fs_util::safe_join(base, relative).ok_or_else(|| {
        ExportError::Configuration(format!("output path escapes the export directory: {relative}"))
    })
}

/// Files produced by a loose-file export; removed on drop unless committed.
#[derive(Debug, Default)]
struct WrittenFiles {
    paths: Vec<PathBuf>,
    committed: bool,
}

impl WrittenFiles {
    fn commit(mut self) -> Vec<PathBuf> {
        self.committed = true;
        std::mem::take(&mut self.paths)
    }
}

impl Drop for WrittenFiles {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for path in self.paths.iter().rev() {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed partial output"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => error!(path = %path.display(), error = %err, "failed to remove partial output"),
            }
        }
    }
}
