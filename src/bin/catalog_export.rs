use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use catalog_export::bag;
use catalog_export::config::{ConfigLoader, Settings};
use catalog_export::domain::Identity;
use catalog_export::error::ExportError;
use catalog_export::output::JsonOutput;
use catalog_export::pipeline::{ExportJob, Pipeline};
use catalog_export::session::HttpConnector;
use catalog_export::store::Store;

#[derive(Parser)]
#[command(name = "catalog-export")]
#[command(about = "Export data-catalog query results as BagIt packages or loose files")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Export the configured queries into a package")]
    Bag(ExportArgs),
    #[command(about = "Export the configured queries as loose files")]
    Files(ExportArgs),
    #[command(about = "Verify a package directory or archive against its checksum manifest")]
    Verify(VerifyArgs),
}

#[derive(Args, Clone)]
struct ExportArgs {
    #[arg(long)]
    config: String,

    #[arg(long)]
    storage: Option<String>,

    /// Identity id of the requesting user, recorded as the output owner.
    #[arg(long)]
    identity: Option<String>,

    #[arg(long)]
    display_name: Option<String>,

    #[arg(long)]
    full_name: Option<String>,

    /// Session cookie forwarded to the catalog when the job has no credentials.
    #[arg(long)]
    cookie: Option<String>,
}

#[derive(Args)]
struct VerifyArgs {
    path: PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<ExportError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &ExportError) -> u8 {
    match error {
        ExportError::Configuration(_) | ExportError::UnsupportedFormat(_) => 2,
        ExportError::UpstreamHttp(_) | ExportError::UpstreamTransport { .. } => 3,
        ExportError::Authentication { .. } => 4,
        ExportError::Integrity(_) => 5,
        ExportError::Storage(_) => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Bag(args) => run_export(args, ExportKind::Bag),
        Commands::Files(args) => run_export(args, ExportKind::Files),
        Commands::Verify(args) => run_verify(args),
    }
}

#[derive(Debug, Clone, Copy)]
enum ExportKind {
    Bag,
    Files,
}

fn run_export(args: ExportArgs, kind: ExportKind) -> miette::Result<()> {
    let config = ConfigLoader::resolve(&args.config)?;
    let settings = Settings::new(args.storage.as_deref(), args.identity.is_some())?;
    let store = Store::new(&settings);
    let (job_id, output_dir) = store.create_job_dir()?;

    let identity = args.identity.map(|id| Identity {
        id,
        full_name: args.full_name,
        display_name: args.display_name,
    });
    let job = ExportJob::new(job_id, output_dir, identity, config).with_cookie(args.cookie);
    let pipeline = Pipeline::new(HttpConnector::new());
    let sink = JsonOutput;
    let outcome = match kind {
        ExportKind::Bag => pipeline.export_bag(&job, &sink)?,
        ExportKind::Files => pipeline.export_files(&job, &sink)?,
    };
    JsonOutput::print_outcome(job_id, &outcome).into_diagnostic()?;
    Ok(())
}

fn run_verify(args: VerifyArgs) -> miette::Result<()> {
    let report = bag::verify_path(&args.path)?;
    JsonOutput::print_verification(&report).into_diagnostic()?;
    if !report.is_valid() {
        return Err(ExportError::Integrity(format!(
            "{} failed verification",
            args.path.display()
        ))
        .into());
    }
    Ok(())
}
