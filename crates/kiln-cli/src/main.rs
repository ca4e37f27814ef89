//! Kiln CLI
//!
//! Developer harness for the kiln pipeline.
//!
//! ## Commands
//!
//! - `package`: Bundle a project directory into a gzip tar archive
//! - `validate`: Check that an archive holds a loadable, callable entrypoint
//! - `run`: Upload, build and execute an archive end-to-end with local stores

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln_core::{
    AgentId, ArtifactIntake, ArtifactPackager, ArtifactValidator, BuildOrchestrator,
    BuildOutcome, CallerId, ExecutionOrchestrator, FsBlobStore, KilnConfig,
};
use kiln_state::fakes::{MemoryExecutionStore, MemoryVersionStore};
use kiln_state::{ExecutionStore, SurrealRecordStore, VersionStore};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build and run agent archives", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Package a project directory into a .tar.gz archive
    Package {
        /// Project directory
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Output archive path (default: <dir>/agent.tar.gz)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate an archive and print the report as JSON
    Validate {
        /// Path to the .tar.gz archive
        archive: PathBuf,
    },

    /// Upload, build and execute an archive, printing the execution as JSON
    Run {
        /// Path to the .tar.gz archive
        archive: PathBuf,

        /// Agent to register the upload under
        #[arg(long, default_value = "1")]
        agent_id: i64,

        /// JSON payload passed to the entrypoint
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Override the execution timeout
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Persist records in SurrealDB instead of memory
        #[arg(long)]
        surreal: bool,

        /// Caller recorded on the execution
        #[arg(long, default_value = "kiln-cli")]
        caller: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    kiln_core::telemetry::init_tracing(cli.json, level);

    let config = KilnConfig::from_env().context("Invalid kiln configuration")?;

    match cli.command {
        Commands::Package { dir, output } => cmd_package(&dir, output.as_deref()),
        Commands::Validate { archive } => cmd_validate(&config, &archive),
        Commands::Run {
            archive,
            agent_id,
            payload,
            timeout_ms,
            surreal,
            caller,
        } => {
            cmd_run(
                &config,
                &archive,
                AgentId(agent_id),
                &payload,
                timeout_ms,
                surreal,
                &caller,
            )
            .await
        }
    }
}

fn cmd_package(dir: &Path, output: Option<&Path>) -> Result<()> {
    let packager = ArtifactPackager::default();
    let summary = match output {
        Some(dest) => packager.package(dir, dest),
        None => packager.package_project(dir, dir),
    }
    .with_context(|| format!("Failed to package {:?}", dir))?;

    for path in &summary.included {
        println!("  + {}", path);
    }
    println!(
        "Packaged {} files ({} excluded) into {:?}",
        summary.included.len(),
        summary.excluded,
        summary.archive_path
    );
    Ok(())
}

fn cmd_validate(config: &KilnConfig, archive: &Path) -> Result<()> {
    std::fs::create_dir_all(&config.scratch_path)
        .with_context(|| format!("Failed to create scratch dir {:?}", config.scratch_path))?;
    let scratch = tempfile::Builder::new()
        .prefix("kiln-validate-")
        .tempdir_in(&config.scratch_path)?;

    let report = ArtifactValidator::new().validate(archive, scratch.path());
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.valid {
        anyhow::bail!("Validation failed");
    }
    Ok(())
}

async fn cmd_run(
    config: &KilnConfig,
    archive: &Path,
    agent_id: AgentId,
    payload: &str,
    timeout_ms: Option<u64>,
    surreal: bool,
    caller: &str,
) -> Result<()> {
    let payload = parse_payload(payload)?;
    let filename = archive
        .file_name()
        .and_then(|n| n.to_str())
        .context("Archive path has no file name")?;
    let bytes =
        std::fs::read(archive).with_context(|| format!("Failed to read {:?}", archive))?;

    let (versions, executions) = open_stores(config, surreal).await?;
    let blobs = Arc::new(
        FsBlobStore::new(config.storage_path.join("blobs"))
            .context("Failed to open blob store")?,
    );

    let intake = ArtifactIntake::new(versions.clone(), blobs.clone(), config.upload_max_bytes);
    let version = intake.accept_upload(agent_id, filename, &bytes).await?;
    info!(version_id = version.id.0, label = %version.version, "archive uploaded");

    let builds = BuildOrchestrator::new(
        versions.clone(),
        blobs.clone(),
        &config.scratch_path,
        config.build_timeout(),
    );
    match builds.process_build(version.id).await? {
        BuildOutcome::Failed { reason } => anyhow::bail!("Build failed: {}", reason),
        outcome => info!(?outcome, "build finished"),
    }

    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.execution_timeout());
    let runner = ExecutionOrchestrator::new(
        versions,
        executions,
        blobs,
        &config.scratch_path,
        timeout,
    );
    let execution = runner
        .execute(agent_id, payload, &CallerId::new(caller))
        .await?;

    println!("{}", serde_json::to_string_pretty(&execution)?);
    kiln_core::metrics::METRICS.flush();
    Ok(())
}

async fn open_stores(
    config: &KilnConfig,
    surreal: bool,
) -> Result<(Arc<dyn VersionStore>, Arc<dyn ExecutionStore>)> {
    if surreal {
        let store = Arc::new(
            SurrealRecordStore::from_env(&config.storage_path)
                .await
                .context("Failed to connect to kiln database")?,
        );
        Ok((store.clone(), store))
    } else {
        Ok((
            Arc::new(MemoryVersionStore::new()),
            Arc::new(MemoryExecutionStore::new()),
        ))
    }
}

fn parse_payload(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("Payload is not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("Payload must be a JSON object");
    }
    Ok(value)
}
