use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crucible::cache::DataCache;
use crucible::config::Config;
use crucible::dataset::{dataset_read, Dataset};
use crucible::dispatcher::{self, Job};
use crucible::dissemination::distribute_dataset;
use crucible::factory::{FactoryRegistry, MajorityClassFactory, SleepyFactory};
use crucible::worker::{pool, WorkerServer};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Args {
    /// Re-exec entry point used only by a worker's own child-process spawn
    /// path (§4.6): reads one job off stdin, writes its result to stdout.
    /// Never invoked by a user directly, so it stays out of `--help`.
    #[clap(long, hide = true)]
    run_training_job: bool,

    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Disseminates the datasets a job list references, then dispatches
    /// every job round-robin across the resulting roster.
    Coordinator {
        #[clap(long)]
        config: String,
        #[clap(long)]
        jobs: String,
    },
    /// Serves TRAIN_MODEL/SEND_DATASET/RECV_DATASET requests on `listen`.
    Worker {
        #[clap(long)]
        config: String,
        #[clap(long)]
        listen: Option<String>,
    },
}

/// One demonstration job entry: the production job source is external per
/// §1, this is only enough to drive the coordinator end to end.
#[derive(Debug, Clone, Deserialize)]
struct JobSpec {
    factory: String,
    transforms: String,
    dataset_path: String,
}

#[derive(Debug, Deserialize)]
struct JobList {
    jobs: Vec<JobSpec>,
}

fn default_factory_registry() -> FactoryRegistry {
    let mut registry = FactoryRegistry::new();
    registry.register("majority", Arc::new(MajorityClassFactory));
    registry.register("sleepy", Arc::new(SleepyFactory));
    registry
}

/// Datasets travel between CLI invocations as files holding exactly the
/// bytes `dataset_write` would put on the wire -- reusing the crate's own
/// codec rather than a production on-disk format, which is out of scope
/// per §1.
async fn load_dataset(path: &str) -> Result<Dataset> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading dataset file {path}"))?;
    let mut cursor = Cursor::new(bytes);
    Ok(dataset_read(&mut cursor).await?)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn run_coordinator(config_path: String, jobs_path: String) -> Result<()> {
    let config = Config::load(&config_path)?;
    let raw = std::fs::read_to_string(&jobs_path)
        .with_context(|| format!("reading job list {jobs_path}"))?;
    let job_list: JobList = toml::from_str(&raw).context("parsing job list")?;

    let mut by_dataset: HashMap<String, Vec<JobSpec>> = HashMap::new();
    for job in job_list.jobs {
        by_dataset.entry(job.dataset_path.clone()).or_default().push(job);
    }

    for (dataset_path, specs) in by_dataset {
        let dataset = load_dataset(&dataset_path).await?;
        info!(dataset_path, hash = %hex(&dataset.hash), "disseminating dataset");
        let roster = distribute_dataset(&config, &dataset).await?;

        let jobs: Vec<Job> = specs
            .iter()
            .map(|spec| Job {
                factory: spec.factory.clone(),
                transforms: spec.transforms.clone(),
                dataset_hash: dataset.hash,
            })
            .collect();

        let results = dispatcher::dispatch_jobs(&config, &roster.seeded, jobs).await;
        for (spec, result) in specs.iter().zip(results.iter()) {
            println!(
                "{}::{} -> {:?} score={} code={}",
                spec.factory,
                spec.transforms,
                result.response,
                result.score,
                if result.code.is_some() { "present" } else { "discarded" },
            );
        }
    }

    Ok(())
}

async fn run_worker(config_path: String, listen: Option<String>) -> Result<()> {
    let config = Arc::new(Config::load(&config_path)?);
    let listen_addr = listen.unwrap_or_else(|| config.listen_addr.clone());
    let cache = DataCache::new();
    let server = WorkerServer::new(config, cache, default_factory_registry())?;
    let bound = server.bind(listen_addr.clone()).await?;
    info!(addr = %listen_addr, "worker listening");
    bound.serve().await?;
    Ok(())
}

/// The hidden `--run-training-job` mode (§11): not a worker in its own
/// right, just a one-shot wrapper around a single `Factory::train` call so
/// it can be re-exec'd as an isolated child process.
async fn run_training_job_mode() -> Result<()> {
    let timeout = std::env::var("CRUCIBLE_TRAIN_TIMEOUT_MS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(30));

    let mut stdin = tokio::io::stdin();
    let (dataset, factory_name, transforms) = pool::read_job(&mut stdin).await?;

    let registry = default_factory_registry();
    let factory = registry.resolve(&factory_name)?;

    let training = tokio::task::spawn_blocking(move || factory.train(&dataset, &transforms));
    let (node, score) = match tokio::time::timeout(timeout, training).await {
        Ok(Ok(Ok(pair))) => pair,
        Ok(Ok(Err(e))) => return Err(e.into()),
        Ok(Err(_join_err)) => bail!("training task panicked"),
        Err(_elapsed) => bail!("training job exceeded its internal timeout"),
    };

    let mut stdout = tokio::io::stdout();
    pool::write_result(&mut stdout, &node, score).await?;
    stdout.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Writes to stderr, never stdout: the `--run-training-job` mode uses
    // stdout as its wire-protocol channel and logging there would corrupt
    // it (§4.6).
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let args = Args::parse();

    if args.run_training_job {
        return run_training_job_mode().await;
    }

    match args.command {
        Some(Commands::Coordinator { config, jobs }) => run_coordinator(config, jobs).await,
        Some(Commands::Worker { config, listen }) => run_worker(config, listen).await,
        None => bail!("no subcommand given; run with --help"),
    }
}
