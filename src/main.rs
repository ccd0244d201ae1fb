use std::io::Read as _;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use log::info;
use tokio_util::sync::CancellationToken;

use nayduck::admission::{success_response, Request};
use nayduck::blobs;
use nayduck::builder::Builder;
use nayduck::config::{self, BlobStoreConfig, DatabaseConfig, SchedulerConfig};
use nayduck::db::Db;
use nayduck::git::Repo;
use nayduck::nightly;
use nayduck::worker::Worker;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the per-service configuration files.
    /// Defaults to ~/.nayduck.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the build dispatcher daemon.
    Builder {
        /// Process at most one build, then exit.
        #[arg(long)]
        once: bool,
    },
    /// Run the test dispatcher daemon.
    Worker {
        /// Process at most one test, then exit.
        #[arg(long)]
        once: bool,
    },
    /// Run the nightly scheduler.  Exactly one instance of this may run per
    /// deployment.
    Scheduler,
    /// Read a run request as JSON from stdin, schedule it and print the
    /// {"code", "response"} result on stdout.
    Request {
        /// Identity to record as the run's requester.
        #[arg(long)]
        requester: String,
    },
}

/// A token which trips when the process is asked to shut down, so daemon
/// loops can finish the item at hand and exit between items.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            trip.cancel();
        }
    });
    cancel
}

fn open_db(config_dir: &std::path::Path) -> anyhow::Result<Db> {
    let database: DatabaseConfig = config::load(config_dir, "database")?;
    Db::open(&database.path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config_dir = match args.config_dir {
        Some(dir) => dir,
        None => config::default_dir()?,
    };

    match args.command {
        Command::Builder { once } => {
            let db = open_db(&config_dir)?;
            let builder_config = config::load(&config_dir, "builder")?;
            let mut builder = Builder::new(db, builder_config)?;
            builder.run(shutdown_token(), once).await
        }
        Command::Worker { once } => {
            let db = open_db(&config_dir)?;
            let worker_config: config::WorkerConfig = config::load(&config_dir, "worker")?;
            // The blob store is optional kit; without it full logs are
            // simply not archived and only the inline snippets survive.
            let blob_store = match config::load::<BlobStoreConfig>(&config_dir, "blob-store") {
                Ok(blob_config) => Some(blobs::from_config(&blob_config)?),
                Err(_) => None,
            };
            let mut worker = Worker::new(db, worker_config, blob_store)?;
            worker.run(shutdown_token(), once).await
        }
        Command::Scheduler => {
            let mut db = open_db(&config_dir)?;
            let scheduler_config: SchedulerConfig = config::load(&config_dir, "scheduler")?;
            nightly::run(&mut db, &scheduler_config, shutdown_token()).await
        }
        Command::Request { requester } => {
            let mut db = open_db(&config_dir)?;
            let scheduler_config: SchedulerConfig = config::load(&config_dir, "scheduler")?;
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("reading request from stdin")?;

            let response = match serde_json::from_str(&input)
                .map_err(|err| {
                    nayduck::admission::Failure(format!("Invalid JSON: {err}"))
                })
                .and_then(|value| Request::from_value(&value, &requester))
            {
                Ok(request) => {
                    let repo =
                        Repo::new(scheduler_config.repo_url, scheduler_config.repo_dir);
                    match request.schedule(&mut db, &repo, None).await {
                        Ok(run_id) => success_response(&scheduler_config.ui_url, run_id),
                        Err(failure) => failure.to_response(),
                    }
                }
                Err(failure) => failure.to_response(),
            };
            println!("{response}");
            Ok(())
        }
    }
}
