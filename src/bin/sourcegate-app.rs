use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

use sourcegate::app::dispatcher::{
    AttemptDispatcher, ExecutionMode, InProcessDispatcher, WorkerDispatcher, worker_token_from_env,
};
use sourcegate::app::http::{AppState, router};
use sourcegate::app::queue::InProcessQueue;
use sourcegate::app::review::ReviewService;
use sourcegate::app::runner::{CurationRunner, EnvSearchFactory, SearchFactory};
use sourcegate::app::store::{CurationStore, LocalFsCurationStore};
use sourcegate::config::CurationConfig;
use sourcegate::reachability::{ReachabilityChecker, UrlProbe};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    #[arg(long, default_value = "workspace-app")]
    data_dir: PathBuf,

    /// Attempts curated at the same time on this process.
    #[arg(long, default_value_t = 1)]
    max_concurrency: usize,

    /// YAML file with curation settings.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    sourcegate::logging::init()?;

    let args = AppArgs::parse();
    tracing::info!(?args, "starting sourcegate-app");

    let config = CurationConfig::load(args.config.as_deref()).context("load config")?;
    let mode = ExecutionMode::from_env()?;

    let store: Arc<dyn CurationStore> = Arc::new(LocalFsCurationStore::new(&args.data_dir));
    let probe: Arc<dyn UrlProbe> = Arc::new(ReachabilityChecker::new(&config.reachability)?);
    let search: Arc<dyn SearchFactory> = Arc::new(EnvSearchFactory);

    let runner = Arc::new(CurationRunner::new(
        Arc::clone(&store),
        Arc::clone(&probe),
        Arc::clone(&search),
        config.clone(),
    ));
    let local: Arc<dyn AttemptDispatcher> = Arc::new(InProcessDispatcher::new(
        InProcessQueue::new(args.max_concurrency),
        runner,
    ));

    let worker_token = worker_token_from_env();
    let dispatcher: Arc<dyn AttemptDispatcher> = match mode {
        ExecutionMode::InProcess => {
            tracing::info!(max_concurrency = args.max_concurrency, "using in-process queue");
            Arc::clone(&local)
        }
        ExecutionMode::Worker => {
            let worker = WorkerDispatcher::from_env()?;
            tracing::info!("dispatching curation runs to remote worker");
            Arc::new(worker)
        }
    };

    let state = AppState {
        review: Arc::new(ReviewService::new(
            Arc::clone(&store),
            probe,
            config.clone(),
        )),
        store,
        dispatcher,
        local,
        search,
        config,
        worker_token,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
