//! Bodies of the `sourcegate` subcommands. Each one wires the same services the
//! HTTP app uses against a local data directory and prints JSON to stdout.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;

use crate::app::model::StartCurationRequest;
use crate::app::review::ReviewService;
use crate::app::runner::{
    CurationRunner, EnvSearchFactory, FixedSearchFactory, RunOutcome, SearchFactory,
    create_attempt,
};
use crate::app::store::{CurationStore, LocalFsCurationStore};
use crate::cli::{AttemptArgs, CheckArgs, CurateArgs, InitArgs, ValidateArgs};
use crate::config::CurationConfig;
use crate::coverage::{self, CoverageSummary, Gap};
use crate::formats::{CurationAttempt, RequiredComponent};
use crate::reachability::{ReachabilityChecker, UrlProbe};
use crate::validation::Validator;

pub async fn check(config: &CurationConfig, args: CheckArgs) -> anyhow::Result<()> {
    let checker = ReachabilityChecker::new(&config.reachability)?;
    let report = checker.check(&args.url).await;
    print_json(&report)
}

pub async fn init(args: InitArgs) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&args.components)
        .with_context(|| format!("read components: {}", args.components.display()))?;
    let components: Vec<RequiredComponent> = serde_json::from_str(&raw)
        .with_context(|| format!("parse components: {}", args.components.display()))?;

    let course_id = match args.course_id {
        Some(id) => id,
        None => args
            .components
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_owned)
            .context("cannot derive course id; pass --course-id")?,
    };
    let request = StartCurationRequest {
        course_id,
        course_title: args.title.unwrap_or_default(),
        components,
        engine: args.engine,
        autostart: false,
    };

    let store = LocalFsCurationStore::new(&args.data_dir);
    let attempt = create_attempt(&store, &request).await?;
    tracing::info!(attempt_id = %attempt.attempt_id, data_dir = %args.data_dir.display(), "attempt created");
    println!("{}", attempt.attempt_id);
    Ok(())
}

#[derive(Debug, Serialize)]
struct CurateReport {
    attempt: CurationAttempt,
    coverage: CoverageSummary,
    gaps: Vec<Gap>,
}

pub async fn curate(config: &CurationConfig, args: CurateArgs) -> anyhow::Result<()> {
    let store = open_store(&args.target.data_dir);
    let probe: Arc<dyn UrlProbe> = Arc::new(ReachabilityChecker::new(&config.reachability)?);
    let search = search_factory(args.engine)?;
    let runner = CurationRunner::new(Arc::clone(&store), probe, search, config.clone());
    let outcome = runner.run_attempt(&args.target.attempt).await;

    let (attempt, request) = load(store.as_ref(), &args.target.attempt).await?;
    let rows = store.list_rows(&attempt.attempt_id).await?;
    let report = CurateReport {
        coverage: coverage::strict_summary(&rows, &request.components),
        gaps: coverage::detect_gaps(&rows, &request.components),
        attempt,
    };
    print_json(&report)?;
    if let RunOutcome::Failed(message) = outcome {
        anyhow::bail!(
            "curation run failed; attempt {} is {:?}: {message}",
            report.attempt.attempt_id,
            report.attempt.state
        );
    }
    Ok(())
}

pub async fn gaps(config: &CurationConfig, args: AttemptArgs) -> anyhow::Result<()> {
    let review = review_service(config, &args.data_dir)?;
    let gaps = review.gaps(&args.attempt).await?;
    print_json(&gaps)
}

pub async fn dod(config: &CurationConfig, args: AttemptArgs) -> anyhow::Result<()> {
    let review = review_service(config, &args.data_dir)?;
    let report = review.dod(&args.attempt).await?;
    print_json(&report)
}

pub async fn validate(config: &CurationConfig, args: ValidateArgs) -> anyhow::Result<()> {
    let store = open_store(&args.target.data_dir);
    let (_, request) = load(store.as_ref(), &args.target.attempt).await?;
    let search = search_factory(args.engine)?.build(request.engine)?;
    let owner = args
        .owner
        .unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4()));
    let outcome = Validator::new(store, search, config.clone())
        .run(&args.target.attempt, &owner)
        .await?;
    print_json(&outcome)
}

fn open_store(data_dir: &Path) -> Arc<dyn CurationStore> {
    Arc::new(LocalFsCurationStore::new(data_dir))
}

fn review_service(config: &CurationConfig, data_dir: &Path) -> anyhow::Result<ReviewService> {
    let probe: Arc<dyn UrlProbe> = Arc::new(ReachabilityChecker::new(&config.reachability)?);
    Ok(ReviewService::new(open_store(data_dir), probe, config.clone()))
}

fn search_factory(
    engine: Option<crate::cli::SearchEngine>,
) -> anyhow::Result<Arc<dyn SearchFactory>> {
    Ok(match engine {
        Some(engine) => Arc::new(FixedSearchFactory(EnvSearchFactory.build(engine)?)),
        None => Arc::new(EnvSearchFactory),
    })
}

async fn load(
    store: &dyn CurationStore,
    attempt_id: &str,
) -> anyhow::Result<(CurationAttempt, StartCurationRequest)> {
    let attempt = store
        .get(attempt_id)
        .await?
        .with_context(|| format!("attempt not found: {attempt_id}"))?;
    let request = store
        .get_request(attempt_id)
        .await?
        .with_context(|| format!("request not found: {attempt_id}"))?;
    Ok((attempt, request))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}
