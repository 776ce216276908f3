mod openai_stub;

use std::sync::Arc;
use std::time::Duration;

use openai_stub::{OpenAiStub, OpenAiStubConfig, SiteStub};
use sourcegate::app::model::StartCurationRequest;
use sourcegate::app::runner::{CurationRunner, FixedSearchFactory, create_attempt};
use sourcegate::app::store::{CurationStore, LocalFsCurationStore};
use sourcegate::cli::SearchEngine;
use sourcegate::config::CurationConfig;
use sourcegate::formats::{AutoReason, LogEntryType, RequiredComponent, UrlStatus};
use sourcegate::openai::{OpenAiConfig, OpenAiSearch};
use sourcegate::orchestrator::Orchestrator;
use sourcegate::reachability::{ReachabilityChecker, UrlProbe};
use sourcegate::search::GenerativeSearch;
use sourcegate::state::AttemptState;
use sourcegate::validation::Validator;

fn component(lesson_id: &str, name: &str, critical: bool) -> RequiredComponent {
    RequiredComponent {
        lesson_id: lesson_id.to_owned(),
        lesson_title: format!("Lesson {lesson_id}"),
        component_name: name.to_owned(),
        is_critical: critical,
    }
}

fn fast_config() -> CurationConfig {
    let mut config = CurationConfig::default();
    config.inter_batch_delay_ms = 0;
    config.ladder_backoff_ms = 0;
    config.recovery.inter_batch_delay_ms = 0;
    config.recovery.ladder_backoff_ms = 0;
    config.reachability.timeout_ms = 3000;
    config
}

fn search_for(stub: &OpenAiStub) -> Arc<dyn GenerativeSearch> {
    let config = OpenAiConfig {
        base_url: stub.base_url.clone(),
        api_key: "test-key".to_owned(),
        timeout: Duration::from_secs(10),
    };
    Arc::new(OpenAiSearch::new(&config).expect("build openai search"))
}

fn probe(config: &CurationConfig) -> Arc<dyn UrlProbe> {
    Arc::new(ReachabilityChecker::new(&config.reachability).expect("build checker"))
}

async fn new_attempt(
    store: &dyn CurationStore,
    components: Vec<RequiredComponent>,
) -> anyhow::Result<String> {
    let request = StartCurationRequest {
        course_id: "course-1".to_owned(),
        course_title: "Intro to Networking".to_owned(),
        components,
        engine: SearchEngine::Openai,
        autostart: false,
    };
    Ok(create_attempt(store, &request).await?.attempt_id)
}

#[tokio::test]
async fn worker_curates_probes_classifies_and_records_gaps() -> anyhow::Result<()> {
    let site = SiteStub::spawn();
    let mut stub_config = OpenAiStubConfig::new(&site.base_url);
    stub_config.silent_components = vec!["Video".to_owned()];
    let stub = OpenAiStub::spawn(stub_config);

    let temp = tempfile::tempdir()?;
    let store: Arc<dyn CurationStore> = Arc::new(LocalFsCurationStore::new(temp.path()));
    let config = fast_config();
    let attempt_id = new_attempt(
        store.as_ref(),
        vec![
            component("L1", "Reading", true),
            component("L1", "Login portal", false),
            component("L2", "Missing page", false),
            component("L2", "Video", false),
        ],
    )
    .await?;

    let runner = CurationRunner::new(
        Arc::clone(&store),
        probe(&config),
        Arc::new(FixedSearchFactory(search_for(&stub))),
        config,
    );
    runner.run_attempt(&attempt_id).await;

    let attempt = store.get(&attempt_id).await?.expect("attempt");
    assert_eq!(attempt.state, AttemptState::Generated);

    let rows = store.list_rows(&attempt_id).await?;
    let reading = rows
        .iter()
        .find(|r| r.component_name == "READING")
        .expect("reading row");
    assert_eq!(reading.url_status, UrlStatus::Ok);
    assert_eq!(reading.apta, None);
    assert!(reading.source_ref.starts_with(&site.base_url));

    // 401 is kept, auto-rejected, so a reviewer can still override it.
    let login = rows
        .iter()
        .find(|r| r.component_name == "LOGIN PORTAL")
        .expect("login row");
    assert_eq!(login.url_status, UrlStatus::AuthRequired);
    assert_eq!(login.apta, Some(false));
    assert_eq!(login.auto_reason, Some(AutoReason::Http401));
    assert!(login.has_rejection_reason());

    // 404 candidates never become rows. Keys are stored upper-cased.
    assert!(!rows.iter().any(|r| r.component_name == "MISSING PAGE"));
    assert!(!rows.iter().any(|r| r.component_name == "VIDEO"));

    let log = store.list_log(&attempt_id).await?;
    let gaps = log
        .iter()
        .filter(|e| e.entry_type == LogEntryType::Gap)
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>();
    assert_eq!(gaps.len(), 3, "{gaps:?}");
    assert!(gaps[0].starts_with("L1/LOGIN PORTAL"));
    assert!(log.iter().any(|e| e.entry_type == LogEntryType::Discard));
    assert!(log.iter().any(|e| e.entry_type == LogEntryType::NextStep));
    Ok(())
}

#[tokio::test]
async fn ladder_walks_down_to_the_secondary_model() -> anyhow::Result<()> {
    let site = SiteStub::spawn();
    let mut stub_config = OpenAiStubConfig::new(&site.base_url);
    stub_config.fail_first = 2;
    let stub = OpenAiStub::spawn(stub_config);

    let temp = tempfile::tempdir()?;
    let store: Arc<dyn CurationStore> = Arc::new(LocalFsCurationStore::new(temp.path()));
    let mut config = fast_config();
    config.recovery.enabled = false;
    let required = vec![component("L1", "Reading", false)];
    let attempt_id = new_attempt(store.as_ref(), required.clone()).await?;

    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        search_for(&stub),
        probe(&config),
        config.clone(),
    );
    let summary = orchestrator.run(&attempt_id, "Course", &required).await?;
    assert_eq!(summary.batches_run, 1);
    assert_eq!(summary.batches_failed, 0);
    assert_eq!(summary.coverage.covered, 1);

    let calls = stub.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].model, config.ladder.primary_model);
    assert_eq!(calls[1].model, config.ladder.primary_model);
    assert_eq!(calls[2].model, config.ladder.secondary_model);
    let temps = calls
        .iter()
        .map(|c| c.temperature.expect("temperature sent"))
        .collect::<Vec<_>>();
    assert!((temps[0] - 0.7).abs() < 1e-3);
    assert!((temps[1] - 0.2).abs() < 1e-3);
    assert!((temps[2] - 1.0).abs() < 1e-3);
    Ok(())
}

#[tokio::test]
async fn unparseable_text_falls_back_to_attested_citations() -> anyhow::Result<()> {
    let site = SiteStub::spawn();
    let mut stub_config = OpenAiStubConfig::new(&site.base_url);
    stub_config.garble_text = true;
    let stub = OpenAiStub::spawn(stub_config);

    let temp = tempfile::tempdir()?;
    let store: Arc<dyn CurationStore> = Arc::new(LocalFsCurationStore::new(temp.path()));
    let mut config = fast_config();
    config.recovery.enabled = false;
    let required = vec![component("L1", "Reading", false)];
    let attempt_id = new_attempt(store.as_ref(), required.clone()).await?;

    let summary = Orchestrator::new(
        Arc::clone(&store),
        search_for(&stub),
        probe(&config),
        config,
    )
    .run(&attempt_id, "Course", &required)
    .await?;
    assert_eq!(summary.parse_fallbacks, 1);

    let rows = store.list_rows(&attempt_id).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].url_status, UrlStatus::Ok);
    Ok(())
}

#[tokio::test]
async fn deleted_attempt_stops_the_worker_quietly() -> anyhow::Result<()> {
    let site = SiteStub::spawn();
    let stub = OpenAiStub::spawn(OpenAiStubConfig::new(&site.base_url));

    let temp = tempfile::tempdir()?;
    let store: Arc<dyn CurationStore> = Arc::new(LocalFsCurationStore::new(temp.path()));
    let config = fast_config();
    let attempt_id = new_attempt(store.as_ref(), vec![component("L1", "Reading", false)]).await?;
    store.delete(&attempt_id).await?;

    let runner = CurationRunner::new(
        Arc::clone(&store),
        probe(&config),
        Arc::new(FixedSearchFactory(search_for(&stub))),
        config,
    );
    runner.run_attempt(&attempt_id).await;

    assert!(store.get(&attempt_id).await?.is_none());
    assert!(stub.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn validation_marks_weak_sources_and_releases_the_lease() -> anyhow::Result<()> {
    let site = SiteStub::spawn();
    let mut stub_config = OpenAiStubConfig::new(&site.base_url);
    stub_config.covers = false;
    let stub = OpenAiStub::spawn(stub_config);

    let temp = tempfile::tempdir()?;
    let store: Arc<dyn CurationStore> = Arc::new(LocalFsCurationStore::new(temp.path()));
    let mut config = fast_config();
    config.recovery.enabled = false;
    let required = vec![component("L1", "Reading", false)];
    let attempt_id = new_attempt(store.as_ref(), required.clone()).await?;
    Orchestrator::new(
        Arc::clone(&store),
        search_for(&stub),
        probe(&config),
        config.clone(),
    )
    .run(&attempt_id, "Course", &required)
    .await?;

    let outcome = Validator::new(Arc::clone(&store), search_for(&stub), config)
        .run(&attempt_id, "validator-1")
        .await?;
    assert_eq!(outcome.rows_judged, 1);
    assert_eq!(outcome.not_covering, 1);

    let rows = store.list_rows(&attempt_id).await?;
    assert_eq!(rows[0].coverage_complete, Some(false));
    assert!(store.get_lease(&attempt_id).await?.is_none());
    let log = store.list_log(&attempt_id).await?;
    assert!(
        log.iter()
            .any(|e| e.entry_type == LogEntryType::NextStep && e.message.contains("L1/READING"))
    );
    Ok(())
}
