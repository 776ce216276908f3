use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;

use crate::app::model::StartCurationRequest;
use crate::app::store::CurationStore;
use crate::cli::SearchEngine;
use crate::config::CurationConfig;
use crate::coverage;
use crate::formats::{CurationAttempt, LogEntry, LogEntryType};
use crate::gating;
use crate::orchestrator::{CurationSummary, IntegrityError, Orchestrator};
use crate::reachability::UrlProbe;
use crate::search::{GenerativeSearch, NoopSearch};
use crate::state::AttemptState;

/// Builds the generative-search backend for a request's engine.
pub trait SearchFactory: Send + Sync {
    fn build(&self, engine: SearchEngine) -> anyhow::Result<Arc<dyn GenerativeSearch>>;
}

/// `openai` reads its credentials from the environment on every run.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSearchFactory;

impl SearchFactory for EnvSearchFactory {
    fn build(&self, engine: SearchEngine) -> anyhow::Result<Arc<dyn GenerativeSearch>> {
        match engine {
            SearchEngine::Noop => Ok(Arc::new(NoopSearch)),
            SearchEngine::Openai => {
                let config = crate::openai::OpenAiConfig::from_env()?;
                Ok(Arc::new(crate::openai::OpenAiSearch::new(&config)?))
            }
        }
    }
}

/// Always hands out the same backend, whatever the request asks for.
#[derive(Clone)]
pub struct FixedSearchFactory(pub Arc<dyn GenerativeSearch>);

impl SearchFactory for FixedSearchFactory {
    fn build(&self, _engine: SearchEngine) -> anyhow::Result<Arc<dyn GenerativeSearch>> {
        Ok(Arc::clone(&self.0))
    }
}

/// How a single [`CurationRunner::run_attempt`] call ended.
#[derive(Debug)]
pub enum RunOutcome {
    Generated(CurationSummary),
    /// Duplicate run, vanished attempt, or an attempt reset mid-run.
    Skipped,
    Failed(String),
}

pub struct CurationRunner {
    store: Arc<dyn CurationStore>,
    probe: Arc<dyn UrlProbe>,
    search: Arc<dyn SearchFactory>,
    config: CurationConfig,
}

impl CurationRunner {
    pub fn new(
        store: Arc<dyn CurationStore>,
        probe: Arc<dyn UrlProbe>,
        search: Arc<dyn SearchFactory>,
        config: CurationConfig,
    ) -> Self {
        Self {
            store,
            probe,
            search,
            config,
        }
    }

    /// Worker entry point. Never returns an error: failures end up as persisted
    /// attempt state and are reported back as [`RunOutcome::Failed`].
    pub async fn run_attempt(&self, attempt_id: &str) -> RunOutcome {
        match self.try_run_attempt(attempt_id).await {
            Ok(None) => RunOutcome::Skipped,
            Ok(Some(summary)) => {
                tracing::info!(
                    attempt_id,
                    covered = summary.coverage.covered,
                    total = summary.coverage.total,
                    "attempt generated"
                );
                RunOutcome::Generated(summary)
            }
            Err(err) => {
                if let Some(IntegrityError::AttemptVanished(_)) = err.downcast_ref::<IntegrityError>()
                {
                    tracing::warn!(attempt_id, "attempt deleted while running; worker stopped");
                    return RunOutcome::Skipped;
                }
                tracing::error!(attempt_id, ?err, "curation run failed");
                let message = format!("{err:#}");
                if let Err(mark_err) = self.mark_blocked(attempt_id, message.clone()).await {
                    tracing::error!(attempt_id, error = ?mark_err, "could not mark attempt as blocked");
                }
                RunOutcome::Failed(message)
            }
        }
    }

    async fn try_run_attempt(&self, attempt_id: &str) -> anyhow::Result<Option<CurationSummary>> {
        let mut attempt = self
            .store
            .get(attempt_id)
            .await
            .context("load attempt")?
            .ok_or_else(|| IntegrityError::AttemptVanished(attempt_id.to_owned()))?;
        let request = self
            .store
            .get_request(attempt_id)
            .await
            .context("load request")?
            .ok_or_else(|| anyhow::anyhow!("request not found: {attempt_id}"))?;

        if attempt.state == AttemptState::Generating {
            tracing::warn!(attempt_id, "attempt is already generating; ignoring duplicate run");
            return Ok(None);
        }
        attempt.state = attempt.state.transition(AttemptState::Generating)?;
        attempt.updated_at = Utc::now();
        self.store.put(&attempt).await.context("save attempt")?;

        let search = self.search.build(request.engine).context("build search backend")?;
        let orchestrator = Orchestrator::new(
            Arc::clone(&self.store),
            search,
            Arc::clone(&self.probe),
            self.config.clone(),
        );
        let summary = orchestrator
            .run(attempt_id, request.display_title(), &request.components)
            .await?;

        let mut attempt = self
            .store
            .get(attempt_id)
            .await
            .context("reload attempt")?
            .ok_or_else(|| IntegrityError::AttemptVanished(attempt_id.to_owned()))?;
        if attempt.state != AttemptState::Generating {
            tracing::warn!(attempt_id, state = ?attempt.state, "attempt was reset while running; results left as written");
            return Ok(None);
        }
        attempt.state = attempt.state.transition(AttemptState::Generated)?;
        attempt.updated_at = Utc::now();
        self.store.put(&attempt).await.context("save attempt")?;

        self.record_gaps(&attempt, &request).await?;
        Ok(Some(summary))
    }

    async fn record_gaps(
        &self,
        attempt: &CurationAttempt,
        request: &StartCurationRequest,
    ) -> anyhow::Result<()> {
        let rows = self
            .store
            .list_rows(&attempt.attempt_id)
            .await
            .context("list rows")?;
        let gaps = coverage::detect_gaps(&rows, &request.components);
        for gap in &gaps {
            let entry = LogEntry::new(
                LogEntryType::Gap,
                format!("{}: {:?} ({})", gap.key(), gap.reason, gap.details),
            );
            self.store
                .append_log(&attempt.attempt_id, &entry)
                .await
                .context("append gap")?;
        }

        let next = gating::should_enable_attempt2(attempt, &gaps, self.config.max_attempts);
        let message = if next.enabled {
            format!("review the sources; a further attempt is available ({})", next.reason)
        } else {
            format!("review the sources ({})", next.reason)
        };
        self.store
            .append_log(
                &attempt.attempt_id,
                &LogEntry::new(LogEntryType::NextStep, message),
            )
            .await
            .context("append next step")?;
        Ok(())
    }

    async fn mark_blocked(&self, attempt_id: &str, message: String) -> anyhow::Result<()> {
        let Some(mut attempt) = self.store.get(attempt_id).await? else {
            return Ok(());
        };
        // Only a run that got as far as GENERATING owns the attempt state.
        if attempt.state == AttemptState::Generating {
            attempt.state = AttemptState::Blocked;
            attempt.updated_at = Utc::now();
            self.store.put(&attempt).await?;
        }
        self.store
            .append_log(
                attempt_id,
                &LogEntry::new(LogEntryType::Note, format!("curation run failed: {message}")),
            )
            .await?;
        Ok(())
    }
}

/// Persists a new attempt in DRAFT for `request`.
pub async fn create_attempt(
    store: &dyn CurationStore,
    request: &StartCurationRequest,
) -> anyhow::Result<CurationAttempt> {
    request.validate()?;
    let now = Utc::now();
    let attempt = CurationAttempt {
        attempt_id: uuid::Uuid::new_v4().to_string(),
        course_id: request.course_id.trim().to_owned(),
        attempt_number: 1,
        state: AttemptState::Draft,
        qa_decision: None,
        created_at: now,
        updated_at: now,
    };
    store
        .create(&attempt, request)
        .await
        .context("create attempt")?;
    store
        .append_log(
            &attempt.attempt_id,
            &LogEntry::new(
                LogEntryType::Note,
                format!(
                    "attempt created for {} component(s)",
                    coverage::unique_components(&request.components).len()
                ),
            ),
        )
        .await
        .context("append log")?;
    Ok(attempt)
}
