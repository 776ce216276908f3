use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::app::store::CurationStore;
use crate::classify;
use crate::config::{AlternatesPolicy, CurationConfig};
use crate::coverage::{self, CoverageSummary};
use crate::formats::{ComponentKey, LogEntry, LogEntryType, RequiredComponent, SourceRow};
use crate::grounding::{AcceptedClaim, Reconciler};
use crate::ladder;
use crate::reachability::{ReachabilityReport, UrlProbe};
use crate::search::{self, GenerativeSearch, SearchResponse};

/// Failures that end a worker run on the spot. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("attempt {0} no longer exists")]
    AttemptVanished(String),
    #[error("store failure for attempt {attempt_id}: {message}")]
    Store { attempt_id: String, message: String },
}

impl IntegrityError {
    fn store(attempt_id: &str, err: anyhow::Error) -> Self {
        Self::Store {
            attempt_id: attempt_id.to_owned(),
            message: format!("{err:#}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationSummary {
    pub short_circuited: bool,
    pub budget_exhausted: bool,
    pub batches_run: usize,
    pub batches_failed: usize,
    pub parse_fallbacks: usize,
    pub claims_dropped: usize,
    pub rows_written: usize,
    pub components_filled: usize,
    pub recovery_components: usize,
    /// Candidate coverage after the run.
    pub coverage: CoverageSummary,
}

impl CurationSummary {
    fn new(coverage: CoverageSummary) -> Self {
        Self {
            short_circuited: false,
            budget_exhausted: false,
            batches_run: 0,
            batches_failed: 0,
            parse_fallbacks: 0,
            claims_dropped: 0,
            rows_written: 0,
            components_filled: 0,
            recovery_components: 0,
            coverage,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PassPlan {
    name: &'static str,
    batch_size: usize,
    inter_batch_delay: Duration,
    ladder_backoff: Duration,
}

struct RunState {
    deadline: Instant,
    batches_started: usize,
    summary: CurationSummary,
}

#[derive(Default)]
struct Selection {
    chosen: Option<SourceRow>,
    alternates: Vec<SourceRow>,
    overridable: Option<SourceRow>,
    discards: Vec<String>,
}

pub struct Orchestrator {
    store: Arc<dyn CurationStore>,
    search: Arc<dyn GenerativeSearch>,
    probe: Arc<dyn UrlProbe>,
    reconciler: Reconciler,
    config: CurationConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn CurationStore>,
        search: Arc<dyn GenerativeSearch>,
        probe: Arc<dyn UrlProbe>,
        config: CurationConfig,
    ) -> Self {
        let reconciler = Reconciler::new(&config.grounding.redirect_prefixes);
        Self {
            store,
            search,
            probe,
            reconciler,
            config,
        }
    }

    /// Runs one generation pass plus the recovery sweep for `attempt_id`.
    ///
    /// Per-batch failures are logged and skipped. Only integrity failures
    /// (vanished attempt, broken store) end the run early.
    pub async fn run(
        &self,
        attempt_id: &str,
        course_title: &str,
        required: &[RequiredComponent],
    ) -> Result<CurationSummary, IntegrityError> {
        self.ensure_alive(attempt_id).await?;

        let rows = self.load_rows(attempt_id).await?;
        let before = coverage::candidate_summary(&rows, required);
        if before.is_complete() || before.ratio() >= self.config.coverage_short_circuit {
            tracing::info!(
                attempt_id,
                covered = before.covered,
                total = before.total,
                "coverage already sufficient; skipping generation"
            );
            self.log(
                attempt_id,
                LogEntryType::Note,
                format!(
                    "coverage already at {}% ({}/{}); generation skipped",
                    before.percent(),
                    before.covered,
                    before.total
                ),
            )
            .await?;
            let mut summary = CurationSummary::new(before);
            summary.short_circuited = true;
            return Ok(summary);
        }

        let mut run = RunState {
            deadline: Instant::now() + self.config.time_budget(),
            batches_started: 0,
            summary: CurationSummary::new(before),
        };

        let pending = components_without_candidate(&rows, required);
        tracing::info!(
            attempt_id,
            pending = pending.len(),
            covered = before.covered,
            total = before.total,
            "curation started"
        );
        let main = PassPlan {
            name: "main",
            batch_size: self.config.batch_size,
            inter_batch_delay: self.config.inter_batch_delay(),
            ladder_backoff: self.config.ladder_backoff(),
        };
        self.run_pass(attempt_id, course_title, &pending, main, &mut run)
            .await?;

        if self.config.recovery.enabled {
            self.run_recovery(attempt_id, course_title, required, &mut run)
                .await?;
        }

        let rows = self.load_rows(attempt_id).await?;
        let after = coverage::candidate_summary(&rows, required);
        let strict = coverage::strict_summary(&rows, required);
        run.summary.coverage = after;
        tracing::info!(
            attempt_id,
            covered = after.covered,
            total = after.total,
            batches = run.summary.batches_run,
            failed = run.summary.batches_failed,
            rows = run.summary.rows_written,
            "curation finished"
        );
        self.log(
            attempt_id,
            LogEntryType::Note,
            format!(
                "curation finished: {}/{} components have a reachable candidate ({}%), {}/{} fully covered; {} batch(es) run, {} failed, {} row(s) written",
                after.covered,
                after.total,
                after.percent(),
                strict.covered,
                strict.total,
                run.summary.batches_run,
                run.summary.batches_failed,
                run.summary.rows_written
            ),
        )
        .await?;

        Ok(run.summary)
    }

    async fn run_recovery(
        &self,
        attempt_id: &str,
        course_title: &str,
        required: &[RequiredComponent],
        run: &mut RunState,
    ) -> Result<(), IntegrityError> {
        let rows = self.load_rows(attempt_id).await?;
        let mut uncovered = coverage::uncovered_prioritized(&rows, required);
        if uncovered.is_empty() {
            return Ok(());
        }
        if Instant::now() >= run.deadline {
            tracing::info!(
                attempt_id,
                uncovered = uncovered.len(),
                "no time left for recovery pass"
            );
            return Ok(());
        }
        uncovered.truncate(self.config.recovery.max_components);
        run.summary.recovery_components = uncovered.len();

        tracing::info!(
            attempt_id,
            components = uncovered.len(),
            critical = uncovered.iter().filter(|c| c.is_critical).count(),
            "recovery pass"
        );
        let recovery = PassPlan {
            name: "recovery",
            batch_size: self.config.recovery.batch_size,
            inter_batch_delay: Duration::from_millis(self.config.recovery.inter_batch_delay_ms),
            ladder_backoff: Duration::from_millis(self.config.recovery.ladder_backoff_ms),
        };
        self.run_pass(attempt_id, course_title, &uncovered, recovery, run)
            .await
    }

    async fn run_pass(
        &self,
        attempt_id: &str,
        course_title: &str,
        components: &[RequiredComponent],
        plan: PassPlan,
        run: &mut RunState,
    ) -> Result<(), IntegrityError> {
        let batch_size = plan.batch_size.max(1);
        let total_batches = components.len().div_ceil(batch_size);

        for (idx, batch) in components.chunks(batch_size).enumerate() {
            if run.batches_started > 0 && !plan.inter_batch_delay.is_zero() {
                let remaining = run.deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(plan.inter_batch_delay.min(remaining)).await;
            }
            if Instant::now() >= run.deadline {
                let skipped = total_batches - idx;
                run.summary.budget_exhausted = true;
                tracing::warn!(
                    attempt_id,
                    pass = plan.name,
                    skipped,
                    "time budget exhausted; not starting more batches"
                );
                self.log(
                    attempt_id,
                    LogEntryType::Note,
                    format!(
                        "time budget exhausted during {} pass; {skipped} batch(es) not started",
                        plan.name
                    ),
                )
                .await?;
                break;
            }

            run.batches_started += 1;
            run.summary.batches_run += 1;
            tracing::info!(
                attempt_id,
                pass = plan.name,
                batch = idx + 1,
                batches = total_batches,
                components = batch.len(),
                "curation batch"
            );
            self.process_batch(attempt_id, course_title, batch, plan, run)
                .await?;
        }
        Ok(())
    }

    async fn process_batch(
        &self,
        attempt_id: &str,
        course_title: &str,
        batch: &[RequiredComponent],
        plan: PassPlan,
        run: &mut RunState,
    ) -> Result<(), IntegrityError> {
        let prompt = match search::build_prompt(course_title, batch) {
            Ok(prompt) => prompt,
            Err(err) => {
                run.summary.batches_failed += 1;
                tracing::warn!(attempt_id, error = %format!("{err:#}"), "build prompt failed; skipping batch");
                return Ok(());
            }
        };

        let rungs = self.config.ladder.rungs();
        let search: &dyn GenerativeSearch = self.search.as_ref();
        let prompt_ref = prompt.as_str();
        let outcome = ladder::run_ladder(
            &rungs,
            plan.ladder_backoff,
            move |rung| async move {
                search
                    .generate(prompt_ref, &rung.model, rung.temperature)
                    .await
            },
            SearchResponse::has_evidence,
        )
        .await;

        let attempts = outcome.attempts();
        let Some((rung, response)) = outcome.accepted else {
            run.summary.batches_failed += 1;
            let keys = batch
                .iter()
                .map(|c| c.key().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                attempt_id,
                attempts,
                "no search attempt produced grounding evidence; skipping batch"
            );
            self.log(
                attempt_id,
                LogEntryType::Note,
                format!(
                    "batch skipped after {attempts} search attempt(s) without grounding evidence: {keys}"
                ),
            )
            .await?;
            return Ok(());
        };

        let claims = match search::parse_claims(&response.text, batch) {
            Ok(claims) => claims,
            Err(err) => {
                run.summary.parse_fallbacks += 1;
                tracing::warn!(
                    attempt_id,
                    model = %rung.model,
                    error = %err,
                    "unusable model output; falling back to attested citations"
                );
                search::fallback_claims(&response.attested_citations, batch)
            }
        };
        let accepted = self
            .reconciler
            .reconcile(&claims, &response.attested_citations);
        run.summary.claims_dropped += claims.len().saturating_sub(accepted.len());
        tracing::debug!(
            attempt_id,
            claims = claims.len(),
            grounded = accepted.len(),
            citations = response.attested_citations.len(),
            "grounding reconciled"
        );
        if accepted.is_empty() {
            return Ok(());
        }

        let mut urls = Vec::new();
        let mut seen = HashSet::new();
        for claim in &accepted {
            for url in claim.candidate_urls() {
                if seen.insert(url.clone()) {
                    urls.push(url);
                }
            }
        }
        let reports = self.probe_all(urls).await;

        let existing_rows = self.load_rows(attempt_id).await?;
        let by_component = coverage::rows_by_component(&existing_rows);
        let existing = existing_rows
            .iter()
            .map(|row| (row.row_id.as_str(), row))
            .collect::<HashMap<_, _>>();

        let mut writes = Vec::new();
        let mut entries = Vec::new();
        for component in batch {
            let key = component.key();
            if by_component
                .get(&key)
                .is_some_and(|rows| coverage::has_candidate(rows))
            {
                tracing::debug!(attempt_id, component = %key, "component gained a candidate meanwhile; skipping");
                continue;
            }
            let claims = accepted
                .iter()
                .filter(|a| a.claim.component == key)
                .collect::<Vec<_>>();
            if claims.is_empty() {
                continue;
            }

            let selection = self.select(&key, &claims, &reports, &existing);
            for message in selection.discards {
                entries.push(LogEntry::new(LogEntryType::Discard, message));
            }
            match (selection.chosen, selection.overridable) {
                (Some(row), _) => {
                    run.summary.components_filled += 1;
                    entries.push(LogEntry::new(
                        LogEntryType::Decision,
                        format!("{key}: selected {} ({})", row.source_ref, row.source_title),
                    ));
                    writes.push(row);
                }
                (None, Some(row)) => {
                    entries.push(LogEntry::new(
                        LogEntryType::Decision,
                        format!(
                            "{key}: no reachable source; kept {} ({}) for a possible reviewer override",
                            row.source_ref, row.url_status
                        ),
                    ));
                    writes.push(row);
                }
                (None, None) => {}
            }
            for row in selection.alternates {
                entries.push(LogEntry::new(
                    LogEntryType::Note,
                    format!("{key}: kept {} as an alternate", row.source_ref),
                ));
                writes.push(row);
            }
        }

        if writes.is_empty() && entries.is_empty() {
            return Ok(());
        }
        self.ensure_alive(attempt_id).await?;
        for row in &writes {
            if let Err(err) = self.store.upsert_row(attempt_id, row).await {
                return Err(self.integrity(attempt_id, err).await);
            }
            run.summary.rows_written += 1;
        }
        for entry in &entries {
            if let Err(err) = self.store.append_log(attempt_id, entry).await {
                return Err(self.integrity(attempt_id, err).await);
            }
        }
        Ok(())
    }

    /// Strict 1:1: the first reachable candidate in claim order wins.
    fn select(
        &self,
        key: &ComponentKey,
        claims: &[&AcceptedClaim],
        reports: &HashMap<String, ReachabilityReport>,
        existing: &HashMap<&str, &SourceRow>,
    ) -> Selection {
        let mut selection = Selection::default();
        let mut seen = HashSet::new();

        for accepted in claims {
            for url in accepted.candidate_urls() {
                if !seen.insert(url.clone()) {
                    continue;
                }
                let Some(report) = reports.get(&url) else {
                    selection
                        .discards
                        .push(format!("{key}: {url} could not be probed"));
                    continue;
                };

                let source_ref = match &report.final_url {
                    Some(final_url)
                        if report.is_reachable() && self.reconciler.is_provider_redirect(&url) =>
                    {
                        final_url.clone()
                    }
                    _ => url.clone(),
                };
                let mut row = SourceRow::new(
                    key,
                    &source_ref,
                    &accepted.claim.title,
                    &accepted.claim.rationale,
                );
                if let Some(previous) = existing.get(row.row_id.as_str()) {
                    if previous.is_rejected() && !previous.auto_evaluated {
                        selection.discards.push(format!(
                            "{key}: {source_ref} was already rejected by a reviewer"
                        ));
                        continue;
                    }
                    if previous.is_accepted() || previous.coverage_complete == Some(false) {
                        selection.discards.push(format!(
                            "{key}: {source_ref} was already reviewed and does not cover the component"
                        ));
                        continue;
                    }
                    row.created_at = previous.created_at;
                }
                report.write_to(&mut row);
                classify::auto_classify(&mut row);

                if report.is_reachable() {
                    if selection.chosen.is_none() {
                        selection.chosen = Some(row);
                    } else if self.config.alternates == AlternatesPolicy::Retain {
                        selection.alternates.push(row);
                    } else {
                        selection.discards.push(format!(
                            "{key}: {source_ref} is reachable but a source was already selected"
                        ));
                    }
                } else if row.url_status.is_overridable() && selection.overridable.is_none() {
                    selection.overridable = Some(row);
                } else {
                    selection.discards.push(unreachable_message(key, &row));
                }
            }
        }

        if selection.chosen.is_some()
            && let Some(row) = selection.overridable.take()
        {
            selection.discards.push(unreachable_message(key, &row));
        }
        selection
    }

    async fn probe_all(&self, urls: Vec<String>) -> HashMap<String, ReachabilityReport> {
        let concurrency = self.config.reachability.concurrency.max(1);
        let mut pending = urls.into_iter();
        let mut join_set = tokio::task::JoinSet::new();
        let mut reports = HashMap::new();

        loop {
            while join_set.len() < concurrency {
                let Some(url) = pending.next() else {
                    break;
                };
                let probe = Arc::clone(&self.probe);
                join_set.spawn(async move {
                    let report = probe.check(&url).await;
                    (url, report)
                });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok((url, report)) => {
                    reports.insert(url, report);
                }
                Err(err) => tracing::warn!(error = %err, "reachability task failed"),
            }
        }
        reports
    }

    async fn ensure_alive(&self, attempt_id: &str) -> Result<(), IntegrityError> {
        match self.store.exists(attempt_id).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!(attempt_id, "attempt vanished; stopping worker");
                Err(IntegrityError::AttemptVanished(attempt_id.to_owned()))
            }
            Err(err) => Err(IntegrityError::store(attempt_id, err)),
        }
    }

    async fn integrity(&self, attempt_id: &str, err: anyhow::Error) -> IntegrityError {
        match self.store.exists(attempt_id).await {
            Ok(false) => IntegrityError::AttemptVanished(attempt_id.to_owned()),
            _ => IntegrityError::store(attempt_id, err),
        }
    }

    async fn load_rows(&self, attempt_id: &str) -> Result<Vec<SourceRow>, IntegrityError> {
        match self.store.list_rows(attempt_id).await {
            Ok(rows) => Ok(rows),
            Err(err) => Err(self.integrity(attempt_id, err).await),
        }
    }

    async fn log(
        &self,
        attempt_id: &str,
        entry_type: LogEntryType,
        message: String,
    ) -> Result<(), IntegrityError> {
        let entry = LogEntry::new(entry_type, message);
        match self.store.append_log(attempt_id, &entry).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.integrity(attempt_id, err).await),
        }
    }
}

/// Components still lacking a candidate, in declaration order.
fn components_without_candidate(
    rows: &[SourceRow],
    required: &[RequiredComponent],
) -> Vec<RequiredComponent> {
    let by_component = coverage::rows_by_component(rows);
    coverage::unique_components(required)
        .into_iter()
        .filter(|c| {
            !by_component
                .get(&c.key())
                .is_some_and(|rows| coverage::has_candidate(rows))
        })
        .collect()
}

fn unreachable_message(key: &ComponentKey, row: &SourceRow) -> String {
    match row.http_status_code {
        Some(code) => format!(
            "{key}: {} unreachable ({}, HTTP {code})",
            row.source_ref, row.url_status
        ),
        None => format!("{key}: {} unreachable ({})", row.source_ref, row.url_status),
    }
}
