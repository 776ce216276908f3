//! Content-quality pass: asks the model whether each reachable source really
//! covers its component and records the verdict in `coverage_complete`.
//! Runs under a [`ValidationLease`](crate::lease::ValidationLease) so two passes
//! never overlap on one attempt.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::app::store::CurationStore;
use crate::config::CurationConfig;
use crate::formats::{ComponentKey, LogEntry, LogEntryType, RequiredComponent, SourceRow};
use crate::ladder;
use crate::search::{self, GenerativeSearch, SearchResponse};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub rows_judged: usize,
    pub covering: usize,
    pub not_covering: usize,
    pub chunks_failed: usize,
}

#[derive(Debug, Deserialize)]
struct VerdictPayload {
    verdicts: Vec<Verdict>,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    row_id: String,
    covers: bool,
    #[serde(default)]
    note: String,
}

#[derive(Debug, Serialize)]
struct PromptRow<'a> {
    row_id: &'a str,
    lesson_title: &'a str,
    component_name: &'a str,
    url: &'a str,
    title: &'a str,
    rationale: &'a str,
}

pub struct Validator {
    store: Arc<dyn CurationStore>,
    search: Arc<dyn GenerativeSearch>,
    config: CurationConfig,
}

impl Validator {
    pub fn new(
        store: Arc<dyn CurationStore>,
        search: Arc<dyn GenerativeSearch>,
        config: CurationConfig,
    ) -> Self {
        Self {
            store,
            search,
            config,
        }
    }

    /// Judges every reachable, not-rejected row that has no coverage verdict yet.
    pub async fn run(&self, attempt_id: &str, owner_id: &str) -> anyhow::Result<ValidationOutcome> {
        let ttl = chrono::Duration::seconds(
            i64::try_from(self.config.validation.lease_ttl_secs).context("lease ttl overflow")?,
        );
        let lease = self.store.acquire_lease(attempt_id, owner_id, ttl).await?;
        tracing::info!(attempt_id, owner_id, expires_at = %lease.expires_at, "validation lease acquired");

        let result = self.judge_rows(attempt_id, owner_id, ttl).await;

        if !self
            .store
            .release_lease(attempt_id, owner_id)
            .await
            .context("release lease")?
        {
            tracing::warn!(attempt_id, owner_id, "lease taken over; leaving it in place");
        }
        result
    }

    async fn judge_rows(
        &self,
        attempt_id: &str,
        owner_id: &str,
        ttl: chrono::Duration,
    ) -> anyhow::Result<ValidationOutcome> {
        let request = self
            .store
            .get_request(attempt_id)
            .await
            .context("load request")?
            .ok_or_else(|| anyhow::anyhow!("attempt not found: {attempt_id}"))?;
        let lesson_titles = lesson_titles(&request.components);

        let rows = self.store.list_rows(attempt_id).await.context("list rows")?;
        let pending = rows
            .into_iter()
            .filter(|r| r.has_usable_url() && !r.is_rejected() && r.coverage_complete.is_none())
            .collect::<Vec<_>>();

        let mut outcome = ValidationOutcome::default();
        if pending.is_empty() {
            return Ok(outcome);
        }

        let chunk_size = self.config.validation.chunk_size.max(1);
        for (idx, chunk) in pending.chunks(chunk_size).enumerate() {
            if idx > 0 {
                self.store.renew_lease(attempt_id, owner_id, ttl).await?;
            }

            let verdicts = match self.ask(request.display_title(), chunk, &lesson_titles).await {
                Ok(verdicts) => verdicts,
                Err(err) => {
                    outcome.chunks_failed += 1;
                    tracing::warn!(attempt_id, chunk = idx, error = %format!("{err:#}"), "validation chunk failed");
                    continue;
                }
            };

            for judged in chunk {
                let Some(verdict) = verdicts.get(&judged.row_id) else {
                    continue;
                };
                // Reviewers may have edited the row while the model was thinking.
                let Some(mut row) = self
                    .store
                    .get_row(attempt_id, &judged.row_id)
                    .await
                    .with_context(|| format!("reload row {}", judged.row_id))?
                else {
                    continue;
                };
                if row.source_ref != judged.source_ref
                    || row.coverage_complete.is_some()
                    || row.is_rejected()
                    || !row.has_usable_url()
                {
                    tracing::debug!(attempt_id, row_id = %row.row_id, "row changed during validation; verdict dropped");
                    continue;
                }
                row.coverage_complete = Some(verdict.covers);
                row.updated_at = Utc::now();
                self.store
                    .upsert_row(attempt_id, &row)
                    .await
                    .with_context(|| format!("save row {}", row.row_id))?;

                outcome.rows_judged += 1;
                if verdict.covers {
                    outcome.covering += 1;
                } else {
                    outcome.not_covering += 1;
                }
                let mut message = format!(
                    "{}: {} {} the component",
                    row.key(),
                    row.source_ref,
                    if verdict.covers { "covers" } else { "does not fully cover" }
                );
                if !verdict.note.trim().is_empty() {
                    message.push_str(&format!(" ({})", verdict.note.trim()));
                }
                self.store
                    .append_log(attempt_id, &LogEntry::new(LogEntryType::Note, message))
                    .await
                    .context("append log")?;
            }
        }

        let rows = self.store.list_rows(attempt_id).await.context("list rows")?;
        for key in weak_components(&rows) {
            self.store
                .append_log(
                    attempt_id,
                    &LogEntry::new(
                        LogEntryType::NextStep,
                        format!("{key}: no source fully covers the component; find a better one or record a blocker"),
                    ),
                )
                .await
                .context("append log")?;
        }

        tracing::info!(
            attempt_id,
            judged = outcome.rows_judged,
            covering = outcome.covering,
            failed_chunks = outcome.chunks_failed,
            "validation finished"
        );
        Ok(outcome)
    }

    async fn ask(
        &self,
        course_title: &str,
        chunk: &[SourceRow],
        lesson_titles: &HashMap<String, String>,
    ) -> anyhow::Result<HashMap<String, Verdict>> {
        let prompt = build_prompt(course_title, chunk, lesson_titles)?;
        let rungs = self.config.ladder.rungs();
        let search: &dyn GenerativeSearch = self.search.as_ref();
        let prompt_ref = prompt.as_str();
        let outcome = ladder::run_ladder(
            &rungs,
            self.config.ladder_backoff(),
            move |rung| async move {
                search
                    .generate(prompt_ref, &rung.model, rung.temperature)
                    .await
            },
            |response: &SearchResponse| parse_verdicts(&response.text).is_ok(),
        )
        .await;

        let Some((_, response)) = outcome.accepted else {
            let last = outcome
                .errors
                .last()
                .map(|(_, err)| format!("{err:#}"))
                .unwrap_or_else(|| "no parseable verdicts".to_owned());
            anyhow::bail!("model gave no usable verdicts: {last}");
        };
        let verdicts = parse_verdicts(&response.text)?;
        Ok(verdicts
            .into_iter()
            .map(|v| (v.row_id.clone(), v))
            .collect())
    }
}

fn lesson_titles(components: &[RequiredComponent]) -> HashMap<String, String> {
    components
        .iter()
        .map(|c| (c.lesson_id.trim().to_owned(), c.lesson_title.clone()))
        .collect()
}

fn build_prompt(
    course_title: &str,
    chunk: &[SourceRow],
    lesson_titles: &HashMap<String, String>,
) -> anyhow::Result<String> {
    let rows = chunk
        .iter()
        .map(|row| PromptRow {
            row_id: &row.row_id,
            lesson_title: lesson_titles
                .get(&row.lesson_id)
                .map(String::as_str)
                .unwrap_or(&row.lesson_id),
            component_name: &row.component_name,
            url: &row.source_ref,
            title: &row.source_title,
            rationale: &row.rationale,
        })
        .collect::<Vec<_>>();
    let rows_json = serde_json::to_string_pretty(&rows).context("serialize rows")?;

    Ok(format!(
        "You review reference sources for the course \"{course_title}\".\n\
\n\
For each source below, open the page and decide whether it fully covers the lesson \
component it was chosen for.\n\
\n\
BEGIN_SOURCES_JSON\n\
{rows_json}\n\
END_SOURCES_JSON\n\
\n\
Output ONLY a single JSON object:\n\
{{\"verdicts\":[{{\"row_id\":\"...\",\"covers\":true,\"note\":\"one short sentence\"}}]}}\n"
    ))
}

fn parse_verdicts(text: &str) -> anyhow::Result<Vec<Verdict>> {
    let json = search::extract_json_object(text)
        .ok_or_else(|| anyhow::anyhow!("no JSON object in validation output"))?;
    let payload: VerdictPayload = serde_json::from_str(json).context("parse verdicts")?;
    if payload.verdicts.is_empty() {
        anyhow::bail!("validation output has no verdicts");
    }
    Ok(payload.verdicts)
}

/// Components whose reachable sources were all judged as not covering.
pub fn weak_components(rows: &[SourceRow]) -> Vec<ComponentKey> {
    let mut keys = rows
        .iter()
        .filter(|r| r.has_usable_url() && r.coverage_complete == Some(false))
        .map(SourceRow::key)
        .filter(|key| {
            !rows
                .iter()
                .any(|r| r.key() == *key && r.coverage_complete == Some(true))
        })
        .collect::<Vec<_>>();
    keys.sort();
    keys.dedup();
    keys
}
