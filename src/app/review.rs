use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::app::model::{AttemptView, StartCurationRequest};
use crate::app::store::CurationStore;
use crate::classify::{self, InvariantViolation, OverrideError};
use crate::config::CurationConfig;
use crate::coverage::{self, Gap};
use crate::formats::{
    Blocker, BlockerStatus, ComponentKey, CurationAttempt, LogEntry, LogEntryType, QaDecision,
    SourceRow, UrlStatus,
};
use crate::gating::{self, Attempt2Decision, CheckCode, DodReport, GateInput};
use crate::reachability::UrlProbe;
use crate::state::{AttemptState, TransitionError};

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("attempt not found: {0}")]
    AttemptNotFound(String),
    #[error("row not found: {0}")]
    RowNotFound(String),
    #[error("blocker not found: {0}")]
    BlockerNotFound(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    #[error(transparent)]
    Override(#[from] OverrideError),
    #[error("attempt is {0:?}; rows can only be edited during review")]
    NotEditable(AttemptState),
    #[error("{component} already has an accepted source ({row_id})")]
    AlreadyAccepted {
        component: ComponentKey,
        row_id: String,
    },
    #[error("rejecting a source requires a reason")]
    MissingRejectionReason,
    #[error("{component} is not a required component of this attempt")]
    UnknownComponent { component: ComponentKey },
    #[error("submission to QA refused; failing checks: {failing:?}")]
    SubmissionRefused { failing: Vec<CheckCode> },
    #[error("second attempt refused: {0}")]
    SecondAttemptRefused(String),
    #[error("escalation is only possible on attempt {max} (current attempt {current})")]
    EscalationTooEarly { current: u8, max: u8 },
    #[error("a curation run is still in progress (started {since})")]
    RunInProgress { since: chrono::DateTime<Utc> },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Partial update of a row by a reviewer. Absent fields stay untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RowPatch {
    /// `true` accepts, `false` rejects (needs `rejection_reason`).
    pub apta: Option<bool>,
    /// Resets the verdict to un-reviewed.
    pub clear_apta: bool,
    pub rejection_reason: Option<String>,
    pub coverage_complete: Option<bool>,
    pub forbidden_override: Option<bool>,
    /// New URL or free-text reference; URLs are probed again.
    pub source_ref: Option<String>,
    pub source_title: Option<String>,
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRow {
    pub lesson_id: String,
    pub component_name: String,
    pub source_ref: String,
    #[serde(default)]
    pub source_title: String,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBlocker {
    pub lesson_id: String,
    pub component_name: String,
    pub impact: String,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockerPatch {
    pub status: Option<BlockerStatus>,
    pub owner: Option<String>,
    pub impact: Option<String>,
}

/// Human-in-the-loop operations on an attempt. Every method re-reads the
/// persisted state, so concurrent reviewers see each other's writes.
pub struct ReviewService {
    store: Arc<dyn CurationStore>,
    probe: Arc<dyn UrlProbe>,
    config: CurationConfig,
}

impl ReviewService {
    pub fn new(
        store: Arc<dyn CurationStore>,
        probe: Arc<dyn UrlProbe>,
        config: CurationConfig,
    ) -> Self {
        Self {
            store,
            probe,
            config,
        }
    }

    pub async fn view(&self, attempt_id: &str) -> Result<AttemptView, ReviewError> {
        let (attempt, request) = self.load(attempt_id).await?;
        Ok(AttemptView {
            attempt,
            components: request.components,
            rows: self.store.list_rows(attempt_id).await?,
            blockers: self.store.list_blockers(attempt_id).await?,
            log_entries: self.store.list_log(attempt_id).await?,
            validation_lease: self.store.get_lease(attempt_id).await?,
        })
    }

    pub async fn gaps(&self, attempt_id: &str) -> Result<Vec<Gap>, ReviewError> {
        let (_, request) = self.load(attempt_id).await?;
        let rows = self.store.list_rows(attempt_id).await?;
        Ok(coverage::detect_gaps(&rows, &request.components))
    }

    pub async fn dod(&self, attempt_id: &str) -> Result<DodReport, ReviewError> {
        let (attempt, request) = self.load(attempt_id).await?;
        let rows = self.store.list_rows(attempt_id).await?;
        Ok(self.evaluate(&attempt, &request, &rows))
    }

    pub async fn attempt2(&self, attempt_id: &str) -> Result<Attempt2Decision, ReviewError> {
        let (attempt, request) = self.load(attempt_id).await?;
        let rows = self.store.list_rows(attempt_id).await?;
        let gaps = coverage::detect_gaps(&rows, &request.components);
        Ok(gating::should_enable_attempt2(
            &attempt,
            &gaps,
            self.config.max_attempts,
        ))
    }

    pub async fn begin_review(&self, attempt_id: &str) -> Result<CurationAttempt, ReviewError> {
        let (mut attempt, _) = self.load(attempt_id).await?;
        self.set_state(&mut attempt, AttemptState::HitlReview).await?;
        self.log(attempt_id, LogEntryType::Decision, "human review started")
            .await?;
        Ok(attempt)
    }

    pub async fn update_row(
        &self,
        attempt_id: &str,
        row_id: &str,
        patch: RowPatch,
    ) -> Result<SourceRow, ReviewError> {
        let (attempt, _) = self.load(attempt_id).await?;
        ensure_editable(&attempt)?;
        let mut row = self
            .store
            .get_row(attempt_id, row_id)
            .await?
            .ok_or_else(|| ReviewError::RowNotFound(row_id.to_owned()))?;
        let mut notes = Vec::new();

        if let Some(title) = patch.source_title {
            row.source_title = title.trim().to_owned();
        }
        if let Some(rationale) = patch.rationale {
            row.rationale = rationale.trim().to_owned();
        }
        if let Some(source_ref) = patch.source_ref {
            let source_ref = source_ref.trim();
            if source_ref.is_empty() {
                return Err(ReviewError::InvalidInput(
                    "source_ref must not be empty".to_owned(),
                ));
            }
            if source_ref != row.source_ref {
                row.source_ref = source_ref.to_owned();
                row.coverage_complete = None;
                self.refresh_status(&mut row).await;
                notes.push(format!(
                    "{}: reference changed to {} ({})",
                    row.key(),
                    row.source_ref,
                    row.url_status
                ));
            }
        }

        match patch.forbidden_override {
            Some(true) if !row.forbidden_override => {
                classify::apply_forbidden_override(&mut row)?;
                notes.push(format!(
                    "{}: reviewer confirmed access to {} despite {}",
                    row.key(),
                    row.source_ref,
                    row.url_status
                ));
            }
            Some(false) if row.forbidden_override => {
                row.forbidden_override = false;
                classify::auto_classify(&mut row);
                notes.push(format!("{}: access override withdrawn", row.key()));
            }
            _ => {}
        }

        if patch.clear_apta {
            row.apta = None;
            row.rejection_reason = None;
            row.auto_evaluated = false;
            row.auto_reason = None;
        }
        match patch.apta {
            Some(true) => {
                if !row.has_usable_url() {
                    return Err(InvariantViolation::AcceptedWithoutUsableUrl(row.row_id).into());
                }
                let rows = self.store.list_rows(attempt_id).await?;
                if let Some(other) = rows
                    .iter()
                    .find(|r| r.row_id != row.row_id && r.key() == row.key() && r.is_accepted())
                {
                    return Err(ReviewError::AlreadyAccepted {
                        component: row.key(),
                        row_id: other.row_id.clone(),
                    });
                }
                row.apta = Some(true);
                row.rejection_reason = None;
                notes.push(format!("{}: accepted {}", row.key(), row.source_ref));
            }
            Some(false) => {
                let reason = patch
                    .rejection_reason
                    .as_deref()
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .ok_or(ReviewError::MissingRejectionReason)?;
                row.apta = Some(false);
                row.rejection_reason = Some(reason.to_owned());
                row.auto_evaluated = false;
                row.auto_reason = None;
                notes.push(format!(
                    "{}: rejected {} ({reason})",
                    row.key(),
                    row.source_ref
                ));
            }
            None => {}
        }

        if let Some(complete) = patch.coverage_complete {
            row.coverage_complete = Some(complete);
        }

        classify::check_invariants(&row)?;
        row.updated_at = Utc::now();
        self.store.upsert_row(attempt_id, &row).await?;
        for note in notes {
            self.log(attempt_id, LogEntryType::Decision, note).await?;
        }
        Ok(row)
    }

    /// Adds a reviewer-supplied source. Free text becomes `MANUAL`; URLs are probed.
    pub async fn add_manual_row(
        &self,
        attempt_id: &str,
        new_row: NewRow,
    ) -> Result<SourceRow, ReviewError> {
        let (attempt, request) = self.load(attempt_id).await?;
        ensure_editable(&attempt)?;
        let key = ComponentKey::new(&new_row.lesson_id, &new_row.component_name);
        if !request.components.iter().any(|c| c.key() == key) {
            return Err(ReviewError::UnknownComponent { component: key });
        }
        if new_row.source_ref.trim().is_empty() {
            return Err(ReviewError::InvalidInput(
                "source_ref must not be empty".to_owned(),
            ));
        }

        let mut row = SourceRow::new(
            &key,
            &new_row.source_ref,
            &new_row.source_title,
            &new_row.rationale,
        );
        self.refresh_status(&mut row).await;
        self.store.upsert_row(attempt_id, &row).await?;
        self.log(
            attempt_id,
            LogEntryType::Decision,
            format!(
                "{key}: manual source added {} ({})",
                row.source_ref, row.url_status
            ),
        )
        .await?;
        Ok(row)
    }

    /// Accepts the first usable, un-reviewed row of every component that has no
    /// accepted row yet. Returns the accepted row ids.
    pub async fn bulk_accept(&self, attempt_id: &str) -> Result<Vec<String>, ReviewError> {
        let (attempt, _) = self.load(attempt_id).await?;
        ensure_editable(&attempt)?;
        let rows = self.store.list_rows(attempt_id).await?;
        let by_component = coverage::rows_by_component(&rows);
        let mut keys = by_component.keys().cloned().collect::<Vec<_>>();
        keys.sort();

        let mut accepted = Vec::new();
        for key in keys {
            let component_rows = &by_component[&key];
            if component_rows.iter().any(|r| r.is_accepted()) {
                continue;
            }
            let Some(row) = component_rows
                .iter()
                .find(|r| r.apta.is_none() && r.has_usable_url())
            else {
                continue;
            };
            let mut row = (*row).clone();
            row.apta = Some(true);
            row.updated_at = Utc::now();
            self.store.upsert_row(attempt_id, &row).await?;
            accepted.push(row.row_id);
        }

        self.log(
            attempt_id,
            LogEntryType::Decision,
            format!("bulk accept: {} source(s) accepted", accepted.len()),
        )
        .await?;
        Ok(accepted)
    }

    pub async fn add_note(&self, attempt_id: &str, message: &str) -> Result<LogEntry, ReviewError> {
        self.load(attempt_id).await?;
        let message = message.trim();
        if message.is_empty() {
            return Err(ReviewError::InvalidInput("note must not be empty".to_owned()));
        }
        let entry = LogEntry::new(LogEntryType::Note, message);
        self.store.append_log(attempt_id, &entry).await?;
        Ok(entry)
    }

    pub async fn add_blocker(
        &self,
        attempt_id: &str,
        new_blocker: NewBlocker,
    ) -> Result<Blocker, ReviewError> {
        self.load(attempt_id).await?;
        if new_blocker.impact.trim().is_empty() {
            return Err(ReviewError::InvalidInput("impact must not be empty".to_owned()));
        }
        let key = ComponentKey::new(&new_blocker.lesson_id, &new_blocker.component_name);
        let blocker = Blocker {
            blocker_id: uuid::Uuid::new_v4().to_string(),
            lesson_id: key.lesson_id.clone(),
            component_name: key.component_name.clone(),
            impact: new_blocker.impact.trim().to_owned(),
            owner: new_blocker
                .owner
                .map(|o| o.trim().to_owned())
                .filter(|o| !o.is_empty())
                .unwrap_or_else(|| self.config.blocker_owner.clone()),
            status: BlockerStatus::Open,
            created_at: Utc::now(),
        };
        self.store.upsert_blocker(attempt_id, &blocker).await?;
        self.log(
            attempt_id,
            LogEntryType::Gap,
            format!("{key}: blocker recorded ({})", blocker.impact),
        )
        .await?;
        Ok(blocker)
    }

    pub async fn update_blocker(
        &self,
        attempt_id: &str,
        blocker_id: &str,
        patch: BlockerPatch,
    ) -> Result<Blocker, ReviewError> {
        self.load(attempt_id).await?;
        let mut blocker = self
            .store
            .list_blockers(attempt_id)
            .await?
            .into_iter()
            .find(|b| b.blocker_id == blocker_id)
            .ok_or_else(|| ReviewError::BlockerNotFound(blocker_id.to_owned()))?;
        if let Some(status) = patch.status {
            blocker.status = status;
        }
        if let Some(owner) = patch.owner.filter(|o| !o.trim().is_empty()) {
            blocker.owner = owner.trim().to_owned();
        }
        if let Some(impact) = patch.impact.filter(|i| !i.trim().is_empty()) {
            blocker.impact = impact.trim().to_owned();
        }
        self.store.upsert_blocker(attempt_id, &blocker).await?;
        Ok(blocker)
    }

    pub async fn submit_to_qa(&self, attempt_id: &str) -> Result<DodReport, ReviewError> {
        let (mut attempt, request) = self.load(attempt_id).await?;
        attempt.state.transition(AttemptState::ReadyForQa)?;
        let rows = self.store.list_rows(attempt_id).await?;
        let report = self.evaluate(&attempt, &request, &rows);
        let blockers = self.store.list_blockers(attempt_id).await?;
        if !gating::can_submit_to_qa(&report, &blockers) {
            return Err(ReviewError::SubmissionRefused {
                failing: report.failing_errors().iter().map(|c| c.code).collect(),
            });
        }

        self.set_state(&mut attempt, AttemptState::ReadyForQa)
            .await?;
        let message = if report.releasable {
            "submitted to QA with every blocking check passing".to_owned()
        } else {
            format!(
                "submitted to QA with {} failing check(s) acknowledged by {} blocker(s)",
                report.failing_errors().len(),
                blockers.len()
            )
        };
        self.log(attempt_id, LogEntryType::Decision, message).await?;
        Ok(report)
    }

    pub async fn apply_qa_decision(
        &self,
        attempt_id: &str,
        decision: QaDecision,
    ) -> Result<CurationAttempt, ReviewError> {
        let (mut attempt, request) = self.load(attempt_id).await?;
        attempt.qa_decision = Some(decision);
        self.set_state(&mut attempt, decision.target_state()).await?;
        self.log(
            attempt_id,
            LogEntryType::Decision,
            format!("QA decision: {decision:?}"),
        )
        .await?;

        if decision == QaDecision::Blocked && attempt.attempt_number >= self.config.max_attempts {
            let rows = self.store.list_rows(attempt_id).await?;
            let gaps = coverage::detect_gaps(&rows, &request.components);
            self.persist_blockers(attempt_id, &gaps).await?;
        }
        Ok(attempt)
    }

    /// Bumps the attempt number after checking the gaps still justify it. The
    /// caller dispatches the worker run afterwards.
    pub async fn start_second_attempt(
        &self,
        attempt_id: &str,
    ) -> Result<CurationAttempt, ReviewError> {
        let (mut attempt, request) = self.load(attempt_id).await?;
        let rows = self.store.list_rows(attempt_id).await?;
        let gaps = coverage::detect_gaps(&rows, &request.components);
        let decision = gating::should_enable_attempt2(&attempt, &gaps, self.config.max_attempts);
        if !decision.enabled {
            return Err(ReviewError::SecondAttemptRefused(decision.reason));
        }
        attempt.state.transition(AttemptState::Generating)?;

        attempt.attempt_number += 1;
        attempt.qa_decision = None;
        attempt.updated_at = Utc::now();
        self.store.put(&attempt).await?;
        self.log(
            attempt_id,
            LogEntryType::NextStep,
            format!(
                "attempt {} started for {} gap(s)",
                attempt.attempt_number,
                gaps.len()
            ),
        )
        .await?;
        Ok(attempt)
    }

    /// Undoes [`Self::start_second_attempt`] when the run could not be handed
    /// to a worker, restoring the counter and QA decision of `previous`.
    pub async fn cancel_second_attempt(
        &self,
        previous: &CurationAttempt,
    ) -> Result<CurationAttempt, ReviewError> {
        let attempt_id = previous.attempt_id.as_str();
        let (mut attempt, _) = self.load(attempt_id).await?;
        if attempt.attempt_number <= previous.attempt_number
            || attempt.state == AttemptState::Generating
        {
            return Ok(attempt);
        }
        attempt.attempt_number = previous.attempt_number;
        attempt.qa_decision = previous.qa_decision;
        attempt.updated_at = Utc::now();
        self.store.put(&attempt).await?;
        self.log(
            attempt_id,
            LogEntryType::Note,
            format!(
                "attempt {} could not be started; still on attempt {}",
                previous.attempt_number + 1,
                attempt.attempt_number
            ),
        )
        .await?;
        Ok(attempt)
    }

    /// Records one blocker per unresolved gap. Only allowed once the attempt cap
    /// is reached.
    pub async fn escalate(&self, attempt_id: &str) -> Result<Vec<Blocker>, ReviewError> {
        let (attempt, request) = self.load(attempt_id).await?;
        if attempt.attempt_number < self.config.max_attempts {
            return Err(ReviewError::EscalationTooEarly {
                current: attempt.attempt_number,
                max: self.config.max_attempts,
            });
        }
        let rows = self.store.list_rows(attempt_id).await?;
        let gaps = coverage::detect_gaps(&rows, &request.components);
        self.persist_blockers(attempt_id, &gaps).await
    }

    /// Deletes every row and returns the attempt to DRAFT. The attempt number
    /// is kept.
    pub async fn restart(&self, attempt_id: &str) -> Result<CurationAttempt, ReviewError> {
        let (mut attempt, _) = self.load(attempt_id).await?;
        attempt.state.transition(AttemptState::Draft)?;
        // A GENERATING attempt is only reset once its worker is presumed dead.
        if attempt.state == AttemptState::Generating && !self.run_is_stale(&attempt) {
            return Err(ReviewError::RunInProgress {
                since: attempt.updated_at,
            });
        }
        self.store.delete_rows(attempt_id).await?;
        self.store.delete_lease(attempt_id).await?;
        attempt.qa_decision = None;
        self.set_state(&mut attempt, AttemptState::Draft).await?;
        self.log(
            attempt_id,
            LogEntryType::Note,
            "pipeline restarted; all sources removed",
        )
        .await?;
        Ok(attempt)
    }

    fn run_is_stale(&self, attempt: &CurationAttempt) -> bool {
        let limit = chrono::Duration::from_std(self.config.time_budget() * 2)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        Utc::now() - attempt.updated_at > limit
    }

    async fn persist_blockers(
        &self,
        attempt_id: &str,
        gaps: &[Gap],
    ) -> Result<Vec<Blocker>, ReviewError> {
        let existing = self.store.list_blockers(attempt_id).await?;
        let created = gating::blockers_for_gaps(gaps, &existing, &self.config.blocker_owner);
        for blocker in &created {
            self.store.upsert_blocker(attempt_id, blocker).await?;
            self.log(
                attempt_id,
                LogEntryType::Gap,
                format!("{}: escalated ({})", blocker.key(), blocker.impact),
            )
            .await?;
        }
        Ok(created)
    }

    fn evaluate(
        &self,
        attempt: &CurationAttempt,
        request: &StartCurationRequest,
        rows: &[SourceRow],
    ) -> DodReport {
        gating::evaluate(&GateInput {
            attempt_number: attempt.attempt_number,
            max_attempts: self.config.max_attempts,
            required: &request.components,
            rows,
        })
    }

    async fn refresh_status(&self, row: &mut SourceRow) {
        if row.looks_like_url() {
            let report = self.probe.check(&row.source_ref).await;
            report.write_to(row);
            classify::apply_url_status(row, report.status);
        } else {
            row.http_status_code = None;
            row.failure_reason = None;
            row.last_checked_at = Some(Utc::now());
            classify::apply_url_status(row, UrlStatus::Manual);
        }
    }

    async fn load(
        &self,
        attempt_id: &str,
    ) -> Result<(CurationAttempt, StartCurationRequest), ReviewError> {
        let attempt = self
            .store
            .get(attempt_id)
            .await
            .context("load attempt")?
            .ok_or_else(|| ReviewError::AttemptNotFound(attempt_id.to_owned()))?;
        let request = self
            .store
            .get_request(attempt_id)
            .await
            .context("load request")?
            .ok_or_else(|| ReviewError::AttemptNotFound(attempt_id.to_owned()))?;
        Ok((attempt, request))
    }

    async fn set_state(
        &self,
        attempt: &mut CurationAttempt,
        to: AttemptState,
    ) -> Result<(), ReviewError> {
        attempt.state = attempt.state.transition(to)?;
        attempt.updated_at = Utc::now();
        self.store.put(attempt).await?;
        Ok(())
    }

    async fn log(
        &self,
        attempt_id: &str,
        entry_type: LogEntryType,
        message: impl Into<String>,
    ) -> Result<(), ReviewError> {
        self.store
            .append_log(attempt_id, &LogEntry::new(entry_type, message))
            .await?;
        Ok(())
    }
}

fn ensure_editable(attempt: &CurationAttempt) -> Result<(), ReviewError> {
    if attempt.state.is_reviewable() {
        Ok(())
    } else {
        Err(ReviewError::NotEditable(attempt.state))
    }
}
