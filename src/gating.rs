use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::coverage::{self, Gap};
use crate::formats::{
    Blocker, BlockerStatus, ComponentKey, CurationAttempt, RequiredComponent, SourceRow, UrlStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckCode {
    UrlOperable,
    ComponentCoverage,
    CriticalCoverage,
    RejectionReasons,
    NoOrphans,
    AttemptLimit,
    AllEvaluated,
    NoPendingUrls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DodCheck {
    pub code: CheckCode,
    pub pass: bool,
    pub message: String,
    pub severity: Severity,
}

impl DodCheck {
    pub fn blocks_submission(&self) -> bool {
        !self.pass && self.severity == Severity::Error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DodReport {
    pub checks: Vec<DodCheck>,
    /// True when no error-severity check fails.
    pub releasable: bool,
    pub gaps: Vec<Gap>,
}

impl DodReport {
    pub fn failing_errors(&self) -> Vec<&DodCheck> {
        self.checks.iter().filter(|c| c.blocks_submission()).collect()
    }

    pub fn check(&self, code: CheckCode) -> Option<&DodCheck> {
        self.checks.iter().find(|c| c.code == code)
    }
}

pub struct GateInput<'a> {
    pub attempt_number: u8,
    pub max_attempts: u8,
    pub required: &'a [RequiredComponent],
    pub rows: &'a [SourceRow],
}

pub fn evaluate(input: &GateInput<'_>) -> DodReport {
    let rows = input.rows;
    let required = coverage::unique_components(input.required);
    let by_component = coverage::rows_by_component(rows);
    let covered = |c: &RequiredComponent| {
        by_component
            .get(&c.key())
            .is_some_and(|rows| coverage::is_covered(rows.as_slice()))
    };

    let mut checks = Vec::with_capacity(8);

    let inoperable = rows
        .iter()
        .filter(|r| r.is_accepted() && !r.has_usable_url())
        .count();
    checks.push(DodCheck {
        code: CheckCode::UrlOperable,
        pass: inoperable == 0,
        message: if inoperable == 0 {
            "every accepted source has a working URL".to_owned()
        } else {
            format!("{inoperable} accepted source(s) have no working URL")
        },
        severity: Severity::Error,
    });

    let uncovered = required.iter().filter(|c| !covered(*c)).count();
    checks.push(DodCheck {
        code: CheckCode::ComponentCoverage,
        pass: uncovered == 0,
        message: format!(
            "{}/{} components covered",
            required.len() - uncovered,
            required.len()
        ),
        severity: Severity::Warning,
    });

    let critical = required.iter().filter(|c| c.is_critical).collect::<Vec<_>>();
    let critical_uncovered = critical.iter().filter(|c| !covered(**c)).count();
    checks.push(DodCheck {
        code: CheckCode::CriticalCoverage,
        pass: critical_uncovered == 0,
        message: format!(
            "{}/{} critical components covered",
            critical.len() - critical_uncovered,
            critical.len()
        ),
        severity: Severity::Warning,
    });

    let missing_reason = rows
        .iter()
        .filter(|r| r.is_rejected() && !r.has_rejection_reason())
        .count();
    checks.push(DodCheck {
        code: CheckCode::RejectionReasons,
        pass: missing_reason == 0,
        message: if missing_reason == 0 {
            "every rejected source has a reason".to_owned()
        } else {
            format!("{missing_reason} rejected source(s) lack a reason")
        },
        severity: Severity::Error,
    });

    let known = required.iter().map(|c| c.key()).collect::<HashSet<_>>();
    let mut orphans = rows
        .iter()
        .map(SourceRow::key)
        .filter(|key| !known.contains(key))
        .collect::<Vec<ComponentKey>>();
    orphans.sort();
    orphans.dedup();
    checks.push(DodCheck {
        code: CheckCode::NoOrphans,
        pass: orphans.is_empty(),
        message: if orphans.is_empty() {
            "every source belongs to a required component".to_owned()
        } else {
            let sample = orphans
                .iter()
                .take(5)
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            format!("{} unknown component(s): {sample}", orphans.len())
        },
        severity: Severity::Error,
    });

    checks.push(DodCheck {
        code: CheckCode::AttemptLimit,
        pass: input.attempt_number <= input.max_attempts,
        message: format!(
            "attempt {} of at most {}",
            input.attempt_number, input.max_attempts
        ),
        severity: Severity::Error,
    });

    let unevaluated = rows.iter().filter(|r| r.apta.is_none()).count();
    checks.push(DodCheck {
        code: CheckCode::AllEvaluated,
        pass: unevaluated == 0,
        message: if unevaluated == 0 {
            "every source has been reviewed".to_owned()
        } else {
            format!("{unevaluated} source(s) still await review")
        },
        severity: Severity::Error,
    });

    let pending = rows
        .iter()
        .filter(|r| r.url_status == UrlStatus::Pending)
        .count();
    checks.push(DodCheck {
        code: CheckCode::NoPendingUrls,
        pass: pending == 0,
        message: if pending == 0 {
            "no URL check is pending".to_owned()
        } else {
            format!("{pending} URL check(s) pending")
        },
        severity: Severity::Error,
    });

    let releasable = !checks.iter().any(DodCheck::blocks_submission);
    DodReport {
        checks,
        releasable,
        gaps: coverage::detect_gaps(rows, input.required),
    }
}

/// Submission needs a clean report, or at least one blocker that acknowledges
/// what is still unresolved.
pub fn can_submit_to_qa(report: &DodReport, blockers: &[Blocker]) -> bool {
    report.releasable || !blockers.is_empty()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt2Decision {
    pub enabled: bool,
    pub reason: String,
}

pub fn should_enable_attempt2(
    attempt: &CurationAttempt,
    gaps: &[Gap],
    max_attempts: u8,
) -> Attempt2Decision {
    if gaps.is_empty() {
        return Attempt2Decision {
            enabled: false,
            reason: "all components covered".to_owned(),
        };
    }
    if attempt.attempt_number >= max_attempts {
        return Attempt2Decision {
            enabled: false,
            reason: "maximum attempts reached".to_owned(),
        };
    }
    if !attempt.state.is_reviewable() {
        return Attempt2Decision {
            enabled: false,
            reason: "attempt is not in a reviewable state".to_owned(),
        };
    }
    Attempt2Decision {
        enabled: true,
        reason: format!("{} gaps remain", gaps.len()),
    }
}

/// One blocker per gap that has none yet.
pub fn blockers_for_gaps(gaps: &[Gap], existing: &[Blocker], owner: &str) -> Vec<Blocker> {
    let known = existing.iter().map(Blocker::key).collect::<HashSet<_>>();
    gaps.iter()
        .filter(|gap| !known.contains(&gap.key()))
        .map(|gap| Blocker {
            blocker_id: uuid::Uuid::new_v4().to_string(),
            lesson_id: gap.lesson_id.clone(),
            component_name: gap.component_name.clone(),
            impact: format!(
                "{}{:?}: {}",
                if gap.is_critical { "critical, " } else { "" },
                gap.reason,
                gap.details
            ),
            owner: owner.to_owned(),
            status: BlockerStatus::Open,
            created_at: Utc::now(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::apply_url_status;
    use crate::state::AttemptState;

    fn component(lesson: &str, name: &str, critical: bool) -> RequiredComponent {
        RequiredComponent {
            lesson_id: lesson.to_owned(),
            lesson_title: format!("Lesson {lesson}"),
            component_name: name.to_owned(),
            is_critical: critical,
        }
    }

    fn accepted(lesson: &str, name: &str) -> SourceRow {
        let mut row = SourceRow::new(&ComponentKey::new(lesson, name), "https://e.com", "t", "r");
        apply_url_status(&mut row, UrlStatus::Ok);
        row.apta = Some(true);
        row.coverage_complete = Some(true);
        row
    }

    fn attempt(number: u8, state: AttemptState) -> CurationAttempt {
        CurationAttempt {
            attempt_id: "a1".to_owned(),
            course_id: "c1".to_owned(),
            attempt_number: number,
            state,
            qa_decision: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn clean_set_is_releasable_with_eight_checks() {
        let required = [component("L1", "READING", true)];
        let rows = [accepted("L1", "READING")];
        let report = evaluate(&GateInput {
            attempt_number: 1,
            max_attempts: 2,
            required: &required,
            rows: &rows,
        });
        assert_eq!(report.checks.len(), 8);
        assert!(report.checks.iter().all(|c| c.pass), "{report:?}");
        assert!(report.releasable);
        assert!(report.gaps.is_empty());
    }

    #[test]
    fn coverage_failures_are_only_warnings() {
        let required = [
            component("L1", "READING", true),
            component("L2", "VIDEO", false),
        ];
        let rows = [accepted("L1", "READING")];
        let report = evaluate(&GateInput {
            attempt_number: 1,
            max_attempts: 2,
            required: &required,
            rows: &rows,
        });
        let coverage = report.check(CheckCode::ComponentCoverage).unwrap();
        assert!(!coverage.pass);
        assert_eq!(coverage.severity, Severity::Warning);
        assert!(report.releasable);
    }

    #[test]
    fn error_checks_block_release() {
        let required = [component("L1", "READING", false)];
        let mut unreviewed = accepted("L1", "READING");
        unreviewed.apta = None;
        let mut orphan = accepted("L7", "QUIZ");
        orphan.apta = Some(false);
        orphan.rejection_reason = None;
        let mut pending = accepted("L1", "READING");
        pending.row_id = "r_pending".to_owned();
        pending.url_status = UrlStatus::Pending;
        pending.apta = None;
        let rows = [unreviewed, orphan, pending];
        let report = evaluate(&GateInput {
            attempt_number: 3,
            max_attempts: 2,
            required: &required,
            rows: &rows,
        });
        let failing = report
            .failing_errors()
            .iter()
            .map(|c| c.code)
            .collect::<Vec<_>>();
        assert_eq!(
            failing,
            vec![
                CheckCode::RejectionReasons,
                CheckCode::NoOrphans,
                CheckCode::AttemptLimit,
                CheckCode::AllEvaluated,
                CheckCode::NoPendingUrls,
            ]
        );
        assert!(!report.releasable);
    }

    #[test]
    fn accepted_unreachable_row_fails_url_operability() {
        let required = [component("L1", "READING", false)];
        let mut row = accepted("L1", "READING");
        row.url_status = UrlStatus::Timeout;
        let rows = [row];
        let report = evaluate(&GateInput {
            attempt_number: 1,
            max_attempts: 2,
            required: &required,
            rows: &rows,
        });
        assert!(report.check(CheckCode::UrlOperable).unwrap().blocks_submission());
    }

    #[test]
    fn submission_needs_clean_report_or_blocker() {
        let required = [component("L1", "READING", false)];
        let mut row = accepted("L1", "READING");
        row.apta = None;
        let rows = [row];
        let report = evaluate(&GateInput {
            attempt_number: 1,
            max_attempts: 2,
            required: &required,
            rows: &rows,
        });
        assert_eq!(report.failing_errors().len(), 1);
        assert!(!can_submit_to_qa(&report, &[]));

        let gaps = [Gap {
            lesson_id: "L1".to_owned(),
            component_name: "READING".to_owned(),
            is_critical: false,
            reason: coverage::GapReason::NoSources,
            details: "none".to_owned(),
        }];
        let blockers = blockers_for_gaps(&gaps, &[], "team");
        assert!(can_submit_to_qa(&report, &blockers));
    }

    #[test]
    fn attempt2_is_disabled_when_nothing_is_missing() {
        let decision = should_enable_attempt2(&attempt(2, AttemptState::HitlReview), &[], 2);
        assert!(!decision.enabled);
        assert_eq!(decision.reason, "all components covered");
    }

    #[test]
    fn attempt2_respects_cap_and_state() {
        let gaps = detect_one_gap();
        assert!(!should_enable_attempt2(&attempt(2, AttemptState::HitlReview), &gaps, 2).enabled);
        assert!(!should_enable_attempt2(&attempt(1, AttemptState::Generating), &gaps, 2).enabled);
        let decision = should_enable_attempt2(&attempt(1, AttemptState::HitlReview), &gaps, 2);
        assert!(decision.enabled);
        assert_eq!(decision.reason, "1 gaps remain");
    }

    #[test]
    fn blockers_are_not_duplicated() {
        let gaps = detect_one_gap();
        let first = blockers_for_gaps(&gaps, &[], "team");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, BlockerStatus::Open);
        assert!(first[0].impact.starts_with("critical"));
        assert!(blockers_for_gaps(&gaps, &first, "team").is_empty());
    }

    fn detect_one_gap() -> Vec<Gap> {
        coverage::detect_gaps(&[], &[component("L1", "READING", true)])
    }
}
