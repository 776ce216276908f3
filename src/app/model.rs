use serde::{Deserialize, Serialize};

use crate::cli::SearchEngine;
use crate::formats::{Blocker, CurationAttempt, LogEntry, RequiredComponent, SourceRow};
use crate::lease::ValidationLease;

/// Payload of the inbound trigger that starts curation for a course.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCurationRequest {
    pub course_id: String,
    #[serde(default)]
    pub course_title: String,
    pub components: Vec<RequiredComponent>,
    #[serde(default = "StartCurationRequest::default_engine")]
    pub engine: SearchEngine,
    /// Start the worker right away instead of leaving the attempt in DRAFT.
    #[serde(default = "StartCurationRequest::default_autostart")]
    pub autostart: bool,
}

impl StartCurationRequest {
    pub fn default_engine() -> SearchEngine {
        SearchEngine::Openai
    }

    pub fn default_autostart() -> bool {
        true
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.course_id.trim().is_empty() {
            anyhow::bail!("course_id is required");
        }
        if self.components.is_empty() {
            anyhow::bail!("components must not be empty");
        }
        for (idx, c) in self.components.iter().enumerate() {
            if c.lesson_id.trim().is_empty() || c.component_name.trim().is_empty() {
                anyhow::bail!("components[{idx}] needs lesson_id and component_name");
            }
        }
        Ok(())
    }

    pub fn display_title(&self) -> &str {
        if self.course_title.trim().is_empty() {
            &self.course_id
        } else {
            &self.course_title
        }
    }
}

/// Everything the review UI needs about one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptView {
    pub attempt: CurationAttempt,
    pub components: Vec<RequiredComponent>,
    pub rows: Vec<SourceRow>,
    pub blockers: Vec<Blocker>,
    pub log_entries: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_lease: Option<ValidationLease>,
}
