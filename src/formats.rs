use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::state::AttemptState;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequiredComponent {
    pub lesson_id: String,
    pub lesson_title: String,
    pub component_name: String,
    #[serde(default)]
    pub is_critical: bool,
}

impl RequiredComponent {
    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(&self.lesson_id, &self.component_name)
    }
}

/// Identifies a (lesson, component) pair independently of titles and criticality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentKey {
    pub lesson_id: String,
    pub component_name: String,
}

impl ComponentKey {
    pub fn new(lesson_id: &str, component_name: &str) -> Self {
        Self {
            lesson_id: lesson_id.trim().to_owned(),
            component_name: component_name.trim().to_ascii_uppercase(),
        }
    }
}

impl std::fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.lesson_id, self.component_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UrlStatus {
    Pending,
    Ok,
    Manual,
    NotFound,
    Forbidden,
    AuthRequired,
    Timeout,
    DnsFail,
    TlsError,
    ConnectionError,
    ServerError,
    InvalidUrl,
    InvalidUrlTruncated,
}

impl UrlStatus {
    /// `OK` and `MANUAL` are the only statuses a source can be accepted with
    /// (besides an explicit forbidden override).
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Ok | Self::Manual)
    }

    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Ok | Self::Manual | Self::Pending)
    }

    /// Statuses a reviewer may override after confirming access out of band.
    pub fn is_overridable(self) -> bool {
        matches!(self, Self::Forbidden | Self::AuthRequired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Ok => "OK",
            Self::Manual => "MANUAL",
            Self::NotFound => "NOT_FOUND",
            Self::Forbidden => "FORBIDDEN",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::Timeout => "TIMEOUT",
            Self::DnsFail => "DNS_FAIL",
            Self::TlsError => "TLS_ERROR",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::ServerError => "SERVER_ERROR",
            Self::InvalidUrl => "INVALID_URL",
            Self::InvalidUrlTruncated => "INVALID_URL_TRUNCATED",
        }
    }
}

impl std::fmt::Display for UrlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reason attached to automatic rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoReason {
    #[serde(rename = "HTTP_404")]
    Http404,
    #[serde(rename = "HTTP_403")]
    Http403,
    #[serde(rename = "HTTP_401")]
    Http401,
    #[serde(rename = "HTTP_5XX")]
    Http5xx,
    Timeout,
    DnsFail,
    TlsError,
    ConnectionError,
    InvalidUrl,
    UrlTruncated,
}

impl AutoReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http404 => "HTTP_404",
            Self::Http403 => "HTTP_403",
            Self::Http401 => "HTTP_401",
            Self::Http5xx => "HTTP_5XX",
            Self::Timeout => "TIMEOUT",
            Self::DnsFail => "DNS_FAIL",
            Self::TlsError => "TLS_ERROR",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::InvalidUrl => "INVALID_URL",
            Self::UrlTruncated => "URL_TRUNCATED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRow {
    pub row_id: String,
    pub lesson_id: String,
    pub component_name: String,
    pub source_ref: String,
    #[serde(default)]
    pub source_title: String,
    #[serde(default)]
    pub rationale: String,
    pub url_status: UrlStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Tri-state acceptance: `None` means not reviewed yet.
    #[serde(default)]
    pub apta: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub coverage_complete: Option<bool>,
    #[serde(default)]
    pub auto_evaluated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_reason: Option<AutoReason>,
    #[serde(default)]
    pub forbidden_override: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceRow {
    pub fn new(component: &ComponentKey, source_ref: &str, title: &str, rationale: &str) -> Self {
        let now = Utc::now();
        Self {
            row_id: row_id(component, source_ref),
            lesson_id: component.lesson_id.clone(),
            component_name: component.component_name.clone(),
            source_ref: source_ref.trim().to_owned(),
            source_title: title.trim().to_owned(),
            rationale: rationale.trim().to_owned(),
            url_status: UrlStatus::Pending,
            http_status_code: None,
            last_checked_at: None,
            failure_reason: None,
            apta: None,
            rejection_reason: None,
            coverage_complete: None,
            auto_evaluated: false,
            auto_reason: None,
            forbidden_override: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(&self.lesson_id, &self.component_name)
    }

    /// A row has a usable URL when the probe succeeded, the source is manual,
    /// or a reviewer vouched for a 401/403 target.
    pub fn has_usable_url(&self) -> bool {
        self.url_status.is_usable() || self.forbidden_override
    }

    pub fn is_accepted(&self) -> bool {
        self.apta == Some(true)
    }

    pub fn is_rejected(&self) -> bool {
        self.apta == Some(false)
    }

    pub fn is_fully_valid(&self) -> bool {
        self.is_accepted() && self.coverage_complete == Some(true) && self.has_usable_url()
    }

    pub fn has_rejection_reason(&self) -> bool {
        self.rejection_reason
            .as_deref()
            .is_some_and(|reason| !reason.trim().is_empty())
    }

    pub fn looks_like_url(&self) -> bool {
        let lower = self.source_ref.trim().to_ascii_lowercase();
        lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("www.")
    }
}

/// Stable id for a candidate so that reruns upsert instead of duplicating.
pub fn row_id(component: &ComponentKey, source_ref: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(component.lesson_id.as_bytes());
    hasher.update(b"|");
    hasher.update(component.component_name.as_bytes());
    hasher.update(b"|");
    hasher.update(source_ref.trim().as_bytes());
    let hash = hasher.finalize();
    format!("r_{}", hex::encode(&hash[..12]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QaDecision {
    Approved,
    Correctable,
    Blocked,
}

impl QaDecision {
    pub fn target_state(self) -> AttemptState {
        match self {
            Self::Approved => AttemptState::Approved,
            Self::Correctable => AttemptState::Correctable,
            Self::Blocked => AttemptState::Blocked,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationAttempt {
    pub attempt_id: String,
    pub course_id: String,
    pub attempt_number: u8,
    pub state: AttemptState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qa_decision: Option<QaDecision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockerStatus {
    Open,
    Mitigating,
    Accepted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blocker {
    pub blocker_id: String,
    pub lesson_id: String,
    pub component_name: String,
    pub impact: String,
    pub owner: String,
    pub status: BlockerStatus,
    pub created_at: DateTime<Utc>,
}

impl Blocker {
    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(&self.lesson_id, &self.component_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogEntryType {
    Decision,
    Discard,
    Gap,
    NextStep,
    Note,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_type: LogEntryType,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(entry_type: LogEntryType, message: impl Into<String>) -> Self {
        Self {
            entry_type,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}
