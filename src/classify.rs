use chrono::Utc;

use crate::formats::{AutoReason, SourceRow, UrlStatus};

pub fn auto_reason_for(status: UrlStatus) -> Option<AutoReason> {
    match status {
        UrlStatus::Pending | UrlStatus::Ok | UrlStatus::Manual => None,
        UrlStatus::NotFound => Some(AutoReason::Http404),
        UrlStatus::Forbidden => Some(AutoReason::Http403),
        UrlStatus::AuthRequired => Some(AutoReason::Http401),
        UrlStatus::ServerError => Some(AutoReason::Http5xx),
        UrlStatus::Timeout => Some(AutoReason::Timeout),
        UrlStatus::DnsFail => Some(AutoReason::DnsFail),
        UrlStatus::TlsError => Some(AutoReason::TlsError),
        UrlStatus::ConnectionError => Some(AutoReason::ConnectionError),
        UrlStatus::InvalidUrl => Some(AutoReason::InvalidUrl),
        UrlStatus::InvalidUrlTruncated => Some(AutoReason::UrlTruncated),
    }
}

pub fn rejection_text(reason: AutoReason) -> &'static str {
    match reason {
        AutoReason::Http404 => "The page no longer exists (HTTP 404/410).",
        AutoReason::Http403 => "The site refuses access to this page (HTTP 403).",
        AutoReason::Http401 => "The page requires a login (HTTP 401).",
        AutoReason::Http5xx => "The site returned a server error.",
        AutoReason::Timeout => "The site did not answer in time.",
        AutoReason::DnsFail => "The domain does not resolve.",
        AutoReason::TlsError => "The site's TLS certificate could not be verified.",
        AutoReason::ConnectionError => "The page could not be retrieved.",
        AutoReason::InvalidUrl => "The URL is malformed.",
        AutoReason::UrlTruncated => "The URL is truncated.",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    AutoRejected(AutoReason),
    Cleared,
    Unchanged,
}

/// Re-evaluates a row after its `url_status` changed. Never sets `apta=true`.
pub fn auto_classify(row: &mut SourceRow) -> Classification {
    let outcome = match auto_reason_for(row.url_status) {
        Some(_) if row.forbidden_override && row.url_status.is_overridable() => {
            Classification::Unchanged
        }
        Some(reason) => {
            row.apta = Some(false);
            row.auto_evaluated = true;
            row.auto_reason = Some(reason);
            row.rejection_reason = Some(rejection_text(reason).to_owned());
            Classification::AutoRejected(reason)
        }
        None if row.url_status == UrlStatus::Pending => Classification::Unchanged,
        None if row.auto_evaluated => {
            clear_auto_rejection(row);
            Classification::Cleared
        }
        None => Classification::Unchanged,
    };
    if outcome != Classification::Unchanged {
        row.updated_at = Utc::now();
    }
    outcome
}

/// Sets a new status and classifies in one step; drops a stale override when
/// the URL is no longer in an overridable state.
pub fn apply_url_status(row: &mut SourceRow, status: UrlStatus) -> Classification {
    row.url_status = status;
    if row.forbidden_override && !status.is_overridable() {
        row.forbidden_override = false;
    }
    auto_classify(row)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OverrideError {
    #[error("row {row_id} has status {status}; only FORBIDDEN or AUTH_REQUIRED can be overridden")]
    NotOverridable { row_id: String, status: UrlStatus },
}

/// Reviewer asserts the page is reachable despite a 401/403. The row goes back
/// to un-reviewed rather than accepted.
pub fn apply_forbidden_override(row: &mut SourceRow) -> Result<(), OverrideError> {
    if !row.url_status.is_overridable() {
        return Err(OverrideError::NotOverridable {
            row_id: row.row_id.clone(),
            status: row.url_status,
        });
    }
    row.forbidden_override = true;
    if row.auto_evaluated {
        clear_auto_rejection(row);
    }
    row.updated_at = Utc::now();
    Ok(())
}

fn clear_auto_rejection(row: &mut SourceRow) {
    row.apta = None;
    row.auto_evaluated = false;
    row.auto_reason = None;
    row.rejection_reason = None;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("row {0} is accepted without a usable URL")]
    AcceptedWithoutUsableUrl(String),
    #[error("row {0} is rejected without a reason")]
    RejectedWithoutReason(String),
    #[error("row {0} has an empty source reference")]
    EmptySourceRef(String),
    #[error("row {0} points at an unreachable URL and must stay rejected")]
    UnreachableNotRejected(String),
}

pub fn check_invariants(row: &SourceRow) -> Result<(), InvariantViolation> {
    if row.source_ref.trim().is_empty() {
        return Err(InvariantViolation::EmptySourceRef(row.row_id.clone()));
    }
    if row.is_accepted() && !row.has_usable_url() {
        return Err(InvariantViolation::AcceptedWithoutUsableUrl(
            row.row_id.clone(),
        ));
    }
    if row.is_rejected() && !row.has_rejection_reason() {
        return Err(InvariantViolation::RejectedWithoutReason(row.row_id.clone()));
    }
    if row.url_status.is_failure() && !row.forbidden_override && !row.is_rejected() {
        return Err(InvariantViolation::UnreachableNotRejected(
            row.row_id.clone(),
        ));
    }
    Ok(())
}
