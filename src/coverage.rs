use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::formats::{ComponentKey, RequiredComponent, SourceRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GapReason {
    NoSources,
    UrlFail,
    AuthRequired,
    NoCoverage,
    AllRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub lesson_id: String,
    pub component_name: String,
    pub is_critical: bool,
    pub reason: GapReason,
    pub details: String,
}

impl Gap {
    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(&self.lesson_id, &self.component_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub covered: usize,
    pub total: usize,
}

impl CoverageSummary {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.covered as f64 / self.total as f64
    }

    pub fn percent(&self) -> u32 {
        (self.ratio() * 100.0).floor() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.covered >= self.total
    }
}

pub fn rows_by_component(rows: &[SourceRow]) -> HashMap<ComponentKey, Vec<&SourceRow>> {
    let mut map: HashMap<ComponentKey, Vec<&SourceRow>> = HashMap::new();
    for row in rows {
        map.entry(row.key()).or_default().push(row);
    }
    map
}

/// Strict coverage used by gating: accepted, complete, and reachable (or overridden).
pub fn is_covered(rows: &[&SourceRow]) -> bool {
    rows.iter().any(|row| row.is_fully_valid())
}

/// Looser coverage used by the worker: some row is reachable, not rejected and
/// not judged incomplete, so spending more search calls on the component is
/// pointless. Once a reviewer accepted a row the component only counts when it
/// is fully covered; an accepted but incomplete source must be searched again.
pub fn has_candidate(rows: &[&SourceRow]) -> bool {
    if rows.iter().any(|row| row.is_accepted()) {
        return is_covered(rows);
    }
    rows.iter().any(|row| {
        row.has_usable_url() && !row.is_rejected() && row.coverage_complete != Some(false)
    })
}

pub fn strict_summary(rows: &[SourceRow], required: &[RequiredComponent]) -> CoverageSummary {
    summarize(rows, required, is_covered)
}

pub fn candidate_summary(rows: &[SourceRow], required: &[RequiredComponent]) -> CoverageSummary {
    summarize(rows, required, has_candidate)
}

fn summarize(
    rows: &[SourceRow],
    required: &[RequiredComponent],
    counts: fn(&[&SourceRow]) -> bool,
) -> CoverageSummary {
    let by_component = rows_by_component(rows);
    let unique = unique_components(required);
    let covered = unique
        .iter()
        .filter(|c| {
            by_component
                .get(&c.key())
                .is_some_and(|rows| counts(rows.as_slice()))
        })
        .count();
    CoverageSummary {
        covered,
        total: unique.len(),
    }
}

/// Components without a candidate, critical first, then by lesson and name.
pub fn uncovered_prioritized(
    rows: &[SourceRow],
    required: &[RequiredComponent],
) -> Vec<RequiredComponent> {
    let by_component = rows_by_component(rows);
    let mut uncovered = unique_components(required)
        .into_iter()
        .filter(|c| {
            !by_component
                .get(&c.key())
                .is_some_and(|rows| has_candidate(rows.as_slice()))
        })
        .collect::<Vec<_>>();
    uncovered.sort_by(|a, b| {
        b.is_critical
            .cmp(&a.is_critical)
            .then_with(|| a.key().cmp(&b.key()))
    });
    uncovered
}

/// Drops repeated (lesson, component) declarations, keeping the first and
/// merging criticality.
pub fn unique_components(required: &[RequiredComponent]) -> Vec<RequiredComponent> {
    let mut order: Vec<ComponentKey> = Vec::new();
    let mut by_key: BTreeMap<ComponentKey, RequiredComponent> = BTreeMap::new();
    for component in required {
        let key = component.key();
        match by_key.get_mut(&key) {
            Some(existing) => existing.is_critical |= component.is_critical,
            None => {
                order.push(key.clone());
                by_key.insert(key, component.clone());
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

pub fn classify_component(rows: &[&SourceRow]) -> Option<(GapReason, String)> {
    if rows.is_empty() {
        return Some((GapReason::NoSources, "no candidate sources".to_owned()));
    }
    if is_covered(rows) {
        return None;
    }

    let total = rows.len();
    let auth_blocked = rows
        .iter()
        .filter(|r| r.url_status.is_overridable() && !r.forbidden_override)
        .count();
    if auth_blocked == total {
        return Some((
            GapReason::AuthRequired,
            format!("all {total} source(s) require authentication or refuse access"),
        ));
    }

    let failed = rows
        .iter()
        .filter(|r| r.url_status.is_failure() && !r.forbidden_override)
        .collect::<Vec<_>>();
    if failed.len() == total {
        let mut statuses = failed
            .iter()
            .map(|r| r.url_status.as_str())
            .collect::<Vec<_>>();
        statuses.sort_unstable();
        statuses.dedup();
        return Some((
            GapReason::UrlFail,
            format!(
                "all {total} source URL(s) failed ({})",
                statuses.join(", ")
            ),
        ));
    }

    if rows.iter().all(|r| r.is_rejected()) {
        return Some((
            GapReason::AllRejected,
            format!("all {total} source(s) rejected by review"),
        ));
    }

    if rows.iter().any(|r| r.is_accepted()) {
        return Some((
            GapReason::NoCoverage,
            "accepted source(s) do not fully cover the component".to_owned(),
        ));
    }

    None
}

/// Pure and deterministic: the same inputs always produce the same gaps in
/// the order of `required`.
pub fn detect_gaps(rows: &[SourceRow], required: &[RequiredComponent]) -> Vec<Gap> {
    let by_component = rows_by_component(rows);
    unique_components(required)
        .into_iter()
        .filter_map(|component| {
            let component_rows = by_component
                .get(&component.key())
                .map(Vec::as_slice)
                .unwrap_or_default();
            let (reason, details) = classify_component(component_rows)?;
            Some(Gap {
                lesson_id: component.lesson_id,
                component_name: component.component_name,
                is_critical: component.is_critical,
                reason,
                details,
            })
        })
        .collect()
}
