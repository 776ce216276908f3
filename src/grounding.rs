//! Anti-hallucination gate: a model-written source only survives when it can be
//! traced to a URL the search provider attests it actually used.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::formats::ComponentKey;

/// A candidate source as written by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub component: ComponentKey,
    pub title: String,
    pub url: String,
    pub rationale: String,
}

/// A URL the provider reports as search evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedCitation {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attestation {
    Exact(AttestedCitation),
    Contained(AttestedCitation),
    ProviderRedirect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedClaim {
    pub claim: Claim,
    pub attestation: Attestation,
}

impl AcceptedClaim {
    /// URLs worth probing for this claim, in order of preference.
    pub fn candidate_urls(&self) -> Vec<String> {
        let mut urls = vec![self.claim.url.trim().to_owned()];
        if let Attestation::Contained(citation) = &self.attestation
            && citation.url.trim() != self.claim.url.trim()
        {
            urls.push(citation.url.trim().to_owned());
        }
        urls
    }

    fn richness(&self) -> usize {
        self.claim.rationale.trim().chars().count() + self.claim.title.trim().chars().count()
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    redirect_prefixes: Vec<String>,
}

impl Reconciler {
    pub fn new(redirect_prefixes: &[String]) -> Self {
        Self {
            redirect_prefixes: redirect_prefixes
                .iter()
                .map(|p| p.trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn is_provider_redirect(&self, url: &str) -> bool {
        let lower = url.trim().to_ascii_lowercase();
        self.redirect_prefixes
            .iter()
            .any(|prefix| lower.starts_with(prefix.as_str()))
    }

    /// Keeps only claims traceable to `attested`. When several claims map to the
    /// same evidence, the one with the richer title/rationale wins.
    pub fn reconcile(&self, claims: &[Claim], attested: &[AttestedCitation]) -> Vec<AcceptedClaim> {
        let mut accepted: Vec<AcceptedClaim> = Vec::new();
        let mut slot_by_evidence: HashMap<String, usize> = HashMap::new();

        for claim in claims {
            if claim.url.trim().is_empty() {
                continue;
            }
            let Some(attestation) = self.attest(claim, attested) else {
                tracing::debug!(
                    component = %claim.component,
                    url = %claim.url,
                    "dropping claim without grounding evidence"
                );
                continue;
            };

            let evidence_key = match &attestation {
                Attestation::Exact(c) | Attestation::Contained(c) => c.url.trim().to_owned(),
                Attestation::ProviderRedirect => claim.url.trim().to_owned(),
            };
            let candidate = AcceptedClaim {
                claim: claim.clone(),
                attestation,
            };

            match slot_by_evidence.get(&evidence_key) {
                Some(&idx) => {
                    if candidate.richness() > accepted[idx].richness() {
                        accepted[idx] = candidate;
                    }
                }
                None => {
                    slot_by_evidence.insert(evidence_key, accepted.len());
                    accepted.push(candidate);
                }
            }
        }

        accepted
    }

    fn attest(&self, claim: &Claim, attested: &[AttestedCitation]) -> Option<Attestation> {
        let claim_url = claim.url.trim();
        if let Some(citation) = attested.iter().find(|c| c.url.trim() == claim_url) {
            return Some(Attestation::Exact(citation.clone()));
        }
        if self.is_provider_redirect(claim_url) {
            return Some(Attestation::ProviderRedirect);
        }

        let claim_key = MatchKey::parse(claim_url)?;
        attested.iter().find_map(|citation| {
            let key = MatchKey::parse(&citation.url)?;
            if claim_key == key {
                Some(Attestation::Exact(citation.clone()))
            } else if claim_key.contains_or_within(&key) {
                Some(Attestation::Contained(citation.clone()))
            } else {
                None
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MatchKey {
    host: String,
    path: String,
}

impl MatchKey {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let url = Url::parse(raw)
            .or_else(|_| Url::parse(&format!("https://{raw}")))
            .ok()?;
        let host = url.host_str()?.to_ascii_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host).to_owned();
        let path = url.path().trim_end_matches('/').to_ascii_lowercase();
        Some(Self { host, path })
    }

    /// Same host, and one path is a segment-aligned prefix of the other. A bare
    /// domain never vouches for deeper pages.
    fn contains_or_within(&self, other: &MatchKey) -> bool {
        if self.host != other.host || self.path.is_empty() || other.path.is_empty() {
            return false;
        }
        let (short, long) = if self.path.len() <= other.path.len() {
            (&self.path, &other.path)
        } else {
            (&other.path, &self.path)
        };
        long == short || long.starts_with(&format!("{short}/"))
    }
}
