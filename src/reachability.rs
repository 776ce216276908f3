use std::error::Error as _;
use std::net::IpAddr;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ReachabilityConfig;
use crate::formats::{SourceRow, UrlStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReachabilityReport {
    pub status: UrlStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ReachabilityReport {
    fn new(status: UrlStatus) -> Self {
        Self {
            status,
            http_code: None,
            final_url: None,
            failure_reason: None,
            checked_at: Utc::now(),
        }
    }

    fn failed(status: UrlStatus, reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::new(status)
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.status == UrlStatus::Ok
    }

    /// Copies probe results onto a row. Classification is left to the caller.
    pub fn write_to(&self, row: &mut SourceRow) {
        row.url_status = self.status;
        row.http_status_code = self.http_code;
        row.last_checked_at = Some(self.checked_at);
        row.failure_reason = self.failure_reason.clone();
        row.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedUrl {
    Valid(Url),
    Truncated(String),
    Invalid(String),
}

/// Cleans up a URL as written by a model or a human: trims wrapping punctuation,
/// infers a missing scheme, and rejects truncated or implausible hosts.
pub fn normalize_url(raw: &str) -> NormalizedUrl {
    let trimmed = raw
        .trim()
        .trim_start_matches(['<', '(', '"', '\''])
        .trim_end_matches(['>', ')', '"', '\'', ',', ';']);
    if trimmed.is_empty() {
        return NormalizedUrl::Invalid("empty url".to_owned());
    }
    if is_truncated(trimmed) {
        return NormalizedUrl::Truncated(format!("url looks truncated: {trimmed}"));
    }
    let trimmed = trimmed.trim_end_matches('.');
    if trimmed.chars().any(char::is_whitespace) {
        return NormalizedUrl::Invalid(format!("url contains whitespace: {trimmed}"));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_owned()
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        format!("https://{trimmed}")
    };

    let mut url = match Url::parse(&with_scheme) {
        Ok(url) => url,
        Err(err) => return NormalizedUrl::Invalid(format!("parse url: {err}")),
    };
    if url.scheme() != "http" && url.scheme() != "https" {
        return NormalizedUrl::Invalid(format!("unsupported scheme: {}", url.scheme()));
    }
    let Some(host) = url.host_str() else {
        return NormalizedUrl::Invalid("url has no host".to_owned());
    };
    if !is_plausible_host(host) {
        return NormalizedUrl::Invalid(format!("implausible host: {host}"));
    }
    url.set_fragment(None);
    NormalizedUrl::Valid(url)
}

pub fn is_truncated(raw: &str) -> bool {
    raw.contains('\u{2026}')
        || raw.to_ascii_lowercase().contains("%e2%80%a6")
        || raw.trim_end().ends_with("...")
}

fn is_plausible_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.parse::<IpAddr>().is_ok() || host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let labels = host.split('.').collect::<Vec<_>>();
    if labels.len() < 2 {
        return false;
    }
    let valid_label = |label: &&str| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    if !labels.iter().all(valid_label) {
        return false;
    }
    labels
        .last()
        .is_some_and(|tld| tld.len() >= 2 && !tld.chars().all(|c| c.is_ascii_digit()))
}

/// Maps a final HTTP status (after redirects) onto the status taxonomy.
pub fn status_from_http(code: StatusCode) -> (UrlStatus, Option<String>) {
    let c = code.as_u16();
    match c {
        200..=299 => (UrlStatus::Ok, None),
        300..=399 => (
            UrlStatus::ConnectionError,
            Some(format!("unresolved redirect (HTTP {c})")),
        ),
        401 => (UrlStatus::AuthRequired, Some("HTTP 401".to_owned())),
        403 => (UrlStatus::Forbidden, Some("HTTP 403".to_owned())),
        404 | 410 => (UrlStatus::NotFound, Some(format!("HTTP {c}"))),
        500..=599 => (UrlStatus::ServerError, Some(format!("HTTP {c}"))),
        _ => (UrlStatus::ConnectionError, Some(format!("HTTP {c}"))),
    }
}

/// Classifies a transport failure from its timeout flag and rendered source chain.
pub fn status_from_transport(is_timeout: bool, chain: &str) -> UrlStatus {
    let chain = chain.to_ascii_lowercase();
    if is_timeout || chain.contains("timed out") || chain.contains("deadline has elapsed") {
        return UrlStatus::Timeout;
    }
    if chain.contains("dns error")
        || chain.contains("failed to lookup address")
        || chain.contains("name or service not known")
        || chain.contains("no such host")
        || chain.contains("nodename nor servname")
    {
        return UrlStatus::DnsFail;
    }
    if chain.contains("certificate")
        || chain.contains("tls")
        || chain.contains("ssl")
        || chain.contains("handshake")
    {
        return UrlStatus::TlsError;
    }
    UrlStatus::ConnectionError
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}

/// Anything that can turn a URL into a terminal reachability outcome.
#[async_trait]
pub trait UrlProbe: Send + Sync {
    async fn check(&self, url: &str) -> ReachabilityReport;
}

#[derive(Debug, Clone)]
pub struct ReachabilityChecker {
    client: reqwest::Client,
    user_agent: String,
}

impl ReachabilityChecker {
    pub fn new(config: &ReachabilityConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .context("build reachability http client")?;
        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
        })
    }

    /// Probes `raw_url`. Never fails: every outcome is a terminal status.
    pub async fn check(&self, raw_url: &str) -> ReachabilityReport {
        let url = match normalize_url(raw_url) {
            NormalizedUrl::Valid(url) => url,
            NormalizedUrl::Truncated(reason) => {
                return ReachabilityReport::failed(UrlStatus::InvalidUrlTruncated, reason);
            }
            NormalizedUrl::Invalid(reason) => {
                return ReachabilityReport::failed(UrlStatus::InvalidUrl, reason);
            }
        };

        let report = match self.probe(reqwest::Method::HEAD, &url).await {
            Ok(response) if !matches!(response.status().as_u16(), 405 | 501) => {
                report_from_response(&response)
            }
            Ok(response) => {
                tracing::debug!(url = %url, status = %response.status(), "HEAD not supported; retrying with GET");
                self.check_with_get(&url).await
            }
            Err(err) => {
                tracing::debug!(url = %url, error = %error_chain(&err), "HEAD failed; retrying with GET");
                self.check_with_get(&url).await
            }
        };

        tracing::debug!(
            url = %url,
            status = %report.status,
            http_code = ?report.http_code,
            "reachability checked"
        );
        report
    }

    async fn check_with_get(&self, url: &Url) -> ReachabilityReport {
        match self.probe(reqwest::Method::GET, url).await {
            Ok(response) => report_from_response(&response),
            Err(err) => {
                let chain = error_chain(&err);
                let status = status_from_transport(err.is_timeout(), &chain);
                ReachabilityReport::failed(status, chain)
            }
        }
    }

    async fn probe(
        &self,
        method: reqwest::Method,
        url: &Url,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .request(method, url.clone())
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
    }
}

#[async_trait]
impl UrlProbe for ReachabilityChecker {
    async fn check(&self, url: &str) -> ReachabilityReport {
        ReachabilityChecker::check(self, url).await
    }
}

fn report_from_response(response: &reqwest::Response) -> ReachabilityReport {
    let (status, failure_reason) = status_from_http(response.status());
    ReachabilityReport {
        status,
        http_code: Some(response.status().as_u16()),
        final_url: Some(response.url().to_string()),
        failure_reason,
        checked_at: Utc::now(),
    }
}
