//! Profile resolution across prioritized data sources.
//!
//! Sources are queried one at a time in ascending priority. Transient failures
//! (timeouts, network errors, non-2xx) are retried per source with exponential
//! backoff; error envelopes and validation failures abandon the source at once.
//! The first record that validates wins.

use std::future::Future;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tccard_core::{
    order_sources, DataSource, IdentifierError, ProfileIdentifier, ProfileRecord,
    RawLookupResponse, ValidationError,
};
use tccard_storage::{FetchFailure, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

pub mod contact;

pub const CRATE_NAME: &str = "tccard-resolver";

/// Why a single source did not produce a profile.
#[derive(Debug, Error)]
pub enum SourceFailure {
    #[error("source unreachable: {0}")]
    Unreachable(#[from] FetchFailure),
    #[error("source has no match: {}", .message.as_deref().unwrap_or("no message"))]
    Rejected { message: Option<String> },
    #[error("invalid profile: {0}")]
    Invalid(#[from] ValidationError),
}

impl SourceFailure {
    /// Rejections and validation failures say something about the profile;
    /// transport failures do not.
    pub fn is_authoritative(&self) -> bool {
        !matches!(self, SourceFailure::Unreachable(_))
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            SourceFailure::Unreachable(_) => "unreachable",
            SourceFailure::Rejected { .. } => "source_rejected",
            SourceFailure::Invalid(err) => err.reason_code(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    MissingIdentifier(#[from] IdentifierError),
    #[error("profile not found in any data source")]
    NotFound { last_failure: Option<SourceFailure> },
    #[error("profile lookup cancelled")]
    Cancelled,
}

impl ResolveError {
    /// Stable code for the error-display collaborator.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ResolveError::MissingIdentifier(_) => "missing_identifier",
            ResolveError::NotFound { .. } => "not_found",
            ResolveError::Cancelled => "cancelled",
        }
    }

    pub fn last_failure_code(&self) -> Option<&'static str> {
        match self {
            ResolveError::NotFound {
                last_failure: Some(failure),
            } => Some(failure.reason_code()),
            _ => None,
        }
    }

    /// End-user text. Never includes transport details.
    pub fn user_message(&self) -> &'static str {
        match self {
            ResolveError::MissingIdentifier(_) => "No profile link provided",
            ResolveError::NotFound {
                last_failure: Some(SourceFailure::Invalid(ValidationError::Inactive { .. })),
            } => "This profile is currently inactive",
            ResolveError::NotFound { .. } => "Profile not found",
            ResolveError::Cancelled => "Profile loading was interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceAttempt {
    pub source: String,
    pub requests: usize,
    /// `None` when this source produced the record.
    pub failure_code: Option<&'static str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionReport {
    pub sources: Vec<SourceAttempt>,
}

impl ResolutionReport {
    pub fn total_requests(&self) -> usize {
        self.sources.iter().map(|s| s.requests).sum()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<DataSource>,
}

pub fn load_source_registry(path: impl AsRef<Path>) -> Result<Vec<DataSource>> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let registry: SourceRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if registry.sources.is_empty() {
        bail!("{} lists no data sources", path.display());
    }
    Ok(registry.sources)
}

#[derive(Debug, Clone)]
pub struct ProfileResolver {
    sources: Vec<DataSource>,
    http: HttpFetcher,
}

impl ProfileResolver {
    pub fn new(sources: Vec<DataSource>, http_config: HttpClientConfig) -> Result<Self> {
        Self::with_fetcher(sources, HttpFetcher::new(http_config)?)
    }

    pub fn with_fetcher(sources: Vec<DataSource>, http: HttpFetcher) -> Result<Self> {
        if sources.is_empty() {
            bail!("profile resolver needs at least one data source");
        }
        Ok(Self {
            sources: order_sources(sources),
            http,
        })
    }

    pub fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    pub async fn resolve(
        &self,
        identifier: &ProfileIdentifier,
    ) -> Result<ProfileRecord, ResolveError> {
        self.resolve_with_report(identifier).await.0
    }

    pub async fn resolve_token(&self, token: &str) -> Result<ProfileRecord, ResolveError> {
        let identifier = ProfileIdentifier::from_routing_token(token)?;
        self.resolve(&identifier).await
    }

    /// Sequential resolution that also reports what each source did.
    pub async fn resolve_with_report(
        &self,
        identifier: &ProfileIdentifier,
    ) -> (Result<ProfileRecord, ResolveError>, ResolutionReport) {
        let span = info_span!("profile_lookup", %identifier, sources = self.sources.len());
        async {
            let mut report = ResolutionReport::default();
            let mut last_failure = None;

            for source in &self.sources {
                let label = source.label();
                let (outcome, requests) = lookup_source(&self.http, source, identifier).await;
                match outcome {
                    Ok(record) => {
                        info!(source = %label, requests, "profile resolved");
                        report.sources.push(SourceAttempt {
                            source: label,
                            requests,
                            failure_code: None,
                        });
                        return (Ok(record), report);
                    }
                    Err(failure) => {
                        warn!(source = %label, requests, reason = failure.reason_code(), error = %failure, "source gave no profile");
                        report.sources.push(SourceAttempt {
                            source: label,
                            requests,
                            failure_code: Some(failure.reason_code()),
                        });
                        remember_failure(&mut last_failure, failure);
                    }
                }
            }

            (Err(ResolveError::NotFound { last_failure }), report)
        }
        .instrument(span)
        .await
    }

    /// Query every source concurrently and take the first record to validate.
    ///
    /// The winner is whichever source answers first, not the highest-priority one.
    /// Losing lookups are aborted once a winner is found. On exhaustion the error
    /// carries the highest-priority rejection or validation failure, falling back to
    /// the highest-priority transport failure.
    pub async fn resolve_parallel(
        &self,
        identifier: &ProfileIdentifier,
    ) -> Result<ProfileRecord, ResolveError> {
        let span = info_span!("profile_lookup_parallel", %identifier, sources = self.sources.len());
        async {
            let mut lookups = JoinSet::new();
            for (index, source) in self.sources.iter().cloned().enumerate() {
                let http = self.http.clone();
                let identifier = identifier.clone();
                lookups.spawn(async move {
                    let (outcome, _requests) = lookup_source(&http, &source, &identifier).await;
                    (index, outcome)
                });
            }

            let mut failures: Vec<Option<SourceFailure>> =
                self.sources.iter().map(|_| None).collect();
            while let Some(joined) = lookups.join_next().await {
                match joined {
                    Ok((index, Ok(record))) => {
                        info!(source = %self.sources[index].label(), "profile resolved");
                        lookups.abort_all();
                        return Ok(record);
                    }
                    Ok((index, Err(failure))) => {
                        warn!(source = %self.sources[index].label(), reason = failure.reason_code(), error = %failure, "source gave no profile");
                        failures[index] = Some(failure);
                    }
                    Err(err) => warn!(error = %err, "source lookup task failed"),
                }
            }

            let ranked: Vec<SourceFailure> = failures.into_iter().flatten().collect();
            let pick = ranked
                .iter()
                .position(SourceFailure::is_authoritative)
                .unwrap_or(0);
            Err(ResolveError::NotFound {
                last_failure: ranked.into_iter().nth(pick),
            })
        }
        .instrument(span)
        .await
    }

    /// Resolve unless `cancel` completes first; the in-flight request is dropped.
    pub async fn resolve_until<F>(
        &self,
        identifier: &ProfileIdentifier,
        cancel: F,
    ) -> Result<ProfileRecord, ResolveError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.resolve(identifier) => result,
            () = cancel => {
                info!(%identifier, "profile lookup cancelled");
                Err(ResolveError::Cancelled)
            }
        }
    }
}

/// Keep the latest authoritative failure; an unreachable source only fills an empty slot.
fn remember_failure(slot: &mut Option<SourceFailure>, failure: SourceFailure) {
    if slot.is_none() || failure.is_authoritative() {
        *slot = Some(failure);
    }
}

async fn lookup_source(
    http: &HttpFetcher,
    source: &DataSource,
    identifier: &ProfileIdentifier,
) -> (Result<ProfileRecord, SourceFailure>, usize) {
    let url = source.request_url(identifier);
    let resp = match http.fetch_bytes(&url).await {
        Ok(resp) => resp,
        Err(failure) => {
            let attempts = failure.attempts;
            return (Err(failure.into()), attempts);
        }
    };

    (parse_lookup_body(&resp.body), resp.attempts)
}

fn parse_lookup_body(body: &[u8]) -> Result<ProfileRecord, SourceFailure> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| ValidationError::Malformed(format!("invalid JSON: {e}")))?;
    match RawLookupResponse::from_json(value)? {
        RawLookupResponse::ErrorEnvelope { message } => Err(SourceFailure::Rejected { message }),
        RawLookupResponse::Profile(fields) => Ok(ProfileRecord::from_fields(&fields)?),
    }
}
