//! Scrape-actor ingestion: submit/poll/fetch protocol, raw-field extraction,
//! title validity filtering, and the upsert pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobflow_core::{IngestSummary, NormalizedJob};
use jobflow_store::{
    HttpClient, HttpClientConfig, JobStore, PayloadArchive, StoreError, UpsertOutcome,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "jobflow-ingest";

/// Quality score assigned to every freshly ingested posting. Recomputation
/// happens downstream; ingestion only stamps the baseline.
pub const BASELINE_QUALITY_SCORE: i32 = 7;

/// Cache short-circuit: this many fresh cached rows suppress the actor call.
pub const CACHE_MIN_RESULTS: i64 = 10;

/// Freshness window (days) for the cache short-circuit.
pub const CACHE_FRESHNESS_DAYS: i32 = 7;

/// Only rows scraped within this many days count as "just ingested" on the
/// post-scrape return path.
pub const FRESH_RETURN_DAYS: i32 = 1;

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("actor request failed: {0}")]
    Http(#[from] jobflow_store::HttpError),
    #[error("actor run ended with non-success status {0}")]
    RunFailed(String),
    #[error("actor run still incomplete after {attempts} polls")]
    TimedOut { attempts: u32 },
    #[error("actor protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeQuery {
    pub query: String,
    pub location: String,
    pub max_results: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorRunHandle {
    pub run_id: String,
    pub dataset_id: Option<String>,
}

/// Observed state of a remote actor run. Any terminal state other than
/// `Succeeded` fails the whole invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorRunStatus {
    InProgress,
    Succeeded,
    Ended(String),
}

impl ActorRunStatus {
    pub fn from_wire(status: &str) -> Self {
        match status {
            "READY" | "RUNNING" => ActorRunStatus::InProgress,
            "SUCCEEDED" => ActorRunStatus::Succeeded,
            other => ActorRunStatus::Ended(other.to_string()),
        }
    }
}

/// Outbound contract to the external scraping service.
#[async_trait]
pub trait ScrapeActor: Send + Sync {
    async fn submit(&self, query: &ScrapeQuery) -> Result<ActorRunHandle, ActorError>;
    async fn status(&self, handle: &ActorRunHandle) -> Result<ActorRunStatus, ActorError>;
    async fn fetch_items(&self, handle: &ActorRunHandle) -> Result<Vec<JsonValue>, ActorError>;
}

/// Injectable suspension point so the poll loop is testable without wall
/// clock time.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        // 60 polls at 5s: five minutes of patience, attempt-count based.
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Submitted,
    Polling(u32),
    Succeeded,
    Failed(String),
    TimedOut,
}

/// Drive the poll state machine until the run reaches a terminal state.
pub async fn await_completion(
    actor: &dyn ScrapeActor,
    handle: &ActorRunHandle,
    config: &PollConfig,
    sleeper: &dyn Sleeper,
) -> Result<(), ActorError> {
    let mut state = PollState::Submitted;
    loop {
        state = match state {
            PollState::Submitted => PollState::Polling(0),
            PollState::Polling(attempt) if attempt >= config.max_attempts => PollState::TimedOut,
            PollState::Polling(attempt) => match actor.status(handle).await? {
                ActorRunStatus::Succeeded => PollState::Succeeded,
                ActorRunStatus::Ended(status) => PollState::Failed(status),
                ActorRunStatus::InProgress => {
                    sleeper.sleep(config.interval).await;
                    PollState::Polling(attempt + 1)
                }
            },
            PollState::Succeeded => return Ok(()),
            PollState::Failed(status) => return Err(ActorError::RunFailed(status)),
            PollState::TimedOut => {
                return Err(ActorError::TimedOut {
                    attempts: config.max_attempts,
                })
            }
        };
    }
}

#[derive(Debug, Clone)]
pub struct ActorConfig {
    pub base_url: String,
    pub actor_id: String,
    pub token: String,
    /// Origin used to absolutize relative posting URLs.
    pub site_origin: String,
    pub user_agent: Option<String>,
    pub http_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RunEnvelope {
    data: RunData,
}

#[derive(Debug, Deserialize)]
struct RunData {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "defaultDatasetId")]
    default_dataset_id: Option<String>,
}

/// Bearer-authenticated client for the actor's submit/poll/fetch protocol.
pub struct HttpScrapeActor {
    http: HttpClient,
    base_url: String,
    actor_id: String,
}

impl HttpScrapeActor {
    pub fn new(config: &ActorConfig) -> anyhow::Result<Self> {
        let http = HttpClient::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: config.user_agent.clone(),
            bearer_token: Some(config.token.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            actor_id: config.actor_id.clone(),
        })
    }
}

#[async_trait]
impl ScrapeActor for HttpScrapeActor {
    async fn submit(&self, query: &ScrapeQuery) -> Result<ActorRunHandle, ActorError> {
        let url = format!("{}/v2/acts/{}/runs", self.base_url, self.actor_id);
        let body = json!({
            "query": query.query,
            "location": query.location,
            "maxResults": query.max_results,
        });
        let envelope: RunEnvelope = self.http.post_json(&url, &body).await?;
        Ok(ActorRunHandle {
            run_id: envelope.data.id,
            dataset_id: envelope.data.default_dataset_id,
        })
    }

    async fn status(&self, handle: &ActorRunHandle) -> Result<ActorRunStatus, ActorError> {
        let url = format!("{}/v2/actor-runs/{}", self.base_url, handle.run_id);
        let envelope: RunEnvelope = self.http.get_json(&url).await?;
        let status = envelope
            .data
            .status
            .ok_or_else(|| ActorError::Protocol(format!("run {} reported no status", handle.run_id)))?;
        Ok(ActorRunStatus::from_wire(&status))
    }

    async fn fetch_items(&self, handle: &ActorRunHandle) -> Result<Vec<JsonValue>, ActorError> {
        let dataset_id = match &handle.dataset_id {
            Some(id) => id.clone(),
            None => {
                let url = format!("{}/v2/actor-runs/{}", self.base_url, handle.run_id);
                let envelope: RunEnvelope = self.http.get_json(&url).await?;
                envelope.data.default_dataset_id.ok_or_else(|| {
                    ActorError::Protocol(format!("run {} exposes no dataset", handle.run_id))
                })?
            }
        };
        let url = format!("{}/v2/datasets/{}/items", self.base_url, dataset_id);
        Ok(self.http.get_json(&url).await?)
    }
}

// Candidate raw field names, tried in order. External payloads are
// duck-typed; field names vary by source.
const URL_FIELDS: &[&str] = &[
    "url", "jobUrl", "job_url", "link", "applyUrl", "apply_url", "detailUrl", "jobLink",
];
const TITLE_FIELDS: &[&str] = &["title", "jobTitle", "positionName", "position", "name"];
const COMPANY_FIELDS: &[&str] = &["company", "companyName", "employer", "organization"];
const LOCATION_FIELDS: &[&str] = &["location", "jobLocation", "city", "place"];
const DESCRIPTION_FIELDS: &[&str] = &["description", "jobDescription", "descriptionText", "summary"];
const SALARY_FIELDS: &[&str] = &["salary", "salaryText", "compensation", "pay"];
const EXTERNAL_ID_FIELDS: &[&str] = &["id", "jobId", "job_id", "externalId", "jobkey"];
const EMPLOYMENT_TYPE_FIELDS: &[&str] = &["employmentType", "jobType", "employment_type"];
const EXPERIENCE_FIELDS: &[&str] = &["experienceLevel", "seniority", "experience_level"];
const REMOTE_FIELDS: &[&str] = &["isRemote", "remote", "remoteWork"];

pub fn first_string(item: &JsonValue, fields: &[&str]) -> Option<String> {
    for field in fields {
        if let Some(text) = item.get(*field).and_then(JsonValue::as_str) {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub fn first_bool(item: &JsonValue, fields: &[&str]) -> Option<bool> {
    fields.iter().find_map(|f| item.get(*f).and_then(JsonValue::as_bool))
}

/// Resolve a raw URL candidate to an absolute URL against the source origin.
pub fn resolve_url(raw: &str, origin: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Some(raw.to_string());
    }
    if let Some(rest) = raw.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    if raw.starts_with('/') {
        return Some(format!("{}{}", origin.trim_end_matches('/'), raw));
    }
    None
}

/// Try the ordered URL field candidates and absolutize the first hit.
pub fn extract_canonical_url(item: &JsonValue, origin: &str) -> Option<String> {
    for field in URL_FIELDS {
        if let Some(raw) = item.get(*field).and_then(JsonValue::as_str) {
            if let Some(url) = resolve_url(raw, origin) {
                return Some(url);
            }
        }
    }
    None
}

const US_STATE_CODES: &[&str] = &[
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DC", "DE", "FL", "GA", "HI", "IA", "ID", "IL",
    "IN", "KS", "KY", "LA", "MA", "MD", "ME", "MI", "MN", "MO", "MS", "MT", "NC", "ND", "NE",
    "NH", "NJ", "NM", "NV", "NY", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT",
    "VA", "VT", "WA", "WI", "WV", "WY",
];

const MAJOR_CITIES: &[&str] = &[
    "new york", "los angeles", "chicago", "houston", "phoenix", "philadelphia", "san antonio",
    "san diego", "dallas", "austin", "san jose", "san francisco", "seattle", "denver", "boston",
    "atlanta", "miami", "tampa", "orlando", "charlotte", "nashville", "portland", "remote",
];

const DESCRIPTION_MARKERS: &[&str] = &[
    "description", "overview", "who you", "what you", "about the role", "about us",
    "we are looking", "responsibilities", "job summary", "you will be",
];

const FILLER_TOKENS: &[&str] = &[
    "job", "jobs", "career", "careers", "hiring", "position", "positions", "opportunity",
    "opportunities", "opening", "openings", "full time", "full-time", "part time", "part-time",
];

const DAY_MONTH_NAMES: &[&str] = &[
    "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday", "january",
    "february", "march", "april", "may", "june", "july", "august", "september", "october",
    "november", "december",
];

const CALL_TO_ACTION: &[&str] = &[
    "apply now", "apply today", "click here", "view job", "view details", "see details",
    "learn more", "join us", "sign up", "read more",
];

fn looks_like_location(candidate: &str) -> bool {
    let trimmed = candidate.trim();
    if US_STATE_CODES.contains(&trimmed) {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    if MAJOR_CITIES.contains(&lower.as_str()) {
        return true;
    }
    // "City, ST" shape: anything followed by a bare two-letter state code.
    let mut parts = trimmed.rsplitn(2, ',');
    if let (Some(tail), Some(head)) = (parts.next(), parts.next()) {
        if !head.trim().is_empty() && US_STATE_CODES.contains(&tail.trim()) {
            return true;
        }
    }
    false
}

fn looks_like_description_fragment(candidate: &str) -> bool {
    let lower = candidate.to_ascii_lowercase();
    if DESCRIPTION_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    // More than one sentence-terminating period reads as prose, not a title.
    let sentences = candidate
        .split('.')
        .filter(|s| !s.trim().is_empty())
        .count();
    sentences > 2
}

fn is_generic_filler(candidate: &str) -> bool {
    let lower = candidate.trim().to_ascii_lowercase();
    if FILLER_TOKENS.contains(&lower.as_str()) || DAY_MONTH_NAMES.contains(&lower.as_str()) {
        return true;
    }
    if CALL_TO_ACTION.iter().any(|cta| lower == *cta || lower.starts_with(cta)) {
        return true;
    }
    // Pure numbers (ids, dates) are never titles.
    !lower.is_empty() && lower.chars().all(|c| c.is_ascii_digit() || c == '-' || c == '/')
}

/// Pure, deterministic guard applied before accepting any extracted title.
pub fn is_valid_title(candidate: &str) -> bool {
    let trimmed = candidate.trim();
    let len = trimmed.chars().count();
    if len <= 3 || len >= 80 {
        return false;
    }
    if looks_like_location(trimmed) {
        return false;
    }
    if looks_like_description_fragment(trimmed) {
        return false;
    }
    if is_generic_filler(trimmed) {
        return false;
    }
    true
}

/// Why a raw item was dropped instead of normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoResolvableUrl,
    NoValidTitle,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoResolvableUrl => f.write_str("no resolvable url"),
            SkipReason::NoValidTitle => f.write_str("no valid title"),
        }
    }
}

/// Map one untrusted raw posting into the canonical record, or say why not.
pub fn normalize_item(
    item: &JsonValue,
    requested_location: &str,
    origin: &str,
    scraped_at: DateTime<Utc>,
) -> Result<NormalizedJob, SkipReason> {
    let canonical_url = extract_canonical_url(item, origin).ok_or(SkipReason::NoResolvableUrl)?;

    let title = TITLE_FIELDS
        .iter()
        .filter_map(|f| item.get(*f).and_then(JsonValue::as_str))
        .map(str::trim)
        .find(|t| is_valid_title(t))
        .map(str::to_string)
        .ok_or(SkipReason::NoValidTitle)?;

    let external_id = first_string(item, EXTERNAL_ID_FIELDS).unwrap_or_else(|| {
        // No upstream id: the canonical URL is the next-best natural key.
        canonical_url.clone()
    });

    let company = first_string(item, COMPANY_FIELDS)
        .unwrap_or_else(|| "Unknown Company".to_string());
    let location = first_string(item, LOCATION_FIELDS).unwrap_or_else(|| {
        if requested_location.trim().is_empty() {
            "Remote".to_string()
        } else {
            requested_location.trim().to_string()
        }
    });
    let remote_type = first_bool(item, REMOTE_FIELDS)
        .map(|remote| if remote { "remote" } else { "onsite" }.to_string());

    Ok(NormalizedJob {
        external_id,
        title,
        company,
        location,
        description: first_string(item, DESCRIPTION_FIELDS).unwrap_or_default(),
        salary_text: first_string(item, SALARY_FIELDS),
        canonical_url,
        employment_type: first_string(item, EMPLOYMENT_TYPE_FIELDS),
        remote_type,
        experience_level: first_string(item, EXPERIENCE_FIELDS),
        quality_score: BASELINE_QUALITY_SCORE,
        scraped_at,
        archived_at: None,
        is_expired: false,
    })
}

/// Fold raw items into normalized jobs plus an immutable skip summary.
pub fn normalize_batch(
    items: &[JsonValue],
    requested_location: &str,
    origin: &str,
    scraped_at: DateTime<Utc>,
) -> (Vec<NormalizedJob>, IngestSummary) {
    items.iter().fold(
        (Vec::new(), IngestSummary::default()),
        |(mut jobs, summary), item| match normalize_item(item, requested_location, origin, scraped_at) {
            Ok(job) => {
                jobs.push(job);
                (jobs, summary)
            }
            Err(reason) => (jobs, summary.record_skipped(reason.to_string())),
        },
    )
}

/// Persistence operations the pipeline depends on, behind a seam so the
/// cache short-circuit and upsert paths are testable without a database.
#[async_trait]
pub trait IngestStore: Send + Sync {
    async fn count_fresh(
        &self,
        query: &str,
        location: &str,
        max_age_days: i32,
    ) -> Result<i64, StoreError>;

    async fn search_fresh(
        &self,
        query: &str,
        location: &str,
        max_age_days: i32,
        limit: i64,
    ) -> Result<Vec<NormalizedJob>, StoreError>;

    async fn upsert_job(&self, job: &NormalizedJob) -> Result<UpsertOutcome, StoreError>;
}

#[async_trait]
impl IngestStore for JobStore {
    async fn count_fresh(
        &self,
        query: &str,
        location: &str,
        max_age_days: i32,
    ) -> Result<i64, StoreError> {
        JobStore::count_fresh(self, query, location, max_age_days).await
    }

    async fn search_fresh(
        &self,
        query: &str,
        location: &str,
        max_age_days: i32,
        limit: i64,
    ) -> Result<Vec<NormalizedJob>, StoreError> {
        JobStore::search_fresh(self, query, location, max_age_days, limit).await
    }

    async fn upsert_job(&self, job: &NormalizedJob) -> Result<UpsertOutcome, StoreError> {
        JobStore::upsert_job(self, job).await
    }
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub query: String,
    pub location: String,
    pub max_jobs: usize,
    pub force_refresh: bool,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub jobs: Vec<NormalizedJob>,
    pub from_cache: bool,
    pub total_results: usize,
    pub scraped_count: Option<usize>,
    pub summary: IngestSummary,
    pub payload_hash: Option<String>,
}

/// Orchestrates one ingestion invocation: cache short-circuit, actor run,
/// normalization, upsert, and the consistent post-scrape read-back.
pub struct IngestPipeline {
    store: Arc<dyn IngestStore>,
    archive: Option<PayloadArchive>,
    actor: Arc<dyn ScrapeActor>,
    sleeper: Arc<dyn Sleeper>,
    poll: PollConfig,
    site_origin: String,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn IngestStore>,
        actor: Arc<dyn ScrapeActor>,
        site_origin: impl Into<String>,
    ) -> Self {
        Self {
            store,
            archive: None,
            actor,
            sleeper: Arc::new(TokioSleeper),
            poll: PollConfig::default(),
            site_origin: site_origin.into(),
        }
    }

    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub async fn run(&self, request: &IngestRequest) -> anyhow::Result<IngestOutcome> {
        if !request.force_refresh {
            let cached = self
                .store
                .count_fresh(&request.query, &request.location, CACHE_FRESHNESS_DAYS)
                .await?;
            if cached >= CACHE_MIN_RESULTS {
                let jobs = self
                    .store
                    .search_fresh(
                        &request.query,
                        &request.location,
                        CACHE_FRESHNESS_DAYS,
                        request.max_jobs as i64,
                    )
                    .await?;
                info!(query = %request.query, cached, "cache short-circuit, skipping actor run");
                return Ok(IngestOutcome {
                    total_results: jobs.len(),
                    jobs,
                    from_cache: true,
                    scraped_count: None,
                    summary: IngestSummary::default(),
                    payload_hash: None,
                });
            }
        }

        let scrape_query = ScrapeQuery {
            query: request.query.clone(),
            location: request.location.clone(),
            max_results: request.max_jobs,
        };
        let handle = self.actor.submit(&scrape_query).await?;
        info!(run_id = %handle.run_id, query = %request.query, "actor run submitted");
        await_completion(self.actor.as_ref(), &handle, &self.poll, self.sleeper.as_ref()).await?;
        let items = self.actor.fetch_items(&handle).await?;

        let scraped_at = Utc::now();
        let payload_hash = match &self.archive {
            Some(archive) => {
                let bytes = serde_json::to_vec(&items)?;
                match archive.store(scraped_at, &request.query, &bytes).await {
                    Ok(stored) => Some(stored.content_hash),
                    Err(err) => {
                        // Archival is best-effort; the batch proceeds without it.
                        warn!(error = %err, "failed to archive raw payload");
                        None
                    }
                }
            }
            None => None,
        };

        let (normalized, summary) =
            normalize_batch(&items, &request.location, &self.site_origin, scraped_at);

        let mut summary = summary;
        for job in &normalized {
            match self.store.upsert_job(job).await {
                Ok(UpsertOutcome::Inserted) => summary = summary.record_inserted(),
                Ok(UpsertOutcome::Updated) => summary = summary.record_updated(),
                Err(err) => {
                    warn!(external_id = %job.external_id, error = %err, "row upsert failed");
                    summary = summary.record_error(format!(
                        "upsert {} failed: {err}",
                        job.external_id
                    ));
                }
            }
        }

        let jobs = self
            .store
            .search_fresh(
                &request.query,
                &request.location,
                FRESH_RETURN_DAYS,
                request.max_jobs as i64,
            )
            .await?;

        info!(
            query = %request.query,
            raw = items.len(),
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            "ingestion run complete"
        );

        Ok(IngestOutcome {
            total_results: jobs.len(),
            jobs,
            from_cache: false,
            scraped_count: Some(summary.persisted()),
            summary,
            payload_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedActor {
        statuses: Mutex<VecDeque<ActorRunStatus>>,
        items: Vec<JsonValue>,
        submits: AtomicUsize,
    }

    impl ScriptedActor {
        fn new(statuses: Vec<ActorRunStatus>, items: Vec<JsonValue>) -> Self {
            Self {
                statuses: Mutex::new(statuses.into()),
                items,
                submits: AtomicUsize::new(0),
            }
        }

        fn submit_calls(&self) -> usize {
            self.submits.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScrapeActor for ScriptedActor {
        async fn submit(&self, _query: &ScrapeQuery) -> Result<ActorRunHandle, ActorError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            Ok(ActorRunHandle {
                run_id: "run-1".to_string(),
                dataset_id: Some("ds-1".to_string()),
            })
        }

        async fn status(&self, _handle: &ActorRunHandle) -> Result<ActorRunStatus, ActorError> {
            Ok(self
                .statuses
                .lock()
                .expect("status lock")
                .pop_front()
                .unwrap_or(ActorRunStatus::InProgress))
        }

        async fn fetch_items(&self, _handle: &ActorRunHandle) -> Result<Vec<JsonValue>, ActorError> {
            Ok(self.items.clone())
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().expect("sleep lock").push(duration);
        }
    }

    fn handle() -> ActorRunHandle {
        ActorRunHandle {
            run_id: "run-1".to_string(),
            dataset_id: Some("ds-1".to_string()),
        }
    }

    #[tokio::test]
    async fn poll_loop_waits_then_succeeds() {
        let actor = ScriptedActor::new(
            vec![
                ActorRunStatus::InProgress,
                ActorRunStatus::InProgress,
                ActorRunStatus::Succeeded,
            ],
            vec![],
        );
        let sleeper = RecordingSleeper::default();
        let config = PollConfig {
            interval: Duration::from_secs(5),
            max_attempts: 10,
        };
        await_completion(&actor, &handle(), &config, &sleeper)
            .await
            .expect("run succeeds");
        let slept = sleeper.slept.lock().expect("sleep lock");
        assert_eq!(slept.len(), 2);
        assert!(slept.iter().all(|d| *d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn poll_loop_times_out_after_bounded_attempts() {
        let actor = ScriptedActor::new(vec![], vec![]);
        let sleeper = RecordingSleeper::default();
        let config = PollConfig {
            interval: Duration::from_millis(1),
            max_attempts: 3,
        };
        let err = await_completion(&actor, &handle(), &config, &sleeper)
            .await
            .expect_err("must time out");
        assert!(matches!(err, ActorError::TimedOut { attempts: 3 }));
        assert_eq!(sleeper.slept.lock().expect("sleep lock").len(), 3);
    }

    #[tokio::test]
    async fn poll_loop_fails_on_non_success_terminal_status() {
        let actor = ScriptedActor::new(
            vec![
                ActorRunStatus::InProgress,
                ActorRunStatus::Ended("ABORTED".to_string()),
            ],
            vec![],
        );
        let sleeper = RecordingSleeper::default();
        let err = await_completion(&actor, &handle(), &PollConfig::default(), &sleeper)
            .await
            .expect_err("aborted run is a hard failure");
        assert!(matches!(err, ActorError::RunFailed(status) if status == "ABORTED"));
    }

    #[test]
    fn wire_statuses_map_to_run_states() {
        assert_eq!(ActorRunStatus::from_wire("READY"), ActorRunStatus::InProgress);
        assert_eq!(ActorRunStatus::from_wire("RUNNING"), ActorRunStatus::InProgress);
        assert_eq!(ActorRunStatus::from_wire("SUCCEEDED"), ActorRunStatus::Succeeded);
        assert_eq!(
            ActorRunStatus::from_wire("TIMED-OUT"),
            ActorRunStatus::Ended("TIMED-OUT".to_string())
        );
    }

    #[test]
    fn url_resolution_absolutizes_relative_paths() {
        let origin = "https://jobs.example.com";
        assert_eq!(
            resolve_url("/postings/42", origin).as_deref(),
            Some("https://jobs.example.com/postings/42")
        );
        assert_eq!(
            resolve_url("https://elsewhere.com/j/1", origin).as_deref(),
            Some("https://elsewhere.com/j/1")
        );
        assert_eq!(
            resolve_url("//cdn.example.com/j/2", origin).as_deref(),
            Some("https://cdn.example.com/j/2")
        );
        assert_eq!(resolve_url("postings/42", origin), None);
        assert_eq!(resolve_url("   ", origin), None);
    }

    #[test]
    fn canonical_url_tries_candidate_fields_in_order() {
        let item = serde_json::json!({
            "link": "/fallback/1",
            "url": "https://jobs.example.com/primary/1",
        });
        assert_eq!(
            extract_canonical_url(&item, "https://jobs.example.com").as_deref(),
            Some("https://jobs.example.com/primary/1")
        );

        let relative_only = serde_json::json!({ "jobLink": "/only/2" });
        assert_eq!(
            extract_canonical_url(&relative_only, "https://jobs.example.com").as_deref(),
            Some("https://jobs.example.com/only/2")
        );
    }

    #[test]
    fn title_filter_rejects_locations() {
        assert!(!is_valid_title("Tampa, FL"));
        assert!(!is_valid_title("Saint Paul, MN"));
        assert!(!is_valid_title("TX"));
        assert!(!is_valid_title("Chicago"));
    }

    #[test]
    fn title_filter_rejects_length_outliers() {
        assert!(!is_valid_title("A"));
        assert!(!is_valid_title("Dev"));
        let long = "x".repeat(85);
        assert!(!is_valid_title(&long));
    }

    #[test]
    fn title_filter_rejects_description_fragments_and_filler() {
        assert!(!is_valid_title("Job Description Overview"));
        assert!(!is_valid_title("Who you are and what you bring"));
        assert!(!is_valid_title("We hire. You apply. We talk. You start."));
        assert!(!is_valid_title("Careers"));
        assert!(!is_valid_title("September"));
        assert!(!is_valid_title("12345"));
        assert!(!is_valid_title("Apply now"));
    }

    #[test]
    fn title_filter_accepts_real_titles() {
        assert!(is_valid_title("Senior Backend Engineer"));
        assert!(is_valid_title("Business Analyst"));
        assert!(is_valid_title("Nurse Practitioner - ICU"));
    }

    fn raw_item(title: &str, url: Option<&str>) -> JsonValue {
        let mut obj = serde_json::json!({
            "id": format!("ext-{title}"),
            "title": title,
            "company": "Acme Corp",
        });
        if let Some(url) = url {
            obj["url"] = JsonValue::String(url.to_string());
        }
        obj
    }

    #[test]
    fn normalize_batch_skips_items_without_resolvable_url() {
        let items = vec![
            raw_item("Business Analyst", Some("https://jobs.example.com/1")),
            raw_item("Senior Business Analyst", Some("/postings/2")),
            raw_item("Business Systems Analyst", None),
        ];
        let (jobs, summary) =
            normalize_batch(&items, "", "https://jobs.example.com", Utc::now());
        assert_eq!(jobs.len(), 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errors, vec!["no resolvable url".to_string()]);
        assert_eq!(jobs[1].canonical_url, "https://jobs.example.com/postings/2");
    }

    #[test]
    fn normalize_item_applies_sentinel_defaults() {
        let item = serde_json::json!({
            "title": "Data Engineer",
            "url": "https://jobs.example.com/3",
        });
        let job = normalize_item(&item, "", "https://jobs.example.com", Utc::now())
            .expect("normalizes");
        assert_eq!(job.company, "Unknown Company");
        assert_eq!(job.location, "Remote");
        assert_eq!(job.quality_score, BASELINE_QUALITY_SCORE);
        assert_eq!(job.external_id, "https://jobs.example.com/3");

        let located = normalize_item(&item, "Austin, TX", "https://jobs.example.com", Utc::now())
            .expect("normalizes");
        assert_eq!(located.location, "Austin, TX");
    }

    #[test]
    fn normalize_item_skips_invalid_titles() {
        let item = serde_json::json!({
            "title": "Tampa, FL",
            "url": "https://jobs.example.com/4",
        });
        assert_eq!(
            normalize_item(&item, "", "https://jobs.example.com", Utc::now()),
            Err(SkipReason::NoValidTitle)
        );
    }

    #[test]
    fn normalize_item_falls_back_to_later_title_candidates() {
        let item = serde_json::json!({
            "title": "Apply now",
            "positionName": "Platform Engineer",
            "url": "https://jobs.example.com/5",
        });
        let job = normalize_item(&item, "", "https://jobs.example.com", Utc::now())
            .expect("normalizes");
        assert_eq!(job.title, "Platform Engineer");
    }

    #[derive(Default)]
    struct MemoryStore {
        jobs: Mutex<BTreeMap<String, NormalizedJob>>,
    }

    #[async_trait]
    impl IngestStore for MemoryStore {
        async fn count_fresh(
            &self,
            _query: &str,
            _location: &str,
            _max_age_days: i32,
        ) -> Result<i64, StoreError> {
            Ok(self.jobs.lock().expect("jobs lock").len() as i64)
        }

        async fn search_fresh(
            &self,
            _query: &str,
            _location: &str,
            _max_age_days: i32,
            limit: i64,
        ) -> Result<Vec<NormalizedJob>, StoreError> {
            Ok(self
                .jobs
                .lock()
                .expect("jobs lock")
                .values()
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn upsert_job(&self, job: &NormalizedJob) -> Result<UpsertOutcome, StoreError> {
            let mut jobs = self.jobs.lock().expect("jobs lock");
            Ok(match jobs.insert(job.external_id.clone(), job.clone()) {
                None => UpsertOutcome::Inserted,
                Some(_) => UpsertOutcome::Updated,
            })
        }
    }

    fn stored_job(i: usize) -> NormalizedJob {
        NormalizedJob {
            external_id: format!("cached-{i}"),
            title: format!("Business Analyst {i}"),
            company: "Acme Corp".to_string(),
            location: "Remote".to_string(),
            description: String::new(),
            salary_text: None,
            canonical_url: format!("https://jobs.example.com/{i}"),
            employment_type: None,
            remote_type: None,
            experience_level: None,
            quality_score: BASELINE_QUALITY_SCORE,
            scraped_at: Utc::now(),
            archived_at: None,
            is_expired: false,
        }
    }

    fn request(force_refresh: bool) -> IngestRequest {
        IngestRequest {
            query: "Business Analyst".to_string(),
            location: String::new(),
            max_jobs: 50,
            force_refresh,
        }
    }

    #[tokio::test]
    async fn cache_short_circuit_makes_zero_actor_calls() {
        let store = Arc::new(MemoryStore::default());
        for i in 0..CACHE_MIN_RESULTS as usize {
            store.upsert_job(&stored_job(i)).await.expect("prefill");
        }
        let actor = Arc::new(ScriptedActor::new(vec![ActorRunStatus::Succeeded], vec![]));
        let pipeline = IngestPipeline::new(store, actor.clone(), "https://jobs.example.com");

        let outcome = pipeline.run(&request(false)).await.expect("run");
        assert!(outcome.from_cache);
        assert_eq!(outcome.total_results, CACHE_MIN_RESULTS as usize);
        assert_eq!(outcome.scraped_count, None);
        assert_eq!(actor.submit_calls(), 0);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_warm_cache() {
        let store = Arc::new(MemoryStore::default());
        for i in 0..CACHE_MIN_RESULTS as usize {
            store.upsert_job(&stored_job(i)).await.expect("prefill");
        }
        let actor = Arc::new(ScriptedActor::new(vec![ActorRunStatus::Succeeded], vec![]));
        let pipeline = IngestPipeline::new(store, actor.clone(), "https://jobs.example.com");

        let outcome = pipeline.run(&request(true)).await.expect("run");
        assert!(!outcome.from_cache);
        assert_eq!(actor.submit_calls(), 1);
    }

    #[tokio::test]
    async fn reingesting_an_external_id_updates_the_row_in_place() {
        let store = Arc::new(MemoryStore::default());

        let first = Arc::new(ScriptedActor::new(
            vec![ActorRunStatus::Succeeded],
            vec![serde_json::json!({
                "id": "ext-1",
                "title": "Business Analyst",
                "url": "https://jobs.example.com/1",
            })],
        ));
        let outcome = IngestPipeline::new(store.clone(), first, "https://jobs.example.com")
            .run(&request(true))
            .await
            .expect("first run");
        assert_eq!(outcome.summary.inserted, 1);
        assert_eq!(outcome.summary.updated, 0);

        let second = Arc::new(ScriptedActor::new(
            vec![ActorRunStatus::Succeeded],
            vec![serde_json::json!({
                "id": "ext-1",
                "title": "Senior Business Analyst",
                "url": "https://jobs.example.com/1",
            })],
        ));
        let outcome = IngestPipeline::new(store.clone(), second, "https://jobs.example.com")
            .run(&request(true))
            .await
            .expect("second run");
        assert_eq!(outcome.summary.inserted, 0);
        assert_eq!(outcome.summary.updated, 1);

        let jobs = store.jobs.lock().expect("jobs lock");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs["ext-1"].title, "Senior Business Analyst");
    }
}
