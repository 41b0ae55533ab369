//! Postgres job store, raw payload archive, and retrying HTTP client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use jobflow_core::{NormalizedJob, Recommendation, RecommendationRun, RunStatus, UserPreferenceProfile};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobflow-store";

/// Recommendation rows are inserted in chunks of this size to bound the
/// payload of a single statement.
pub const RECOMMENDATION_BATCH_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Whether an upsert created a new row or refreshed an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Pool that defers connecting until first use. Handler tests exercise
    /// non-database paths against this.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Insert-or-update keyed on `external_id`. Re-ingestion refreshes the
    /// row in place and clears expiry/archival state.
    pub async fn upsert_job(&self, job: &NormalizedJob) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                external_id, title, company, location, description, salary_text,
                canonical_url, employment_type, remote_type, experience_level,
                quality_score, scraped_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (external_id) DO UPDATE SET
                title = EXCLUDED.title,
                company = EXCLUDED.company,
                location = EXCLUDED.location,
                description = EXCLUDED.description,
                salary_text = EXCLUDED.salary_text,
                canonical_url = EXCLUDED.canonical_url,
                employment_type = EXCLUDED.employment_type,
                remote_type = EXCLUDED.remote_type,
                experience_level = EXCLUDED.experience_level,
                quality_score = EXCLUDED.quality_score,
                scraped_at = EXCLUDED.scraped_at,
                archived_at = NULL,
                is_expired = FALSE,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&job.external_id)
        .bind(&job.title)
        .bind(&job.company)
        .bind(&job.location)
        .bind(&job.description)
        .bind(&job.salary_text)
        .bind(&job.canonical_url)
        .bind(&job.employment_type)
        .bind(&job.remote_type)
        .bind(&job.experience_level)
        .bind(job.quality_score)
        .bind(job.scraped_at)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    /// The single read path behind both the cache short-circuit and the
    /// post-scrape return, so callers always see the same output shape.
    pub async fn search_fresh(
        &self,
        query: &str,
        location: &str,
        max_age_days: i32,
        limit: i64,
    ) -> Result<Vec<NormalizedJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT external_id, title, company, location, description, salary_text,
                   canonical_url, employment_type, remote_type, experience_level,
                   quality_score, scraped_at, archived_at, is_expired
              FROM jobs
             WHERE is_expired = FALSE
               AND archived_at IS NULL
               AND scraped_at > NOW() - make_interval(days => $1)
               AND title ILIKE '%' || $2 || '%'
               AND ($3 = '' OR location ILIKE '%' || $3 || '%')
             ORDER BY quality_score DESC, scraped_at DESC
             LIMIT $4
            "#,
        )
        .bind(max_age_days)
        .bind(query)
        .bind(location)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn count_fresh(
        &self,
        query: &str,
        location: &str,
        max_age_days: i32,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
              FROM jobs
             WHERE is_expired = FALSE
               AND archived_at IS NULL
               AND scraped_at > NOW() - make_interval(days => $1)
               AND title ILIKE '%' || $2 || '%'
               AND ($3 = '' OR location ILIKE '%' || $3 || '%')
            "#,
        )
        .bind(max_age_days)
        .bind(query)
        .bind(location)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    /// Candidate jobs for a recommendation run: quality-gated, live, and
    /// inside the lookback window, capped at a fixed pool size.
    pub async fn matching_pool(
        &self,
        min_quality: i32,
        lookback_days: i32,
        cap: i64,
    ) -> Result<Vec<NormalizedJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT external_id, title, company, location, description, salary_text,
                   canonical_url, employment_type, remote_type, experience_level,
                   quality_score, scraped_at, archived_at, is_expired
              FROM jobs
             WHERE is_expired = FALSE
               AND archived_at IS NULL
               AND quality_score >= $1
               AND scraped_at > NOW() - make_interval(days => $2)
             ORDER BY scraped_at DESC
             LIMIT $3
            "#,
        )
        .bind(min_quality)
        .bind(lookback_days)
        .bind(cap)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    /// Users with a usable profile who have not received a recommendation
    /// inside the cooldown window.
    pub async fn eligible_profiles(
        &self,
        cooldown_days: i32,
    ) -> Result<Vec<UserPreferenceProfile>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, email, desired_job_title, experience_level,
                   preferred_location, preferred_industry, last_recommended_at
              FROM user_profiles
             WHERE desired_job_title IS NOT NULL
               AND experience_level IS NOT NULL
               AND (last_recommended_at IS NULL
                    OR last_recommended_at < NOW() - make_interval(days => $1))
             ORDER BY email
            "#,
        )
        .bind(cooldown_days)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(UserPreferenceProfile {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                desired_job_title: row.try_get("desired_job_title")?,
                experience_level: row.try_get("experience_level")?,
                preferred_location: row.try_get("preferred_location")?,
                preferred_industry: row.try_get("preferred_industry")?,
                last_recommended_at: row.try_get("last_recommended_at")?,
            });
        }
        Ok(out)
    }

    pub async fn create_run(&self) -> Result<Uuid, StoreError> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO recommendation_runs (id, status) VALUES ($1, $2)"#,
        )
        .bind(run_id)
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(run_id)
    }

    pub async fn complete_run(
        &self,
        run_id: Uuid,
        users_processed: i32,
        recommendations_generated: i32,
        jobs_considered: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE recommendation_runs
               SET status = $2,
                   finished_at = NOW(),
                   users_processed = $3,
                   recommendations_generated = $4,
                   jobs_considered = $5
             WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(RunStatus::Completed.as_str())
        .bind(users_processed)
        .bind(recommendations_generated)
        .bind(jobs_considered)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_run(&self, run_id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE recommendation_runs
               SET status = $2, finished_at = NOW(), error = $3
             WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(RunStatus::Failed.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_run(&self, run_id: Uuid) -> Result<Option<RecommendationRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, status, started_at, finished_at, users_processed,
                   recommendations_generated, jobs_considered, error
              FROM recommendation_runs
             WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let status_text: String = row.try_get("status")?;
        Ok(Some(RecommendationRun {
            id: row.try_get("id")?,
            status: RunStatus::parse(&status_text).unwrap_or(RunStatus::Failed),
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            users_processed: row.try_get("users_processed")?,
            recommendations_generated: row.try_get("recommendations_generated")?,
            jobs_considered: row.try_get("jobs_considered")?,
            error: row.try_get("error")?,
        }))
    }

    /// Batch-insert recommendation rows in chunks of
    /// [`RECOMMENDATION_BATCH_SIZE`]. A chunk failure aborts the remainder.
    pub async fn insert_recommendations(
        &self,
        recommendations: &[Recommendation],
    ) -> Result<usize, StoreError> {
        let mut written = 0usize;
        for chunk in recommendations.chunks(RECOMMENDATION_BATCH_SIZE) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO recommendations (id, run_id, user_id, job_external_id, \
                 match_score, title_similarity_score, experience_match_score, merge_data) ",
            );
            builder.push_values(chunk, |mut b, rec| {
                b.push_bind(rec.id)
                    .push_bind(rec.run_id)
                    .push_bind(rec.user_id)
                    .push_bind(&rec.job_external_id)
                    .push_bind(rec.match_score)
                    .push_bind(rec.title_similarity_score)
                    .push_bind(rec.experience_match_score)
                    .push_bind(rec.merge_data.to_json());
            });
            builder.build().execute(&self.pool).await?;
            written += chunk.len();
        }
        Ok(written)
    }

    pub async fn stamp_recommended(&self, user_ids: &[Uuid]) -> Result<(), StoreError> {
        if user_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"UPDATE user_profiles SET last_recommended_at = NOW() WHERE id = ANY($1)"#,
        )
        .bind(user_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Lifecycle maintenance: flag postings older than the retention window.
    pub async fn mark_stale_expired(&self, older_than_days: i32) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET is_expired = TRUE, updated_at = NOW()
             WHERE is_expired = FALSE
               AND scraped_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(older_than_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Lifecycle maintenance: archive postings below the quality floor.
    pub async fn archive_low_quality(&self, min_quality: i32) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET archived_at = NOW(), updated_at = NOW()
             WHERE archived_at IS NULL
               AND quality_score < $1
            "#,
        )
        .bind(min_quality)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn job_from_row(row: &PgRow) -> Result<NormalizedJob, StoreError> {
    Ok(NormalizedJob {
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        location: row.try_get("location")?,
        description: row.try_get("description")?,
        salary_text: row.try_get("salary_text")?,
        canonical_url: row.try_get("canonical_url")?,
        employment_type: row.try_get("employment_type")?,
        remote_type: row.try_get("remote_type")?,
        experience_level: row.try_get("experience_level")?,
        quality_score: row.try_get("quality_score")?,
        scraped_at: row.try_get("scraped_at")?,
        archived_at: row.try_get("archived_at")?,
        is_expired: row.try_get("is_expired")?,
    })
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw actor dataset payloads, one file per
/// distinct payload, written atomically so concurrent runs never observe a
/// partial file.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn slug(input: &str) -> String {
        let slug = input
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        if slug.is_empty() {
            "unqualified".to_string()
        } else {
            slug
        }
    }

    pub fn payload_relative_path(
        fetched_at: DateTime<Utc>,
        query: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(Self::slug(query))
            .join(format!("{content_hash}.json"))
    }

    /// Store a raw dataset payload. Identical content lands on an identical
    /// path, so a repeat store is a no-op reported as `deduplicated`.
    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        query: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::payload_relative_path(fetched_at, query, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = absolute_path
            .parent()
            .expect("archive path always has a parent")
            .join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp payload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp payload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp payload file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedPayload {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!("renaming temp payload into {}", absolute_path.display())
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            bearer_token: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// JSON-oriented HTTP client with bounded exponential-backoff retries on
/// transport errors, 5xx, and 429.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    bearer_token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            bearer_token: config.bearer_token,
            backoff: config.backoff,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, HttpError> {
        self.send_json(reqwest::Method::GET, url, None).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T, HttpError> {
        self.send_json(reqwest::Method::POST, url, Some(body)).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, HttpError> {
        let span = info_span!("http_request", %method, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.request(method.clone(), url);
            if let Some(token) = &self.bearer_token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.json::<T>().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(HttpError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }

        Err(HttpError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
