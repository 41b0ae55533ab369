//! Core domain model for the jobflow ingestion and matching pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobflow-core";

/// Number of job slots exposed to the mail-merge collaborator. Fixed so the
/// downstream template always sees the same payload shape.
pub const MERGE_SLOT_COUNT: usize = 5;

/// Canonical persisted job posting. `external_id` is the natural key:
/// re-ingesting the same id updates the row in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedJob {
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub salary_text: Option<String>,
    pub canonical_url: String,
    pub employment_type: Option<String>,
    pub remote_type: Option<String>,
    pub experience_level: Option<String>,
    pub quality_score: i32,
    pub scraped_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
}

/// Read-only view of a user's matching preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferenceProfile {
    pub id: Uuid,
    pub email: String,
    pub desired_job_title: Option<String>,
    pub experience_level: Option<String>,
    pub preferred_location: Option<String>,
    pub preferred_industry: Option<String>,
    pub last_recommended_at: Option<DateTime<Utc>>,
}

/// One persisted match for one user in one run. Never mutated; superseded by
/// the next run's rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub run_id: Uuid,
    pub user_id: Uuid,
    pub job_external_id: String,
    pub match_score: f64,
    pub title_similarity_score: f64,
    pub experience_match_score: f64,
    pub merge_data: MergeData,
}

/// Lifecycle of a batch execution (ingestion or recommendation generation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run-level record with aggregate counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub users_processed: i32,
    pub recommendations_generated: i32,
    pub jobs_considered: i32,
    pub error: Option<String>,
}

/// One populated slot of the merge payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSlot {
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: String,
    pub score: f64,
}

/// Fixed-shape payload for the email-templating collaborator: always exactly
/// [`MERGE_SLOT_COUNT`] slots, unused slots rendered blank.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeData {
    slots: Vec<MergeSlot>,
}

impl MergeData {
    pub fn from_slots(slots: Vec<MergeSlot>) -> Self {
        let mut slots = slots;
        slots.truncate(MERGE_SLOT_COUNT);
        Self { slots }
    }

    pub fn slots(&self) -> &[MergeSlot] {
        &self.slots
    }

    pub fn populated(&self) -> usize {
        self.slots.len()
    }

    /// Flatten into `JOB1_TITLE`..`JOB5_SCORE` keys, blank-padding slots that
    /// have no match.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for i in 0..MERGE_SLOT_COUNT {
            let n = i + 1;
            let slot = self.slots.get(i);
            out.insert(
                format!("JOB{n}_TITLE"),
                slot.map(|s| s.title.clone()).unwrap_or_default(),
            );
            out.insert(
                format!("JOB{n}_COMPANY"),
                slot.map(|s| s.company.clone()).unwrap_or_default(),
            );
            out.insert(
                format!("JOB{n}_LOCATION"),
                slot.map(|s| s.location.clone()).unwrap_or_default(),
            );
            out.insert(
                format!("JOB{n}_URL"),
                slot.map(|s| s.url.clone()).unwrap_or_default(),
            );
            out.insert(
                format!("JOB{n}_SCORE"),
                slot.map(|s| format!("{:.0}", s.score)).unwrap_or_default(),
            );
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.to_map()).unwrap_or(serde_json::Value::Null)
    }
}

/// Immutable per-batch outcome, produced by folding over raw items rather
/// than incrementing shared counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl IngestSummary {
    pub fn record_inserted(mut self) -> Self {
        self.inserted += 1;
        self
    }

    pub fn record_updated(mut self) -> Self {
        self.updated += 1;
        self
    }

    pub fn record_skipped(mut self, reason: impl Into<String>) -> Self {
        self.skipped += 1;
        self.errors.push(reason.into());
        self
    }

    pub fn record_error(mut self, message: impl Into<String>) -> Self {
        self.errors.push(message.into());
        self
    }

    /// Items that made it into the store in this batch.
    pub fn persisted(&self) -> usize {
        self.inserted + self.updated
    }
}
