//! Core domain vocabulary for the ghmirror organization mirror.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ghmirror-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseVariantError {
    pub kind: &'static str,
    pub value: String,
}

/// Unit of mutual exclusion for background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Sync,
    Backup,
    Restore,
    Transfer,
}

impl JobType {
    pub const ALL: [JobType; 4] = [JobType::Sync, JobType::Backup, JobType::Restore, JobType::Transfer];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Sync => "sync",
            JobType::Backup => "backup",
            JobType::Restore => "restore",
            JobType::Transfer => "transfer",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|job| job.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| ParseVariantError {
                kind: "job type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    Automatic,
    Manual,
}

impl JobTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobTrigger::Automatic => "automatic",
            JobTrigger::Manual => "manual",
        }
    }
}

impl fmt::Display for JobTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobTrigger {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(JobTrigger::Automatic),
            "manual" => Ok(JobTrigger::Manual),
            other => Err(ParseVariantError {
                kind: "job trigger",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle of one job run: waiting -> running -> success | failed.
/// A waiting run may also go straight to failed when its lock wait times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ParseVariantError {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("hour {0} is outside 0-23")]
    HourOutOfRange(u8),
    #[error("minute {0} is outside 0-59")]
    MinuteOutOfRange(u8),
    #[error("unknown IANA timezone `{0}`")]
    UnknownTimezone(String),
}

/// Admin-configured recurring schedule for one job type, in local wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub hour: u8,
    pub minute: u8,
    pub timezone: String,
}

impl ScheduleConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            hour: 0,
            minute: 0,
            timezone: "UTC".to_string(),
        }
    }

    /// Checks ranges and resolves the timezone. Returns the parsed zone so callers
    /// never need to parse it twice.
    pub fn validate(&self) -> Result<Tz, ScheduleError> {
        if self.hour > 23 {
            return Err(ScheduleError::HourOutOfRange(self.hour));
        }
        if self.minute > 59 {
            return Err(ScheduleError::MinuteOutOfRange(self.minute));
        }
        self.timezone
            .trim()
            .parse::<Tz>()
            .map_err(|_| ScheduleError::UnknownTimezone(self.timezone.clone()))
    }
}

/// Workflow status tracked in the append-only status history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Todo,
    InProgress,
    Done,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Todo => "todo",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Done => "done",
        }
    }

    /// Maps a planning-board column name onto a workflow status.
    pub fn from_board_column(name: &str) -> Option<Self> {
        let normalized = name
            .trim()
            .to_ascii_lowercase()
            .replace(['-', '_'], " ");
        match normalized.as_str() {
            "todo" | "to do" | "backlog" | "ready" => Some(IssueStatus::Todo),
            "in progress" | "in review" | "doing" => Some(IssueStatus::InProgress),
            "done" | "closed" | "shipped" => Some(IssueStatus::Done),
            _ => None,
        }
    }
}

impl FromStr for IssueStatus {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(IssueStatus::Todo),
            "in_progress" => Ok(IssueStatus::InProgress),
            "done" => Ok(IssueStatus::Done),
            other => Err(ParseVariantError {
                kind: "issue status",
                value: other.to_string(),
            }),
        }
    }
}

/// Where a status history fact came from. `TodoProject` always outranks `Activity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    TodoProject,
    Activity,
}

impl StatusSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusSource::TodoProject => "todo_project",
            StatusSource::Activity => "activity",
        }
    }
}

impl FromStr for StatusSource {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo_project" => Ok(StatusSource::TodoProject),
            "activity" => Ok(StatusSource::Activity),
            other => Err(ParseVariantError {
                kind: "status source",
                value: other.to_string(),
            }),
        }
    }
}

/// Immutable status fact. The (issue, status, occurred_at, source) tuple is unique
/// by convention only; writers check for existence before inserting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub issue_id: String,
    pub status: IssueStatus,
    pub occurred_at: DateTime<Utc>,
    pub source: StatusSource,
}

/// `owner/name` pair as embedded in an issue or pull request URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoSlug {
    pub owner: String,
    pub name: String,
}

impl RepoSlug {
    /// Parses `https://github.com/{owner}/{name}/(issues|pull)/{number}`.
    pub fn from_entity_url(url: &str) -> Option<Self> {
        let rest = url
            .trim()
            .strip_prefix("https://")
            .or_else(|| url.trim().strip_prefix("http://"))?;
        let mut parts = rest.split('/');
        let _host = parts.next()?;
        let owner = parts.next().filter(|s| !s.is_empty())?;
        let name = parts.next().filter(|s| !s.is_empty())?;
        let kind = parts.next()?;
        if kind != "issues" && kind != "pull" {
            return None;
        }
        parts.next().filter(|n| n.parse::<u64>().is_ok())?;
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// GitHub owner and repository names are case-insensitive.
    pub fn matches_name_with_owner(&self, name_with_owner: &str) -> bool {
        name_with_owner.eq_ignore_ascii_case(&self.to_string())
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Running,
    Success,
    Failed,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Running => "running",
            CacheStatus::Success => "success",
            CacheStatus::Failed => "failed",
        }
    }
}

impl FromStr for CacheStatus {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(CacheStatus::Running),
            "success" => Ok(CacheStatus::Success),
            "failed" => Ok(CacheStatus::Failed),
            other => Err(ParseVariantError {
                kind: "cache status",
                value: other.to_string(),
            }),
        }
    }
}

/// One row of the generic key/metadata cache-state table. Serves as an
/// idempotency fingerprint and as an observability surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheState {
    pub key: String,
    pub status: CacheStatus,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub counts: BTreeMap<String, i64>,
    pub error: Option<String>,
}
