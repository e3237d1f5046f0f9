//! Derived workflow status for issues that have no planning-board status.
//!
//! Two rules, both insert-if-missing:
//! - `in_progress` at the earliest creation time of any linked pull request;
//! - `done` at the issue's own `closed_at` when a linked pull request merged at
//!   that exact instant.
//!
//! Issues with any `todo_project` history are left alone. Runs hold a
//! transaction-scoped advisory lock so a manual trigger and the post-sync run
//! never interleave, and a fingerprint against the last successful sync skips
//! work that was already done.

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ghmirror_core::{CacheState, CacheStatus, IssueStatus, StatusHistoryEntry, StatusSource};
use serde::Serialize;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::store::{read_cache_state, write_cache_state};

/// Advisory lock key owned by this engine ("ghstatus" in ASCII).
pub const STATUS_LOCK_KEY: i64 = 0x6768_7374_6174_7573;
pub const FINGERPRINT_KEY: &str = "status_automation";
pub const SYNC_KEY: &str = "sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedPr {
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
}

/// Everything the planner needs to know about one issue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueFacts {
    pub issue_id: String,
    pub closed_at: Option<DateTime<Utc>>,
    pub has_todo_project: bool,
    pub linked_prs: Vec<LinkedPr>,
    pub existing_activity: HashSet<(IssueStatus, DateTime<Utc>)>,
}

/// Activity entries missing for the given issues.
pub fn plan_status_entries(facts: &[IssueFacts]) -> Vec<StatusHistoryEntry> {
    let mut planned = Vec::new();
    for issue in facts {
        if issue.has_todo_project {
            continue;
        }

        if let Some(started) = issue.linked_prs.iter().map(|pr| pr.created_at).min() {
            if !issue.existing_activity.contains(&(IssueStatus::InProgress, started)) {
                planned.push(activity(&issue.issue_id, IssueStatus::InProgress, started));
            }
        }

        if let Some(closed_at) = issue.closed_at {
            let closed_by_merge = issue.linked_prs.iter().any(|pr| pr.merged_at == Some(closed_at));
            if closed_by_merge && !issue.existing_activity.contains(&(IssueStatus::Done, closed_at)) {
                planned.push(activity(&issue.issue_id, IssueStatus::Done, closed_at));
            }
        }
    }
    planned
}

fn activity(issue_id: &str, status: IssueStatus, occurred_at: DateTime<Utc>) -> StatusHistoryEntry {
    StatusHistoryEntry {
        issue_id: issue_id.to_string(),
        status,
        occurred_at,
        source: StatusSource::Activity,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DerivationOutcome {
    /// The last successful sync was already processed.
    Skipped { fingerprint: Option<DateTime<Utc>> },
    Applied {
        in_progress: u64,
        done: u64,
        fingerprint: Option<DateTime<Utc>>,
    },
}

#[derive(Clone)]
pub struct StatusDerivationEngine {
    pool: PgPool,
}

impl StatusDerivationEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs one derivation pass. Failures are rolled back and then recorded on
    /// the fingerprint row in a separate transaction when possible.
    pub async fn run(&self, force: bool, run_id: Option<Uuid>) -> Result<DerivationOutcome> {
        match self.run_locked(force, run_id).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.record_failure(run_id, &err).await;
                Err(err)
            }
        }
    }

    async fn run_locked(&self, force: bool, run_id: Option<Uuid>) -> Result<DerivationOutcome> {
        let mut tx = self.pool.begin().await.context("opening status derivation transaction")?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(STATUS_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .context("taking status derivation advisory lock")?;

        let fingerprint = read_cache_state(&mut *tx, SYNC_KEY)
            .await?
            .and_then(|state| state.last_successful_sync_at);
        let processed = read_cache_state(&mut *tx, FINGERPRINT_KEY).await?;
        let already_done = processed
            .as_ref()
            .is_some_and(|state| state.status == CacheStatus::Success && state.last_successful_sync_at == fingerprint);
        if !force && already_done {
            info!(fingerprint = ?fingerprint, "status derivation already applied for this sync; skipping");
            tx.commit().await.context("releasing status derivation lock")?;
            return Ok(DerivationOutcome::Skipped { fingerprint });
        }

        let facts = load_facts(&mut tx).await?;
        let planned = plan_status_entries(&facts);
        let mut in_progress = 0u64;
        let mut done = 0u64;
        for entry in &planned {
            if insert_status_entry(&mut tx, entry).await? {
                match entry.status {
                    IssueStatus::InProgress => in_progress += 1,
                    IssueStatus::Done => done += 1,
                    IssueStatus::Todo => {}
                }
            }
        }

        let mut counts = BTreeMap::new();
        counts.insert("in_progress".to_string(), in_progress as i64);
        counts.insert("done".to_string(), done as i64);
        counts.insert("issues_considered".to_string(), facts.len() as i64);
        write_cache_state(
            &mut *tx,
            &CacheState {
                key: FINGERPRINT_KEY.to_string(),
                status: CacheStatus::Success,
                last_successful_sync_at: fingerprint,
                run_id,
                counts,
                error: None,
            },
        )
        .await?;
        tx.commit().await.context("committing status derivation")?;

        info!(in_progress, done, issues = facts.len(), forced = force, "status derivation applied");
        Ok(DerivationOutcome::Applied {
            in_progress,
            done,
            fingerprint,
        })
    }

    async fn record_failure(&self, run_id: Option<Uuid>, err: &anyhow::Error) {
        let outcome = async {
            let mut tx = self.pool.begin().await?;
            let previous = read_cache_state(&mut *tx, FINGERPRINT_KEY).await?;
            write_cache_state(
                &mut *tx,
                &CacheState {
                    key: FINGERPRINT_KEY.to_string(),
                    status: CacheStatus::Failed,
                    last_successful_sync_at: previous.and_then(|p| p.last_successful_sync_at),
                    run_id,
                    counts: BTreeMap::new(),
                    error: Some(format!("{err:#}")),
                },
            )
            .await?;
            tx.commit().await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;
        match outcome {
            Ok(()) => warn!(error = %format!("{err:#}"), "status derivation failed; failure recorded"),
            Err(record_err) => error!(
                error = %format!("{err:#}"),
                record_error = %format!("{record_err:#}"),
                "status derivation failed and the failure could not be recorded"
            ),
        }
    }
}

async fn load_facts(conn: &mut PgConnection) -> Result<Vec<IssueFacts>> {
    let rows = sqlx::query(
        "SELECT i.id, i.closed_at, p.created_at AS pr_created_at, p.merged_at
         FROM issues i
         JOIN pull_request_issue_links l ON l.issue_id = i.id
         JOIN pull_requests p ON p.id = l.pull_request_id
         ORDER BY i.id",
    )
    .fetch_all(&mut *conn)
    .await
    .context("loading linked pull request timelines")?;

    let todo_project: HashSet<String> =
        sqlx::query_scalar("SELECT DISTINCT issue_id FROM issue_status_history WHERE source = $1")
            .bind(StatusSource::TodoProject.as_str())
            .fetch_all(&mut *conn)
            .await
            .context("loading todo_project history")?
            .into_iter()
            .collect();

    let mut by_issue: BTreeMap<String, IssueFacts> = BTreeMap::new();
    for row in rows {
        let issue_id: String = row.try_get("id")?;
        let facts = by_issue.entry(issue_id.clone()).or_insert_with(|| IssueFacts {
            has_todo_project: todo_project.contains(&issue_id),
            issue_id,
            ..IssueFacts::default()
        });
        facts.closed_at = row.try_get("closed_at")?;
        facts.linked_prs.push(LinkedPr {
            created_at: row.try_get("pr_created_at")?,
            merged_at: row.try_get("merged_at")?,
        });
    }

    let activity = sqlx::query("SELECT issue_id, status, occurred_at FROM issue_status_history WHERE source = $1")
        .bind(StatusSource::Activity.as_str())
        .fetch_all(&mut *conn)
        .await
        .context("loading activity history")?;
    for row in activity {
        let issue_id: String = row.try_get("issue_id")?;
        if let Some(facts) = by_issue.get_mut(&issue_id) {
            let status: IssueStatus = row.try_get::<String, _>("status")?.parse()?;
            facts.existing_activity.insert((status, row.try_get("occurred_at")?));
        }
    }

    Ok(by_issue.into_values().collect())
}

/// Inserts one history fact unless the same tuple exists already. Activity
/// facts are also refused for issues that gained `todo_project` history after
/// planning. Returns whether a row was written.
async fn insert_status_entry(conn: &mut PgConnection, entry: &StatusHistoryEntry) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO issue_status_history (issue_id, status, occurred_at, source)
         SELECT $1, $2, $3, $4
         WHERE NOT EXISTS (
             SELECT 1 FROM issue_status_history
             WHERE issue_id = $1 AND status = $2 AND occurred_at = $3 AND source = $4
         )
         AND ($4 <> 'activity' OR NOT EXISTS (
             SELECT 1 FROM issue_status_history WHERE issue_id = $1 AND source = 'todo_project'
         ))",
    )
    .bind(&entry.issue_id)
    .bind(entry.status.as_str())
    .bind(entry.occurred_at)
    .bind(entry.source.as_str())
    .execute(&mut *conn)
    .await
    .with_context(|| format!("recording {} for {}", entry.status.as_str(), entry.issue_id))?;
    Ok(result.rows_affected() > 0)
}

/// Records a planning-board status change observed during sync.
pub async fn record_board_status(
    conn: &mut PgConnection,
    issue_id: &str,
    status: IssueStatus,
    occurred_at: DateTime<Utc>,
) -> Result<bool> {
    insert_status_entry(
        conn,
        &StatusHistoryEntry {
            issue_id: issue_id.to_string(),
            status,
            occurred_at,
            source: StatusSource::TodoProject,
        },
    )
    .await
}
