//! Identity realignment for issues and pull requests whose stored repository
//! no longer matches the repository embedded in their own URL.
//!
//! Each candidate is re-fetched by node id in bounded batches. A node that
//! still resolves under the same id is refreshed in place. A node that no
//! longer resolves is looked up again by URL; if that yields a new id, the row
//! and every dependent reference move to the new id inside one transaction.
//! Anything else is reported for manual follow-up.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ghmirror_github::{url_disagrees_with_repository, CanonicalNode, GithubSource, MAX_NODE_BATCH};
use ghmirror_storage::FetchError;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{info, warn};

use crate::mirror;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Issue,
    PullRequest,
}

/// A column elsewhere that holds an entity id. `key` names the other columns
/// that, together with `column`, identify a row; an old-id row whose key
/// already exists under the new id is dropped instead of moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependent {
    pub table: &'static str,
    pub column: &'static str,
    pub key: &'static [&'static str],
}

const fn plain(table: &'static str, column: &'static str) -> Dependent {
    Dependent { table, column, key: &[] }
}

const fn keyed(table: &'static str, column: &'static str, key: &'static [&'static str]) -> Dependent {
    Dependent { table, column, key }
}

const HISTORY_KEY: &[&str] = &["status", "occurred_at", "source"];

const ISSUE_DEPENDENTS: &[Dependent] = &[
    plain("comments", "subject_id"),
    plain("reactions", "subject_id"),
    keyed("issue_status_history", "issue_id", HISTORY_KEY),
    keyed("saved_filter_refs", "subject_id", &["filter_id"]),
    keyed("pull_request_issue_links", "issue_id", &["pull_request_id"]),
    keyed("issue_tracked_issues", "issue_id", &["tracked_issue_id"]),
    keyed("issue_tracked_issues", "tracked_issue_id", &["issue_id"]),
];

const PULL_REQUEST_DEPENDENTS: &[Dependent] = &[
    plain("comments", "subject_id"),
    plain("reactions", "subject_id"),
    plain("pull_request_reviews", "pull_request_id"),
    keyed("saved_filter_refs", "subject_id", &["filter_id"]),
    keyed("pull_request_issue_links", "pull_request_id", &["issue_id"]),
];

impl Dependent {
    /// Deletes old-id rows that would duplicate a row already on the new id.
    fn dedupe_sql(&self) -> Option<String> {
        if self.key.is_empty() {
            return None;
        }
        let Dependent { table, column, key } = *self;
        let same = key
            .iter()
            .map(|k| format!("n.{k} IS NOT DISTINCT FROM o.{k}"))
            .collect::<Vec<_>>()
            .join(" AND ");
        Some(format!(
            "DELETE FROM {table} o WHERE o.{column} = $1
             AND EXISTS (SELECT 1 FROM {table} n WHERE n.{column} = $2 AND {same})"
        ))
    }

    fn repoint_sql(&self) -> String {
        let Dependent { table, column, .. } = *self;
        format!("UPDATE {table} SET {column} = $2 WHERE {column} = $1")
    }
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Issue, EntityKind::PullRequest];

    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Issue => "issues",
            EntityKind::PullRequest => "pull_requests",
        }
    }

    pub fn dependents(&self) -> &'static [Dependent] {
        match self {
            EntityKind::Issue => ISSUE_DEPENDENTS,
            EntityKind::PullRequest => PULL_REQUEST_DEPENDENTS,
        }
    }

    fn matches(&self, node: &CanonicalNode) -> bool {
        matches!(
            (self, node),
            (EntityKind::Issue, CanonicalNode::Issue(_)) | (EntityKind::PullRequest, CanonicalNode::PullRequest(_))
        )
    }
}

/// A stored record whose repository disagrees with its URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub kind: EntityKind,
    pub id: String,
    pub url: String,
    pub repository_id: String,
    pub stored_repository: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealignOptions {
    pub dry_run: bool,
    pub batch_size: usize,
    pub limit: usize,
}

impl Default for RealignOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: 50,
            limit: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Same id upstream; refresh denormalized fields.
    InPlace(CanonicalNode),
    /// The entity now lives under `new_id`.
    Migrate { new_id: String, node: CanonicalNode },
    Unresolved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFix {
    pub candidate: Candidate,
    pub resolution: Resolution,
}

/// Upstream lookups used during realignment.
#[async_trait]
pub trait CanonicalLookup: Send + Sync {
    async fn nodes_by_id(&self, ids: &[String]) -> Result<Vec<Option<CanonicalNode>>, FetchError>;

    async fn resolve_url(&self, url: &str) -> Result<Option<CanonicalNode>, FetchError>;
}

#[async_trait]
impl CanonicalLookup for GithubSource {
    async fn nodes_by_id(&self, ids: &[String]) -> Result<Vec<Option<CanonicalNode>>, FetchError> {
        GithubSource::nodes_by_id(self, ids).await
    }

    async fn resolve_url(&self, url: &str) -> Result<Option<CanonicalNode>, FetchError> {
        GithubSource::resolve_url(self, url).await
    }
}

/// Resolves every candidate against upstream. Batch lookups that fail abort
/// the plan; a failed URL re-resolution only leaves that candidate unresolved.
pub async fn plan_fixes(
    lookup: &dyn CanonicalLookup,
    candidates: Vec<Candidate>,
    batch_size: usize,
) -> Result<Vec<PlannedFix>> {
    let batch_size = batch_size.clamp(1, MAX_NODE_BATCH);
    let mut fixes = Vec::with_capacity(candidates.len());

    for chunk in candidates.chunks(batch_size) {
        let ids: Vec<String> = chunk.iter().map(|c| c.id.clone()).collect();
        let nodes = lookup
            .nodes_by_id(&ids)
            .await
            .with_context(|| format!("looking up {} candidate nodes", ids.len()))?;

        for (candidate, node) in chunk.iter().zip(nodes) {
            let resolution = match node {
                Some(node) if candidate.kind.matches(&node) => resolution_for(candidate, node),
                _ => match lookup.resolve_url(&candidate.url).await {
                    Ok(Some(node)) if candidate.kind.matches(&node) => resolution_for(candidate, node),
                    Ok(_) => Resolution::Unresolved,
                    Err(err) => {
                        warn!(id = %candidate.id, url = %candidate.url, error = %err, "url re-resolution failed");
                        Resolution::Unresolved
                    }
                },
            };
            fixes.push(PlannedFix {
                candidate: candidate.clone(),
                resolution,
            });
        }
    }
    Ok(fixes)
}

fn resolution_for(candidate: &Candidate, node: CanonicalNode) -> Resolution {
    if node.id() == candidate.id {
        Resolution::InPlace(node)
    } else {
        Resolution::Migrate {
            new_id: node.id().to_string(),
            node,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealignReport {
    pub dry_run: bool,
    pub scanned: usize,
    pub in_place: usize,
    pub migrated: usize,
    /// Ids that resolved to neither their old nor a new identity.
    pub unresolved: Vec<String>,
    /// Ids whose fix was rolled back; they are picked up again on the next scan.
    pub failed: Vec<String>,
}

impl RealignReport {
    pub fn corrected(&self) -> usize {
        self.in_place + self.migrated
    }
}

/// Invoked after a live pass corrected at least one record.
#[async_trait]
pub trait RefreshHook: Send + Sync {
    async fn refresh(&self, report: &RealignReport) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopRefreshHook;

#[async_trait]
impl RefreshHook for NoopRefreshHook {
    async fn refresh(&self, _report: &RealignReport) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct RealignmentEngine {
    pool: PgPool,
    lookup: Arc<dyn CanonicalLookup>,
    refresh: Arc<dyn RefreshHook>,
}

impl RealignmentEngine {
    pub fn new(pool: PgPool, lookup: Arc<dyn CanonicalLookup>) -> Self {
        Self {
            pool,
            lookup,
            refresh: Arc::new(NoopRefreshHook),
        }
    }

    pub fn with_refresh_hook(mut self, refresh: Arc<dyn RefreshHook>) -> Self {
        self.refresh = refresh;
        self
    }

    pub async fn find_candidates(&self, kind: EntityKind, limit: usize) -> Result<Vec<Candidate>> {
        // cheap SQL prefilter; the URL parser makes the final call
        let rows = sqlx::query(&format!(
            "SELECT e.id, e.url, e.repository_id, r.name_with_owner
             FROM {table} e
             JOIN repositories r ON r.id = e.repository_id
             WHERE position(lower('/' || r.name_with_owner || '/') IN lower(e.url)) = 0
             ORDER BY e.updated_at DESC
             LIMIT $1",
            table = kind.table()
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("scanning {} for realignment candidates", kind.table()))?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let candidate = Candidate {
                kind,
                id: row.try_get("id")?,
                url: row.try_get("url")?,
                repository_id: row.try_get("repository_id")?,
                stored_repository: row.try_get("name_with_owner")?,
            };
            if url_disagrees_with_repository(&candidate.url, &candidate.stored_repository) {
                candidates.push(candidate);
            }
        }
        info!(kind = kind.table(), candidates = candidates.len(), "realignment candidates found");
        Ok(candidates)
    }

    pub async fn run(&self, options: RealignOptions) -> Result<RealignReport> {
        let mut report = RealignReport {
            dry_run: options.dry_run,
            ..RealignReport::default()
        };

        for kind in EntityKind::ALL {
            let remaining = options.limit.saturating_sub(report.scanned);
            if remaining == 0 {
                break;
            }
            let candidates = self.find_candidates(kind, remaining).await?;
            report.scanned += candidates.len();
            let fixes = plan_fixes(self.lookup.as_ref(), candidates, options.batch_size).await?;

            for fix in fixes {
                let PlannedFix { candidate, resolution } = fix;
                match resolution {
                    Resolution::Unresolved => {
                        warn!(id = %candidate.id, url = %candidate.url, "candidate resolves to no upstream entity; needs manual follow-up");
                        report.unresolved.push(candidate.id);
                    }
                    Resolution::InPlace(node) => {
                        if options.dry_run {
                            info!(id = %candidate.id, repository = %node.repository().name_with_owner, "dry run: would refresh in place");
                            report.in_place += 1;
                            continue;
                        }
                        match self.refresh_in_place(&node).await {
                            Ok(()) => report.in_place += 1,
                            Err(err) => {
                                warn!(id = %candidate.id, error = %format!("{err:#}"), "in-place refresh failed");
                                report.failed.push(candidate.id);
                            }
                        }
                    }
                    Resolution::Migrate { new_id, node } => {
                        if options.dry_run {
                            info!(old_id = %candidate.id, new_id = %new_id, "dry run: would migrate identity");
                            report.migrated += 1;
                            continue;
                        }
                        match self.migrate(kind, &candidate.id, &node).await {
                            Ok(()) => {
                                info!(old_id = %candidate.id, new_id = %new_id, kind = kind.table(), "identity migrated");
                                report.migrated += 1;
                            }
                            Err(err) => {
                                warn!(old_id = %candidate.id, new_id = %new_id, error = %format!("{err:#}"), "identity migration rolled back");
                                report.failed.push(candidate.id);
                            }
                        }
                    }
                }
            }
        }

        info!(
            dry_run = report.dry_run,
            scanned = report.scanned,
            in_place = report.in_place,
            migrated = report.migrated,
            unresolved = report.unresolved.len(),
            failed = report.failed.len(),
            "realignment pass finished"
        );

        if !report.dry_run && report.corrected() > 0 {
            if let Err(err) = self.refresh.refresh(&report).await {
                warn!(error = %format!("{err:#}"), "post-realignment refresh failed");
            }
        }
        Ok(report)
    }

    async fn refresh_in_place(&self, node: &CanonicalNode) -> Result<()> {
        let mut tx = self.pool.begin().await.context("opening refresh transaction")?;
        mirror::upsert_canonical(&mut tx, node).await?;
        tx.commit().await.context("committing in-place refresh")?;
        Ok(())
    }

    async fn migrate(&self, kind: EntityKind, old_id: &str, node: &CanonicalNode) -> Result<()> {
        let mut tx = self.pool.begin().await.context("opening identity migration transaction")?;
        migrate_identity(&mut tx, kind, old_id, node).await?;
        tx.commit().await.context("committing identity migration")?;
        Ok(())
    }
}

/// Moves `old_id` to `node`'s id. Must run inside a transaction: on any error
/// the caller rolls back and nothing references the new id.
pub async fn migrate_identity(
    conn: &mut PgConnection,
    kind: EntityKind,
    old_id: &str,
    node: &CanonicalNode,
) -> Result<()> {
    let table = kind.table();
    let new_id = node.id();

    // no-op when a later sync already imported the new id
    sqlx::query(&format!(
        "INSERT INTO {table}
         SELECT (jsonb_populate_record(NULL::{table}, to_jsonb(t) || jsonb_build_object('id', $2::text))).*
         FROM {table} t WHERE t.id = $1
         ON CONFLICT (id) DO NOTHING"
    ))
    .bind(old_id)
    .bind(new_id)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("copying {table} row {old_id} to {new_id}"))?;

    for dependent in kind.dependents() {
        let (dep, column) = (dependent.table, dependent.column);
        if let Some(sql) = dependent.dedupe_sql() {
            sqlx::query(&sql)
                .bind(old_id)
                .bind(new_id)
                .execute(&mut *conn)
                .await
                .with_context(|| format!("dropping duplicate {dep}.{column} rows"))?;
        }
        sqlx::query(&dependent.repoint_sql())
            .bind(old_id)
            .bind(new_id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("re-pointing {dep}.{column}"))?;
    }

    sqlx::query(&format!("DELETE FROM {table} WHERE id = $1"))
        .bind(old_id)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("deleting superseded {table} row {old_id}"))?;

    mirror::upsert_canonical(conn, node).await
}
