//! Backup and restore of the mirror tables through the snapshot store.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ghmirror_core::JobType;
use ghmirror_storage::SnapshotStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::jobs::{JobContext, JobHandler, JobOutcome, JobParams};
use crate::store::LogLevel;

/// Mirror tables in foreign-key order; restore inserts in this order.
pub const BACKUP_TABLES: &[&str] = &[
    "repositories",
    "issues",
    "pull_requests",
    "issue_tracked_issues",
    "pull_request_issue_links",
    "comments",
    "pull_request_reviews",
    "reactions",
    "issue_status_history",
    "saved_filter_refs",
];

const MANIFEST_LABEL: &str = "manifest";

const SNAPSHOT_ISOLATION: &str = "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY";

/// One exported table: its row count and the rows as a JSON array.
#[derive(Debug, Clone)]
pub struct TableExport {
    pub table: &'static str,
    pub rows: i64,
    pub payload: String,
}

/// Opens a read-only transaction whose reads all see one snapshot, so every
/// exported table reflects the same moment.
pub async fn begin_snapshot(pool: &PgPool) -> Result<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await.context("opening backup transaction")?;
    sqlx::query(SNAPSHOT_ISOLATION)
        .execute(&mut *tx)
        .await
        .context("setting backup isolation level")?;
    Ok(tx)
}

pub async fn export_tables(conn: &mut PgConnection) -> Result<Vec<TableExport>> {
    let mut exports = Vec::with_capacity(BACKUP_TABLES.len());
    for &table in BACKUP_TABLES {
        let row = sqlx::query(&format!(
            "SELECT count(*) AS row_count, COALESCE(json_agg(t), '[]'::json)::text AS payload FROM {table} t"
        ))
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("exporting {table}"))?;
        exports.push(TableExport {
            table,
            rows: row.try_get("row_count")?,
            payload: row.try_get("payload")?,
        });
    }
    Ok(exports)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub schema_version: u32,
    pub taken_at: DateTime<Utc>,
    pub run_id: Option<Uuid>,
    pub tables: Vec<BackupTable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupTable {
    pub table: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: i64,
}

impl BackupManifest {
    /// Tables in restore order. Unknown tables are refused.
    fn restore_order(&self) -> Result<Vec<&BackupTable>> {
        if let Some(unknown) = self.tables.iter().find(|t| !BACKUP_TABLES.contains(&t.table.as_str())) {
            bail!("manifest names unknown table `{}`", unknown.table);
        }
        Ok(BACKUP_TABLES
            .iter()
            .filter_map(|name| self.tables.iter().find(|t| t.table == *name))
            .collect())
    }
}

pub struct BackupJob {
    pool: PgPool,
    store: SnapshotStore,
}

impl BackupJob {
    pub fn new(pool: PgPool, store: SnapshotStore) -> Self {
        Self { pool, store }
    }
}

#[async_trait]
impl JobHandler for BackupJob {
    fn job_type(&self) -> JobType {
        JobType::Backup
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome> {
        let taken_at = Utc::now();
        let mut tx = begin_snapshot(&self.pool).await?;
        let exports = export_tables(&mut tx).await?;
        tx.commit().await.context("closing backup transaction")?;

        let mut tables = Vec::with_capacity(exports.len());
        for export in exports {
            let stored = self.store.put(taken_at, export.table, "json", export.payload.as_bytes()).await?;
            tables.push(BackupTable {
                table: export.table.to_string(),
                path: stored.relative_path.to_string_lossy().into_owned(),
                sha256: stored.sha256,
                bytes: stored.byte_size,
                rows: export.rows,
            });
        }

        let manifest = BackupManifest {
            schema_version: 1,
            taken_at,
            run_id: Some(ctx.run_id),
            tables,
        };
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing backup manifest")?;
        let stored = self.store.put(taken_at, MANIFEST_LABEL, "json", &bytes).await?;
        let generation = stored
            .relative_path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let rows: i64 = manifest.tables.iter().map(|t| t.rows).sum();
        ctx.log(LogLevel::Info, format!("backup {generation} written: {rows} rows")).await;
        Ok(JobOutcome {
            summary: format!("generation {generation}, {} tables, {rows} rows", manifest.tables.len()),
            details: json!({ "generation": generation, "manifest": manifest }),
        })
    }
}

pub struct RestoreJob {
    pool: PgPool,
    store: SnapshotStore,
}

impl RestoreJob {
    pub fn new(pool: PgPool, store: SnapshotStore) -> Self {
        Self { pool, store }
    }
}

/// Loads and verifies the manifest of `generation`, or of the newest one.
pub async fn load_manifest(store: &SnapshotStore, generation: Option<&str>) -> Result<(PathBuf, BackupManifest)> {
    let generation = match generation {
        Some(name) => PathBuf::from(name),
        None => store
            .list_generations()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no backups under {}", store.root().display()))?,
    };
    let (path, sha256) = store
        .find_labeled(&generation, MANIFEST_LABEL)
        .await?
        .ok_or_else(|| anyhow!("backup {} has no manifest", generation.display()))?;
    let bytes = store.read_verified(&path, &sha256).await?;
    let manifest = serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
    Ok((generation, manifest))
}

#[async_trait]
impl JobHandler for RestoreJob {
    fn job_type(&self) -> JobType {
        JobType::Restore
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome> {
        let requested = match &ctx.params {
            JobParams::Restore { generation } => generation.as_deref(),
            _ => None,
        };
        let (generation, manifest) = load_manifest(&self.store, requested).await?;

        // verify everything before touching the database
        let mut payloads = Vec::new();
        for entry in manifest.restore_order()? {
            let bytes = self.store.read_verified(PathBuf::from(&entry.path).as_path(), &entry.sha256).await?;
            let payload = String::from_utf8(bytes).with_context(|| format!("{} is not UTF-8", entry.path))?;
            payloads.push((entry.table.as_str(), payload));
        }

        let mut tx = self.pool.begin().await.context("opening restore transaction")?;
        let mut inserted = serde_json::Map::new();
        for (table, payload) in &payloads {
            let result = sqlx::query(&format!(
                "INSERT INTO {table}
                 SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1::jsonb)
                 ON CONFLICT DO NOTHING"
            ))
            .bind(payload)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("restoring {table}"))?;
            inserted.insert(table.to_string(), json!(result.rows_affected()));
        }
        sqlx::query(
            "SELECT setval(pg_get_serial_sequence('issue_status_history', 'id'),
                           GREATEST((SELECT COALESCE(max(id), 0) FROM issue_status_history), 1))",
        )
        .execute(&mut *tx)
        .await
        .context("advancing issue_status_history sequence")?;
        sqlx::query(
            "SELECT setval(pg_get_serial_sequence('reactions', 'id'),
                           GREATEST((SELECT COALESCE(max(id), 0) FROM reactions), 1))",
        )
        .execute(&mut *tx)
        .await
        .context("advancing reactions sequence")?;
        tx.commit().await.context("committing restore")?;

        let total: u64 = inserted.values().filter_map(|v| v.as_u64()).sum();
        info!(generation = %generation.display(), rows = total, "restore applied");
        ctx.log(LogLevel::Info, format!("restored {total} rows from {}", generation.display()))
            .await;
        Ok(JobOutcome {
            summary: format!("restored {total} rows from {}", generation.display()),
            details: json!({ "generation": generation.to_string_lossy(), "inserted": inserted }),
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn manifest_with(tables: &[&str]) -> BackupManifest {
        BackupManifest {
            schema_version: 1,
            taken_at: DateTime::parse_from_rfc3339("2024-03-05T02:00:00Z").unwrap().with_timezone(&Utc),
            run_id: None,
            tables: tables
                .iter()
                .map(|t| BackupTable {
                    table: t.to_string(),
                    path: format!("20240305_020000/{t}-x.json"),
                    sha256: "x".into(),
                    bytes: 2,
                    rows: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn restore_follows_foreign_key_order() {
        let manifest = manifest_with(&["comments", "issues", "repositories", "pull_request_issue_links"]);
        let order: Vec<_> = manifest.restore_order().unwrap().iter().map(|t| t.table.as_str()).collect();
        assert_eq!(order, ["repositories", "issues", "pull_request_issue_links", "comments"]);
    }

    #[test]
    fn unknown_tables_are_refused() {
        let manifest = manifest_with(&["issues", "users; DROP TABLE issues"]);
        assert!(manifest.restore_order().is_err());
    }

    #[tokio::test]
    async fn newest_manifest_is_loaded_and_verified() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let older = manifest_with(&["issues"]);
        let mut newer = manifest_with(&["issues", "comments"]);
        newer.taken_at = older.taken_at + chrono::Duration::hours(1);
        for manifest in [&older, &newer] {
            let bytes = serde_json::to_vec(manifest).unwrap();
            store.put(manifest.taken_at, MANIFEST_LABEL, "json", &bytes).await.unwrap();
        }

        let (generation, loaded) = load_manifest(&store, None).await.unwrap();
        assert_eq!(generation, PathBuf::from("20240305_030000"));
        assert_eq!(loaded, newer);

        let (_, named) = load_manifest(&store, Some("20240305_020000")).await.unwrap();
        assert_eq!(named, older);
    }

    #[tokio::test]
    async fn tampered_manifest_is_rejected() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let manifest = manifest_with(&["issues"]);
        let stored = store
            .put(manifest.taken_at, MANIFEST_LABEL, "json", &serde_json::to_vec(&manifest).unwrap())
            .await
            .unwrap();
        std::fs::write(&stored.absolute_path, b"{}").unwrap();

        let err = load_manifest(&store, None).await.unwrap_err();
        assert!(format!("{err:#}").contains("corrupt"));
    }

    #[tokio::test]
    async fn missing_backups_are_reported() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("none-yet"));
        let err = load_manifest(&store, None).await.unwrap_err();
        assert!(err.to_string().contains("no backups"));
    }

    mod db {
        use std::sync::Arc;

        use ghmirror_core::JobTrigger;
        use sqlx::PgPool;

        use super::*;
        use crate::store::memory::MemoryStore;

        #[sqlx::test(migrations = "../../migrations")]
        #[ignore = "requires DATABASE_URL"]
        async fn backup_then_restore_into_an_empty_mirror(pool: PgPool) {
            sqlx::query(
                "INSERT INTO repositories (id, owner, name, name_with_owner, url)
                 VALUES ('R_1', 'acme', 'widgets', 'acme/widgets', 'https://github.com/acme/widgets')",
            )
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO issues (id, repository_id, number, title, state, url, labels, created_at, updated_at)
                 VALUES ('I_1', 'R_1', 1, 'First', 'OPEN', 'https://github.com/acme/widgets/issues/1', '[\"bug\"]', now(), now())",
            )
            .execute(&pool)
            .await
            .unwrap();

            let dir = tempdir().unwrap();
            let snapshots = SnapshotStore::new(dir.path());
            let store = Arc::new(MemoryStore::default());
            let ctx = JobContext::new(Uuid::new_v4(), JobType::Backup, JobTrigger::Manual, JobParams::None, store.clone());
            BackupJob::new(pool.clone(), snapshots.clone()).run(&ctx).await.unwrap();

            sqlx::query("DELETE FROM issues").execute(&pool).await.unwrap();
            sqlx::query("DELETE FROM repositories").execute(&pool).await.unwrap();

            let ctx = JobContext::new(Uuid::new_v4(), JobType::Restore, JobTrigger::Manual, JobParams::None, store);
            let outcome = RestoreJob::new(pool.clone(), snapshots).run(&ctx).await.unwrap();
            assert_eq!(outcome.details["inserted"]["issues"], 1);

            let labels: serde_json::Value = sqlx::query_scalar("SELECT labels FROM issues WHERE id = 'I_1'")
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(labels, json!(["bug"]));
        }

        #[sqlx::test(migrations = "../../migrations")]
        #[ignore = "requires DATABASE_URL"]
        async fn exports_share_one_snapshot(pool: PgPool) {
            let mut tx = begin_snapshot(&pool).await.unwrap();
            let before: i64 = sqlx::query_scalar("SELECT count(*) FROM repositories")
                .fetch_one(&mut *tx)
                .await
                .unwrap();

            // committed after the snapshot was taken
            sqlx::query(
                "INSERT INTO repositories (id, owner, name, name_with_owner, url)
                 VALUES ('R_late', 'acme', 'late', 'acme/late', 'https://github.com/acme/late')",
            )
            .execute(&pool)
            .await
            .unwrap();

            let exports = export_tables(&mut tx).await.unwrap();
            let repositories = exports.iter().find(|e| e.table == "repositories").unwrap();
            assert_eq!(repositories.rows, before);
            assert!(!repositories.payload.contains("R_late"));

            let write = sqlx::query("DELETE FROM comments").execute(&mut *tx).await;
            assert!(write.is_err(), "backup transaction is read only");
        }
    }
}
