//! Job handler contract plus the sync and transfer handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ghmirror_core::{CacheState, CacheStatus, JobTrigger, JobType};
use ghmirror_github::GithubSource;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::mirror;
use crate::realign::{RealignOptions, RealignmentEngine};
use crate::status::{StatusDerivationEngine, SYNC_KEY};
use crate::store::{read_cache_state, write_cache_state, LogLevel, SchedulerStore};
use crate::MirrorRegistry;

/// Per-run parameters supplied by the administrative surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobParams {
    #[default]
    None,
    Realign(RealignOptions),
    Restore { generation: Option<String> },
}

#[derive(Clone)]
pub struct JobContext {
    pub run_id: Uuid,
    pub job: JobType,
    pub trigger: JobTrigger,
    pub params: JobParams,
    store: Arc<dyn SchedulerStore>,
}

impl JobContext {
    pub fn new(
        run_id: Uuid,
        job: JobType,
        trigger: JobTrigger,
        params: JobParams,
        store: Arc<dyn SchedulerStore>,
    ) -> Self {
        Self {
            run_id,
            job,
            trigger,
            params,
            store,
        }
    }

    /// Emits a tracing event and persists the line beside the run row.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!(job = %self.job, run_id = %self.run_id, "{message}"),
            LogLevel::Warn => warn!(job = %self.job, run_id = %self.run_id, "{message}"),
            LogLevel::Error => error!(job = %self.job, run_id = %self.run_id, "{message}"),
        }
        if let Err(err) = self.store.append_log(self.run_id, level, &message).await {
            warn!(run_id = %self.run_id, error = %format!("{err:#}"), "could not persist job log line");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobOutcome {
    pub summary: String,
    pub details: Value,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome>;
}

/// Incremental pull of the organization into the mirror tables.
pub struct SyncJob {
    pool: PgPool,
    source: GithubSource,
    registry: MirrorRegistry,
    status: StatusDerivationEngine,
}

impl SyncJob {
    pub fn new(pool: PgPool, source: GithubSource, registry: MirrorRegistry, status: StatusDerivationEngine) -> Self {
        Self {
            pool,
            source,
            registry,
            status,
        }
    }

    async fn pull(&self, ctx: &JobContext, since: Option<chrono::DateTime<Utc>>) -> Result<BTreeMap<String, i64>> {
        let repos: Vec<_> = self
            .source
            .repositories()
            .await
            .with_context(|| format!("listing repositories of {}", self.source.org()))?
            .into_iter()
            .filter(|repo| self.registry.wants(&repo.name))
            .collect();
        ctx.log(LogLevel::Info, format!("syncing {} repositories (since {since:?})", repos.len()))
            .await;

        let mut conn = self.pool.acquire().await.context("acquiring mirror connection")?;
        let mut counts = BTreeMap::new();
        let mut bump = |key: &str, by: usize| *counts.entry(key.to_string()).or_insert(0i64) += by as i64;

        for repo in &repos {
            mirror::upsert_repository(&mut conn, repo).await?;
        }
        bump("repositories", repos.len());

        // issues first so pull request links find their targets
        for repo in &repos {
            let issues = self
                .source
                .issues(repo, since)
                .await
                .with_context(|| format!("fetching issues of {}", repo.name_with_owner))?;
            for issue in &issues {
                if mirror::sync_issue(&mut conn, issue).await? {
                    bump("board_status_changes", 1);
                }
            }
            bump("issues", issues.len());
        }

        for repo in &repos {
            let pulls = self
                .source
                .pull_requests(repo, since)
                .await
                .with_context(|| format!("fetching pull requests of {}", repo.name_with_owner))?;
            for pr in &pulls {
                mirror::upsert_pull_request(&mut conn, pr).await?;
            }
            bump("pull_requests", pulls.len());
        }

        Ok(counts)
    }
}

#[async_trait]
impl JobHandler for SyncJob {
    fn job_type(&self) -> JobType {
        JobType::Sync
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome> {
        let started_at = Utc::now();
        let previous = read_cache_state(&self.pool, SYNC_KEY).await?;
        let since = previous.as_ref().and_then(|p| p.last_successful_sync_at);
        let mut state = CacheState {
            key: SYNC_KEY.to_string(),
            status: CacheStatus::Running,
            last_successful_sync_at: since,
            run_id: Some(ctx.run_id),
            counts: previous.map(|p| p.counts).unwrap_or_default(),
            error: None,
        };
        write_cache_state(&self.pool, &state).await?;

        let counts = match self.pull(ctx, since).await {
            Ok(counts) => counts,
            Err(err) => {
                state.status = CacheStatus::Failed;
                state.error = Some(format!("{err:#}"));
                if let Err(write_err) = write_cache_state(&self.pool, &state).await {
                    warn!(error = %format!("{write_err:#}"), "could not record failed sync state");
                }
                return Err(err);
            }
        };

        state.status = CacheStatus::Success;
        state.last_successful_sync_at = Some(started_at);
        state.counts = counts.clone();
        write_cache_state(&self.pool, &state).await?;

        let derivation = match self.status.run(false, Some(ctx.run_id)).await {
            Ok(outcome) => serde_json::to_value(&outcome).unwrap_or(Value::Null),
            Err(err) => {
                ctx.log(LogLevel::Warn, format!("status derivation after sync failed: {err:#}"))
                    .await;
                Value::Null
            }
        };

        Ok(JobOutcome {
            summary: format!(
                "{} repositories, {} issues, {} pull requests",
                counts.get("repositories").copied().unwrap_or(0),
                counts.get("issues").copied().unwrap_or(0),
                counts.get("pull_requests").copied().unwrap_or(0),
            ),
            details: json!({ "counts": counts, "since": since, "status_derivation": derivation }),
        })
    }
}

/// Identity realignment run through the job lock.
pub struct TransferJob {
    engine: RealignmentEngine,
    defaults: RealignOptions,
}

impl TransferJob {
    pub fn new(engine: RealignmentEngine, defaults: RealignOptions) -> Self {
        Self { engine, defaults }
    }

    fn options_for(&self, params: &JobParams) -> RealignOptions {
        match params {
            JobParams::Realign(options) => *options,
            _ => self.defaults,
        }
    }
}

#[async_trait]
impl JobHandler for TransferJob {
    fn job_type(&self) -> JobType {
        JobType::Transfer
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutcome> {
        let options = self.options_for(&ctx.params);
        let report = self.engine.run(options).await?;
        if !report.unresolved.is_empty() {
            ctx.log(
                LogLevel::Warn,
                format!("unresolved after realignment: {}", report.unresolved.join(", ")),
            )
            .await;
        }
        if !report.failed.is_empty() {
            ctx.log(
                LogLevel::Warn,
                format!("rolled back, retried next scan: {}", report.failed.join(", ")),
            )
            .await;
        }
        Ok(JobOutcome {
            summary: format!(
                "{}scanned {}, in place {}, migrated {}, unresolved {}, failed {}",
                if report.dry_run { "dry run: " } else { "" },
                report.scanned,
                report.in_place,
                report.migrated,
                report.unresolved.len(),
                report.failed.len(),
            ),
            details: serde_json::to_value(&report).context("serializing realignment report")?,
        })
    }
}
