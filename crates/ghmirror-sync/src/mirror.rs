//! Idempotent upserts of upstream payloads into the mirror tables.

use anyhow::{Context, Result};
use ghmirror_core::IssueStatus;
use ghmirror_github::{CanonicalNode, CommentNode, IssueNode, PullRequestNode, RepositoryNode};
use sqlx::types::Json;
use sqlx::PgConnection;

use crate::status::record_board_status;

pub async fn upsert_repository(conn: &mut PgConnection, repo: &RepositoryNode) -> Result<()> {
    sqlx::query(
        "INSERT INTO repositories (id, owner, name, name_with_owner, url, is_archived, updated_at, synced_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, now())
         ON CONFLICT (id) DO UPDATE
         SET owner = EXCLUDED.owner, name = EXCLUDED.name, name_with_owner = EXCLUDED.name_with_owner,
             url = EXCLUDED.url, is_archived = EXCLUDED.is_archived, updated_at = EXCLUDED.updated_at,
             synced_at = now()",
    )
    .bind(&repo.id)
    .bind(&repo.owner.login)
    .bind(&repo.name)
    .bind(&repo.name_with_owner)
    .bind(&repo.url)
    .bind(repo.is_archived)
    .bind(repo.updated_at)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("upserting repository {}", repo.name_with_owner))?;
    Ok(())
}

/// Upserts an issue with its repository, labels, project-field snapshot,
/// tracked-issue links and comments. Returns the planning-board status when it
/// differs from what was stored before.
pub async fn upsert_issue(conn: &mut PgConnection, issue: &IssueNode) -> Result<Option<IssueStatus>> {
    upsert_repository(conn, &issue.repository).await?;

    let previous: Option<Option<String>> = sqlx::query_scalar("SELECT board_status FROM issues WHERE id = $1")
        .bind(&issue.id)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("reading stored board status of {}", issue.id))?;
    let board_status = issue.board_status();

    sqlx::query(
        "INSERT INTO issues (id, repository_id, number, title, state, url, author_login, labels,
                             project_fields, board_status, created_at, updated_at, closed_at, synced_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now())
         ON CONFLICT (id) DO UPDATE
         SET repository_id = EXCLUDED.repository_id, number = EXCLUDED.number, title = EXCLUDED.title,
             state = EXCLUDED.state, url = EXCLUDED.url, author_login = EXCLUDED.author_login,
             labels = EXCLUDED.labels, project_fields = EXCLUDED.project_fields,
             board_status = EXCLUDED.board_status, updated_at = EXCLUDED.updated_at,
             closed_at = EXCLUDED.closed_at, synced_at = now()",
    )
    .bind(&issue.id)
    .bind(&issue.repository.id)
    .bind(issue.number)
    .bind(&issue.title)
    .bind(&issue.state)
    .bind(&issue.url)
    .bind(issue.author_login())
    .bind(Json(issue.label_names()))
    .bind(Json(issue.project_fields()))
    .bind(board_status.map(|s| s.as_str()))
    .bind(issue.created_at)
    .bind(issue.updated_at)
    .bind(issue.closed_at)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("upserting issue {}", issue.url))?;

    sqlx::query("DELETE FROM issue_tracked_issues WHERE issue_id = $1")
        .bind(&issue.id)
        .execute(&mut *conn)
        .await
        .context("clearing tracked-issue links")?;
    for tracked in issue.tracked_issue_ids() {
        sqlx::query(
            "INSERT INTO issue_tracked_issues (issue_id, tracked_issue_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(&issue.id)
        .bind(&tracked)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("linking tracked issue {tracked}"))?;
    }

    for comment in issue.comments() {
        upsert_comment(conn, &issue.id, comment).await?;
    }

    let previous = previous.flatten();
    Ok(board_status.filter(|status| previous.as_deref() != Some(status.as_str())))
}

/// Upserts a pull request with its reviews, comments and closing-issue links.
/// Links to issues that are not mirrored are skipped.
pub async fn upsert_pull_request(conn: &mut PgConnection, pr: &PullRequestNode) -> Result<()> {
    upsert_repository(conn, &pr.repository).await?;

    sqlx::query(
        "INSERT INTO pull_requests (id, repository_id, number, title, state, url, author_login, labels,
                                    created_at, updated_at, closed_at, merged_at, synced_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now())
         ON CONFLICT (id) DO UPDATE
         SET repository_id = EXCLUDED.repository_id, number = EXCLUDED.number, title = EXCLUDED.title,
             state = EXCLUDED.state, url = EXCLUDED.url, author_login = EXCLUDED.author_login,
             labels = EXCLUDED.labels, updated_at = EXCLUDED.updated_at, closed_at = EXCLUDED.closed_at,
             merged_at = EXCLUDED.merged_at, synced_at = now()",
    )
    .bind(&pr.id)
    .bind(&pr.repository.id)
    .bind(pr.number)
    .bind(&pr.title)
    .bind(&pr.state)
    .bind(&pr.url)
    .bind(pr.author_login())
    .bind(Json(pr.label_names()))
    .bind(pr.created_at)
    .bind(pr.updated_at)
    .bind(pr.closed_at)
    .bind(pr.merged_at)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("upserting pull request {}", pr.url))?;

    for review in pr.reviews() {
        sqlx::query(
            "INSERT INTO pull_request_reviews (id, pull_request_id, author_login, state, submitted_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE
             SET pull_request_id = EXCLUDED.pull_request_id, author_login = EXCLUDED.author_login,
                 state = EXCLUDED.state, submitted_at = EXCLUDED.submitted_at",
        )
        .bind(&review.id)
        .bind(&pr.id)
        .bind(review.author.as_ref().map(|a| a.login.as_str()))
        .bind(&review.state)
        .bind(review.submitted_at)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("upserting review {}", review.id))?;
    }

    for comment in pr.comments() {
        upsert_comment(conn, &pr.id, comment).await?;
    }

    for issue_id in pr.closing_issue_ids() {
        sqlx::query(
            "INSERT INTO pull_request_issue_links (pull_request_id, issue_id)
             SELECT $1, $2 WHERE EXISTS (SELECT 1 FROM issues WHERE id = $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(&pr.id)
        .bind(&issue_id)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("linking {} to issue {issue_id}", pr.id))?;
    }
    Ok(())
}

/// Upserts an issue and appends a `todo_project` history entry when its board
/// status moved. Returns whether an entry was written.
pub async fn sync_issue(conn: &mut PgConnection, issue: &IssueNode) -> Result<bool> {
    match upsert_issue(conn, issue).await? {
        Some(status) => record_board_status(conn, &issue.id, status, issue.updated_at).await,
        None => Ok(false),
    }
}

pub async fn upsert_canonical(conn: &mut PgConnection, node: &CanonicalNode) -> Result<()> {
    match node {
        CanonicalNode::Issue(issue) => sync_issue(conn, issue).await.map(|_| ()),
        CanonicalNode::PullRequest(pr) => upsert_pull_request(conn, pr).await,
    }
}

async fn upsert_comment(conn: &mut PgConnection, subject_id: &str, comment: &CommentNode) -> Result<()> {
    sqlx::query(
        "INSERT INTO comments (id, subject_id, author_login, body, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (id) DO UPDATE
         SET subject_id = EXCLUDED.subject_id, author_login = EXCLUDED.author_login,
             body = EXCLUDED.body, updated_at = EXCLUDED.updated_at",
    )
    .bind(&comment.id)
    .bind(subject_id)
    .bind(comment.author.as_ref().map(|a| a.login.as_str()))
    .bind(&comment.body)
    .bind(comment.created_at)
    .bind(comment.updated_at)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("upserting comment {}", comment.id))?;
    Ok(())
}
