//! GitHub GraphQL adapter: query documents, payload types and collectors.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ghmirror_core::{IssueStatus, RepoSlug};
use ghmirror_storage::{ConnectionQuery, FetchError, GraphqlRequest, RateLimitedClient};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ghmirror-github";

/// Upper bound GitHub accepts for `nodes(ids:)`.
pub const MAX_NODE_BATCH: usize = 100;

const ISSUE_FIELDS: &str = r#"
fragment IssueFields on Issue {
  id number title issueState: state url createdAt updatedAt closedAt
  author { login }
  repository { ...RepositoryFields }
  labels(first: 50) { nodes { name } }
  trackedIssues(first: 50) { nodes { id } }
  projectItems(first: 10) {
    nodes {
      project { title }
      fieldValueByName(name: "Status") { ... on ProjectV2ItemFieldSingleSelectValue { name } }
    }
  }
  comments(first: 100) { nodes { id body createdAt updatedAt author { login } } }
}
"#;

const PULL_REQUEST_FIELDS: &str = r#"
fragment PullRequestFields on PullRequest {
  id number title prState: state url createdAt updatedAt closedAt mergedAt
  author { login }
  repository { ...RepositoryFields }
  labels(first: 50) { nodes { name } }
  closingIssuesReferences(first: 50) { nodes { id } }
  reviews(first: 100) { nodes { id state submittedAt author { login } } }
  comments(first: 100) { nodes { id body createdAt updatedAt author { login } } }
}
"#;

const REPOSITORY_FIELDS: &str = r#"
fragment RepositoryFields on Repository {
  id name nameWithOwner url isArchived updatedAt
  owner { login }
}
"#;

const REPOSITORIES_QUERY: &str = r#"
query OrgRepositories($org: String!, $after: String) {
  organization(login: $org) {
    repositories(first: 100, after: $after, orderBy: {field: NAME, direction: ASC}) {
      nodes { ...RepositoryFields }
      pageInfo { hasNextPage endCursor }
    }
  }
}
"#;

const ISSUES_QUERY: &str = r#"
query RepositoryIssues($owner: String!, $name: String!, $since: DateTime, $after: String) {
  repository(owner: $owner, name: $name) {
    issues(first: 50, after: $after, orderBy: {field: UPDATED_AT, direction: DESC}, filterBy: {since: $since}) {
      nodes { ...IssueFields }
      pageInfo { hasNextPage endCursor }
    }
  }
}
"#;

const PULL_REQUESTS_QUERY: &str = r#"
query RepositoryPullRequests($owner: String!, $name: String!, $after: String) {
  repository(owner: $owner, name: $name) {
    pullRequests(first: 50, after: $after, orderBy: {field: UPDATED_AT, direction: DESC}) {
      nodes { ...PullRequestFields }
      pageInfo { hasNextPage endCursor }
    }
  }
}
"#;

const NODES_QUERY: &str = r#"
query NodesById($ids: [ID!]!) {
  nodes(ids: $ids) {
    __typename
    ...IssueFields
    ...PullRequestFields
  }
}
"#;

const RESOURCE_QUERY: &str = r#"
query ResourceByUrl($url: URI!) {
  resource(url: $url) {
    __typename
    ...IssueFields
    ...PullRequestFields
  }
}
"#;

fn document(body: &str, fragments: &[&str]) -> String {
    let mut out = body.trim().to_string();
    for fragment in fragments {
        out.push('\n');
        out.push_str(fragment.trim());
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub login: String,
}

/// Nested connection whose `nodes` may be absent, null, or contain nulls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Nested<T> {
    #[serde(default)]
    pub nodes: Option<Vec<Option<T>>>,
}

impl<T> Default for Nested<T> {
    fn default() -> Self {
        Self { nodes: None }
    }
}

impl<T> Nested<T> {
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.nodes.iter().flatten().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdOnly {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelNode {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryNode {
    pub id: String,
    pub name: String,
    pub name_with_owner: String,
    pub url: String,
    pub owner: Actor,
    #[serde(default)]
    pub is_archived: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFieldValue {
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectItemNode {
    pub project: Option<ProjectRef>,
    pub field_value_by_name: Option<ProjectFieldValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentNode {
    pub id: String,
    pub author: Option<Actor>,
    #[serde(default)]
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewNode {
    pub id: String,
    pub author: Option<Actor>,
    pub state: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueNode {
    pub id: String,
    pub number: i32,
    pub title: String,
    /// Aliased upstream: `Issue.state` and `PullRequest.state` have different
    /// enum types and cannot share a response name in one selection.
    #[serde(rename = "issueState")]
    pub state: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub author: Option<Actor>,
    pub repository: RepositoryNode,
    #[serde(default)]
    pub labels: Option<Nested<LabelNode>>,
    #[serde(default)]
    pub tracked_issues: Option<Nested<IdOnly>>,
    #[serde(default)]
    pub project_items: Option<Nested<ProjectItemNode>>,
    #[serde(default)]
    pub comments: Option<Nested<CommentNode>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestNode {
    pub id: String,
    pub number: i32,
    pub title: String,
    #[serde(rename = "prState")]
    pub state: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub author: Option<Actor>,
    pub repository: RepositoryNode,
    #[serde(default)]
    pub labels: Option<Nested<LabelNode>>,
    #[serde(default)]
    pub closing_issues_references: Option<Nested<IdOnly>>,
    #[serde(default)]
    pub reviews: Option<Nested<ReviewNode>>,
    #[serde(default)]
    pub comments: Option<Nested<CommentNode>>,
}

fn nested_items<T>(nested: &Option<Nested<T>>) -> impl Iterator<Item = &T> {
    nested.iter().flat_map(|n| n.items())
}

impl IssueNode {
    pub fn author_login(&self) -> Option<&str> {
        self.author.as_ref().map(|a| a.login.as_str())
    }

    pub fn label_names(&self) -> Vec<String> {
        nested_items(&self.labels).map(|l| l.name.clone()).collect()
    }

    pub fn tracked_issue_ids(&self) -> Vec<String> {
        nested_items(&self.tracked_issues).map(|n| n.id.clone()).collect()
    }

    pub fn comments(&self) -> impl Iterator<Item = &CommentNode> {
        nested_items(&self.comments)
    }

    /// Project title -> board column, for every project the issue sits on.
    pub fn project_fields(&self) -> BTreeMap<String, String> {
        nested_items(&self.project_items)
            .filter_map(|item| {
                let title = item.project.as_ref()?.title.clone();
                let column = item.field_value_by_name.as_ref()?.name.clone()?;
                Some((title, column))
            })
            .collect()
    }

    /// First board column that maps onto a workflow status.
    pub fn board_status(&self) -> Option<IssueStatus> {
        nested_items(&self.project_items)
            .filter_map(|item| item.field_value_by_name.as_ref()?.name.as_deref())
            .find_map(IssueStatus::from_board_column)
    }
}

impl PullRequestNode {
    pub fn author_login(&self) -> Option<&str> {
        self.author.as_ref().map(|a| a.login.as_str())
    }

    pub fn label_names(&self) -> Vec<String> {
        nested_items(&self.labels).map(|l| l.name.clone()).collect()
    }

    pub fn closing_issue_ids(&self) -> Vec<String> {
        nested_items(&self.closing_issues_references)
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn reviews(&self) -> impl Iterator<Item = &ReviewNode> {
        nested_items(&self.reviews)
    }

    pub fn comments(&self) -> impl Iterator<Item = &CommentNode> {
        nested_items(&self.comments)
    }
}

/// Authoritative upstream representation of an issue or pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__typename")]
pub enum CanonicalNode {
    Issue(IssueNode),
    PullRequest(PullRequestNode),
}

impl CanonicalNode {
    pub fn id(&self) -> &str {
        match self {
            CanonicalNode::Issue(issue) => &issue.id,
            CanonicalNode::PullRequest(pr) => &pr.id,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            CanonicalNode::Issue(issue) => &issue.url,
            CanonicalNode::PullRequest(pr) => &pr.url,
        }
    }

    pub fn repository(&self) -> &RepositoryNode {
        match self {
            CanonicalNode::Issue(issue) => &issue.repository,
            CanonicalNode::PullRequest(pr) => &pr.repository,
        }
    }

    /// Decodes one `nodes`/`resource` slot. Nulls and entity types this mirror
    /// does not track resolve to `None`.
    pub fn from_slot(slot: &Value) -> Option<Self> {
        if slot.is_null() {
            return None;
        }
        match serde_json::from_value::<CanonicalNode>(slot.clone()) {
            Ok(node) => Some(node),
            Err(err) => {
                warn!(
                    typename = slot.get("__typename").and_then(|v| v.as_str()).unwrap_or("?"),
                    error = %err,
                    "ignoring undecodable canonical node"
                );
                None
            }
        }
    }
}

/// Organization-scoped view of the upstream API.
#[derive(Clone)]
pub struct GithubSource {
    client: RateLimitedClient,
    org: String,
}

impl GithubSource {
    pub fn new(client: RateLimitedClient, org: impl Into<String>) -> Self {
        Self {
            client,
            org: org.into(),
        }
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub async fn repositories(&self) -> Result<Vec<RepositoryNode>, FetchError> {
        let query = ConnectionQuery::new(
            document(REPOSITORIES_QUERY, &[REPOSITORY_FIELDS]),
            json!({ "org": self.org }),
            "/organization/repositories",
        );
        self.client.collect_all(&query).await
    }

    /// Issues updated at or after `since` (all issues when `None`).
    pub async fn issues(
        &self,
        repo: &RepositoryNode,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<IssueNode>, FetchError> {
        let query = ConnectionQuery::new(
            document(ISSUES_QUERY, &[ISSUE_FIELDS, REPOSITORY_FIELDS]),
            json!({
                "owner": repo.owner.login,
                "name": repo.name,
                "since": since.map(|s| s.to_rfc3339()),
            }),
            "/repository/issues",
        );
        self.client.collect_all(&query).await
    }

    /// Pull requests updated at or after `since`. The connection is ordered by
    /// `UPDATED_AT DESC`, so collection stops at the first older node.
    pub async fn pull_requests(
        &self,
        repo: &RepositoryNode,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<PullRequestNode>, FetchError> {
        let query = ConnectionQuery::new(
            document(PULL_REQUESTS_QUERY, &[PULL_REQUEST_FIELDS, REPOSITORY_FIELDS]),
            json!({ "owner": repo.owner.login, "name": repo.name }),
            "/repository/pullRequests",
        );
        self.client
            .collect_while(&query, |pr: &PullRequestNode| {
                since.is_none_or(|since| pr.updated_at >= since)
            })
            .await
    }

    /// One batched lookup. The result is aligned with `ids`; ids that no longer
    /// resolve yield `None`.
    pub async fn nodes_by_id(&self, ids: &[String]) -> Result<Vec<Option<CanonicalNode>>, FetchError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let request = GraphqlRequest::new(
            document(NODES_QUERY, &[ISSUE_FIELDS, PULL_REQUEST_FIELDS, REPOSITORY_FIELDS]),
            json!({ "ids": ids }),
        );
        let data = self.client.fetch(&request).await?;
        let slots = data
            .get("nodes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if slots.len() != ids.len() {
            debug!(requested = ids.len(), returned = slots.len(), "node lookup returned a short batch");
        }
        Ok((0..ids.len())
            .map(|i| slots.get(i).and_then(CanonicalNode::from_slot))
            .collect())
    }

    /// Re-resolves an entity by its URL. GitHub follows transfer redirects here,
    /// which is how a superseded node id is rediscovered.
    pub async fn resolve_url(&self, url: &str) -> Result<Option<CanonicalNode>, FetchError> {
        let request = GraphqlRequest::new(
            document(RESOURCE_QUERY, &[ISSUE_FIELDS, PULL_REQUEST_FIELDS, REPOSITORY_FIELDS]),
            json!({ "url": url }),
        );
        let data = self.client.fetch(&request).await?;
        Ok(data.get("resource").and_then(CanonicalNode::from_slot))
    }
}

/// True when the repository recorded in the URL differs from `name_with_owner`.
pub fn url_disagrees_with_repository(url: &str, name_with_owner: &str) -> bool {
    RepoSlug::from_entity_url(url).is_some_and(|slug| !slug.matches_name_with_owner(name_with_owner))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use ghmirror_storage::{GraphqlTransport, RateLimitHeaders, TransportResponse};

    use super::*;

    fn fixture(name: &str) -> Value {
        let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/github")
            .join(name);
        let text = std::fs::read_to_string(&path).expect("fixture readable");
        serde_json::from_str(&text).expect("fixture is json")
    }

    #[derive(Default)]
    struct CannedTransport {
        bodies: Mutex<VecDeque<Value>>,
        requests: Mutex<Vec<GraphqlRequest>>,
    }

    #[async_trait]
    impl GraphqlTransport for CannedTransport {
        async fn execute(&self, request: &GraphqlRequest) -> Result<TransportResponse, FetchError> {
            self.requests.lock().unwrap().push(request.clone());
            let body = self
                .bodies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| FetchError::Transport("no canned body".into()))?;
            Ok(TransportResponse {
                status: 200,
                rate_limit: RateLimitHeaders::default(),
                body,
            })
        }
    }

    fn source_with(bodies: Vec<Value>) -> (GithubSource, Arc<CannedTransport>) {
        let transport = Arc::new(CannedTransport {
            bodies: Mutex::new(bodies.into()),
            ..Default::default()
        });
        let source = GithubSource::new(RateLimitedClient::new(transport.clone()), "acme");
        (source, transport)
    }

    fn sample_repo() -> RepositoryNode {
        RepositoryNode {
            id: "R_widgets".into(),
            name: "widgets".into(),
            name_with_owner: "acme/widgets".into(),
            url: "https://github.com/acme/widgets".into(),
            owner: Actor { login: "acme".into() },
            is_archived: false,
            updated_at: None,
        }
    }

    #[test]
    fn documents_carry_the_fragments_they_spread() {
        let doc = document(NODES_QUERY, &[ISSUE_FIELDS, PULL_REQUEST_FIELDS, REPOSITORY_FIELDS]);
        for fragment in ["fragment IssueFields", "fragment PullRequestFields", "fragment RepositoryFields"] {
            assert!(doc.contains(fragment), "missing {fragment}");
        }
    }

    /// Top-level scalar selections of a fragment, with `alias: field` kept whole.
    fn top_level_selections(fragment: &str) -> Vec<String> {
        let body = &fragment[fragment.find('{').unwrap() + 1..];
        let mut depth = 0;
        let mut flat = String::new();
        for ch in body.chars() {
            match ch {
                '{' | '(' => depth += 1,
                '}' | ')' => depth -= 1,
                _ if depth == 0 => flat.push(ch),
                _ => {}
            }
        }
        flat.replace(": ", ":").split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn issue_and_pull_request_fragments_never_share_a_conflicting_state_field() {
        let issue = top_level_selections(ISSUE_FIELDS);
        let pull = top_level_selections(PULL_REQUEST_FIELDS);
        assert!(issue.contains(&"issueState:state".to_string()), "{issue:?}");
        assert!(pull.contains(&"prState:state".to_string()), "{pull:?}");
        assert!(!issue.contains(&"state".to_string()));
        assert!(!pull.contains(&"state".to_string()));

        // shared response names are only unaliased fields of matching type
        for name in issue.iter().filter(|n| pull.contains(n)) {
            assert!(!name.contains(':'), "aliased field {name} shared");
        }
    }

    #[test]
    fn aliased_states_decode_into_node_payloads() {
        let mut pr = fixture_pr("PR_9", "2024-01-01T00:00:00Z");
        pr["__typename"] = json!("PullRequest");
        pr["prState"] = json!("MERGED");
        let Some(CanonicalNode::PullRequest(decoded)) = CanonicalNode::from_slot(&pr) else {
            panic!("expected pull request");
        };
        assert_eq!(decoded.state, "MERGED");

        // an unaliased payload is not what the documents request
        let mut unaliased = fixture_pr("PR_9", "2024-01-01T00:00:00Z");
        unaliased["__typename"] = json!("PullRequest");
        unaliased.as_object_mut().unwrap().remove("prState");
        unaliased["state"] = json!("OPEN");
        assert!(CanonicalNode::from_slot(&unaliased).is_none());
    }

    #[test]
    fn nested_connections_decode_element_types_without_default() {
        let missing: Nested<ReviewNode> = serde_json::from_value(json!({})).unwrap();
        assert!(missing.nodes.is_none());
        let partial: Nested<ReviewNode> = serde_json::from_value(json!({
            "nodes": [null, {"id": "PRR_1", "author": null, "state": "APPROVED", "submittedAt": null}]
        }))
        .unwrap();
        assert_eq!(partial.items().map(|r| r.state.as_str()).collect::<Vec<_>>(), vec!["APPROVED"]);

        // a slot without __typename is dropped, not a panic in the warning path
        assert!(CanonicalNode::from_slot(&json!({"id": "X_1"})).is_none());
    }

    #[tokio::test]
    async fn issue_page_decodes_with_partial_nested_containers() {
        let (source, transport) = source_with(vec![fixture("issues_page.json")]);
        let issues = source.issues(&sample_repo(), None).await.expect("issues");
        assert_eq!(issues.len(), 2);

        let first = &issues[0];
        assert_eq!(first.label_names(), vec!["bug", "p1"]);
        assert_eq!(first.tracked_issue_ids(), vec!["I_tracked"]);
        assert_eq!(first.board_status(), Some(IssueStatus::InProgress));
        assert_eq!(first.project_fields().get("Roadmap").map(String::as_str), Some("In Progress"));
        assert_eq!(first.comments().count(), 1);

        let second = &issues[1];
        assert!(second.label_names().is_empty());
        assert!(second.tracked_issue_ids().is_empty());
        assert_eq!(second.board_status(), None);
        assert_eq!(second.author_login(), None);

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].variables["owner"], "acme");
        assert!(requests[0].variables["since"].is_null());
    }

    #[tokio::test]
    async fn node_lookup_stays_aligned_with_requested_ids() {
        let (source, _) = source_with(vec![fixture("nodes_batch.json")]);
        let ids = vec!["I_moved".to_string(), "I_gone".to_string(), "PR_1".to_string()];
        let nodes = source.nodes_by_id(&ids).await.expect("nodes");

        assert_eq!(nodes.len(), 3);
        assert!(matches!(&nodes[0], Some(CanonicalNode::Issue(i)) if i.repository.name_with_owner == "acme-labs/widgets"));
        assert!(nodes[1].is_none());
        let Some(CanonicalNode::PullRequest(pr)) = &nodes[2] else {
            panic!("expected pull request");
        };
        assert_eq!(pr.closing_issue_ids(), vec!["I_moved"]);
        assert_eq!(pr.reviews().count(), 1);
    }

    #[tokio::test]
    async fn resolve_url_returns_none_for_missing_resource() {
        let (source, _) = source_with(vec![json!({"data": {"resource": null}})]);
        let resolved = source
            .resolve_url("https://github.com/acme/widgets/issues/404")
            .await
            .expect("query ok");
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn pull_requests_stop_at_since_watermark() {
        let page = json!({"data": {"repository": {"pullRequests": {
            "nodes": [
                fixture_pr("PR_new", "2024-02-02T00:00:00Z"),
                fixture_pr("PR_old", "2023-12-31T00:00:00Z"),
            ],
            "pageInfo": {"hasNextPage": true, "endCursor": "c1"}
        }}}});
        let (source, transport) = source_with(vec![page]);
        let since = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);

        let prs = source.pull_requests(&sample_repo(), Some(since)).await.expect("prs");
        assert_eq!(prs.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), ["PR_new"]);
        assert_eq!(transport.requests.lock().unwrap().len(), 1);
    }

    fn fixture_pr(id: &str, updated_at: &str) -> Value {
        json!({
            "id": id, "number": 1, "title": "t", "prState": "OPEN",
            "url": "https://github.com/acme/widgets/pull/1",
            "createdAt": "2023-12-01T00:00:00Z", "updatedAt": updated_at,
            "closedAt": null, "mergedAt": null, "author": {"login": "dev"},
            "repository": {
                "id": "R_widgets", "name": "widgets", "nameWithOwner": "acme/widgets",
                "url": "https://github.com/acme/widgets", "isArchived": false,
                "updatedAt": null, "owner": {"login": "acme"}
            }
        })
    }

    #[test]
    fn url_repository_disagreement() {
        assert!(url_disagrees_with_repository(
            "https://github.com/acme-labs/widgets/issues/3",
            "acme/widgets"
        ));
        assert!(!url_disagrees_with_repository(
            "https://github.com/ACME/widgets/issues/3",
            "acme/widgets"
        ));
        assert!(!url_disagrees_with_repository("garbage", "acme/widgets"));
    }
}
