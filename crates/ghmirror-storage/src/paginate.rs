//! Cursor pagination over GraphQL connections (`{nodes, pageInfo}`).

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::fetch::{FetchError, GraphqlRequest, RateLimitedClient};

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub nodes: Vec<T>,
    /// Cursor for the following page; `None` when this page is the last one.
    pub next_cursor: Option<String>,
}

/// A cursor-parameterized query. `connection_pointer` is a JSON pointer into
/// the `data` member, e.g. `/organization/repositories`.
#[derive(Debug, Clone)]
pub struct ConnectionQuery {
    pub document: String,
    pub variables: Value,
    pub connection_pointer: String,
    pub cursor_variable: String,
}

impl ConnectionQuery {
    pub fn new(document: impl Into<String>, variables: Value, connection_pointer: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            variables,
            connection_pointer: connection_pointer.into(),
            cursor_variable: "after".to_string(),
        }
    }

    fn request_for(&self, cursor: Option<&str>) -> GraphqlRequest {
        let mut variables = match &self.variables {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        variables.insert(
            self.cursor_variable.clone(),
            cursor.map_or(Value::Null, |c| Value::String(c.to_string())),
        );
        GraphqlRequest::new(self.document.clone(), Value::Object(variables))
    }
}

/// Reads one connection out of a response payload.
///
/// Returns `Ok(None)` when the parent container is absent (the owning entity
/// vanished mid-scan). Missing or null `nodes` contribute nothing, null
/// entries inside `nodes` are skipped, and a missing `pageInfo` or a null
/// `endCursor` ends the scan.
pub fn read_connection<T: DeserializeOwned>(data: &Value, pointer: &str) -> Result<Option<Page<T>>, FetchError> {
    let connection = match data.pointer(pointer) {
        None | Some(Value::Null) => return Ok(None),
        Some(connection) => connection,
    };

    let nodes = match connection.get("nodes") {
        Some(Value::Array(items)) => items
            .iter()
            .filter(|item| !item.is_null())
            .map(|item| {
                serde_json::from_value::<T>(item.clone()).map_err(|err| FetchError::Decode {
                    path: format!("{pointer}/nodes"),
                    message: err.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => Vec::new(),
    };

    let page_info = connection.get("pageInfo");
    let has_next = page_info
        .and_then(|p| p.get("hasNextPage"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let next_cursor = page_info
        .and_then(|p| p.get("endCursor"))
        .and_then(Value::as_str)
        .filter(|_| has_next)
        .map(str::to_string);

    Ok(Some(Page { nodes, next_cursor }))
}

impl RateLimitedClient {
    /// Follows cursors until the upstream reports the last page.
    pub async fn collect_all<T: DeserializeOwned>(&self, query: &ConnectionQuery) -> Result<Vec<T>, FetchError> {
        self.collect_while(query, |_| true).await
    }

    /// Like [`collect_all`](Self::collect_all) but stops at the first node for
    /// which `keep` returns false. Used with `UPDATED_AT DESC` orderings to stop
    /// at the incremental-sync watermark.
    pub async fn collect_while<T, F>(&self, query: &ConnectionQuery, mut keep: F) -> Result<Vec<T>, FetchError>
    where
        T: DeserializeOwned,
        F: FnMut(&T) -> bool,
    {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let data = self.fetch(&query.request_for(cursor.as_deref())).await?;
            pages += 1;
            let Some(page) = read_connection::<T>(&data, &query.connection_pointer)? else {
                debug!(pointer = %query.connection_pointer, pages, "connection parent absent; ending scan");
                break;
            };

            for node in page.nodes {
                if !keep(&node) {
                    debug!(pointer = %query.connection_pointer, pages, collected = out.len(), "watermark reached");
                    return Ok(out);
                }
                out.push(node);
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(pointer = %query.connection_pointer, pages, collected = out.len(), "connection exhausted");
        Ok(out)
    }
}
