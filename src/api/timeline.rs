//! Cursor-paginated timeline driver.
//!
//! Wraps one queue client and threads the remote cursor page to page. One
//! iterator serves both consumption styles: every [`Page`] carries the
//! cursor that leads past it, so callers who persist cursors for
//! resumption read it and everyone else ignores it. The stream is finite
//! (it ends on a null cursor, an empty page, a reached limit, or a `None`
//! response) and cancelable at any await point (dropping the paginator
//! releases the held account via the borrow guard).

use anyhow::Result;
use serde_json::{json, Value};

use crate::api::{field_toggles, gql_params, merged_features, Operation};
use crate::client::transport::ApiResponse;
use crate::client::QueueClient;
use crate::json::{find_obj, get_by_path};

/// Which cursor object advances this stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorType {
    #[default]
    Bottom,
    /// Reply threads grow through "show more" cursors instead.
    ShowMoreThreads,
}

impl CursorType {
    pub fn as_str(self) -> &'static str {
        match self {
            CursorType::Bottom => "Bottom",
            CursorType::ShowMoreThreads => "ShowMoreThreads",
        }
    }
}

/// Pagination knobs. `limit` bounds total entries across pages (-1 =
/// unbounded); `cursor` resumes a previously interrupted stream.
#[derive(Debug, Clone, Default)]
pub struct TimelineOpts {
    pub limit: i64,
    pub cursor_type: CursorType,
    pub cursor: Option<String>,
}

impl TimelineOpts {
    pub fn new() -> Self {
        Self {
            limit: -1,
            cursor_type: CursorType::Bottom,
            cursor: None,
        }
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn cursor_type(mut self, ct: CursorType) -> Self {
        self.cursor_type = ct;
        self
    }

    pub fn resume_from(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

/// One yielded page: the raw response, its real entries (navigation and
/// promotional filler already removed), and the cursor to the next page.
#[derive(Debug)]
pub struct Page {
    pub response: ApiResponse,
    pub entries: Vec<Value>,
    pub cursor: Option<String>,
}

pub struct TimelinePaginator {
    client: QueueClient,
    op: Operation,
    variables: Value,
    features: Value,
    cursor: Option<String>,
    cursor_type: CursorType,
    limit: i64,
    yielded: i64,
    done: bool,
}

impl TimelinePaginator {
    pub(crate) fn new(
        client: QueueClient,
        op: Operation,
        variables: Value,
        opts: TimelineOpts,
    ) -> Self {
        Self {
            client,
            op,
            variables,
            features: merged_features(None),
            cursor: opts.cursor,
            cursor_type: opts.cursor_type,
            limit: opts.limit,
            yielded: 0,
            done: false,
        }
    }

    /// Fetch the next page, or `None` when the stream has ended. The held
    /// account is released (with its request count) when the stream ends.
    pub async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.done {
            return Ok(None);
        }

        let mut variables = self.variables.clone();
        if let Some(cur) = &self.cursor {
            variables["cursor"] = json!(cur);
        }
        let params = gql_params(
            &variables,
            &self.features,
            field_toggles(self.op.queue()).as_ref(),
        )?;

        let Some(response) = self.client.get(&self.op.url(), params).await? else {
            self.finish().await?;
            return Ok(None);
        };

        let entries = extract_entries(&response.body);
        // A stale resumption cursor yields an empty first page; that is
        // indistinguishable from a normal end of stream.
        if entries.is_empty() {
            self.finish().await?;
            return Ok(None);
        }

        let cursor = extract_cursor(&response.body, self.cursor_type.as_str());
        self.yielded += entries.len() as i64;
        let at_limit = self.limit > 0 && self.yielded >= self.limit;
        self.cursor = cursor.clone();
        if cursor.is_none() || at_limit {
            self.finish().await?;
        }

        Ok(Some(Page {
            response,
            entries,
            cursor,
        }))
    }

    /// Collect every remaining page (respects the configured limit).
    pub async fn collect_pages(&mut self) -> Result<Vec<Page>> {
        let mut pages = Vec::new();
        while let Some(page) = self.next_page().await? {
            pages.push(page);
        }
        Ok(pages)
    }

    /// Cursor the next fetch would use; persist it to resume later.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    async fn finish(&mut self) -> Result<()> {
        self.done = true;
        self.client.close().await
    }
}

/// Real timeline entries: drop navigation (`cursor-*`) and promotional
/// filler (`messageprompt-*`) by entry-id prefix.
pub fn extract_entries(body: &Value) -> Vec<Value> {
    let Some(entries) = get_by_path(body, "entries").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter(|e| {
            let id = e.get("entryId").and_then(Value::as_str).unwrap_or("");
            !(id.starts_with("cursor-") || id.starts_with("messageprompt-"))
        })
        .cloned()
        .collect()
}

/// Walk the body for the cursor object with the given `cursorType`.
pub fn extract_cursor(body: &Value, cursor_type: &str) -> Option<String> {
    find_obj(body, &|m| {
        m.get("cursorType").and_then(Value::as_str) == Some(cursor_type)
    })
    .and_then(|obj| obj.get("value"))
    .and_then(Value::as_str)
    .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeline_body(ids: &[&str], cursor: Option<&str>) -> Value {
        let mut entries: Vec<Value> = ids
            .iter()
            .map(|id| json!({"entryId": id, "content": {"k": "v"}}))
            .collect();
        if let Some(value) = cursor {
            entries.push(json!({
                "entryId": format!("cursor-bottom-{value}"),
                "content": {"cursorType": "Bottom", "value": value}
            }));
        }
        json!({
            "data": {"search_by_raw_query": {"search_timeline": {"timeline": {
                "instructions": [{"type": "TimelineAddEntries", "entries": entries}]
            }}}}
        })
    }

    #[test]
    fn entries_filter_navigation_and_prompts() {
        let body = timeline_body(&["tweet-1", "messageprompt-2", "tweet-3"], Some("NEXT"));
        let entries = extract_entries(&body);
        let ids: Vec<&str> = entries
            .iter()
            .map(|e| e["entryId"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["tweet-1", "tweet-3"]);
    }

    #[test]
    fn cursor_extraction_matches_type() {
        let body = timeline_body(&["tweet-1"], Some("NEXT"));
        assert_eq!(extract_cursor(&body, "Bottom").as_deref(), Some("NEXT"));
        assert!(extract_cursor(&body, "ShowMoreThreads").is_none());
    }

    #[test]
    fn missing_entries_key_is_empty() {
        assert!(extract_entries(&json!({"data": {}})).is_empty());
    }

    #[test]
    fn opts_builder_sets_fields() {
        let opts = TimelineOpts::new()
            .limit(40)
            .cursor_type(CursorType::ShowMoreThreads)
            .resume_from("CUR");
        assert_eq!(opts.limit, 40);
        assert_eq!(opts.cursor_type, CursorType::ShowMoreThreads);
        assert_eq!(opts.cursor.as_deref(), Some("CUR"));
    }
}
