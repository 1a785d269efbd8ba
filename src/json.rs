//! Recursive JSON walkers for timeline payloads.
//!
//! Timeline responses bury the interesting parts at varying depths
//! (`data.*.timeline.instructions[*].entries`, cursor objects anywhere in
//! the tree), so lookups are depth-first searches rather than fixed paths.

use serde_json::Value;

/// Depth-first search for the first value stored under `key` anywhere in
/// `obj`. Objects are searched before their children; arrays are walked in
/// order.
pub fn get_by_path<'a>(obj: &'a Value, key: &str) -> Option<&'a Value> {
    match obj {
        Value::Object(map) => {
            if let Some(v) = map.get(key) {
                return Some(v);
            }
            map.values().find_map(|v| get_by_path(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| get_by_path(v, key)),
        _ => None,
    }
}

/// Depth-first search for the first JSON object satisfying `pred`.
pub fn find_obj<'a, F>(obj: &'a Value, pred: &F) -> Option<&'a Value>
where
    F: Fn(&serde_json::Map<String, Value>) -> bool,
{
    match obj {
        Value::Object(map) => {
            if pred(map) {
                return Some(obj);
            }
            map.values().find_map(|v| find_obj(v, pred))
        }
        Value::Array(items) => items.iter().find_map(|v| find_obj(v, pred)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_by_path_finds_nested_key() {
        let obj = json!({
            "data": {
                "search": {
                    "timeline": {
                        "instructions": [
                            {"type": "TimelineClearCache"},
                            {"type": "TimelineAddEntries", "entries": [{"entryId": "tweet-1"}]}
                        ]
                    }
                }
            }
        });
        let entries = get_by_path(&obj, "entries").unwrap();
        assert_eq!(entries.as_array().unwrap().len(), 1);
    }

    #[test]
    fn get_by_path_missing_key_is_none() {
        let obj = json!({"a": {"b": 1}});
        assert!(get_by_path(&obj, "entries").is_none());
    }

    #[test]
    fn find_obj_locates_cursor_by_type() {
        let obj = json!({
            "entries": [
                {"entryId": "tweet-1", "content": {}},
                {"entryId": "cursor-top-2", "content": {"cursorType": "Top", "value": "UP"}},
                {"entryId": "cursor-bottom-3", "content": {"cursorType": "Bottom", "value": "DOWN"}}
            ]
        });
        let cur = find_obj(&obj, &|m| {
            m.get("cursorType").and_then(Value::as_str) == Some("Bottom")
        })
        .unwrap();
        assert_eq!(cur["value"], "DOWN");
    }
}
