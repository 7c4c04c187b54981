//! Read-side queries over projection data.
//!
//! Queries are pure: they filter, sort and paginate a copy of the
//! projection's data and never touch the projection itself.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// One sort key: a dotted field path and a direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

/// Filter, sort and pagination options for
/// [`Engine::query_projection`](crate::Engine::query_projection).
///
/// Only applies when the projection's data is a JSON array; any other
/// value is returned as is.
///
/// # Examples
///
/// ```
/// use eventfold_cqrs::{ProjectionQuery, SortOrder};
/// use serde_json::json;
///
/// let query = ProjectionQuery::new()
///     .filter("status", json!("active"))
///     .sort_by("profile.name", SortOrder::Asc)
///     .limit(10)
///     .offset(20);
/// assert_eq!(query.sort.len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectionQuery {
    /// Equality conditions on dotted field paths. All must hold.
    #[serde(default)]
    pub filter: Vec<(String, Value)>,
    /// Sort keys, most significant first.
    #[serde(default)]
    pub sort: Vec<SortKey>,
    /// Maximum number of items returned.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Number of matching items skipped before the page starts.
    #[serde(default)]
    pub offset: usize,
}

impl ProjectionQuery {
    /// An empty query: everything, in stored order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field` to equal `value`.
    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filter.push((field.into(), value));
        self
    }

    /// Add a sort key after the existing ones.
    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            order,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Run the query against projection data.
    ///
    /// Returns the selected data and the number of matches before
    /// pagination.
    pub(crate) fn apply(&self, data: &Value) -> (Value, usize) {
        let Value::Array(items) = data else {
            let count = usize::from(!data.is_null());
            return (data.clone(), count);
        };

        let mut matches: Vec<&Value> = items
            .iter()
            .filter(|item| {
                self.filter
                    .iter()
                    .all(|(field, expected)| lookup(item, field) == Some(expected))
            })
            .collect();
        let total_count = matches.len();

        if !self.sort.is_empty() {
            matches.sort_by(|a, b| {
                self.sort
                    .iter()
                    .map(|key| {
                        let ord = compare(
                            lookup(a, &key.field).unwrap_or(&Value::Null),
                            lookup(b, &key.field).unwrap_or(&Value::Null),
                        );
                        match key.order {
                            SortOrder::Asc => ord,
                            SortOrder::Desc => ord.reverse(),
                        }
                    })
                    .find(|ord| ord.is_ne())
                    .unwrap_or(Ordering::Equal)
            });
        }

        let page = matches
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        (Value::Array(page), total_count)
    }
}

/// Result of a projection query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Selected data.
    pub data: Value,
    /// Highest event incorporated, as a 1-based global log position.
    pub version: u64,
    /// Timestamp of the last folded event (Unix epoch milliseconds).
    pub last_updated: u64,
    /// Matches before `limit`/`offset` were applied.
    pub total_count: usize,
}

/// Resolve a dotted path (`"profile.name"`, `"tags.0"`) inside a value.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < others.
fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn people() -> Value {
        json!([
            { "name": "carol", "age": 41, "team": "red", "profile": { "city": "Oslo" } },
            { "name": "alice", "age": 30, "team": "blue", "profile": { "city": "Lima" } },
            { "name": "bob", "age": 30, "team": "red" },
            { "name": "dave", "age": 25, "team": "red", "profile": { "city": "Kyiv" } },
        ])
    }

    fn names(data: &Value) -> Vec<&str> {
        data.as_array()
            .expect("array result")
            .iter()
            .filter_map(|p| p["name"].as_str())
            .collect()
    }

    #[test]
    fn empty_query_returns_everything_in_order() {
        let (data, total) = ProjectionQuery::new().apply(&people());
        assert_eq!(names(&data), vec!["carol", "alice", "bob", "dave"]);
        assert_eq!(total, 4);
    }

    #[test]
    fn filter_matches_all_conditions() {
        let query = ProjectionQuery::new()
            .filter("team", json!("red"))
            .filter("age", json!(30));
        let (data, total) = query.apply(&people());
        assert_eq!(names(&data), vec!["bob"]);
        assert_eq!(total, 1);
    }

    #[test]
    fn filter_follows_dotted_paths() {
        let query = ProjectionQuery::new().filter("profile.city", json!("Lima"));
        let (data, _) = query.apply(&people());
        assert_eq!(names(&data), vec!["alice"]);
    }

    #[test]
    fn multi_key_sort_breaks_ties_in_order() {
        let query = ProjectionQuery::new()
            .sort_by("age", SortOrder::Desc)
            .sort_by("name", SortOrder::Asc);
        let (data, _) = query.apply(&people());
        assert_eq!(names(&data), vec!["carol", "alice", "bob", "dave"]);
    }

    #[test]
    fn missing_sort_field_sorts_first() {
        let query = ProjectionQuery::new().sort_by("profile.city", SortOrder::Asc);
        let (data, _) = query.apply(&people());
        assert_eq!(names(&data), vec!["bob", "dave", "alice", "carol"]);
    }

    #[test]
    fn total_count_ignores_pagination() {
        let query = ProjectionQuery::new()
            .filter("team", json!("red"))
            .sort_by("name", SortOrder::Asc)
            .offset(1)
            .limit(1);
        let (data, total) = query.apply(&people());
        assert_eq!(names(&data), vec!["carol"]);
        assert_eq!(total, 3);
    }

    #[test]
    fn offset_past_end_is_empty() {
        let (data, total) = ProjectionQuery::new().offset(10).apply(&people());
        assert_eq!(data, json!([]));
        assert_eq!(total, 4);
    }

    #[test]
    fn non_sequence_data_is_returned_unchanged() {
        let data = json!({ "count": 3 });
        let query = ProjectionQuery::new()
            .filter("count", json!(1))
            .limit(0);
        assert_eq!(query.apply(&data), (data.clone(), 1));
        assert_eq!(query.apply(&Value::Null), (Value::Null, 0));
    }

    #[test]
    fn query_deserializes_from_json() {
        let query: ProjectionQuery = serde_json::from_value(json!({
            "filter": [["team", "red"]],
            "sort": [{ "field": "age", "order": "desc" }],
            "limit": 2
        }))
        .expect("deserialize should succeed");
        assert_eq!(query.sort[0].order, SortOrder::Desc);
        assert_eq!(query.offset, 0);
        let (data, _) = query.apply(&people());
        assert_eq!(names(&data), vec!["carol", "bob"]);
    }
}
