//! Parameterized queries and live-subscription selectors
//!
//! A [`QuerySpec`] names an entity kind plus equality filters, an optional
//! ordering and an optional limit. Its [`signature`](QuerySpec::signature) is
//! deterministic (filters are kept sorted) and keys both the query result
//! cache and the subscription registry.

use super::entity::EntityKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Ordering clause of a query
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// A parameterized query over one entity kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub kind: EntityKind,
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// What a live subscription tracks: the same shape as a query
pub type Selector = QuerySpec;

impl QuerySpec {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            filters: BTreeMap::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Add an equality filter (`field == value`, or membership if the field is an array)
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Deterministic identity of this query
    ///
    /// e.g. `meeting:"teamId"="T1":orderBy=-"createdAt":limit=20`
    ///
    /// Field names and values are JSON-encoded, so `"1"` and `1` differ and
    /// a `:` or `=` inside a value cannot forge another filter.
    pub fn signature(&self) -> String {
        let mut sig = self.kind.as_str().to_string();
        for (field, value) in &self.filters {
            sig.push(':');
            sig.push_str(&quoted(field));
            sig.push('=');
            sig.push_str(&value.to_string());
        }
        if let Some(order) = &self.order_by {
            sig.push_str(":orderBy=");
            if order.descending {
                sig.push('-');
            }
            sig.push_str(&quoted(&order.field));
        }
        if let Some(limit) = self.limit {
            sig.push_str(&format!(":limit={}", limit));
        }
        sig
    }

    /// Whether a document of this query's kind satisfies every filter
    pub fn matches(&self, document: &Value) -> bool {
        self.filters.iter().all(|(field, expected)| {
            match document.get(field) {
                Some(Value::Array(items)) => items.iter().any(|item| item == expected),
                Some(actual) => actual == expected,
                None => false,
            }
        })
    }

    /// Whether a write that produced or removed `document` can change this
    /// query's result. Ordering and limit are ignored: any filter match counts.
    pub fn could_contain(&self, kind: EntityKind, document: &Value) -> bool {
        self.kind == kind && self.matches(document)
    }

    /// Whether some document could satisfy both queries
    ///
    /// Conservative: only a filter present on both sides with different
    /// values rules overlap out.
    pub fn overlaps(&self, other: &QuerySpec) -> bool {
        self.kind == other.kind
            && self.filters.iter().all(|(field, value)| {
                other.filters.get(field).map_or(true, |theirs| theirs == value)
            })
    }

    /// Compare two documents by this query's ordering (equal when unordered)
    ///
    /// Missing or null fields sort last regardless of direction.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let Some(order) = &self.order_by else {
            return Ordering::Equal;
        };
        let left = a.get(&order.field).filter(|v| !v.is_null());
        let right = b.get(&order.field).filter(|v| !v.is_null());

        match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = compare_values(x, y);
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        }
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

fn quoted(field: &str) -> String {
    Value::String(field.to_string()).to_string()
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (x, y) => x.to_string().cmp(&y.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signature_is_deterministic() {
        let a = QuerySpec::new(EntityKind::Meeting)
            .filter("teamId", "T1")
            .filter("ownerId", "U1")
            .order_by("createdAt");
        let b = QuerySpec::new(EntityKind::Meeting)
            .filter("ownerId", "U1")
            .filter("teamId", "T1")
            .order_by("createdAt");

        assert_eq!(a.signature(), b.signature());
        assert_eq!(
            a.signature(),
            r#"meeting:"ownerId"="U1":"teamId"="T1":orderBy="createdAt""#
        );
    }

    #[test]
    fn test_signature_keeps_value_types_apart() {
        let text = QuerySpec::new(EntityKind::Meeting).filter("durationMinutes", "30");
        let number = QuerySpec::new(EntityKind::Meeting).filter("durationMinutes", 30);
        let flag = QuerySpec::new(EntityKind::Notification).filter("read", "false");
        let boolean = QuerySpec::new(EntityKind::Notification).filter("read", false);

        assert_ne!(text.signature(), number.signature());
        assert_ne!(flag.signature(), boolean.signature());
    }

    #[test]
    fn test_signature_separators_inside_values_cannot_collide() {
        let single = QuerySpec::new(EntityKind::Meeting).filter("a", "x:b=y");
        let pair = QuerySpec::new(EntityKind::Meeting).filter("a", "x").filter("b", "y");
        assert_ne!(single.signature(), pair.signature());

        let odd_field = QuerySpec::new(EntityKind::Meeting).filter("orderBy", "createdAt");
        let ordered = QuerySpec::new(EntityKind::Meeting).order_by("createdAt");
        assert_ne!(odd_field.signature(), ordered.signature());

        let quote = QuerySpec::new(EntityKind::Meeting).filter("a", "x\":\"b");
        assert_ne!(quote.signature(), pair.signature());
    }

    #[test]
    fn test_signature_distinguishes_order_and_limit() {
        let base = QuerySpec::new(EntityKind::Notification).filter("userId", "U1");
        let desc = base.clone().order_by_desc("createdAt").limit(20);

        assert_eq!(base.signature(), r#"notification:"userId"="U1""#);
        assert_eq!(
            desc.signature(),
            r#"notification:"userId"="U1":orderBy=-"createdAt":limit=20"#
        );
        assert_ne!(base.signature(), desc.signature());
    }

    #[test]
    fn test_matches_equality_and_membership() {
        let by_team = QuerySpec::new(EntityKind::Meeting).filter("teamId", "T1");
        assert!(by_team.matches(&json!({"teamId": "T1", "title": "x"})));
        assert!(!by_team.matches(&json!({"teamId": "T2"})));
        assert!(!by_team.matches(&json!({"title": "no team"})));

        let rosters = QuerySpec::new(EntityKind::Team).filter("memberIds", "U2");
        assert!(rosters.matches(&json!({"memberIds": ["U1", "U2"]})));
        assert!(!rosters.matches(&json!({"memberIds": ["U3"]})));

        let unread = QuerySpec::new(EntityKind::Notification).filter("read", false);
        assert!(unread.matches(&json!({"read": false})));
        assert!(!unread.matches(&json!({"read": true})));
    }

    #[test]
    fn test_could_contain_ignores_limit_and_checks_kind() {
        let latest = QuerySpec::new(EntityKind::Meeting)
            .filter("teamId", "T1")
            .order_by_desc("createdAt")
            .limit(1);
        let doc = json!({"teamId": "T1", "createdAt": "2020-01-01"});

        assert!(latest.could_contain(EntityKind::Meeting, &doc));
        assert!(!latest.could_contain(EntityKind::Team, &doc));
        assert!(!latest.could_contain(EntityKind::Meeting, &json!({"teamId": "T2"})));
    }

    #[test]
    fn test_overlaps() {
        let team1 = QuerySpec::new(EntityKind::Meeting).filter("teamId", "T1");
        let team2 = QuerySpec::new(EntityKind::Meeting).filter("teamId", "T2");
        let owner = QuerySpec::new(EntityKind::Meeting).filter("ownerId", "U1");
        let all = QuerySpec::new(EntityKind::Meeting);

        assert!(team1.overlaps(&team1.clone().order_by("createdAt")));
        assert!(!team1.overlaps(&team2));
        assert!(team1.overlaps(&owner));
        assert!(all.overlaps(&team2));
        assert!(!all.overlaps(&QuerySpec::new(EntityKind::Team)));
    }

    #[test]
    fn test_compare_orders_and_puts_missing_last() {
        let spec = QuerySpec::new(EntityKind::Meeting).order_by("createdAt");
        let early = json!({"createdAt": "2026-01-01T00:00:00Z"});
        let late = json!({"createdAt": "2026-02-01T00:00:00Z"});
        let missing = json!({});

        assert_eq!(spec.compare(&early, &late), Ordering::Less);
        assert_eq!(spec.compare(&late, &missing), Ordering::Less);

        let desc = QuerySpec::new(EntityKind::Meeting).order_by_desc("createdAt");
        assert_eq!(desc.compare(&early, &late), Ordering::Greater);
        assert_eq!(desc.compare(&missing, &early), Ordering::Greater);

        let numeric = QuerySpec::new(EntityKind::Meeting).order_by("durationMinutes");
        assert_eq!(
            numeric.compare(&json!({"durationMinutes": 9}), &json!({"durationMinutes": 30})),
            Ordering::Less
        );
    }
}
