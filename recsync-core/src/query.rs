//! Read-query payload passed through to gateways.
//!
//! Filters and sort orders are opaque here: the engine never evaluates them,
//! it only carries them to the remote source and hashes them for cache keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Free-form request parameters. Ordered so hashing is stable.
pub type Params = BTreeMap<String, Value>;

/// One `{property, value}` filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub property: String,
    pub value: Value,
}

impl Filter {
    pub fn new(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            property: property.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One sort order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub property: String,
    pub direction: SortDirection,
}

impl Sort {
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Payload of a paginated read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    pub page: u32,
    pub limit: u32,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub sort: Vec<Sort>,
    #[serde(default)]
    pub params: Params,
}

impl QueryPayload {
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page,
            limit,
            filters: Vec::new(),
            sort: Vec::new(),
            params: Params::new(),
        }
    }
}

/// Merge `overrides` on top of `base`; keys in `overrides` win.
pub fn merge_params(base: &Params, overrides: &Params) -> Params {
    let mut merged = base.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_payload_wire_shape() {
        let mut query = QueryPayload::new(2, 25);
        query.filters.push(Filter::new("status", "open"));
        query.sort.push(Sort::desc("created"));

        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(value["page"], json!(2));
        assert_eq!(value["limit"], json!(25));
        assert_eq!(value["filters"][0], json!({"property": "status", "value": "open"}));
        assert_eq!(value["sort"][0], json!({"property": "created", "direction": "DESC"}));
    }

    #[test]
    fn test_merge_params_overrides_win() {
        let base: Params = [("tenant".to_string(), json!("a")), ("x".to_string(), json!(1))]
            .into_iter()
            .collect();
        let overrides: Params = [("x".to_string(), json!(2))].into_iter().collect();

        let merged = merge_params(&base, &overrides);
        assert_eq!(merged.get("tenant"), Some(&json!("a")));
        assert_eq!(merged.get("x"), Some(&json!(2)));
    }
}
