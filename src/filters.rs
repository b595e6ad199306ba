use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::metadata::{parse_number, MetadataValue};
use crate::service::{DocumentRecord, SearchRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_chroma(&self) -> &'static str {
        match self {
            FilterOperator::Equals => "$eq",
            FilterOperator::NotEquals => "$ne",
            FilterOperator::GreaterThan => "$gt",
            FilterOperator::GreaterOrEqual => "$gte",
            FilterOperator::LessThan => "$lt",
            FilterOperator::LessOrEqual => "$lte",
            FilterOperator::In => "$in",
            FilterOperator::NotIn => "$nin",
        }
    }

    fn is_list(&self) -> bool {
        matches!(self, FilterOperator::In | FilterOperator::NotIn)
    }
}

/// One row of the filter bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FilterRow {
    Semantic {
        query: String,
    },
    IdContains {
        value: String,
    },
    Metadata {
        key: String,
        operator: FilterOperator,
        value: String,
    },
}

/// The filter bar reduced to what the server understands plus the parts
/// applied locally after the response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentQuery {
    pub query_text: Option<String>,
    pub metadata_filter: Option<JsonValue>,
    /// Substring match on id, never sent to the server.
    pub id_contains: Option<String>,
}

impl DocumentQuery {
    pub fn to_search_request(&self, collection_name: &str, n_results: u32) -> SearchRequest {
        SearchRequest {
            collection_name: collection_name.to_string(),
            query_text: self.query_text.clone(),
            n_results,
            metadata_filter: self.metadata_filter.clone(),
        }
    }
}

fn number_to_json(value: MetadataValue) -> JsonValue {
    match value {
        MetadataValue::Int(i) => json!(i),
        MetadataValue::Float(x) => json!(x),
        MetadataValue::Bool(b) => json!(b),
        MetadataValue::Str(s) => json!(s),
    }
}

fn coerce_scalar(operator: FilterOperator, raw: &str) -> JsonValue {
    if let Some(number) = parse_number(raw) {
        return number_to_json(number);
    }
    if matches!(operator, FilterOperator::Equals | FilterOperator::NotEquals) {
        match raw.trim() {
            "true" => return json!(true),
            "false" => return json!(false),
            _ => {}
        }
    }
    json!(raw.trim())
}

/// Split on commas; the list becomes numeric only if every element is.
fn coerce_list(raw: &str) -> JsonValue {
    let items: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let numbers: Option<Vec<MetadataValue>> = items.iter().map(|s| parse_number(s)).collect();
    match numbers {
        Some(numbers) if !numbers.is_empty() => {
            JsonValue::Array(numbers.into_iter().map(number_to_json).collect())
        }
        _ => json!(items),
    }
}

pub fn metadata_clause(key: &str, operator: FilterOperator, value: &str) -> JsonValue {
    let operand = if operator.is_list() {
        coerce_list(value)
    } else {
        coerce_scalar(operator, value)
    };
    let mut comparison = serde_json::Map::new();
    comparison.insert(operator.as_chroma().to_string(), operand);
    let mut clause = serde_json::Map::new();
    clause.insert(key.to_string(), JsonValue::Object(comparison));
    JsonValue::Object(clause)
}

pub fn translate_filters(rows: &[FilterRow]) -> DocumentQuery {
    let mut query = DocumentQuery::default();
    let mut clauses = Vec::new();

    for row in rows {
        match row {
            FilterRow::Semantic { query: text } => {
                if query.query_text.is_none() && !text.trim().is_empty() {
                    query.query_text = Some(text.trim().to_string());
                }
            }
            FilterRow::IdContains { value } => {
                if query.id_contains.is_none() && !value.trim().is_empty() {
                    query.id_contains = Some(value.trim().to_string());
                }
            }
            FilterRow::Metadata {
                key,
                operator,
                value,
            } => {
                if key.trim().is_empty() || value.trim().is_empty() {
                    continue;
                }
                clauses.push(metadata_clause(key.trim(), *operator, value));
            }
        }
    }

    query.metadata_filter = match clauses.len() {
        0 => None,
        1 => clauses.pop(),
        _ => Some(json!({ "$and": clauses })),
    };
    query
}

/// Apply the filters the server does not know about.
pub fn apply_client_filters(
    mut records: Vec<DocumentRecord>,
    query: &DocumentQuery,
) -> Vec<DocumentRecord> {
    if let Some(needle) = &query.id_contains {
        records.retain(|r| r.id.contains(needle.as_str()));
    }
    records
}
