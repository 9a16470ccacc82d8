use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::http::HttpClient;

const DEFAULT_MAX_RESULTS: usize = 50;
const DEFAULT_FIELDS: [&str; 3] = ["key", "summary", "status"];

#[derive(Debug, Clone, Default)]
/// Either a raw JQL query or object criteria rendered into one.
pub struct SearchRequest {
    pub jql: Option<String>,
    pub criteria: Map<String, Value>,
    pub max_results: Option<usize>,
    pub order_by: Option<String>,
    /// ISO date; wraps the query as `(<jql>) AND created >= "<date>"`.
    pub created_since: Option<String>,
    /// Broadened field list; defaults to key, summary, status.
    pub fields: Option<Vec<String>>,
}

impl SearchRequest {
    pub fn raw(jql: impl Into<String>) -> Self {
        Self {
            jql: Some(jql.into()),
            ..Self::default()
        }
    }

    pub fn with_criteria(criteria: Map<String, Value>) -> Self {
        Self {
            criteria,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundIssue {
    pub key: String,
    pub summary: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub total: usize,
    pub issues: Vec<FoundIssue>,
}

/// Renders a search request to JQL.
///
/// Criteria values are double-quoted with internal quotes escaped; null
/// criteria are dropped; arrays become `field IN (...)`.
///
/// # Errors
/// Returns [`Error::Validation`] when there is neither JQL nor criteria.
pub fn build_jql(request: &SearchRequest) -> Result<String> {
    let base = match request.jql.as_deref().map(str::trim) {
        Some(jql) if !jql.is_empty() => jql.to_string(),
        _ => {
            let clauses: Vec<String> = request
                .criteria
                .iter()
                .filter_map(|(field, value)| clause(field, value))
                .collect();
            if clauses.is_empty() {
                return Err(Error::validation(
                    "search requires a 'jql' string or at least one criteria field",
                ));
            }
            clauses.join(" AND ")
        }
    };

    let mut jql = match &request.created_since {
        Some(date) => format!("({}) AND created >= \"{}\"", base, escape_value(date)),
        None => base,
    };
    if let Some(order_by) = request.order_by.as_deref().map(str::trim) {
        if !order_by.is_empty() {
            jql.push_str(" ORDER BY ");
            jql.push_str(order_by);
        }
    }
    Ok(jql)
}

fn clause(field: &str, value: &Value) -> Option<String> {
    let field = jql_field(field);
    match value {
        Value::Null => None,
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().filter_map(quoted).collect();
            if rendered.is_empty() {
                return None;
            }
            Some(format!("{} IN ({})", field, rendered.join(",")))
        }
        other => Some(format!("{} = {}", field, quoted(other)?)),
    }
}

fn quoted(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(format!("\"{}\"", escape_value(s))),
        Value::Number(n) => Some(format!("\"{}\"", n)),
        Value::Bool(b) => Some(format!("\"{}\"", b)),
        _ => None,
    }
}

fn escape_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Field names with spaces must themselves be quoted in JQL.
fn jql_field(field: &str) -> String {
    if field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        field.to_string()
    } else {
        format!("\"{}\"", escape_value(field))
    }
}

#[derive(Debug, Clone)]
pub struct SearchService {
    http: Arc<HttpClient>,
}

impl SearchService {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }

    /// Runs the search and decodes the minimal issue projection.
    ///
    /// # Errors
    /// Returns JQL-build failures and HTTP-mapped errors.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResult> {
        let jql = build_jql(request)?;
        let fields = request
            .fields
            .clone()
            .unwrap_or_else(|| DEFAULT_FIELDS.iter().map(ToString::to_string).collect())
            .join(",");
        let max_results = request.max_results.unwrap_or(DEFAULT_MAX_RESULTS);

        let response = self.http.get_with_query(
            "/search",
            &[
                ("jql", jql),
                ("maxResults", max_results.to_string()),
                ("fields", fields),
            ],
        )?;

        let total = response
            .get("total")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        let issues = response
            .get("issues")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let key = entry.get("key").and_then(Value::as_str)?;
                        let fields = entry.get("fields");
                        Some(FoundIssue {
                            key: key.to_string(),
                            summary: fields
                                .and_then(|f| f.get("summary"))
                                .and_then(Value::as_str)
                                .map(ToString::to_string),
                            status: fields
                                .and_then(|f| f.get("status"))
                                .and_then(|s| s.get("name"))
                                .and_then(Value::as_str)
                                .map(ToString::to_string),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(SearchResult { total, issues })
    }

    /// Total match count without hydrating any issues.
    ///
    /// # Errors
    /// Returns JQL-build failures and HTTP-mapped errors.
    pub fn count(&self, request: &SearchRequest) -> Result<usize> {
        let mut counting = request.clone();
        counting.max_results = Some(0);
        counting.fields = Some(vec!["key".to_string()]);
        Ok(self.search(&counting)?.total)
    }
}
