use std::collections::BTreeMap;

use serde_json::Value;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
/// One candidate surfaced by an ambiguous friendly-name lookup.
pub struct Candidate {
    pub id: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
/// Errors returned by every public operation of the library.
///
/// Each variant carries a human-readable message that states what happened
/// and how to correct it; variants produced from a Jira response preserve
/// the raw body under `upstream` for advanced callers.
pub enum Error {
    #[error("authentication failed: {message}")]
    Authentication {
        message: String,
        upstream: Option<Value>,
    },
    #[error("network error: {message}")]
    Network { message: String },
    #[error("invalid configuration: {message}")]
    Configuration { message: String },
    #[error("cache error: {message}")]
    Cache { message: String },
    #[error("rate limited by Jira: {message}")]
    RateLimit {
        message: String,
        upstream: Option<Value>,
    },
    #[error("not found: {message}")]
    NotFound {
        message: String,
        upstream: Option<Value>,
    },
    #[error("Jira server error (HTTP {status}): {message}")]
    JiraServer {
        status: u16,
        message: String,
        upstream: Option<Value>,
    },
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        field_errors: BTreeMap<String, String>,
        upstream: Option<Value>,
    },
    #[error("ambiguous value '{input}' for field '{field}': matched {} candidates", candidates.len())]
    Ambiguity {
        field: String,
        input: String,
        candidates: Vec<Candidate>,
    },
    #[error("failed to parse input: {message}")]
    InputParse { message: String },
    #[error("file not found: {path}")]
    FileNotFound { path: String },
}

impl Error {
    /// Stable machine-readable identifier for the variant.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Authentication { .. } => "AUTHENTICATION_ERROR",
            Error::Network { .. } => "NETWORK_ERROR",
            Error::Configuration { .. } => "CONFIGURATION_ERROR",
            Error::Cache { .. } => "CACHE_ERROR",
            Error::RateLimit { .. } => "RATE_LIMIT_ERROR",
            Error::NotFound { .. } => "NOT_FOUND_ERROR",
            Error::JiraServer { .. } => "JIRA_SERVER_ERROR",
            Error::Validation { .. } => "VALIDATION_ERROR",
            Error::Ambiguity { .. } => "AMBIGUITY_ERROR",
            Error::InputParse { .. } => "INPUT_PARSE_ERROR",
            Error::FileNotFound { .. } => "FILE_NOT_FOUND_ERROR",
        }
    }

    /// The raw Jira response that produced this error, when one exists.
    pub fn upstream(&self) -> Option<&Value> {
        match self {
            Error::Authentication { upstream, .. }
            | Error::RateLimit { upstream, .. }
            | Error::NotFound { upstream, .. }
            | Error::JiraServer { upstream, .. }
            | Error::Validation { upstream, .. } => upstream.as_ref(),
            _ => None,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Error::Network {
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Error::Cache {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            message: message.into(),
            upstream: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            field_errors: BTreeMap::new(),
            upstream: None,
        }
    }

    pub fn input_parse(message: impl Into<String>) -> Self {
        Error::InputParse {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_per_variant() {
        assert_eq!(Error::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(Error::not_found("x").code(), "NOT_FOUND_ERROR");
        assert_eq!(Error::network("x").code(), "NETWORK_ERROR");
        assert_eq!(
            Error::Ambiguity {
                field: "Priority".into(),
                input: "Medium".into(),
                candidates: vec![],
            }
            .code(),
            "AMBIGUITY_ERROR"
        );
    }

    #[test]
    fn upstream_is_preserved_for_server_errors() {
        let err = Error::JiraServer {
            status: 500,
            message: "boom".into(),
            upstream: Some(serde_json::json!({"errorMessages": ["boom"]})),
        };
        assert_eq!(
            err.upstream().and_then(|v| v["errorMessages"][0].as_str()),
            Some("boom")
        );
        assert!(Error::validation("x").upstream().is_none());
    }

    #[test]
    fn messages_name_the_failing_field() {
        let err = Error::Ambiguity {
            field: "Priority".into(),
            input: "Medium".into(),
            candidates: vec![
                Candidate {
                    id: "3".into(),
                    name: "Medium".into(),
                },
                Candidate {
                    id: "7".into(),
                    name: "medium".into(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("Priority"));
        assert!(text.contains("Medium"));
        assert!(text.contains("2 candidates"));
    }
}
