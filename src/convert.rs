use std::sync::OnceLock;

use chrono::{Duration as ChronoDuration, NaiveDate};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use unicode_normalization::UnicodeNormalization;

use crate::cache::Cache;
use crate::config::{Config, UserAmbiguityPolicy};
use crate::error::{Candidate, Error, Result};
use crate::http::HttpClient;
use crate::logging;
use crate::schema::{AllowedValue, FieldSchema, FieldType, SchemaInfo};

/// Resolved lookup lists (priorities, components, users, ...) are cached for
/// the same window as schemas.
const LOOKUP_TTL_SECS: u64 = 900;
/// How many available options a not-found error lists before truncating.
const MAX_LISTED_OPTIONS: usize = 10;

/// Everything a converter needs to resolve values for one
/// (project, issue type) pair. Callers own the context; converters borrow it
/// read-only, with the caches as the only interior-mutable collaborator.
pub struct ConversionContext<'a> {
    pub project_key: &'a str,
    pub issue_type: &'a str,
    pub cache: &'a Cache,
    pub http: &'a HttpClient,
    pub config: &'a Config,
}

/// Strips zero-width characters, maps non-breaking spaces to plain spaces,
/// and trims surrounding whitespace.
pub(crate) fn sanitize_text(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{feff}'))
        .map(|c| if c == '\u{a0}' { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// NFKC-normalized lowercase form used for every human-name comparison.
pub(crate) fn normalize_lookup(input: &str) -> String {
    sanitize_text(input)
        .nfkc()
        .collect::<String>()
        .to_lowercase()
}

/// Converts one human value into the wire shape Jira expects for `field`.
///
/// Wire-shaped values pass through unchanged. `Null` passes through for
/// optional fields (callers drop it) and fails for required ones.
///
/// # Errors
/// Returns [`Error::Validation`] for unmatchable or mistyped values and
/// [`Error::Ambiguity`] when a name matches several candidates equally well.
pub fn convert_value(value: &Value, field: &FieldSchema, ctx: &ConversionContext<'_>) -> Result<Value> {
    if value.is_null() {
        if field.required {
            return Err(Error::validation(format!(
                "Field '{}' is required and cannot be empty",
                field.name
            )));
        }
        return Ok(Value::Null);
    }

    match field.field_type {
        FieldType::String | FieldType::Text => convert_string(value, field),
        FieldType::Number => convert_number(value, field),
        FieldType::Date => convert_date(value, field),
        FieldType::DateTime => convert_datetime(value, field),
        FieldType::Priority => convert_lookup(value, field, ctx, LookupTag::Priority),
        FieldType::Option => convert_lookup(value, field, ctx, LookupTag::Option),
        FieldType::Component => convert_lookup(value, field, ctx, LookupTag::Component),
        FieldType::Version => convert_lookup(value, field, ctx, LookupTag::Version),
        FieldType::OptionWithChild => convert_cascading(value, field),
        FieldType::User => convert_user(value, field, ctx),
        FieldType::Project => convert_project(value, field, ctx),
        FieldType::IssueType => convert_issue_type(value, field, ctx),
        FieldType::Timetracking => convert_timetracking(value, field),
        FieldType::Array => convert_array(value, field, ctx),
        FieldType::Unknown => Ok(value.clone()),
    }
}

fn convert_string(value: &Value, field: &FieldSchema) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(sanitize_text(s))),
        other => Err(Error::validation(format!(
            "Field '{}' expects text, got {}",
            field.name,
            type_name(other)
        ))),
    }
}

fn convert_number(value: &Value, field: &FieldSchema) -> Result<Value> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(s) => {
            let trimmed = sanitize_text(s);
            if let Ok(int) = trimmed.parse::<i64>() {
                return Ok(json!(int));
            }
            trimmed
                .parse::<f64>()
                .map(|f| json!(f))
                .map_err(|_| invalid_number(field, s))
        }
        other => Err(invalid_number(field, &type_name(other))),
    }
}

fn invalid_number(field: &FieldSchema, got: &str) -> Error {
    Error::validation(format!(
        "Field '{}' expects a number, got '{}'",
        field.name, got
    ))
}

fn convert_date(value: &Value, field: &FieldSchema) -> Result<Value> {
    match value {
        Value::String(s) => {
            let trimmed = sanitize_text(s);
            // Already a plain ISO date.
            if NaiveDate::parse_from_str(&trimmed, "%Y-%m-%d").is_ok() {
                return Ok(json!(trimmed));
            }
            // ISO datetimes lose their time component.
            if let Some(date_part) = trimmed.split('T').next() {
                if trimmed.contains('T')
                    && NaiveDate::parse_from_str(date_part, "%Y-%m-%d").is_ok()
                {
                    return Ok(json!(date_part));
                }
            }
            if let Ok(serial) = trimmed.parse::<f64>() {
                return excel_serial_to_date(serial, field).map(|d| json!(d));
            }
            Err(invalid_date(field, &trimmed))
        }
        Value::Number(n) => {
            let serial = n
                .as_f64()
                .ok_or_else(|| invalid_date(field, &n.to_string()))?;
            excel_serial_to_date(serial, field).map(|d| json!(d))
        }
        other => Err(invalid_date(field, &type_name(other))),
    }
}

fn convert_datetime(value: &Value, field: &FieldSchema) -> Result<Value> {
    match value {
        Value::String(s) => {
            let trimmed = sanitize_text(s);
            // ISO datetimes pass through untouched.
            if iso_datetime_pattern().is_match(&trimmed) {
                return Ok(json!(trimmed));
            }
            if let Ok(date) = NaiveDate::parse_from_str(&trimmed, "%Y-%m-%d") {
                return Ok(json!(format!("{}T00:00:00.000+0000", date.format("%Y-%m-%d"))));
            }
            if let Ok(serial) = trimmed.parse::<f64>() {
                return excel_serial_to_datetime(serial, field).map(|d| json!(d));
            }
            Err(invalid_date(field, &trimmed))
        }
        Value::Number(n) => {
            let serial = n
                .as_f64()
                .ok_or_else(|| invalid_date(field, &n.to_string()))?;
            excel_serial_to_datetime(serial, field).map(|d| json!(d))
        }
        other => Err(invalid_date(field, &type_name(other))),
    }
}

fn invalid_date(field: &FieldSchema, got: &str) -> Error {
    Error::validation(format!(
        "Field '{}' expects an ISO date, YYYY-MM-DD, or Excel serial number, got '{}'",
        field.name, got
    ))
}

fn iso_datetime_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}(:\d{2}(\.\d+)?)?([Zz]|[+-]\d{2}:?\d{2})?$")
            .expect("static pattern")
    })
}

/// Excel anchors day zero at 1899-12-30.
fn excel_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).expect("static date")
}

fn excel_serial_to_date(serial: f64, field: &FieldSchema) -> Result<String> {
    if !(1.0..=2_958_465.0).contains(&serial) {
        return Err(invalid_date(field, &serial.to_string()));
    }
    let date = excel_epoch() + ChronoDuration::days(serial as i64);
    Ok(date.format("%Y-%m-%d").to_string())
}

fn excel_serial_to_datetime(serial: f64, field: &FieldSchema) -> Result<String> {
    if !(1.0..=2_958_465.0).contains(&serial) {
        return Err(invalid_date(field, &serial.to_string()));
    }
    let days = serial.trunc() as i64;
    let seconds = (serial.fract() * 86_400.0).round() as i64;
    let datetime = excel_epoch()
        .and_hms_opt(0, 0, 0)
        .expect("static time")
        + ChronoDuration::days(days)
        + ChronoDuration::seconds(seconds);
    Ok(datetime.format("%Y-%m-%dT%H:%M:%S%.3f+0000").to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupTag {
    Priority,
    Option,
    Component,
    Version,
}

impl LookupTag {
    fn as_str(self) -> &'static str {
        match self {
            LookupTag::Priority => "priority",
            LookupTag::Option => "option",
            LookupTag::Component => "component",
            LookupTag::Version => "version",
        }
    }
}

/// Shared converter for the `{id}`-emitting lookup types.
fn convert_lookup(
    value: &Value,
    field: &FieldSchema,
    ctx: &ConversionContext<'_>,
    tag: LookupTag,
) -> Result<Value> {
    if let Value::Object(map) = value {
        if map.contains_key("id") {
            return Ok(value.clone());
        }
        if let Some(name) = map.get("name").or_else(|| map.get("value")).and_then(Value::as_str) {
            return convert_lookup(&json!(name), field, ctx, tag);
        }
        return Err(Error::validation(format!(
            "Field '{}' expects a name or an object with an 'id'",
            field.name
        )));
    }

    let input = string_input(value, field)?;
    let values = if field.allowed_values.is_empty() {
        fetch_lookup_values(field, ctx, tag)?
    } else {
        field.allowed_values.clone()
    };

    let matched = match_allowed(&field.name, &input, &values)?;
    let id = matched.id.clone().ok_or_else(|| {
        Error::validation(format!(
            "Option '{}' for field '{}' has no id in Jira's metadata",
            input, field.name
        ))
    })?;
    Ok(json!({ "id": id }))
}

fn fetch_lookup_values(
    field: &FieldSchema,
    ctx: &ConversionContext<'_>,
    tag: LookupTag,
) -> Result<Vec<AllowedValue>> {
    let (cache_key, path) = match tag {
        LookupTag::Priority => (
            format!("jml:lookup:global:{}", tag.as_str()),
            "/priority".to_string(),
        ),
        LookupTag::Component => (
            format!("jml:lookup:{}:{}", ctx.project_key, tag.as_str()),
            format!("/project/{}/components", ctx.project_key),
        ),
        LookupTag::Version => (
            format!("jml:lookup:{}:{}", ctx.project_key, tag.as_str()),
            format!("/project/{}/versions", ctx.project_key),
        ),
        LookupTag::Option => return fetch_option_values(field, ctx),
    };

    cached_values(ctx, &cache_key, || {
        let listing = ctx.http.get(&path)?;
        let entries = listing
            .as_array()
            .cloned()
            .or_else(|| listing.get("values").and_then(Value::as_array).cloned())
            .unwrap_or_default();
        Ok(entries
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect())
    })
}

/// Custom selects have no standalone endpoint; createmeta is the only place
/// Jira enumerates their options, so re-query it for this one field.
fn fetch_option_values(
    field: &FieldSchema,
    ctx: &ConversionContext<'_>,
) -> Result<Vec<AllowedValue>> {
    let cache_key = format!("jml:lookup:{}:option:{}", ctx.project_key, field.id);
    let values = cached_values(ctx, &cache_key, || {
        let listing = ctx
            .http
            .get(&format!("/issue/createmeta/{}/issuetypes", ctx.project_key))?;
        let issue_type_id = listing
            .get("values")
            .and_then(Value::as_array)
            .and_then(|types| {
                types.iter().find(|entry| {
                    entry.get("name").and_then(Value::as_str) == Some(ctx.issue_type)
                })
            })
            .and_then(|entry| entry.get("id"))
            .map(|id| match id.as_str() {
                Some(text) => text.to_string(),
                None => id.to_string(),
            });
        let Some(issue_type_id) = issue_type_id else {
            return Ok(Vec::new());
        };

        let field_listing = ctx.http.get_with_query(
            &format!(
                "/issue/createmeta/{}/issuetypes/{}",
                ctx.project_key, issue_type_id
            ),
            &[
                ("startAt", "0".to_string()),
                ("maxResults", "1000".to_string()),
            ],
        )?;
        let entry = field_listing
            .get("values")
            .and_then(Value::as_array)
            .and_then(|entries| {
                entries.iter().find(|e| {
                    e.get("fieldId").and_then(Value::as_str) == Some(field.id.as_str())
                })
            });
        Ok(entry
            .and_then(|e| e.get("allowedValues"))
            .and_then(Value::as_array)
            .map(|vals| {
                vals.iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default())
    })?;

    if values.is_empty() {
        return Err(Error::validation(format!(
            "Field '{}' has no selectable options",
            field.name
        )));
    }
    Ok(values)
}

fn cached_values<F>(ctx: &ConversionContext<'_>, key: &str, fetch: F) -> Result<Vec<AllowedValue>>
where
    F: FnOnce() -> Result<Vec<AllowedValue>>,
{
    if let Some(raw) = ctx.cache.get_fresh(key) {
        if let Ok(values) = serde_json::from_str(&raw) {
            return Ok(values);
        }
        logging::warn(format!("discarding undecodable cached lookup under {key}"));
        ctx.cache.delete(key);
    }

    let values = fetch()?;
    if let Ok(encoded) = serde_json::to_string(&values) {
        ctx.cache.set(key, &encoded, LOOKUP_TTL_SECS);
    }
    Ok(values)
}

/// Exact normalized matches first; a unique substring match second;
/// ambiguity when several candidates tie; a validation error listing the
/// available options otherwise.
fn match_allowed<'a>(
    field_name: &str,
    input: &str,
    values: &'a [AllowedValue],
) -> Result<&'a AllowedValue> {
    let needle = normalize_lookup(input);
    if needle.is_empty() {
        return Err(not_found_options(field_name, input, values));
    }

    let exact: Vec<&AllowedValue> = values
        .iter()
        .filter(|v| v.label().map(normalize_lookup).as_deref() == Some(needle.as_str()))
        .collect();
    match exact.len() {
        1 => return Ok(exact[0]),
        n if n > 1 => return Err(ambiguity(field_name, input, &exact)),
        _ => {}
    }

    let fuzzy: Vec<&AllowedValue> = values
        .iter()
        .filter(|v| {
            v.label()
                .map(|label| normalize_lookup(label).contains(&needle))
                .unwrap_or(false)
        })
        .collect();
    match fuzzy.len() {
        1 => Ok(fuzzy[0]),
        n if n > 1 => Err(ambiguity(field_name, input, &fuzzy)),
        _ => Err(not_found_options(field_name, input, values)),
    }
}

fn ambiguity(field_name: &str, input: &str, matches: &[&AllowedValue]) -> Error {
    Error::Ambiguity {
        field: field_name.to_string(),
        input: input.to_string(),
        candidates: matches.iter().map(|v| v.candidate()).collect(),
    }
}

fn not_found_options(field_name: &str, input: &str, values: &[AllowedValue]) -> Error {
    let mut listed: Vec<&str> = values.iter().filter_map(AllowedValue::label).collect();
    let truncated = listed.len() > MAX_LISTED_OPTIONS;
    listed.truncate(MAX_LISTED_OPTIONS);
    let mut available = listed.join(", ");
    if truncated {
        available.push_str(", ...");
    }
    Error::validation(format!(
        "No option matching '{}' for field '{}'. Available: {}",
        input, field_name, available
    ))
}

/// Cascading select: `"Parent -> Child"` strings or `{parent, child}`
/// objects become `{value, child: {value}}`.
fn convert_cascading(value: &Value, field: &FieldSchema) -> Result<Value> {
    let (parent_input, child_input) = match value {
        Value::Object(map) => {
            if map.contains_key("value") {
                return Ok(value.clone());
            }
            let parent = map
                .get("parent")
                .and_then(Value::as_str)
                .map(sanitize_text)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    Error::validation(format!(
                        "Field '{}' expects 'Parent -> Child' or an object with 'parent' and 'child'",
                        field.name
                    ))
                })?;
            let child = map
                .get("child")
                .and_then(Value::as_str)
                .map(sanitize_text)
                .filter(|s| !s.is_empty());
            (parent, child)
        }
        Value::String(s) => {
            let trimmed = sanitize_text(s);
            match trimmed.split_once("->") {
                Some((parent, child)) => (
                    sanitize_text(parent),
                    Some(sanitize_text(child)).filter(|c| !c.is_empty()),
                ),
                None => (trimmed, None),
            }
        }
        other => {
            return Err(Error::validation(format!(
                "Field '{}' expects text, got {}",
                field.name,
                type_name(other)
            )))
        }
    };

    let parent = match_allowed(&field.name, &parent_input, &field.allowed_values)?;
    let parent_label = parent.label().unwrap_or(&parent_input).to_string();

    let Some(child_input) = child_input else {
        return Ok(json!({ "value": parent_label }));
    };

    let child = match_allowed(
        &format!("{} ({})", field.name, parent_label),
        &child_input,
        &parent.children,
    )?;
    let child_label = child.label().unwrap_or(&child_input).to_string();
    Ok(json!({ "value": parent_label, "child": { "value": child_label } }))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JiraUser {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    email_address: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

impl JiraUser {
    fn candidate(&self) -> Candidate {
        Candidate {
            id: self
                .name
                .clone()
                .or_else(|| self.account_id.clone())
                .unwrap_or_default(),
            name: self.display_name.clone().unwrap_or_default(),
        }
    }
}

fn convert_user(value: &Value, field: &FieldSchema, ctx: &ConversionContext<'_>) -> Result<Value> {
    if let Value::Object(map) = value {
        if map.contains_key("name") || map.contains_key("accountId") || map.contains_key("key") {
            return Ok(value.clone());
        }
        return Err(Error::validation(format!(
            "Field '{}' expects a username, email, or an object with 'name' or 'accountId'",
            field.name
        )));
    }

    let input = string_input(value, field)?;
    let cache_key = format!("jml:lookup:global:user:{}", normalize_lookup(&input));
    if let Some(raw) = ctx.cache.get_fresh(&cache_key) {
        if let Ok(cached) = serde_json::from_str::<Value>(&raw) {
            return Ok(cached);
        }
    }

    let listing = ctx
        .http
        .get_with_query("/user/search", &[("username", input.clone())])?;
    let users: Vec<JiraUser> = listing
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    if users.is_empty() {
        return Err(Error::validation(format!(
            "No user matching '{}' for field '{}'",
            input, field.name
        )));
    }

    let chosen = if users.len() == 1 {
        &users[0]
    } else {
        pick_user(&input, &users, field, ctx.config.ambiguity.user)?
    };

    let wire = if deployment_is_cloud(ctx) {
        let account_id = chosen.account_id.clone().ok_or_else(|| {
            Error::validation(format!(
                "User matching '{}' has no accountId on this deployment",
                input
            ))
        })?;
        json!({ "accountId": account_id })
    } else {
        let name = chosen.name.clone().ok_or_else(|| {
            Error::validation(format!(
                "User matching '{}' has no username on this deployment",
                input
            ))
        })?;
        json!({ "name": name })
    };

    if let Ok(encoded) = serde_json::to_string(&wire) {
        ctx.cache.set(&cache_key, &encoded, LOOKUP_TTL_SECS);
    }
    Ok(wire)
}

fn pick_user<'a>(
    input: &str,
    users: &'a [JiraUser],
    field: &FieldSchema,
    policy: UserAmbiguityPolicy,
) -> Result<&'a JiraUser> {
    let needle = normalize_lookup(input);
    let exact_email: Vec<&JiraUser> = users
        .iter()
        .filter(|u| {
            u.email_address
                .as_deref()
                .map(normalize_lookup)
                .as_deref()
                == Some(needle.as_str())
        })
        .collect();
    if exact_email.len() == 1 {
        return Ok(exact_email[0]);
    }

    match policy {
        UserAmbiguityPolicy::Strict => Err(Error::Ambiguity {
            field: field.name.clone(),
            input: input.to_string(),
            candidates: users.iter().map(JiraUser::candidate).collect(),
        }),
        UserAmbiguityPolicy::Score => {
            let exact_display: Vec<&JiraUser> = users
                .iter()
                .filter(|u| {
                    u.display_name
                        .as_deref()
                        .map(normalize_lookup)
                        .as_deref()
                        == Some(needle.as_str())
                })
                .collect();
            if exact_display.len() == 1 {
                return Ok(exact_display[0]);
            }
            Err(Error::Ambiguity {
                field: field.name.clone(),
                input: input.to_string(),
                candidates: users.iter().map(JiraUser::candidate).collect(),
            })
        }
    }
}

fn deployment_is_cloud(ctx: &ConversionContext<'_>) -> bool {
    let key = "jml:lookup:global:serverinfo";
    let deployment = if let Some(cached) = ctx.cache.get_fresh(key) {
        cached
    } else {
        match ctx.http.get("/serverInfo") {
            Ok(info) => {
                let deployment = info
                    .get("deploymentType")
                    .and_then(Value::as_str)
                    .unwrap_or("Server")
                    .to_string();
                ctx.cache.set(key, &deployment, LOOKUP_TTL_SECS);
                deployment
            }
            Err(err) => {
                logging::warn(format!(
                    "failed to read serverInfo, assuming Server deployment: {err}"
                ));
                "Server".to_string()
            }
        }
    };
    deployment.eq_ignore_ascii_case("cloud")
}

fn convert_project(value: &Value, field: &FieldSchema, ctx: &ConversionContext<'_>) -> Result<Value> {
    if let Value::Object(map) = value {
        if map.contains_key("key") || map.contains_key("id") {
            return Ok(value.clone());
        }
        return Err(Error::validation(format!(
            "Field '{}' expects a project key or name, or an object with 'key'",
            field.name
        )));
    }

    let input = string_input(value, field)?;
    let cache_key = format!("jml:project:{}", normalize_lookup(&input));
    if let Some(key) = ctx.cache.get_fresh(&cache_key) {
        return Ok(json!({ "key": key }));
    }

    // A direct key lookup first; most callers pass the key.
    match ctx.http.get(&format!("/project/{input}")) {
        Ok(project) => {
            let key = project
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::validation(format!("Project '{input}' has no key")))?;
            ctx.cache.set(&cache_key, key, LOOKUP_TTL_SECS);
            return Ok(json!({ "key": key }));
        }
        Err(Error::NotFound { .. }) => {}
        Err(other) => return Err(other),
    }

    let projects = cached_projects(ctx)?;
    let needle = normalize_lookup(&input);
    if let Some(by_key) = projects
        .iter()
        .find(|p| p.id.as_deref().map(normalize_lookup).as_deref() == Some(needle.as_str()))
    {
        let key = by_key.id.clone().unwrap_or_default();
        ctx.cache.set(&cache_key, &key, LOOKUP_TTL_SECS);
        return Ok(json!({ "key": key }));
    }

    let matched = match_allowed(&field.name, &input, &projects)?;
    let key = matched.id.clone().ok_or_else(|| {
        Error::validation(format!("Project matching '{input}' has no key"))
    })?;
    ctx.cache.set(&cache_key, &key, LOOKUP_TTL_SECS);
    Ok(json!({ "key": key }))
}

/// Full project listing, reshaped so `id` holds the project key and the
/// label holds the display name.
fn cached_projects(ctx: &ConversionContext<'_>) -> Result<Vec<AllowedValue>> {
    let cache_key = format!("jml:projects:{}", ctx.http.base_url());
    cached_values(ctx, &cache_key, || {
        let listing = ctx.http.get("/project")?;
        let entries = listing.as_array().cloned().unwrap_or_default();
        Ok(entries
            .iter()
            .filter_map(|entry| {
                let key = entry.get("key").and_then(Value::as_str)?;
                Some(AllowedValue {
                    id: Some(key.to_string()),
                    name: entry
                        .get("name")
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                    value: None,
                    children: Vec::new(),
                })
            })
            .collect())
    })
}

fn convert_issue_type(
    value: &Value,
    field: &FieldSchema,
    ctx: &ConversionContext<'_>,
) -> Result<Value> {
    if let Value::Object(map) = value {
        if map.contains_key("name") || map.contains_key("id") {
            return Ok(value.clone());
        }
        return Err(Error::validation(format!(
            "Field '{}' expects an issue type name or an object with 'name'",
            field.name
        )));
    }

    let input = string_input(value, field)?;
    let cache_key = format!("jml:lookup:{}:issuetype", ctx.project_key);
    let values = cached_values(ctx, &cache_key, || {
        let listing = ctx
            .http
            .get(&format!("/issue/createmeta/{}/issuetypes", ctx.project_key))?;
        let entries = listing
            .get("values")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if entries.is_empty() {
            return Err(Error::not_found(format!(
                "No issue types found for project {}",
                ctx.project_key
            )));
        }
        Ok(entries
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect())
    })?;

    let matched = match_allowed(&field.name, &input, &values)?;
    let name = matched
        .label()
        .ok_or_else(|| Error::validation(format!("Issue type matching '{input}' has no name")))?;
    Ok(json!({ "name": name }))
}

/// Timetracking accepts a partial `{originalEstimate, remainingEstimate}`
/// object or a bare estimate string (treated as the original estimate).
/// Virtual sub-fields are merged over this object at payload-emission time.
fn convert_timetracking(value: &Value, field: &FieldSchema) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for key in ["originalEstimate", "remainingEstimate"] {
                if let Some(entry) = map.get(key) {
                    let text = entry.as_str().ok_or_else(|| {
                        Error::validation(format!(
                            "Field '{}' expects '{}' to be an estimate string",
                            field.name, key
                        ))
                    })?;
                    out.insert(key.to_string(), json!(sanitize_text(text)));
                }
            }
            if out.is_empty() {
                return Err(Error::validation(format!(
                    "Field '{}' expects 'originalEstimate' and/or 'remainingEstimate'",
                    field.name
                )));
            }
            Ok(Value::Object(out))
        }
        Value::String(s) => Ok(json!({ "originalEstimate": sanitize_text(s) })),
        other => Err(Error::validation(format!(
            "Field '{}' expects an estimate object, got {}",
            field.name,
            type_name(other)
        ))),
    }
}

fn convert_array(value: &Value, field: &FieldSchema, ctx: &ConversionContext<'_>) -> Result<Value> {
    let item_type = FieldType::item_type(field.schema.items.as_deref());
    let item_field = FieldSchema {
        id: field.id.clone(),
        name: field.name.clone(),
        field_type: item_type,
        required: false,
        schema: SchemaInfo {
            type_name: field.schema.items.clone(),
            items: None,
            custom: None,
            custom_id: None,
            system: field.schema.system.clone(),
        },
        allowed_values: field.allowed_values.clone(),
    };

    let elements: Vec<Value> = match value {
        Value::Array(items) => items.clone(),
        Value::String(s) => sanitize_text(s)
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| json!(part))
            .collect(),
        other => vec![other.clone()],
    };

    let mut converted = Vec::with_capacity(elements.len());
    for element in &elements {
        let wire = convert_value(element, &item_field, ctx)?;
        if !wire.is_null() {
            converted.push(wire);
        }
    }
    Ok(Value::Array(converted))
}

impl FieldType {
    /// Maps an array schema's `items` tag to the element converter.
    fn item_type(items: Option<&str>) -> FieldType {
        match items {
            Some("string") => FieldType::String,
            Some("number") => FieldType::Number,
            Some("date") => FieldType::Date,
            Some("datetime") => FieldType::DateTime,
            Some("priority") => FieldType::Priority,
            Some("user") => FieldType::User,
            Some("option") => FieldType::Option,
            Some("component") => FieldType::Component,
            Some("version") => FieldType::Version,
            Some("issuetype") => FieldType::IssueType,
            Some("project") => FieldType::Project,
            _ => FieldType::Unknown,
        }
    }
}

fn string_input(value: &Value, field: &FieldSchema) -> Result<String> {
    match value {
        Value::String(s) => {
            let trimmed = sanitize_text(s);
            if trimmed.is_empty() {
                return Err(Error::validation(format!(
                    "Field '{}' received an empty value",
                    field.name
                )));
            }
            Ok(trimmed)
        }
        other => Err(Error::validation(format!(
            "Field '{}' expects text, got {}",
            field.name,
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
    .to_string()
}
