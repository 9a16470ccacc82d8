use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::Cache;
use crate::convert::normalize_lookup;
use crate::error::{Candidate, Error, Result};
use crate::http::HttpClient;
use crate::logging;

/// Schema catalogs are refreshed after fifteen minutes.
pub const SCHEMA_TTL_SECS: u64 = 900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Closed set of field types the converter registry dispatches on.
pub enum FieldType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "date")]
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    #[serde(rename = "array")]
    Array,
    #[serde(rename = "priority")]
    Priority,
    #[serde(rename = "user")]
    User,
    #[serde(rename = "option")]
    Option,
    #[serde(rename = "option-with-child")]
    OptionWithChild,
    #[serde(rename = "component")]
    Component,
    #[serde(rename = "version")]
    Version,
    #[serde(rename = "timetracking")]
    Timetracking,
    #[serde(rename = "issuetype")]
    IssueType,
    #[serde(rename = "project")]
    Project,
    #[serde(rename = "unknown")]
    Unknown,
}

impl FieldType {
    /// Maps a createmeta `schema.type` to a registry type. `option` becomes
    /// cascading when any allowed value carries children; textarea customs
    /// become `text`; unrecognized or missing types become `unknown`.
    fn from_wire(type_name: Option<&str>, custom: Option<&str>, has_children: bool) -> Self {
        if custom.is_some_and(|c| c.ends_with(":textarea")) {
            return FieldType::Text;
        }
        match type_name {
            Some("string") => FieldType::String,
            Some("number") => FieldType::Number,
            Some("date") => FieldType::Date,
            Some("datetime") => FieldType::DateTime,
            Some("array") => FieldType::Array,
            Some("priority") => FieldType::Priority,
            Some("user") => FieldType::User,
            Some("option-with-child") => FieldType::OptionWithChild,
            Some("option") => {
                if has_children {
                    FieldType::OptionWithChild
                } else {
                    FieldType::Option
                }
            }
            Some("component") => FieldType::Component,
            Some("version") => FieldType::Version,
            Some("timetracking") => FieldType::Timetracking,
            Some("issuetype") => FieldType::IssueType,
            Some("project") => FieldType::Project,
            _ => FieldType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Raw `schema` block of a createmeta field entry.
pub struct SchemaInfo {
    #[serde(rename = "type", default)]
    pub type_name: Option<String>,
    #[serde(default)]
    pub items: Option<String>,
    #[serde(default)]
    pub custom: Option<String>,
    #[serde(default)]
    pub custom_id: Option<i64>,
    #[serde(default)]
    pub system: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// One entry of a field's `allowedValues` list. Options carry `value`,
/// most other lookups carry `name`.
pub struct AllowedValue {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub children: Vec<AllowedValue>,
}

impl AllowedValue {
    pub fn label(&self) -> Option<&str> {
        self.value.as_deref().or(self.name.as_deref())
    }

    pub fn candidate(&self) -> Candidate {
        Candidate {
            id: self.id.clone().unwrap_or_default(),
            name: self.label().unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    pub schema: SchemaInfo,
    #[serde(default)]
    pub allowed_values: Vec<AllowedValue>,
}

impl FieldSchema {
    /// Whether this is a synthesized sub-field backed by a property inside a
    /// parent field's wire object.
    pub fn is_virtual(&self) -> bool {
        self.schema.custom.as_deref() == Some("virtual")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Field catalog for one (project, issue type) pair.
pub struct ProjectSchema {
    pub project_key: String,
    pub issue_type: String,
    pub fields: BTreeMap<String, FieldSchema>,
    /// Normalized friendly name to field id, duplicates excluded.
    name_index: HashMap<String, String>,
    /// Normalized friendly names claimed by more than one field.
    duplicate_names: HashMap<String, Vec<String>>,
}

impl ProjectSchema {
    fn new(project_key: &str, issue_type: &str, fields: BTreeMap<String, FieldSchema>) -> Self {
        let mut name_index: HashMap<String, String> = HashMap::new();
        let mut duplicate_names: HashMap<String, Vec<String>> = HashMap::new();

        for (id, field) in &fields {
            let key = normalize_lookup(&field.name);
            if let Some(ids) = duplicate_names.get_mut(&key) {
                ids.push(id.clone());
                continue;
            }
            match name_index.remove(&key) {
                Some(existing) => {
                    duplicate_names.insert(key, vec![existing, id.clone()]);
                }
                None => {
                    name_index.insert(key, id.clone());
                }
            }
        }

        Self {
            project_key: project_key.to_string(),
            issue_type: issue_type.to_string(),
            fields,
            name_index,
            duplicate_names,
        }
    }

    pub fn field(&self, id: &str) -> Option<&FieldSchema> {
        self.fields.get(id)
    }

    /// Resolves a friendly field name (or a literal field id) to a field id.
    ///
    /// # Errors
    /// Returns [`Error::Ambiguity`] when the normalized name is claimed by
    /// more than one field; the message tells the caller to use the field id.
    pub fn field_id_by_name(&self, friendly: &str) -> Result<Option<String>> {
        if self.fields.contains_key(friendly) {
            return Ok(Some(friendly.to_string()));
        }

        let key = normalize_lookup(friendly);
        if let Some(ids) = self.duplicate_names.get(&key) {
            return Err(Error::Ambiguity {
                field: friendly.to_string(),
                input: friendly.to_string(),
                candidates: ids
                    .iter()
                    .filter_map(|id| self.fields.get(id))
                    .map(|f| Candidate {
                        id: f.id.clone(),
                        name: f.name.clone(),
                    })
                    .collect(),
            });
        }

        Ok(self.name_index.get(&key).cloned())
    }

    pub fn field_by_name(&self, friendly: &str) -> Result<Option<&FieldSchema>> {
        Ok(self
            .field_id_by_name(friendly)?
            .and_then(|id| self.fields.get(&id)))
    }
}

#[derive(Debug, Clone)]
/// Fetches and caches per-(project, issue type) field catalogs from the
/// createmeta endpoints.
pub struct SchemaDiscovery {
    http: Arc<HttpClient>,
    cache: Arc<Cache>,
}

impl SchemaDiscovery {
    pub fn new(http: Arc<HttpClient>, cache: Arc<Cache>) -> Self {
        Self { http, cache }
    }

    /// Returns the field catalog for `issue_type_name` in `project_key`.
    ///
    /// Served from cache while fresh; a stale or missing entry triggers a
    /// single-flight refresh shared by concurrent callers. When the refresh
    /// fails and a stale copy is still within its hard window, the stale
    /// copy is served instead of the error.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] when the project has no issue types or
    /// the named issue type does not exist, and HTTP-mapped errors otherwise.
    pub fn fields_for_issue_type(
        &self,
        project_key: &str,
        issue_type_name: &str,
    ) -> Result<ProjectSchema> {
        let key = format!(
            "jml:schema:{}:{}:{}",
            self.http.base_url(),
            project_key,
            issue_type_name
        );

        if let Some(raw) = self.cache.get_fresh(&key) {
            if let Ok(schema) = serde_json::from_str(&raw) {
                return Ok(schema);
            }
            logging::warn(format!("discarding undecodable cached schema under {key}"));
            self.cache.delete(&key);
        }

        let refreshed = self.cache.refresh_once(&key, SCHEMA_TTL_SECS, || {
            let schema = self.fetch(project_key, issue_type_name)?;
            serde_json::to_string(&schema)
                .map_err(|err| Error::cache(format!("failed to encode schema: {err}")))
        });

        let raw = match refreshed {
            Ok(raw) => raw,
            Err(err) => match self.cache.get(&key) {
                Some(lookup) => {
                    logging::warn(format!(
                        "schema refresh for {project_key}/{issue_type_name} failed ({err}); serving stale copy"
                    ));
                    lookup.value
                }
                None => return Err(err),
            },
        };

        serde_json::from_str(&raw)
            .map_err(|err| Error::cache(format!("failed to decode cached schema: {err}")))
    }

    /// Case-insensitive friendly-name lookup against the discovered catalog.
    ///
    /// # Errors
    /// Propagates discovery failures and name ambiguity.
    pub fn field_id_by_name(
        &self,
        project_key: &str,
        issue_type_name: &str,
        friendly: &str,
    ) -> Result<Option<String>> {
        self.fields_for_issue_type(project_key, issue_type_name)?
            .field_id_by_name(friendly)
    }

    fn fetch(&self, project_key: &str, issue_type_name: &str) -> Result<ProjectSchema> {
        let listing = self
            .http
            .get(&format!("/issue/createmeta/{project_key}/issuetypes"))?;
        let issue_types = listing
            .get("values")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if issue_types.is_empty() {
            return Err(Error::not_found(format!(
                "No issue types found for project {project_key}"
            )));
        }

        // Issue type names are matched case-sensitively; Jira treats "Bug"
        // and "bug" as distinct types.
        let issue_type = issue_types
            .iter()
            .find(|entry| entry.get("name").and_then(Value::as_str) == Some(issue_type_name));
        let Some(issue_type) = issue_type else {
            let available = issue_types
                .iter()
                .filter_map(|entry| entry.get("name").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(Error::not_found(format!(
                "Issue type '{issue_type_name}' not found for project {project_key}. Available: {available}"
            )));
        };
        let issue_type_id = issue_type
            .get("id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| issue_type["id"].to_string());

        let field_listing = self.http.get_with_query(
            &format!("/issue/createmeta/{project_key}/issuetypes/{issue_type_id}"),
            &[
                ("startAt", "0".to_string()),
                ("maxResults", "1000".to_string()),
            ],
        )?;
        let entries = field_listing
            .get("values")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut fields = BTreeMap::new();
        for entry in &entries {
            // Entries without a fieldId cannot be addressed in a payload.
            if let Some(field) = parse_field(entry) {
                fields.insert(field.id.clone(), field);
            }
        }

        synthesize_virtual_fields(&mut fields);
        Ok(ProjectSchema::new(project_key, issue_type_name, fields))
    }
}

fn parse_field(entry: &Value) -> Option<FieldSchema> {
    let field_id = entry.get("fieldId").and_then(Value::as_str)?;
    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(field_id);
    let required = entry
        .get("required")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let schema: SchemaInfo = entry
        .get("schema")
        .cloned()
        .map(serde_json::from_value)
        .and_then(|r| r.ok())
        .unwrap_or_default();
    let allowed_values: Vec<AllowedValue> = entry
        .get("allowedValues")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let has_children = allowed_values.iter().any(|v| !v.children.is_empty());
    let field_type = FieldType::from_wire(
        schema.type_name.as_deref(),
        schema.custom.as_deref(),
        has_children,
    );

    Some(FieldSchema {
        id: field_id.to_string(),
        name: name.to_string(),
        field_type,
        required,
        schema,
        allowed_values,
    })
}

/// When a timetracking field is present, expose its two estimate properties
/// as addressable string sub-fields.
fn synthesize_virtual_fields(fields: &mut BTreeMap<String, FieldSchema>) {
    let has_timetracking = fields
        .values()
        .any(|f| f.field_type == FieldType::Timetracking);
    if !has_timetracking {
        return;
    }

    for sub in ["originalEstimate", "remainingEstimate"] {
        let id = format!("timetracking.{sub}");
        fields.insert(
            id.clone(),
            FieldSchema {
                id: id.clone(),
                name: id.clone(),
                field_type: FieldType::String,
                required: false,
                schema: SchemaInfo {
                    type_name: Some("string".to_string()),
                    items: None,
                    custom: Some("virtual".to_string()),
                    custom_id: None,
                    system: Some(id.clone()),
                },
                allowed_values: Vec::new(),
            },
        );
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn field(id: &str, name: &str, field_type: FieldType) -> FieldSchema {
        FieldSchema {
            id: id.to_string(),
            name: name.to_string(),
            field_type,
            required: false,
            schema: SchemaInfo::default(),
            allowed_values: Vec::new(),
        }
    }

    pub fn allowed(id: &str, label: &str) -> AllowedValue {
        AllowedValue {
            id: Some(id.to_string()),
            name: Some(label.to_string()),
            value: None,
            children: Vec::new(),
        }
    }

    pub fn schema_of(project: &str, issue_type: &str, fields: Vec<FieldSchema>) -> ProjectSchema {
        ProjectSchema::new(
            project,
            issue_type,
            fields.into_iter().map(|f| (f.id.clone(), f)).collect(),
        )
    }
}
