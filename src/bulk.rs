use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::cache::Cache;
use crate::config::Config;
use crate::convert::{self, ConversionContext};
use crate::error::{Error, Result};
use crate::hierarchy::{self, record_key, HierarchyPlan};
use crate::http::HttpClient;
use crate::input::{self, ParseRequest, Record};
use crate::logging;
use crate::manifest::{
    new_manifest_id, BulkManifest, ManifestDelta, ManifestStore, RowError,
};
use crate::metrics::Metrics;
use crate::progress::{self, ProgressCallback, ProgressScope};
use crate::schema::{FieldSchema, FieldType, SchemaInfo, SchemaDiscovery};
use crate::search::SearchService;

/// Worker threads used to build payloads for one bulk pass.
const PAYLOAD_BUILD_WORKERS: usize = 8;
/// Key reported for rows that passed a dry run.
const DRY_RUN_KEY: &str = "DRY-RUN";
/// Retrying a manifest older than this logs a warning.
const RETRY_AGE_WARNING_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
/// The three accepted input shapes: one record, many records, or parser
/// options pointing at a file or inline data.
pub enum CreateInput {
    Record(Record),
    Records(Vec<Record>),
    Parse(ParseRequest),
}

impl From<Record> for CreateInput {
    fn from(record: Record) -> Self {
        CreateInput::Record(record)
    }
}

impl From<Vec<Record>> for CreateInput {
    fn from(records: Vec<Record>) -> Self {
        CreateInput::Records(records)
    }
}

impl From<ParseRequest> for CreateInput {
    fn from(request: ParseRequest) -> Self {
        CreateInput::Parse(request)
    }
}

impl CreateInput {
    /// Applies the acceptance rules to a loose JSON value: arrays are bulk
    /// input, objects carrying `from`/`data`/`format` are parser options,
    /// and any other object is a single record.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] for scalars and mistyped parser options.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(entries) => {
                let records = entries
                    .into_iter()
                    .map(|entry| match entry {
                        Value::Object(record) => Ok(record),
                        _ => Err(Error::validation("every input row must be an object")),
                    })
                    .collect::<Result<Vec<Record>>>()?;
                Ok(CreateInput::Records(records))
            }
            Value::Object(map) => {
                let has_parser_keys = ["from", "data", "format"]
                    .iter()
                    .any(|key| map.contains_key(*key));
                let has_project = record_key(&map, "project").is_some();
                if has_parser_keys && !has_project {
                    let request = ParseRequest {
                        from: map.get("from").and_then(Value::as_str).map(ToString::to_string),
                        data: map.get("data").cloned(),
                        format: map
                            .get("format")
                            .cloned()
                            .map(serde_json::from_value)
                            .transpose()
                            .map_err(|err| {
                                Error::validation(format!("invalid input format: {err}"))
                            })?,
                        ..ParseRequest::default()
                    };
                    return Ok(CreateInput::Parse(request));
                }
                Ok(CreateInput::Record(map))
            }
            other => Err(Error::validation(format!(
                "create input must be a record, an array of records, or parser options, got {other}"
            ))),
        }
    }
}

#[derive(Clone, Default)]
pub struct CreateOptions {
    /// Dry run: resolve and convert every row, skip the POST.
    pub validate: bool,
    /// Retry only the rows a previous manifest recorded as failed.
    pub retry: Option<String>,
    pub on_progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for CreateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateOptions")
            .field("validate", &self.validate)
            .field("retry", &self.retry)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedIssue {
    pub id: String,
    pub key: String,
    pub self_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowResult {
    pub index: usize,
    pub success: bool,
    pub key: Option<String>,
    pub error: Option<String>,
    /// The wire payload, populated by dry runs.
    pub payload: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct BulkResult {
    /// Absent for dry runs and empty input; stored durably otherwise.
    pub manifest: Option<BulkManifest>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<RowResult>,
}

#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Single(CreatedIssue),
    Bulk(BulkResult),
}

impl CreateOutcome {
    pub fn as_single(&self) -> Option<&CreatedIssue> {
        match self {
            CreateOutcome::Single(issue) => Some(issue),
            CreateOutcome::Bulk(_) => None,
        }
    }

    pub fn as_bulk(&self) -> Option<&BulkResult> {
        match self {
            CreateOutcome::Bulk(result) => Some(result),
            CreateOutcome::Single(_) => None,
        }
    }
}

#[derive(Debug)]
enum RowOutcome {
    Created(CreatedIssue),
    Failed(RowError),
}

/// Unified create engine: single records, bulk arrays, parsed files,
/// hierarchical batches, and manifest-driven retries all run through here.
#[derive(Debug, Clone)]
pub struct BulkEngine {
    http: Arc<HttpClient>,
    cache: Arc<Cache>,
    schema: SchemaDiscovery,
    manifests: ManifestStore,
    search: SearchService,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl BulkEngine {
    pub fn new(
        http: Arc<HttpClient>,
        cache: Arc<Cache>,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let schema = SchemaDiscovery::new(Arc::clone(&http), Arc::clone(&cache));
        let manifests = ManifestStore::new(Arc::clone(&cache), config.cache.manifest_ttl_secs);
        let search = SearchService::new(Arc::clone(&http));
        Self {
            http,
            cache,
            schema,
            manifests,
            search,
            config,
            metrics,
        }
    }

    /// Creates issues from any accepted input shape.
    ///
    /// # Errors
    /// Raises only whole-operation faults: configuration problems, an
    /// unusable manifest for retry, transport failures of the bulk POST
    /// itself, or every row failing validation. Per-row failures are
    /// captured in the returned manifest instead.
    pub fn create(&self, input: CreateInput, options: &CreateOptions) -> Result<CreateOutcome> {
        if let Some(manifest_id) = options.retry.clone() {
            return self.retry(input, &manifest_id, options);
        }

        match input {
            CreateInput::Record(record) => self.create_single(&record, options),
            CreateInput::Records(records) => self.create_bulk(records, options),
            CreateInput::Parse(request) => {
                let parsed = input::parse(&request)?;
                self.create_bulk(parsed.data, options)
            }
        }
    }

    fn create_single(&self, record: &Record, options: &CreateOptions) -> Result<CreateOutcome> {
        let payload = self.build_payload(record)?;
        if options.validate {
            return Ok(CreateOutcome::Single(CreatedIssue {
                id: DRY_RUN_KEY.to_string(),
                key: DRY_RUN_KEY.to_string(),
                self_url: String::new(),
            }));
        }

        let response = self.http.post("/issue", &payload)?;
        let created = created_from(&response)?;
        self.metrics.add_issues_created(1);
        logging::info(format!("created issue {}", created.key));
        Ok(CreateOutcome::Single(created))
    }

    fn create_bulk(&self, records: Vec<Record>, options: &CreateOptions) -> Result<CreateOutcome> {
        if records.is_empty() {
            return Ok(CreateOutcome::Bulk(BulkResult {
                manifest: None,
                total: 0,
                succeeded: 0,
                failed: 0,
                results: Vec::new(),
            }));
        }

        let plan = hierarchy::analyze(&records)?;
        if !options.validate {
            self.require_durable_cache()?;
        }

        if plan.has_hierarchy && plan.levels.len() > 1 {
            return self.create_hierarchical(records, &plan, options);
        }
        self.create_flat(records, options)
    }

    fn create_flat(&self, records: Vec<Record>, options: &CreateOptions) -> Result<CreateOutcome> {
        let total = records.len();
        let rows: Vec<(usize, Record)> = records.into_iter().enumerate().collect();
        let built = self.build_payloads(&rows);

        if options.validate {
            return Ok(CreateOutcome::Bulk(dry_run_result(total, built)));
        }

        let valid: Vec<(usize, Value)> = built
            .iter()
            .filter_map(|(index, outcome)| {
                outcome.as_ref().ok().map(|payload| (*index, payload.clone()))
            })
            .collect();
        if valid.is_empty() {
            // Nothing worth sending; surface the first row's error.
            for (_, outcome) in built {
                if let Err(err) = outcome {
                    return Err(err);
                }
            }
            return Err(Error::validation("every row failed validation"));
        }

        let mut manifest = BulkManifest::new(new_manifest_id(false), total);
        for (index, outcome) in &built {
            if let Err(err) = outcome {
                manifest.record_failure(*index, row_error_from(err));
            }
        }

        let mut payloads: Vec<Value> = valid.iter().map(|(_, p)| p.clone()).collect();
        let tracking = self.start_tracking(&manifest.id, &mut payloads, valid.len(), options);

        let posted = self.post_bulk(&valid, &payloads);
        if let Some((stop, _marker)) = &tracking {
            stop.store(true, Ordering::SeqCst);
        }
        let outcomes = posted?;

        let mut created_count = 0u64;
        for (index, outcome) in outcomes {
            match outcome {
                RowOutcome::Created(issue) => {
                    manifest.record_success(index, issue.key);
                    created_count += 1;
                }
                RowOutcome::Failed(error) => manifest.record_failure(index, error),
            }
        }
        self.metrics.add_issues_created(created_count);
        self.metrics.inc_bulk_job();
        self.manifests.save(&manifest);

        if let Some((_, marker)) = tracking {
            let keys: Vec<String> = manifest.created.values().cloned().collect();
            progress::cleanup_markers(&self.http, &keys, &marker);
        }

        Ok(CreateOutcome::Bulk(result_from_manifest(manifest)))
    }

    fn create_hierarchical(
        &self,
        records: Vec<Record>,
        plan: &HierarchyPlan,
        options: &CreateOptions,
    ) -> Result<CreateOutcome> {
        let total = records.len();
        let mut manifest = BulkManifest::new(new_manifest_id(true), total);
        let mut dry_rows: Vec<(usize, std::result::Result<Value, Error>)> = Vec::new();
        let mut created_count = 0u64;

        for level in &plan.levels {
            let mut rows: Vec<(usize, Record)> = Vec::new();
            for &index in &level.indices {
                let mut record = records[index].clone();
                strip_key(&mut record, "uid");

                if let Some(parent_uid) = plan.parent_uid_of.get(&index) {
                    match manifest.uid_map.get(parent_uid) {
                        Some(parent_key) => {
                            let parent_key = parent_key.clone();
                            replace_value(&mut record, "parent", json!(parent_key));
                        }
                        None if options.validate => {
                            // Dry runs never create parents; leave the UID in
                            // place so the payload still renders.
                        }
                        None => {
                            manifest.record_failure(
                                index,
                                RowError::validation(format!(
                                    "parent creation failed for uid '{parent_uid}'"
                                )),
                            );
                            continue;
                        }
                    }
                }
                rows.push((index, record));
            }

            if rows.is_empty() {
                continue;
            }

            let built = self.build_payloads(&rows);
            if options.validate {
                dry_rows.extend(built);
                continue;
            }

            let valid: Vec<(usize, Value)> = built
                .iter()
                .filter_map(|(index, outcome)| {
                    outcome.as_ref().ok().map(|payload| (*index, payload.clone()))
                })
                .collect();
            for (index, outcome) in &built {
                if let Err(err) = outcome {
                    manifest.record_failure(*index, row_error_from(err));
                }
            }
            if valid.is_empty() {
                continue;
            }

            // Children at the next level wait for this POST to finish.
            let payloads: Vec<Value> = valid.iter().map(|(_, p)| p.clone()).collect();
            let outcomes = self.post_bulk(&valid, &payloads)?;
            for (index, outcome) in outcomes {
                match outcome {
                    RowOutcome::Created(issue) => {
                        if let Some(uid) = plan.uid_of.get(&index) {
                            manifest.uid_map.insert(uid.clone(), issue.key.clone());
                        }
                        manifest.record_success(index, issue.key);
                        created_count += 1;
                    }
                    RowOutcome::Failed(error) => manifest.record_failure(index, error),
                }
            }
        }

        if options.validate {
            return Ok(CreateOutcome::Bulk(dry_run_result(total, dry_rows)));
        }

        self.metrics.add_issues_created(created_count);
        self.metrics.inc_bulk_job();
        self.manifests.save(&manifest);
        Ok(CreateOutcome::Bulk(result_from_manifest(manifest)))
    }

    fn retry(
        &self,
        input: CreateInput,
        manifest_id: &str,
        options: &CreateOptions,
    ) -> Result<CreateOutcome> {
        let manifest = self.manifests.load(manifest_id).ok_or_else(|| {
            Error::not_found(format!("Manifest {manifest_id} not found or expired"))
        })?;
        if let Some(age) = manifest.age() {
            if age.num_seconds() > RETRY_AGE_WARNING_SECS {
                logging::warn(format!(
                    "manifest {manifest_id} is {} hours old; the input may have drifted",
                    age.num_hours()
                ));
            }
        }

        if manifest.failed.is_empty() {
            // Everything already succeeded; answer from the manifest alone.
            return Ok(CreateOutcome::Bulk(result_from_manifest(manifest)));
        }

        let records = match input {
            CreateInput::Record(record) => vec![record],
            CreateInput::Records(records) => records,
            CreateInput::Parse(request) => input::parse(&request)?.data,
        };
        if records.len() != manifest.total {
            return Err(Error::validation(format!(
                "retry input has {} rows but manifest {} covers {} rows",
                records.len(),
                manifest_id,
                manifest.total
            )));
        }

        let mut delta = ManifestDelta::default();
        let mut rows: Vec<(usize, Record)> = Vec::new();
        for &index in &manifest.failed {
            let mut record = records[index].clone();
            strip_key(&mut record, "uid");
            if let Some(parent_key) = record_key(&record, "parent").map(str::to_string) {
                if let Some(Value::String(reference)) = record.get(&parent_key).cloned() {
                    if let Some(resolved) = manifest.uid_map.get(reference.trim()) {
                        record.insert(parent_key, json!(resolved));
                    }
                }
            }
            rows.push((index, record));
        }

        let built = self.build_payloads(&rows);
        if options.validate {
            return Ok(CreateOutcome::Bulk(dry_run_result(manifest.total, built)));
        }
        self.require_durable_cache()?;

        let valid: Vec<(usize, Value)> = built
            .iter()
            .filter_map(|(index, outcome)| {
                outcome.as_ref().ok().map(|payload| (*index, payload.clone()))
            })
            .collect();
        for (index, outcome) in &built {
            if let Err(err) = outcome {
                delta.failed.push(*index);
                delta.errors.insert(*index, row_error_from(err));
            }
        }

        if !valid.is_empty() {
            let payloads: Vec<Value> = valid.iter().map(|(_, p)| p.clone()).collect();
            let outcomes = self.post_bulk(&valid, &payloads)?;
            let mut created_count = 0u64;
            for (index, outcome) in outcomes {
                match outcome {
                    RowOutcome::Created(issue) => {
                        delta.succeeded.push(index);
                        delta.created.insert(index, issue.key);
                        created_count += 1;
                    }
                    RowOutcome::Failed(error) => {
                        delta.failed.push(index);
                        delta.errors.insert(index, error);
                    }
                }
            }
            self.metrics.add_issues_created(created_count);
        }

        let merged = self.manifests.update(manifest_id, &delta)?;
        self.metrics.inc_bulk_job();
        Ok(CreateOutcome::Bulk(result_from_manifest(merged)))
    }

    /// Builds wire payloads for rows concurrently; per-row failures stay
    /// per-row, and a panicking row converts to a captured failure instead
    /// of poisoning the batch.
    fn build_payloads(
        &self,
        rows: &[(usize, Record)],
    ) -> Vec<(usize, std::result::Result<Value, Error>)> {
        let cursor = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<(usize, std::result::Result<Value, Error>)>>> =
            Mutex::new((0..rows.len()).map(|_| None).collect());
        let workers = rows.len().min(PAYLOAD_BUILD_WORKERS).max(1);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let slot = cursor.fetch_add(1, Ordering::SeqCst);
                    if slot >= rows.len() {
                        break;
                    }
                    let (index, record) = &rows[slot];
                    let outcome = match catch_unwind(AssertUnwindSafe(|| self.build_payload(record)))
                    {
                        Ok(result) => result,
                        Err(panic) => Err(Error::validation(format!(
                            "Unexpected validation failure: {}",
                            panic_message(panic.as_ref())
                        ))),
                    };
                    let mut slots = slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    slots[slot] = Some((*index, outcome));
                });
            }
        });

        slots
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .into_iter()
            .flatten()
            .collect()
    }

    /// Resolves one record into `{"fields": {...}}`.
    fn build_payload(&self, record: &Record) -> Result<Value> {
        let ctx = ConversionContext {
            project_key: "",
            issue_type: "",
            cache: &self.cache,
            http: &self.http,
            config: &self.config,
        };

        let project_entry = record_key(record, "project").ok_or_else(|| {
            Error::validation("Field 'Project' is required for every record")
        })?;
        let project_wire = convert::convert_value(
            &record[project_entry],
            &pseudo_field("project", "Project", FieldType::Project),
            &ctx,
        )?;
        let project_key = project_wire
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::validation("Field 'Project' must resolve to a project key"))?
            .to_string();

        let ctx = ConversionContext {
            project_key: &project_key,
            issue_type: "",
            cache: &self.cache,
            http: &self.http,
            config: &self.config,
        };
        let issue_type_entry = record_key(record, "issue type")
            .or_else(|| record_key(record, "issuetype"))
            .ok_or_else(|| Error::validation("Field 'Issue Type' is required for every record"))?;
        let issue_type_wire = convert::convert_value(
            &record[issue_type_entry],
            &pseudo_field("issuetype", "Issue Type", FieldType::IssueType),
            &ctx,
        )?;
        let issue_type_name = issue_type_wire
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::validation("Field 'Issue Type' must resolve to an issue type name")
            })?
            .to_string();

        let schema = self
            .schema
            .fields_for_issue_type(&project_key, &issue_type_name)?;
        let ctx = ConversionContext {
            project_key: &project_key,
            issue_type: &issue_type_name,
            cache: &self.cache,
            http: &self.http,
            config: &self.config,
        };

        let mut fields = Map::new();
        fields.insert("project".to_string(), project_wire);
        fields.insert("issuetype".to_string(), issue_type_wire);
        let mut virtual_estimates: BTreeMap<String, Value> = BTreeMap::new();

        for (key, value) in record {
            if key.as_str() == project_entry || key.as_str() == issue_type_entry {
                continue;
            }
            let normalized = crate::convert::normalize_lookup(key);
            if normalized == "uid" {
                continue;
            }
            if normalized == "parent" {
                fields.insert("parent".to_string(), parent_wire(value, &schema, &ctx)?);
                continue;
            }

            let field_id = schema.field_id_by_name(key)?.ok_or_else(|| {
                Error::not_found(format!(
                    "No field named '{}' for {}/{}. Use the name shown in Jira or the field id",
                    key, project_key, issue_type_name
                ))
            })?;
            let field = schema
                .field(&field_id)
                .ok_or_else(|| Error::not_found(format!("No field '{field_id}' in the schema")))?;

            let wire = convert::convert_value(value, field, &ctx)?;
            if wire.is_null() {
                continue;
            }
            if field.is_virtual() {
                if let Some(property) = field.schema.system.as_deref().and_then(|s| s.split('.').nth(1)) {
                    virtual_estimates.insert(property.to_string(), wire);
                }
                continue;
            }
            fields.insert(field.id.clone(), wire);
        }

        if !virtual_estimates.is_empty() {
            // Virtual estimate sub-fields overwrite the same property of an
            // explicitly-supplied timetracking object.
            let slot = fields
                .entry("timetracking".to_string())
                .or_insert_with(|| json!({}));
            if let Some(target) = slot.as_object_mut() {
                for (property, value) in virtual_estimates {
                    target.insert(property, value);
                }
            }
        }

        Ok(json!({ "fields": fields }))
    }

    /// POSTs the bulk body and remaps Jira's per-element indices back to
    /// original row indices.
    fn post_bulk(
        &self,
        valid: &[(usize, Value)],
        payloads: &[Value],
    ) -> Result<BTreeMap<usize, RowOutcome>> {
        let body = json!({ "issueUpdates": payloads });
        let response = match self
            .http
            .post_with_timeout("/issue/bulk", &body, self.http.bulk_timeout())
        {
            Ok(response) => response,
            // A fully-rejected bulk still answers per element; the payload
            // arrives attached to the validation error.
            Err(Error::Validation {
                upstream: Some(upstream),
                ..
            }) if upstream.get("errors").is_some() || upstream.get("issues").is_some() => upstream,
            Err(other) => return Err(other),
        };

        let mut element_errors: BTreeMap<usize, RowError> = BTreeMap::new();
        if let Some(errors) = response.get("errors").and_then(Value::as_array) {
            for entry in errors {
                let Some(element) = entry
                    .get("failedElementNumber")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                else {
                    continue;
                };
                let status = entry.get("status").and_then(Value::as_u64).map(|s| s as u16);
                let messages = entry
                    .get("elementErrors")
                    .and_then(|e| e.get("errors"))
                    .and_then(Value::as_object)
                    .map(|map| {
                        map.iter()
                            .map(|(k, v)| {
                                (
                                    k.clone(),
                                    v.as_str().map(ToString::to_string).unwrap_or_else(|| v.to_string()),
                                )
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                element_errors.insert(
                    element,
                    RowError {
                        status,
                        errors: messages,
                    },
                );
            }
        }

        let issues: Vec<&Value> = response
            .get("issues")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().collect())
            .unwrap_or_default();

        let mut outcomes = BTreeMap::new();
        let mut issue_cursor = issues.into_iter();
        for (position, (index, _)) in valid.iter().enumerate() {
            if let Some(error) = element_errors.remove(&position) {
                outcomes.insert(*index, RowOutcome::Failed(error));
                continue;
            }
            match issue_cursor.next().map(created_from) {
                Some(Ok(issue)) => {
                    outcomes.insert(*index, RowOutcome::Created(issue));
                }
                Some(Err(err)) => {
                    outcomes.insert(
                        *index,
                        RowOutcome::Failed(RowError::validation(err.to_string())),
                    );
                }
                None => {
                    outcomes.insert(
                        *index,
                        RowOutcome::Failed(RowError::validation(
                            "Jira's bulk response did not cover this row",
                        )),
                    );
                }
            }
        }
        Ok(outcomes)
    }

    fn start_tracking(
        &self,
        manifest_id: &str,
        payloads: &mut [Value],
        total: usize,
        options: &CreateOptions,
    ) -> Option<(Arc<AtomicBool>, String)> {
        let callback = options.on_progress.clone()?;
        // Disabling marker cleanup disables injection, and without markers
        // there is nothing to poll.
        if !self.config.timeout.cleanup_markers {
            return None;
        }

        let marker = progress::marker_label(manifest_id);
        progress::inject_marker(payloads, &marker);

        let scope = ProgressScope {
            project: common_field(payloads, &["project", "key"]),
            issue_type: common_field(payloads, &["issuetype", "name"]),
            created_since: Some(Utc::now().format("%Y-%m-%d").to_string()),
        };
        let stuck_after = match self.config.timeout.progress_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let stop = Arc::new(AtomicBool::new(false));
        // The poller stops itself on completion or stuck; nobody joins it.
        let _ = progress::start_tracker(
            self.search.clone(),
            marker.clone(),
            scope,
            total,
            Duration::from_secs(self.config.timeout.progress_polling_secs),
            stuck_after,
            callback,
            Arc::clone(&stop),
        );
        Some((stop, marker))
    }

    fn require_durable_cache(&self) -> Result<()> {
        if !self.cache.is_durable() || !self.cache.ping() {
            return Err(Error::configuration(
                "bulk operations need a durable cache for their retry manifest; configure cache.db_path",
            ));
        }
        Ok(())
    }
}

fn pseudo_field(id: &str, name: &str, field_type: FieldType) -> FieldSchema {
    FieldSchema {
        id: id.to_string(),
        name: name.to_string(),
        field_type,
        required: true,
        schema: SchemaInfo::default(),
        allowed_values: Vec::new(),
    }
}

/// `Parent` resolves through the schema when the issue type exposes a parent
/// field; otherwise it is sent as a plain issue-key reference.
fn parent_wire(
    value: &Value,
    schema: &crate::schema::ProjectSchema,
    ctx: &ConversionContext<'_>,
) -> Result<Value> {
    if let Ok(Some(field)) = schema.field_by_name("parent") {
        return convert::convert_value(value, field, ctx);
    }
    match value {
        Value::Object(map) if map.contains_key("key") => Ok(value.clone()),
        Value::String(key) => Ok(json!({ "key": key.trim() })),
        Value::Number(key) => Ok(json!({ "key": key.to_string() })),
        other => Err(Error::validation(format!(
            "Field 'Parent' expects an issue key, got {other}"
        ))),
    }
}

fn strip_key(record: &mut Record, name: &str) {
    if let Some(key) = record_key(record, name).map(str::to_string) {
        record.remove(&key);
    }
}

fn replace_value(record: &mut Record, name: &str, value: Value) {
    if let Some(key) = record_key(record, name).map(str::to_string) {
        record.insert(key, value);
    }
}

fn created_from(value: &Value) -> Result<CreatedIssue> {
    let key = value
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::network("issue create response did not include a key"))?;
    Ok(CreatedIssue {
        id: value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        key: key.to_string(),
        self_url: value
            .get("self")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn row_error_from(err: &Error) -> RowError {
    match err {
        Error::Validation {
            message,
            field_errors,
            ..
        } => {
            if field_errors.is_empty() {
                RowError::validation(message.clone())
            } else {
                RowError {
                    status: Some(400),
                    errors: field_errors.clone(),
                }
            }
        }
        other => RowError::validation(other.to_string()),
    }
}

fn row_error_message(error: &RowError) -> String {
    error
        .errors
        .iter()
        .map(|(field, message)| {
            if field == "validation" || field == "error" {
                message.clone()
            } else {
                format!("{field}: {message}")
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn dry_run_result(
    total: usize,
    built: Vec<(usize, std::result::Result<Value, Error>)>,
) -> BulkResult {
    let mut results: Vec<RowResult> = built
        .into_iter()
        .map(|(index, outcome)| match outcome {
            Ok(payload) => RowResult {
                index,
                success: true,
                key: Some(DRY_RUN_KEY.to_string()),
                error: None,
                payload: Some(payload),
            },
            Err(err) => RowResult {
                index,
                success: false,
                key: None,
                error: Some(err.to_string()),
                payload: None,
            },
        })
        .collect();
    results.sort_by_key(|row| row.index);
    let succeeded = results.iter().filter(|row| row.success).count();
    BulkResult {
        manifest: None,
        total,
        succeeded,
        failed: results.len() - succeeded,
        results,
    }
}

fn result_from_manifest(manifest: BulkManifest) -> BulkResult {
    let mut results = Vec::with_capacity(manifest.total);
    for index in 0..manifest.total {
        if let Some(key) = manifest.created.get(&index) {
            results.push(RowResult {
                index,
                success: true,
                key: Some(key.clone()),
                error: None,
                payload: None,
            });
        } else if let Some(error) = manifest.errors.get(&index) {
            results.push(RowResult {
                index,
                success: false,
                key: None,
                error: Some(row_error_message(error)),
                payload: None,
            });
        } else if manifest.failed.contains(&index) {
            results.push(RowResult {
                index,
                success: false,
                key: None,
                error: Some("row failed without a recorded error".to_string()),
                payload: None,
            });
        } else {
            results.push(RowResult {
                index,
                success: false,
                key: None,
                error: Some("row was never attempted".to_string()),
                payload: None,
            });
        }
    }

    BulkResult {
        total: manifest.total,
        succeeded: manifest.succeeded.len(),
        failed: manifest.failed.len(),
        results,
        manifest: Some(manifest),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "payload build panicked".to_string()
    }
}

/// The shared value of `fields.<path>` across every payload, when uniform.
fn common_field(payloads: &[Value], path: &[&str]) -> Option<String> {
    let mut shared: Option<String> = None;
    for payload in payloads {
        let mut cursor = payload.get("fields")?;
        for segment in path {
            cursor = cursor.get(segment)?;
        }
        let value = cursor.as_str()?.to_string();
        match &shared {
            None => shared = Some(value),
            Some(existing) if *existing == value => {}
            Some(_) => return None,
        }
    }
    shared
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::path::Path;

    use httpmock::Method::{GET, POST, PUT};
    use httpmock::MockServer;

    use super::*;
    use crate::config::ApiVersion;

    fn engine_at(base_url: &str) -> BulkEngine {
        let metrics = Arc::new(Metrics::new());
        let config = Arc::new(Config::new(base_url, "token"));
        let http = Arc::new(
            HttpClient::new(
                base_url,
                "token",
                ApiVersion::V2,
                Duration::from_secs(10),
                Duration::from_secs(30),
                Arc::clone(&metrics),
            )
            .expect("client"),
        );
        let cache = Arc::new(
            Cache::persistent(Path::new(":memory:"), Arc::clone(&metrics)).expect("cache"),
        );
        BulkEngine::new(http, cache, config, metrics)
    }

    fn memory_engine_at(base_url: &str) -> BulkEngine {
        let metrics = Arc::new(Metrics::new());
        let config = Arc::new(Config::new(base_url, "token"));
        let http = Arc::new(
            HttpClient::new(
                base_url,
                "token",
                ApiVersion::V2,
                Duration::from_secs(10),
                Duration::from_secs(30),
                Arc::clone(&metrics),
            )
            .expect("client"),
        );
        let cache = Arc::new(Cache::in_memory(Arc::clone(&metrics)));
        BulkEngine::new(http, cache, config, metrics)
    }

    fn record(value: Value) -> Record {
        value.as_object().expect("object").clone()
    }

    fn mock_eng_project(server: &MockServer) {
        server.mock(|when, then| {
            when.method(GET).path("/rest/api/2/project/ENG");
            then.status(200)
                .json_body_obj(&json!({"id": "1", "key": "ENG", "name": "Engineering"}));
        });
    }

    fn mock_eng_createmeta(server: &MockServer) {
        server.mock(|when, then| {
            when.method(GET)
                .path("/rest/api/2/issue/createmeta/ENG/issuetypes");
            then.status(200).json_body_obj(&json!({
                "values": [
                    {"id": "10001", "name": "Bug"},
                    {"id": "10002", "name": "Task"}
                ]
            }));
        });
        server.mock(|when, then| {
            when.method(GET)
                .path("/rest/api/2/issue/createmeta/ENG/issuetypes/10001");
            then.status(200).json_body_obj(&json!({
                "values": [
                    {
                        "fieldId": "summary",
                        "name": "Summary",
                        "required": true,
                        "schema": {"type": "string", "system": "summary"}
                    },
                    {
                        "fieldId": "priority",
                        "name": "Priority",
                        "required": false,
                        "schema": {"type": "priority", "system": "priority"},
                        "allowedValues": [
                            {"id": "1", "name": "P1 - Critical"},
                            {"id": "3", "name": "Medium"}
                        ]
                    },
                    {
                        "fieldId": "labels",
                        "name": "Labels",
                        "required": false,
                        "schema": {"type": "array", "items": "string", "system": "labels"}
                    },
                    {
                        "fieldId": "timetracking",
                        "name": "Time Tracking",
                        "required": false,
                        "schema": {"type": "timetracking", "system": "timetracking"}
                    }
                ]
            }));
        });
    }

    #[test]
    fn happy_single_record_posts_the_expected_wire_shape() {
        let server = MockServer::start();
        // The friendly project name is not a key, so the direct lookup
        // misses and the full listing resolves it.
        server.mock(|when, then| {
            when.method(GET).path("/rest/api/2/project/Engineering");
            then.status(404)
                .json_body_obj(&json!({"errorMessages": ["No project could be found"]}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/rest/api/2/project");
            then.status(200).json_body_obj(&json!([
                {"id": "1", "key": "ENG", "name": "Engineering"}
            ]));
        });
        mock_eng_createmeta(&server);
        let create = server.mock(|when, then| {
            when.method(POST).path("/rest/api/2/issue").json_body_obj(&json!({
                "fields": {
                    "project": {"key": "ENG"},
                    "issuetype": {"name": "Bug"},
                    "summary": "X",
                    "priority": {"id": "1"}
                }
            }));
            then.status(201).json_body_obj(&json!({
                "id": "10042",
                "key": "ENG-42",
                "self": format!("{}/rest/api/2/issue/10042", server.base_url())
            }));
        });

        let outcome = engine_at(&server.base_url())
            .create(
                CreateInput::Record(record(json!({
                    "Project": "Engineering",
                    "Issue Type": "Bug",
                    "Summary": "X",
                    "Priority": "P1 - Critical"
                }))),
                &CreateOptions::default(),
            )
            .expect("create");

        create.assert();
        let issue = outcome.as_single().expect("single outcome");
        assert_eq!(issue.key, "ENG-42");
        assert_eq!(issue.id, "10042");
    }

    #[test]
    fn dry_run_converts_rows_without_any_post() {
        let server = MockServer::start();
        mock_eng_project(&server);
        mock_eng_createmeta(&server);
        let single_post = server.mock(|when, then| {
            when.method(POST).path("/rest/api/2/issue");
            then.status(201).body("{}");
        });
        let bulk_post = server.mock(|when, then| {
            when.method(POST).path("/rest/api/2/issue/bulk");
            then.status(201).body("{}");
        });

        let engine = engine_at(&server.base_url());
        let single = engine
            .create(
                CreateInput::Record(record(json!({
                    "Project": "ENG", "Issue Type": "Bug", "Summary": "X"
                }))),
                &CreateOptions {
                    validate: true,
                    ..CreateOptions::default()
                },
            )
            .expect("single dry run");
        assert_eq!(single.as_single().expect("single").key, DRY_RUN_KEY);

        let bulk = engine
            .create(
                CreateInput::Records(vec![
                    record(json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "A"})),
                    record(json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "B"})),
                ]),
                &CreateOptions {
                    validate: true,
                    ..CreateOptions::default()
                },
            )
            .expect("bulk dry run");
        let bulk = bulk.as_bulk().expect("bulk");
        assert_eq!(bulk.total, 2);
        assert_eq!(bulk.succeeded, 2);
        assert!(bulk.manifest.is_none());
        assert_eq!(bulk.results[0].key.as_deref(), Some(DRY_RUN_KEY));
        assert_eq!(
            bulk.results[1].payload.as_ref().map(|p| p["fields"]["summary"].clone()),
            Some(json!("B"))
        );

        single_post.assert_hits(0);
        bulk_post.assert_hits(0);
    }

    #[test]
    fn bulk_records_partial_failures_and_remaps_indices() {
        let server = MockServer::start();
        mock_eng_project(&server);
        mock_eng_createmeta(&server);
        // Exactly two payloads, original rows 0 and 2, in row order.
        let bulk = server.mock(|when, then| {
            when.method(POST).path("/rest/api/2/issue/bulk").json_body_obj(&json!({
                "issueUpdates": [
                    {"fields": {"project": {"key": "ENG"}, "issuetype": {"name": "Bug"}, "summary": "First"}},
                    {"fields": {"project": {"key": "ENG"}, "issuetype": {"name": "Bug"}, "summary": "Third"}}
                ]
            }));
            then.status(201).json_body_obj(&json!({
                "issues": [
                    {"id": "1", "key": "ENG-1", "self": ""},
                    {"id": "2", "key": "ENG-2", "self": ""}
                ],
                "errors": []
            }));
        });

        let outcome = engine_at(&server.base_url())
            .create(
                CreateInput::Records(vec![
                    record(json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "First"})),
                    record(json!({"Project": "ENG", "Issue Type": "Bugg", "Summary": "Second"})),
                    record(json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "Third"})),
                ]),
                &CreateOptions::default(),
            )
            .expect("bulk create");

        bulk.assert();
        let result = outcome.as_bulk().expect("bulk outcome");
        assert_eq!(result.total, 3);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed, 1);

        let manifest = result.manifest.as_ref().expect("manifest");
        assert_eq!(manifest.succeeded, vec![0, 2]);
        assert_eq!(manifest.failed, vec![1]);
        assert_eq!(manifest.created.get(&0).map(String::as_str), Some("ENG-1"));
        assert_eq!(manifest.created.get(&2).map(String::as_str), Some("ENG-2"));
        assert!(manifest
            .errors
            .get(&1)
            .and_then(|e| e.errors.get("validation"))
            .is_some_and(|m| m.contains("Bugg")));
        assert!(result.results[1].error.as_deref().is_some_and(|m| m.contains("Bugg")));
    }

    #[test]
    fn server_side_element_failures_remap_to_original_rows() {
        let server = MockServer::start();
        mock_eng_project(&server);
        mock_eng_createmeta(&server);
        server.mock(|when, then| {
            when.method(POST).path("/rest/api/2/issue/bulk");
            then.status(201).json_body_obj(&json!({
                "issues": [
                    {"id": "1", "key": "ENG-1", "self": ""}
                ],
                "errors": [
                    {
                        "status": 400,
                        "failedElementNumber": 1,
                        "elementErrors": {"errors": {"priority": "Priority is required"}}
                    }
                ]
            }));
        });

        // Row 1 fails locally, so the POST carries rows 0 and 2; Jira's
        // element 1 is therefore original row 2.
        let outcome = engine_at(&server.base_url())
            .create(
                CreateInput::Records(vec![
                    record(json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "First"})),
                    record(json!({"Project": "ENG", "Issue Type": "Bugg", "Summary": "Second"})),
                    record(json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "Third"})),
                ]),
                &CreateOptions::default(),
            )
            .expect("bulk create");

        let manifest = outcome.as_bulk().expect("bulk").manifest.clone().expect("manifest");
        assert_eq!(manifest.succeeded, vec![0]);
        assert_eq!(manifest.failed, vec![1, 2]);
        assert_eq!(
            manifest
                .errors
                .get(&2)
                .and_then(|e| e.errors.get("priority"))
                .map(String::as_str),
            Some("Priority is required")
        );
        assert_eq!(manifest.errors.get(&2).and_then(|e| e.status), Some(400));
    }

    #[test]
    fn retry_resends_only_failed_rows_and_merges_the_manifest() {
        let server = MockServer::start();
        mock_eng_project(&server);
        mock_eng_createmeta(&server);
        server.mock(|when, then| {
            when.method(POST).path("/rest/api/2/issue/bulk").json_body_obj(&json!({
                "issueUpdates": [
                    {"fields": {"project": {"key": "ENG"}, "issuetype": {"name": "Bug"}, "summary": "First"}},
                    {"fields": {"project": {"key": "ENG"}, "issuetype": {"name": "Bug"}, "summary": "Third"}}
                ]
            }));
            then.status(201).json_body_obj(&json!({
                "issues": [
                    {"id": "1", "key": "ENG-1", "self": ""},
                    {"id": "2", "key": "ENG-2", "self": ""}
                ]
            }));
        });
        let retry_post = server.mock(|when, then| {
            when.method(POST).path("/rest/api/2/issue/bulk").json_body_obj(&json!({
                "issueUpdates": [
                    {"fields": {"project": {"key": "ENG"}, "issuetype": {"name": "Bug"}, "summary": "Second"}}
                ]
            }));
            then.status(201).json_body_obj(&json!({
                "issues": [
                    {"id": "3", "key": "ENG-3", "self": ""}
                ]
            }));
        });

        let engine = engine_at(&server.base_url());
        let first = engine
            .create(
                CreateInput::Records(vec![
                    record(json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "First"})),
                    record(json!({"Project": "ENG", "Issue Type": "Bugg", "Summary": "Second"})),
                    record(json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "Third"})),
                ]),
                &CreateOptions::default(),
            )
            .expect("first pass");
        let manifest_id = first
            .as_bulk()
            .and_then(|b| b.manifest.as_ref())
            .map(|m| m.id.clone())
            .expect("manifest id");
        let original_timestamp = first
            .as_bulk()
            .and_then(|b| b.manifest.as_ref())
            .map(|m| m.timestamp.clone())
            .expect("timestamp");

        // Same input with the offending row corrected.
        let outcome = engine
            .create(
                CreateInput::Records(vec![
                    record(json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "First"})),
                    record(json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "Second"})),
                    record(json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "Third"})),
                ]),
                &CreateOptions {
                    retry: Some(manifest_id.clone()),
                    ..CreateOptions::default()
                },
            )
            .expect("retry");

        retry_post.assert();
        let result = outcome.as_bulk().expect("bulk");
        let manifest = result.manifest.as_ref().expect("manifest");
        assert_eq!(manifest.id, manifest_id);
        assert_eq!(manifest.timestamp, original_timestamp);
        assert_eq!(manifest.succeeded, vec![0, 1, 2]);
        assert!(manifest.failed.is_empty());
        assert!(manifest.errors.is_empty());
        assert_eq!(manifest.created.get(&1).map(String::as_str), Some("ENG-3"));
        assert_eq!(result.results.len(), 3);
        assert!(result.results.iter().all(|row| row.success));
    }

    #[test]
    fn retry_with_nothing_failed_answers_from_the_manifest() {
        let server = MockServer::start();
        let engine = engine_at(&server.base_url());

        let mut manifest = BulkManifest::new("bulk-done", 2);
        manifest.record_success(0, "ENG-1");
        manifest.record_success(1, "ENG-2");
        engine.manifests.save(&manifest);

        let outcome = engine
            .create(
                CreateInput::Records(vec![
                    record(json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "A"})),
                    record(json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "B"})),
                ]),
                &CreateOptions {
                    retry: Some("bulk-done".to_string()),
                    ..CreateOptions::default()
                },
            )
            .expect("retry");

        let result = outcome.as_bulk().expect("bulk");
        assert_eq!(result.succeeded, 2);
        assert!(result.results.iter().all(|row| row.success));
    }

    #[test]
    fn retry_of_an_unknown_manifest_is_not_found() {
        let server = MockServer::start();
        let err = engine_at(&server.base_url())
            .create(
                CreateInput::Records(vec![record(json!({"Project": "ENG"}))]),
                &CreateOptions {
                    retry: Some("bulk-gone".to_string()),
                    ..CreateOptions::default()
                },
            )
            .expect_err("missing manifest");
        assert_eq!(err.code(), "NOT_FOUND_ERROR");
        assert!(err.to_string().contains("bulk-gone"));
    }

    #[test]
    fn empty_bulk_input_short_circuits_without_api_calls() {
        let result = memory_engine_at("https://jira.invalid")
            .create(CreateInput::Records(Vec::new()), &CreateOptions::default())
            .expect("empty bulk");
        let result = result.as_bulk().expect("bulk");
        assert_eq!(result.total, 0);
        assert_eq!(result.succeeded, 0);
        assert_eq!(result.failed, 0);
        assert!(result.results.is_empty());
        assert!(result.manifest.is_none());
    }

    #[test]
    fn bulk_without_a_durable_cache_is_a_configuration_error() {
        let err = memory_engine_at("https://jira.invalid")
            .create(
                CreateInput::Records(vec![record(
                    json!({"Project": "ENG", "Issue Type": "Bug", "Summary": "A"}),
                )]),
                &CreateOptions::default(),
            )
            .expect_err("memory cache cannot store manifests");
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn all_rows_failing_validation_raises_the_first_error() {
        let server = MockServer::start();
        let err = engine_at(&server.base_url())
            .create(
                CreateInput::Records(vec![
                    record(json!({"Issue Type": "Bug", "Summary": "no project"})),
                    record(json!({"Summary": "also no project"})),
                ]),
                &CreateOptions::default(),
            )
            .expect_err("nothing to send");
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("Project"));
    }

    #[test]
    fn virtual_estimates_merge_into_the_timetracking_object() {
        let server = MockServer::start();
        mock_eng_project(&server);
        mock_eng_createmeta(&server);
        let create = server.mock(|when, then| {
            when.method(POST).path("/rest/api/2/issue").json_body_obj(&json!({
                "fields": {
                    "project": {"key": "ENG"},
                    "issuetype": {"name": "Bug"},
                    "summary": "Estimates",
                    "timetracking": {
                        "originalEstimate": "3d",
                        "remainingEstimate": "1d"
                    }
                }
            }));
            then.status(201)
                .json_body_obj(&json!({"id": "7", "key": "ENG-7", "self": ""}));
        });

        // The virtual sub-field overwrites the object's original estimate.
        engine_at(&server.base_url())
            .create(
                CreateInput::Record(record(json!({
                    "Project": "ENG",
                    "Issue Type": "Bug",
                    "Summary": "Estimates",
                    "Time Tracking": {"originalEstimate": "5d", "remainingEstimate": "1d"},
                    "timetracking.originalEstimate": "3d"
                }))),
                &CreateOptions::default(),
            )
            .expect("create");
        create.assert();
    }

    #[test]
    fn hierarchy_creates_level_by_level_and_resolves_parent_uids() {
        let (addr, bulk_bodies) = spawn_jira_stub();
        let engine = engine_at(&addr);

        let outcome = engine
            .create(
                CreateInput::Records(vec![
                    record(json!({"uid": "e1", "Project": "ENG", "Issue Type": "Task", "Summary": "Epic"})),
                    record(json!({"uid": "t1", "Project": "ENG", "Issue Type": "Task", "Parent": "e1", "Summary": "Task 1"})),
                    record(json!({"uid": "t2", "Project": "ENG", "Issue Type": "Task", "Parent": "e1", "Summary": "Task 2"})),
                    record(json!({"uid": "s1", "Project": "ENG", "Issue Type": "Task", "Parent": "t1", "Summary": "Sub 1"})),
                    record(json!({"uid": "s2", "Project": "ENG", "Issue Type": "Task", "Parent": "t1", "Summary": "Sub 2"})),
                ]),
                &CreateOptions::default(),
            )
            .expect("hierarchical create");

        let result = outcome.as_bulk().expect("bulk");
        let manifest = result.manifest.as_ref().expect("manifest");
        assert!(manifest.id.starts_with("bulk-hier-"));
        assert_eq!(result.succeeded, 5);
        assert_eq!(manifest.uid_map.len(), 5);
        assert_eq!(manifest.uid_map.get("e1").map(String::as_str), Some("ENG-1"));
        assert_eq!(manifest.uid_map.get("t1").map(String::as_str), Some("ENG-2"));

        let bodies = bulk_bodies.lock().expect("lock");
        assert_eq!(bodies.len(), 3, "one POST per level");
        assert_eq!(bodies[0]["issueUpdates"].as_array().map(Vec::len), Some(1));
        assert_eq!(bodies[1]["issueUpdates"].as_array().map(Vec::len), Some(2));
        assert_eq!(bodies[2]["issueUpdates"].as_array().map(Vec::len), Some(2));
        // Level 1 children point at the epic's real key, level 2 at task 1's.
        assert_eq!(
            bodies[1]["issueUpdates"][0]["fields"]["parent"]["key"],
            json!("ENG-1")
        );
        assert_eq!(
            bodies[1]["issueUpdates"][1]["fields"]["parent"]["key"],
            json!("ENG-1")
        );
        assert_eq!(
            bodies[2]["issueUpdates"][0]["fields"]["parent"]["key"],
            json!("ENG-2")
        );
    }

    #[test]
    fn progress_markers_are_injected_and_cleaned_up() {
        let server = MockServer::start();
        mock_eng_project(&server);
        mock_eng_createmeta(&server);
        let bulk = server.mock(|when, then| {
            when.method(POST)
                .path("/rest/api/2/issue/bulk")
                .body_contains("jml-job-bulk-");
            then.status(201).json_body_obj(&json!({
                "issues": [{"id": "1", "key": "ENG-1", "self": ""}]
            }));
        });
        let cleanup = server.mock(|when, then| {
            when.method(PUT)
                .path("/rest/api/2/issue/ENG-1")
                .body_contains("remove");
            then.status(204);
        });
        server.mock(|when, then| {
            when.method(GET).path("/rest/api/2/search");
            then.status(200)
                .json_body_obj(&json!({"total": 1, "issues": []}));
        });

        let outcome = engine_at(&server.base_url())
            .create(
                CreateInput::Records(vec![record(json!({
                    "Project": "ENG",
                    "Issue Type": "Bug",
                    "Summary": "Tracked",
                    "Labels": "user-label"
                }))]),
                &CreateOptions {
                    on_progress: Some(Arc::new(|_| {})),
                    ..CreateOptions::default()
                },
            )
            .expect("create");

        bulk.assert();
        cleanup.assert();
        assert_eq!(outcome.as_bulk().expect("bulk").succeeded, 1);
    }

    #[test]
    fn input_acceptance_rules_classify_loose_values() {
        let bulk = CreateInput::from_value(json!([{"Project": "ENG"}])).expect("array");
        assert!(matches!(bulk, CreateInput::Records(ref r) if r.len() == 1));

        let single =
            CreateInput::from_value(json!({"project": "ENG", "Summary": "x"})).expect("record");
        assert!(matches!(single, CreateInput::Record(_)));

        let parse = CreateInput::from_value(json!({"from": "rows.csv", "format": "csv"}))
            .expect("parser options");
        match parse {
            CreateInput::Parse(request) => {
                assert_eq!(request.from.as_deref(), Some("rows.csv"));
                assert_eq!(request.format, Some(crate::input::InputFormat::Csv));
            }
            other => panic!("expected parser options, got {other:?}"),
        }

        assert!(CreateInput::from_value(json!("nope")).is_err());
        assert!(CreateInput::from_value(json!([1])).is_err());
    }

    /// Scripted Jira stub for multi-POST flows httpmock cannot sequence:
    /// answers project and createmeta reads, and fabricates `ENG-<n>` keys
    /// for each bulk payload while recording the bodies.
    fn spawn_jira_stub() -> (String, Arc<Mutex<Vec<Value>>>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("server start");
        let addr = format!("http://{}", server.server_addr());
        let bulk_bodies: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&bulk_bodies);

        std::thread::spawn(move || {
            let mut issue_counter = 0usize;
            for mut request in server.incoming_requests() {
                let url = request.url().to_string();
                let body = if url.starts_with("/rest/api/2/project/ENG") {
                    json!({"id": "1", "key": "ENG", "name": "Engineering"})
                } else if url.contains("/issuetypes/10002") {
                    json!({
                        "values": [
                            {
                                "fieldId": "summary",
                                "name": "Summary",
                                "required": true,
                                "schema": {"type": "string", "system": "summary"}
                            }
                        ]
                    })
                } else if url.contains("/issue/createmeta/ENG/issuetypes") {
                    json!({"values": [{"id": "10002", "name": "Task"}]})
                } else if url.starts_with("/rest/api/2/issue/bulk") {
                    let mut raw = String::new();
                    let _ = request.as_reader().read_to_string(&mut raw);
                    let parsed: Value = serde_json::from_str(&raw).unwrap_or_else(|_| json!({}));
                    let count = parsed["issueUpdates"].as_array().map(Vec::len).unwrap_or(0);
                    recorded.lock().expect("lock").push(parsed);
                    let issues: Vec<Value> = (0..count)
                        .map(|_| {
                            issue_counter += 1;
                            json!({
                                "id": issue_counter.to_string(),
                                "key": format!("ENG-{issue_counter}"),
                                "self": ""
                            })
                        })
                        .collect();
                    json!({"issues": issues, "errors": []})
                } else {
                    json!({})
                };

                let response = tiny_http::Response::from_string(body.to_string()).with_header(
                    tiny_http::Header::from_bytes("Content-Type", "application/json")
                        .expect("header"),
                );
                let _ = request.respond(response);
            }
        });

        (addr, bulk_bodies)
    }
}
