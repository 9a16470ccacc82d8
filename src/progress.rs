use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

use crate::http::HttpClient;
use crate::logging;
use crate::search::{SearchRequest, SearchService};

#[derive(Debug, Clone, PartialEq, Eq)]
/// One polling observation of a bulk job's completion state.
pub struct ProgressReport {
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub progress_made: bool,
    pub time_since_progress: Duration,
    pub is_stuck: bool,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressReport) + Send + Sync>;

/// Synthesized label identifying every issue of one bulk job.
pub fn marker_label(job_id: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("jml-job-{job_id}-{ts}")
}

/// Adds the marker to each payload's `labels` array, preserving any labels
/// the caller supplied.
pub fn inject_marker(payloads: &mut [Value], marker: &str) {
    for payload in payloads {
        let Some(fields) = payload.get_mut("fields").and_then(Value::as_object_mut) else {
            continue;
        };
        match fields.get_mut("labels") {
            Some(Value::Array(labels)) => {
                labels.push(json!(marker));
            }
            _ => {
                fields.insert("labels".to_string(), json!([marker]));
            }
        }
    }
}

#[derive(Debug, Clone)]
/// Scope hints narrowing the polling search when the job is uniform.
pub struct ProgressScope {
    pub project: Option<String>,
    pub issue_type: Option<String>,
    /// ISO date of the job start; excludes older issues wearing a recycled
    /// label.
    pub created_since: Option<String>,
}

/// Spawns the poller thread; it stops on its own when the job completes,
/// when it is declared stuck, or when `stop` is raised by the bulk engine.
/// `stuck_after = None` disables stuck detection.
pub fn start_tracker(
    search: SearchService,
    marker: String,
    scope: ProgressScope,
    total: usize,
    polling: Duration,
    stuck_after: Option<Duration>,
    callback: ProgressCallback,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut completed = 0usize;
        let mut last_progress = Instant::now();

        loop {
            std::thread::sleep(polling);
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let mut criteria = Map::new();
            criteria.insert("labels".to_string(), json!([marker.clone()]));
            if let Some(project) = &scope.project {
                criteria.insert("project".to_string(), json!(project));
            }
            if let Some(issue_type) = &scope.issue_type {
                criteria.insert("issuetype".to_string(), json!(issue_type));
            }
            let mut request = SearchRequest::with_criteria(criteria);
            request.created_since = scope.created_since.clone();

            let counted = match search.count(&request) {
                Ok(counted) => counted,
                Err(err) => {
                    logging::warn(format!("progress poll for {marker} failed: {err}"));
                    continue;
                }
            };

            let progress_made = counted > completed;
            if progress_made {
                completed = counted;
                last_progress = Instant::now();
            }
            let time_since_progress = last_progress.elapsed();
            let is_stuck = stuck_after.is_some_and(|limit| time_since_progress > limit);

            callback(ProgressReport {
                total,
                completed,
                in_progress: total.saturating_sub(completed),
                progress_made,
                time_since_progress,
                is_stuck,
            });

            if completed >= total || is_stuck {
                break;
            }
        }
    })
}

/// Removes the marker label from each created issue. Individual failures are
/// logged and swallowed; markers left behind are cosmetic.
pub fn cleanup_markers(http: &HttpClient, issue_keys: &[String], marker: &str) {
    let body = json!({
        "update": {
            "labels": [{"remove": marker}]
        }
    });
    for key in issue_keys {
        if let Err(err) = http.put(&format!("/issue/{key}"), &body) {
            logging::warn(format!("failed to remove marker {marker} from {key}: {err}"));
        }
    }
}
