use std::collections::HashMap;

use serde_json::Value;

use crate::convert::normalize_lookup;
use crate::error::{Error, Result};
use crate::input::Record;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Rows grouped by creation depth: parents at `depth` are created before
/// their children at `depth + 1`.
pub struct HierarchyLevel {
    pub depth: usize,
    pub indices: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
/// Result of scanning input rows for user-assigned UIDs and parent
/// references.
pub struct HierarchyPlan {
    pub has_hierarchy: bool,
    pub levels: Vec<HierarchyLevel>,
    /// Row index to its declared UID.
    pub uid_of: HashMap<usize, String>,
    /// Row index to the UID its `Parent` references. Parents that do not
    /// match a known UID are left alone and treated as existing Jira keys.
    pub parent_uid_of: HashMap<usize, String>,
}

/// Finds a key in a record by case-insensitive name.
pub fn record_key<'a>(record: &'a Record, name: &str) -> Option<&'a str> {
    let wanted = normalize_lookup(name);
    record
        .keys()
        .find(|key| normalize_lookup(key) == wanted)
        .map(String::as_str)
}

/// Scans rows for `uid` fields and orders them into creation levels.
///
/// # Errors
/// Returns [`Error::Validation`] for empty or mistyped UIDs, duplicate UIDs
/// (naming both rows), and parent cycles.
pub fn analyze(records: &[Record]) -> Result<HierarchyPlan> {
    let mut plan = HierarchyPlan::default();
    let mut index_of_uid: HashMap<String, usize> = HashMap::new();

    for (index, record) in records.iter().enumerate() {
        let Some(key) = record_key(record, "uid") else {
            continue;
        };
        let Some(uid) = coerce_uid(&record[key], index)? else {
            continue;
        };
        if let Some(&existing) = index_of_uid.get(&uid) {
            return Err(Error::validation(format!(
                "Duplicate uid '{}' at rows {} and {}",
                uid, existing, index
            )));
        }
        index_of_uid.insert(uid.clone(), index);
        plan.uid_of.insert(index, uid);
    }

    if plan.uid_of.is_empty() {
        return Ok(plan);
    }
    plan.has_hierarchy = true;

    for (index, record) in records.iter().enumerate() {
        let Some(key) = record_key(record, "parent") else {
            continue;
        };
        let reference = match &record[key] {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        if index_of_uid.contains_key(&reference) {
            plan.parent_uid_of.insert(index, reference);
        }
    }

    let mut depth_of: HashMap<usize, usize> = HashMap::new();
    for index in 0..records.len() {
        if !plan.parent_uid_of.contains_key(&index) {
            depth_of.insert(index, 0);
        }
    }

    loop {
        let mut progressed = false;
        for (index, parent_uid) in &plan.parent_uid_of {
            if depth_of.contains_key(index) {
                continue;
            }
            let parent_index = index_of_uid[parent_uid];
            if let Some(&parent_depth) = depth_of.get(&parent_index) {
                depth_of.insert(*index, parent_depth + 1);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    if depth_of.len() != records.len() {
        let mut unresolved: Vec<usize> = (0..records.len())
            .filter(|index| !depth_of.contains_key(index))
            .collect();
        unresolved.sort_unstable();
        return Err(Error::validation(format!(
            "Hierarchy contains a parent cycle involving rows {:?}",
            unresolved
        )));
    }

    let max_depth = depth_of.values().copied().max().unwrap_or(0);
    for depth in 0..=max_depth {
        let mut indices: Vec<usize> = depth_of
            .iter()
            .filter(|(_, d)| **d == depth)
            .map(|(index, _)| *index)
            .collect();
        indices.sort_unstable();
        plan.levels.push(HierarchyLevel { depth, indices });
    }

    Ok(plan)
}

fn coerce_uid(value: &Value, index: usize) -> Result<Option<String>> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Err(Error::validation(format!(
                    "uid at row {} must be a non-empty string",
                    index
                )));
            }
            Ok(Some(trimmed.to_string()))
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Null => Ok(None),
        other => Err(Error::validation(format!(
            "uid at row {} must be a string, got {}",
            index, other
        ))),
    }
}
