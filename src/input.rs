use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use unicode_normalization::UnicodeNormalization;

use crate::convert::sanitize_text;
use crate::error::{Error, Result};

/// One input row: friendly field names mapped to raw values.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    Csv,
    Json,
    Yaml,
}

impl InputFormat {
    fn from_extension(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "csv" => Some(InputFormat::Csv),
            "json" => Some(InputFormat::Json),
            "yaml" | "yml" => Some(InputFormat::Yaml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
/// What to parse: either a file path or already-loaded data.
pub struct ParseRequest {
    pub from: Option<String>,
    pub data: Option<Value>,
    pub format: Option<InputFormat>,
    /// Straightens curly quotes before CSV parsing.
    pub preprocess_quotes: bool,
    /// Collapses `<<<...>>>` blocks into quoted CSV cells.
    pub preprocess_custom_blocks: bool,
}

impl Default for ParseRequest {
    fn default() -> Self {
        Self {
            from: None,
            data: None,
            format: None,
            preprocess_quotes: true,
            preprocess_custom_blocks: true,
        }
    }
}

impl ParseRequest {
    pub fn from_file(path: impl Into<String>) -> Self {
        Self {
            from: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn from_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedInput {
    pub data: Vec<Record>,
    pub format: Option<InputFormat>,
    pub source: String,
}

/// Turns bytes-plus-format into sanitized records: keys are NFKC-normalized
/// and trimmed, string values lose zero-width characters and surrounding
/// whitespace.
///
/// # Errors
/// Returns [`Error::FileNotFound`] for a missing `from` path and
/// [`Error::InputParse`] for malformed or unrecognizable content.
pub fn parse(request: &ParseRequest) -> Result<ParsedInput> {
    if let Some(data) = &request.data {
        return Ok(ParsedInput {
            data: records_from_value(data)?,
            format: request.format,
            source: "inline".to_string(),
        });
    }

    let Some(from) = &request.from else {
        return Err(Error::input_parse(
            "either 'from' (a file path) or 'data' (records) is required",
        ));
    };

    let path = Path::new(from);
    let format = request
        .format
        .or_else(|| InputFormat::from_extension(path))
        .ok_or_else(|| {
            Error::input_parse(format!(
                "cannot infer input format of '{from}'; pass format csv, json, or yaml"
            ))
        })?;

    let raw = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::FileNotFound { path: from.clone() }
        } else {
            Error::input_parse(format!("failed to read '{from}': {source}"))
        }
    })?;

    let data = match format {
        InputFormat::Json => {
            let value: Value = serde_json::from_str(&raw)
                .map_err(|err| Error::input_parse(format!("invalid JSON in '{from}': {err}")))?;
            records_from_value(&value)?
        }
        InputFormat::Yaml => {
            let value: serde_yaml::Value = serde_yaml::from_str(&raw)
                .map_err(|err| Error::input_parse(format!("invalid YAML in '{from}': {err}")))?;
            let value = serde_json::to_value(value)
                .map_err(|err| Error::input_parse(format!("invalid YAML in '{from}': {err}")))?;
            records_from_value(&value)?
        }
        InputFormat::Csv => parse_csv(&raw, request)?,
    };

    Ok(ParsedInput {
        data,
        format: Some(format),
        source: from.clone(),
    })
}

fn records_from_value(value: &Value) -> Result<Vec<Record>> {
    match value {
        Value::Array(entries) => entries
            .iter()
            .map(|entry| {
                entry
                    .as_object()
                    .map(sanitize_record)
                    .ok_or_else(|| Error::input_parse("every input row must be an object"))
            })
            .collect(),
        Value::Object(record) => Ok(vec![sanitize_record(record)]),
        _ => Err(Error::input_parse(
            "input data must be a record or an array of records",
        )),
    }
}

fn sanitize_record(record: &Map<String, Value>) -> Record {
    record
        .iter()
        .map(|(key, value)| {
            let key = sanitize_text(key).nfkc().collect::<String>();
            let value = match value {
                Value::String(s) => Value::String(sanitize_text(s)),
                other => other.clone(),
            };
            (key, value)
        })
        .collect()
}

fn parse_csv(raw: &str, request: &ParseRequest) -> Result<Vec<Record>> {
    let mut text = raw.to_string();
    if request.preprocess_quotes {
        text = straighten_quotes(&text);
    }
    if request.preprocess_custom_blocks {
        text = collapse_custom_blocks(&text);
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| Error::input_parse(format!("invalid CSV header: {err}")))?
        .iter()
        .map(|h| sanitize_text(h).nfkc().collect::<String>())
        .collect();

    let mut records = Vec::new();
    for (row_number, row) in reader.records().enumerate() {
        let row = row.map_err(|err| {
            Error::input_parse(format!("invalid CSV row {}: {}", row_number + 2, err))
        })?;

        let mut record = Record::new();
        for (header, cell) in headers.iter().zip(row.iter()) {
            let cell = sanitize_text(cell);
            // Empty cells are omitted so optional fields stay absent.
            if !cell.is_empty() && !header.is_empty() {
                record.insert(header.clone(), Value::String(cell));
            }
        }
        if !record.is_empty() {
            records.push(record);
        }
    }
    Ok(records)
}

fn straighten_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201c}' | '\u{201d}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect()
}

/// Rewrites `<<<...>>>` blocks as quoted CSV cells so their content may span
/// lines and contain commas.
fn collapse_custom_blocks(text: &str) -> String {
    static BLOCK: OnceLock<Regex> = OnceLock::new();
    let pattern = BLOCK.get_or_init(|| Regex::new(r"(?s)<<<(.*?)>>>").expect("static pattern"));
    pattern
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let inner = caps[1].trim().replace('"', "\"\"");
            format!("\"{inner}\"")
        })
        .into_owned()
}
