use serde_json::Value;

use crate::bulk::{BulkEngine, CreateInput, CreateOptions, CreateOutcome};
use crate::error::Result;
use crate::search::{SearchRequest, SearchResult, SearchService};

/// Issue operations exposed by a connected [`crate::Jml`] handle.
#[derive(Debug, Clone)]
pub struct Issues {
    engine: BulkEngine,
    search: SearchService,
}

impl Issues {
    pub(crate) fn new(engine: BulkEngine, search: SearchService) -> Self {
        Self { engine, search }
    }

    /// Creates one issue, a bulk batch, or a parsed file of issues.
    ///
    /// # Errors
    /// Per-row failures land in the returned manifest; only whole-operation
    /// faults raise. See [`BulkEngine::create`].
    pub fn create(
        &self,
        input: impl Into<CreateInput>,
        options: &CreateOptions,
    ) -> Result<CreateOutcome> {
        self.engine.create(input.into(), options)
    }

    /// [`Issues::create`] for callers holding loose JSON; the input shape is
    /// classified by the acceptance rules.
    ///
    /// # Errors
    /// As [`Issues::create`], plus shape validation of the value itself.
    pub fn create_value(&self, value: Value, options: &CreateOptions) -> Result<CreateOutcome> {
        self.engine.create(CreateInput::from_value(value)?, options)
    }

    /// Searches issues by raw JQL or object criteria.
    ///
    /// # Errors
    /// Returns JQL-build failures and HTTP-mapped errors.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResult> {
        self.search.search(request)
    }
}
