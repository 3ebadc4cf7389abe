use std::path::PathBuf;

use record_analytics_core::{
    analyze, build_dashboard, AnalysisResult, ChartData, DashboardStats, EngineError, Record,
    RecordId, RecordInput, DEFAULT_OPERATION,
};
use record_analytics_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Invalid(EngineError),
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("processing failed: {0}")]
    Processing(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardView {
    pub stats: DashboardStats,
    pub chart: ChartData,
    pub chart_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResult {
    pub id: RecordId,
    pub deleted: bool,
}

/// Entry point for collaborators: every call opens its own store connection and
/// works on a fresh snapshot.
#[derive(Debug, Clone)]
pub struct RecordAnalyticsApi {
    db_path: PathBuf,
}

impl RecordAnalyticsApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> anyhow::Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> anyhow::Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    fn snapshot(&self) -> anyhow::Result<Vec<Record>> {
        let records = self.open_migrated_store()?.list_records()?;
        tracing::debug!(records = records.len(), "loaded record snapshot");
        Ok(records)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> ApiResult<SchemaStatus> {
        let store = self.open_store()?;
        Ok(store.schema_status()?)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> ApiResult<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        tracing::info!(
            from = before.current_version,
            to = after.current_version,
            "schema migrated"
        );
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity probe fails.
    pub fn integrity_check(&self) -> ApiResult<IntegrityReport> {
        let store = self.open_store()?;
        Ok(store.integrity_check()?)
    }

    /// # Errors
    /// Returns [`ApiError::Storage`] when the snapshot cannot be loaded.
    pub fn list_records(&self) -> ApiResult<Vec<Record>> {
        Ok(self.snapshot()?)
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] for an unknown id.
    pub fn get_record(&self, id: RecordId) -> ApiResult<Record> {
        let store = self.open_migrated_store()?;
        store.get_record(id)?.ok_or(ApiError::NotFound(id))
    }

    /// Validate and persist one new record.
    ///
    /// # Errors
    /// Returns [`ApiError::Invalid`] when the input fails validation, or
    /// [`ApiError::Storage`] when persistence fails.
    pub fn create_record(&self, input: RecordInput) -> ApiResult<Record> {
        input.validate().map_err(ApiError::Invalid)?;
        let mut store = self.open_migrated_store()?;
        let record = store.insert_record(&input)?;
        tracing::info!(id = record.id, category = %record.category, "record created");
        Ok(record)
    }

    /// Replace all fields of an existing record.
    ///
    /// # Errors
    /// Returns [`ApiError::Invalid`], [`ApiError::NotFound`], or [`ApiError::Storage`].
    pub fn update_record(&self, id: RecordId, input: RecordInput) -> ApiResult<Record> {
        input.validate().map_err(ApiError::Invalid)?;
        let mut store = self.open_migrated_store()?;
        let record = store.update_record(id, &input)?.ok_or(ApiError::NotFound(id))?;
        tracing::info!(id, "record updated");
        Ok(record)
    }

    /// # Errors
    /// Returns [`ApiError::NotFound`] for an unknown id.
    pub fn delete_record(&self, id: RecordId) -> ApiResult<DeleteResult> {
        let mut store = self.open_migrated_store()?;
        if !store.delete_record(id)? {
            return Err(ApiError::NotFound(id));
        }
        tracing::info!(id, "record deleted");
        Ok(DeleteResult { id, deleted: true })
    }

    /// Summary statistics and chart distribution for the current snapshot.
    ///
    /// # Errors
    /// Returns [`ApiError::Storage`] when the snapshot cannot be loaded.
    pub fn dashboard(&self) -> ApiResult<DashboardView> {
        let records = self.snapshot()?;
        let dashboard = build_dashboard(&records);
        let chart_json =
            dashboard.chart.to_json().map_err(|err| ApiError::Processing(err.to_string()))?;
        Ok(DashboardView { stats: dashboard.stats, chart: dashboard.chart, chart_json })
    }

    /// Run one tabular transformation over the current snapshot.
    ///
    /// # Errors
    /// Every failure, including failing to load the snapshot, is reported as
    /// [`ApiError::Processing`] and no partial table is returned.
    pub fn analyze(&self, request: &AnalyzeRequest) -> ApiResult<AnalysisResult> {
        let selector = request.operation.as_deref().unwrap_or(DEFAULT_OPERATION);
        self.run_analysis(selector).map_err(|err| {
            tracing::error!(operation = selector, error = %format!("{err:#}"), "analysis failed");
            ApiError::Processing(format!("{err:#}"))
        })
    }

    fn run_analysis(&self, selector: &str) -> anyhow::Result<AnalysisResult> {
        let records = self.snapshot()?;
        let result = analyze(&records, Some(selector))?;
        tracing::debug!(
            operation = result.operation.as_str(),
            label = %result.label,
            "analysis complete"
        );
        Ok(result)
    }
}
