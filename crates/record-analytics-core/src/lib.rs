use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub const DEFAULT_OPERATION: &str = "raw_data";
pub const MAX_NAME_CHARS: usize = 100;
pub const MAX_CATEGORY_CHARS: usize = 50;

pub const NO_DATA_MESSAGE: &str = "No data available";
pub const NOTHING_TO_GROUP_MESSAGE: &str = "No data to group";
pub const NOTHING_ABOVE_AVERAGE_MESSAGE: &str = "No records exceed the average";

const TABLE_CLASSES: &str = "table table-striped";
const RECORD_COLUMNS: [&str; 4] = ["id", "name", "value", "category"];
const SCIENTIFIC_LOWER_BOUND: f64 = 1e-4;
const SCIENTIFIC_UPPER_BOUND: f64 = 1e16;
const SUMMARY_STATISTICS: [&str; 8] = ["count", "mean", "std", "min", "25%", "50%", "75%", "max"];

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("computation error: {0}")]
    Computation(String),
}

pub type RecordId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub name: String,
    pub value: f64,
    pub category: String,
}

/// Client-supplied fields of a record; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordInput {
    pub name: String,
    pub value: f64,
    pub category: String,
}

impl RecordInput {
    /// Check the input against the record model before it is persisted.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when `value` is not finite or a text field
    /// exceeds its column width.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.value.is_finite() {
            return Err(EngineError::Validation(format!(
                "value MUST be a finite number, got {}",
                self.value
            )));
        }

        let name_chars = self.name.chars().count();
        if name_chars > MAX_NAME_CHARS {
            return Err(EngineError::Validation(format!(
                "name MUST be at most {MAX_NAME_CHARS} characters, got {name_chars}"
            )));
        }

        let category_chars = self.category.chars().count();
        if category_chars > MAX_CATEGORY_CHARS {
            return Err(EngineError::Validation(format!(
                "category MUST be at most {MAX_CATEGORY_CHARS} characters, got {category_chars}"
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn into_record(self, id: RecordId) -> Record {
        Record { id, name: self.name, value: self.value, category: self.category }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DashboardStats {
    pub total_records: u64,
    pub average_value: f64,
    pub max_value: f64,
    pub min_value: f64,
    pub categories: BTreeMap<String, u64>,
}

/// Category distribution as parallel sequences: `values[i]` is the count of `labels[i]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChartData {
    pub labels: Vec<String>,
    pub values: Vec<u64>,
}

impl ChartData {
    /// Order is descending count, then ascending label.
    #[must_use]
    pub fn from_counts(counts: &BTreeMap<String, u64>) -> Self {
        let mut ordered = counts.iter().collect::<Vec<_>>();
        ordered.sort_by(|(left_label, left_count), (right_label, right_count)| {
            right_count.cmp(left_count).then_with(|| left_label.cmp(right_label))
        });

        let (labels, values): (Vec<String>, Vec<u64>) =
            ordered.into_iter().map(|(label, count)| (label.clone(), *count)).unzip();
        Self { labels, values }
    }

    /// Compact JSON text for embedding in a rendering layer.
    ///
    /// # Errors
    /// Returns [`EngineError::Computation`] if serialization fails.
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string(self)
            .map_err(|err| EngineError::Computation(format!("failed to encode chart data: {err}")))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Dashboard {
    pub stats: DashboardStats,
    pub chart: ChartData,
}

#[must_use]
pub fn category_counts(records: &[Record]) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.category.clone()).or_insert(0_u64) += 1;
    }
    counts
}

/// Count, mean, max and min of `value` plus per-category counts.
///
/// An empty snapshot yields zeroed statistics rather than an error.
#[must_use]
pub fn compute_summary_stats(records: &[Record]) -> DashboardStats {
    if records.is_empty() {
        return DashboardStats::default();
    }

    let values = record_values(records);
    DashboardStats {
        total_records: u64::try_from(records.len()).unwrap_or(u64::MAX),
        average_value: mean(&values).unwrap_or(0.0),
        max_value: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        min_value: values.iter().copied().fold(f64::INFINITY, f64::min),
        categories: category_counts(records),
    }
}

#[must_use]
pub fn compute_chart_data(records: &[Record]) -> ChartData {
    ChartData::from_counts(&category_counts(records))
}

/// Statistics and chart distribution derived from the same snapshot.
#[must_use]
pub fn build_dashboard(records: &[Record]) -> Dashboard {
    let stats = compute_summary_stats(records);
    let chart = ChartData::from_counts(&stats.categories);
    Dashboard { stats, chart }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    RawData,
    Summary,
    Groupby,
    Filter,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RawData => "raw_data",
            Self::Summary => "summary",
            Self::Groupby => "groupby",
            Self::Filter => "filter",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "raw_data" => Some(Self::RawData),
            "summary" => Some(Self::Summary),
            "groupby" => Some(Self::Groupby),
            "filter" => Some(Self::Filter),
            _ => None,
        }
    }

    /// Resolve a selector; anything unrecognized falls back to [`Operation::RawData`].
    #[must_use]
    pub fn from_selector(selector: &str) -> Self {
        Self::parse(selector).unwrap_or(Self::RawData)
    }
}

/// Display label for a selector: underscores become spaces and every word is
/// title-cased, so `raw_data` becomes `Raw Data`.
///
/// A word is a run of cased characters; digits and other uncased characters end
/// it. The first character takes the leading character of its uppercase mapping
/// followed by the lowercase of the rest (`ß` becomes `Ss`). Characters with a
/// distinct titlecase form, such as `ǆ`, use their uppercase form instead.
#[must_use]
pub fn operation_label(selector: &str) -> String {
    let mut label = String::with_capacity(selector.len());
    let mut inside_word = false;

    for ch in selector.chars() {
        let ch = if ch == '_' { ' ' } else { ch };
        if !is_cased(ch) {
            label.push(ch);
            inside_word = false;
        } else if inside_word {
            label.extend(ch.to_lowercase());
        } else {
            let mut upper = ch.to_uppercase();
            label.extend(upper.next());
            label.extend(upper.flat_map(char::to_lowercase));
            inside_word = true;
        }
    }

    label
}

fn is_cased(ch: char) -> bool {
    ch.is_lowercase() || ch.is_uppercase()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Cell {
    Integer(i64),
    Number(f64),
    Text(String),
    Missing,
}

impl Cell {
    fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer(_) | Self::Number(_) | Self::Missing)
    }
}

impl From<Option<f64>> for Cell {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Self::Missing, Self::Number)
    }
}

impl Display for Cell {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Number(value) => f.write_str(&format_number(*value)),
            Self::Text(value) => f.write_str(value),
            Self::Missing => f.write_str("NaN"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    #[must_use]
    pub fn with_columns(columns: &[&str]) -> Self {
        Self { columns: columns.iter().map(ToString::to_string).collect(), rows: Vec::new() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    #[must_use]
    pub fn to_html(&self) -> String {
        let mut html = format!("<table class=\"{TABLE_CLASSES}\">\n  <thead>\n    <tr>");
        for column in &self.columns {
            html.push_str("<th>");
            html.push_str(&escape_html(column));
            html.push_str("</th>");
        }
        html.push_str("</tr>\n  </thead>\n  <tbody>\n");
        for row in &self.rows {
            html.push_str("    <tr>");
            for cell in row {
                html.push_str("<td>");
                html.push_str(&escape_html(&cell.to_string()));
                html.push_str("</td>");
            }
            html.push_str("</tr>\n");
        }
        html.push_str("  </tbody>\n</table>");
        html
    }

    /// Fixed-width rendering; numeric cells are right-aligned.
    #[must_use]
    pub fn to_text(&self) -> String {
        let rendered = self
            .rows
            .iter()
            .map(|row| row.iter().map(ToString::to_string).collect::<Vec<_>>())
            .collect::<Vec<_>>();

        let mut widths =
            self.columns.iter().map(|column| column.chars().count()).collect::<Vec<_>>();
        for row in &rendered {
            for (index, text) in row.iter().enumerate() {
                if let Some(width) = widths.get_mut(index) {
                    *width = (*width).max(text.chars().count());
                }
            }
        }

        let mut lines = Vec::with_capacity(self.rows.len() + 2);
        let header = self
            .columns
            .iter()
            .zip(&widths)
            .map(|(column, width)| format!("{column:<width$}"))
            .collect::<Vec<_>>();
        lines.push(header.join("  ").trim_end().to_string());
        lines.push(widths.iter().map(|width| "-".repeat(*width)).collect::<Vec<_>>().join("  "));

        for (cells, texts) in self.rows.iter().zip(&rendered) {
            let line = cells
                .iter()
                .zip(texts)
                .zip(&widths)
                .map(|((cell, text), width)| {
                    if cell.is_numeric() {
                        format!("{text:>width$}")
                    } else {
                        format!("{text:<width$}")
                    }
                })
                .collect::<Vec<_>>();
            lines.push(line.join("  ").trim_end().to_string());
        }

        lines.join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisOutput {
    Table(Table),
    Placeholder { message: String },
}

impl AnalysisOutput {
    fn placeholder(message: &str) -> Self {
        Self::Placeholder { message: message.to_string() }
    }

    #[must_use]
    pub fn table(&self) -> Option<&Table> {
        match self {
            Self::Table(table) => Some(table),
            Self::Placeholder { .. } => None,
        }
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder { .. })
    }

    #[must_use]
    pub fn to_html(&self) -> String {
        match self {
            Self::Table(table) => table.to_html(),
            Self::Placeholder { message } => format!("<p>{}</p>", escape_html(message)),
        }
    }

    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Table(table) => table.to_text(),
            Self::Placeholder { message } => message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub operation: Operation,
    pub label: String,
    pub output: AnalysisOutput,
    pub html: String,
}

/// Run one tabular transformation over a snapshot.
///
/// `selector` defaults to [`DEFAULT_OPERATION`]; unrecognized selectors behave like
/// `raw_data` but keep their own label.
///
/// # Errors
/// Returns [`EngineError::Computation`] when a record carries a non-finite value.
pub fn analyze(records: &[Record], selector: Option<&str>) -> Result<AnalysisResult, EngineError> {
    let selector = selector.unwrap_or(DEFAULT_OPERATION);
    let operation = Operation::from_selector(selector);
    ensure_finite_values(records)?;

    let output = match operation {
        Operation::RawData => raw_data_output(records),
        Operation::Summary => AnalysisOutput::Table(summary_table(records)),
        Operation::Groupby => groupby_output(records),
        Operation::Filter => filter_output(records),
    };
    let html = output.to_html();

    Ok(AnalysisResult { operation, label: operation_label(selector), output, html })
}

fn ensure_finite_values(records: &[Record]) -> Result<(), EngineError> {
    match records.iter().find(|record| !record.value.is_finite()) {
        Some(record) => Err(EngineError::Computation(format!(
            "record {} has non-numeric value {}",
            record.id, record.value
        ))),
        None => Ok(()),
    }
}

fn record_row(record: &Record) -> Vec<Cell> {
    vec![
        Cell::Integer(record.id),
        Cell::Text(record.name.clone()),
        Cell::Number(record.value),
        Cell::Text(record.category.clone()),
    ]
}

fn raw_data_output(records: &[Record]) -> AnalysisOutput {
    if records.is_empty() {
        return AnalysisOutput::placeholder(NO_DATA_MESSAGE);
    }

    let mut table = Table::with_columns(&RECORD_COLUMNS);
    table.rows.extend(records.iter().map(record_row));
    AnalysisOutput::Table(table)
}

/// Descriptive statistics for one numeric column. Fields other than `count` are
/// `None` when the column has too few observations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnSummary {
    pub count: usize,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub p25: Option<f64>,
    pub p50: Option<f64>,
    pub p75: Option<f64>,
    pub max: Option<f64>,
}

impl ColumnSummary {
    #[must_use]
    pub fn describe(values: &[f64]) -> Self {
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        Self {
            count: sorted.len(),
            mean: mean(&sorted),
            std: sample_std_dev(&sorted),
            min: sorted.first().copied(),
            p25: quantile(&sorted, 0.25),
            p50: quantile(&sorted, 0.5),
            p75: quantile(&sorted, 0.75),
            max: sorted.last().copied(),
        }
    }

    fn cell(&self, statistic: &str) -> Cell {
        match statistic {
            "count" => Cell::Integer(i64::try_from(self.count).unwrap_or(i64::MAX)),
            "mean" => self.mean.into(),
            "std" => self.std.into(),
            "min" => self.min.into(),
            "25%" => self.p25.into(),
            "50%" => self.p50.into(),
            "75%" => self.p75.into(),
            "max" => self.max.into(),
            _ => Cell::Missing,
        }
    }
}

/// Linear interpolation between order statistics of an ascending slice.
///
/// Returns `None` for an empty slice or `q` outside `[0, 1]`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }

    let position = count_as_f64(sorted.len() - 1) * q;
    let lower = position.floor();
    let lower_index = lower as usize;
    let upper_index = (lower_index + 1).min(sorted.len() - 1);
    let lower_value = sorted[lower_index];
    let upper_value = sorted[upper_index];

    Some(lower_value + (position - lower) * (upper_value - lower_value))
}

fn summary_table(records: &[Record]) -> Table {
    let ids = records.iter().map(|record| id_as_f64(record.id)).collect::<Vec<_>>();
    let columns = [ColumnSummary::describe(&ids), ColumnSummary::describe(&record_values(records))];

    let mut table = Table::with_columns(&["statistic", "id", "value"]);
    for statistic in SUMMARY_STATISTICS {
        let mut row = vec![Cell::Text(statistic.to_string())];
        row.extend(columns.iter().map(|column| column.cell(statistic)));
        table.rows.push(row);
    }
    table
}

fn groupby_output(records: &[Record]) -> AnalysisOutput {
    if records.is_empty() {
        return AnalysisOutput::placeholder(NOTHING_TO_GROUP_MESSAGE);
    }

    let mut groups: BTreeMap<&str, (usize, f64)> = BTreeMap::new();
    for record in records {
        let group = groups.entry(record.category.as_str()).or_insert((0, 0.0));
        group.0 += 1;
        group.1 += record.value;
    }

    let mut table = Table::with_columns(&["category", "count", "mean", "sum"]);
    for (category, (count, sum)) in groups {
        table.rows.push(vec![
            Cell::Text(category.to_string()),
            Cell::Integer(i64::try_from(count).unwrap_or(i64::MAX)),
            Cell::Number(sum / count_as_f64(count)),
            Cell::Number(sum),
        ]);
    }
    AnalysisOutput::Table(table)
}

fn filter_output(records: &[Record]) -> AnalysisOutput {
    // Threshold comes from the whole snapshot, before any row is dropped.
    let Some(threshold) = mean(&record_values(records)) else {
        return AnalysisOutput::placeholder(NOTHING_ABOVE_AVERAGE_MESSAGE);
    };

    let mut table = Table::with_columns(&RECORD_COLUMNS);
    table.rows.extend(records.iter().filter(|record| record.value > threshold).map(record_row));

    if table.is_empty() {
        AnalysisOutput::placeholder(NOTHING_ABOVE_AVERAGE_MESSAGE)
    } else {
        AnalysisOutput::Table(table)
    }
}

fn record_values(records: &[Record]) -> Vec<f64> {
    records.iter().map(|record| record.value).collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / count_as_f64(values.len()))
}

fn sample_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = mean(values)?;
    let squared = values.iter().map(|value| (value - mean).powi(2)).sum::<f64>();
    Some((squared / count_as_f64(values.len() - 1)).sqrt())
}

#[allow(clippy::cast_precision_loss)]
fn count_as_f64(count: usize) -> f64 {
    count as f64
}

#[allow(clippy::cast_precision_loss)]
fn id_as_f64(id: RecordId) -> f64 {
    id as f64
}

/// Shortest text that parses back to the same `f64`. Very small or very large
/// magnitudes switch to scientific notation.
fn format_number(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    let magnitude = value.abs();
    if magnitude > 0.0 && !(SCIENTIFIC_LOWER_BOUND..SCIENTIFIC_UPPER_BOUND).contains(&magnitude)
    {
        return format!("{value:e}");
    }
    let plain = value.to_string();
    if plain.contains('.') {
        plain
    } else {
        format!("{plain}.0")
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
