//! Per-build metric history.
//!
//! The history is a flat `;`-separated table with one row per build and one
//! column per metric:
//!
//! ```text
//! buildNumber;timestamp;CoreNcss;CoreComponents
//! 12;1476793200000;1034;17
//! 13;1476879600000;1101;
//! ```
//!
//! `timestamp` holds Unix epoch milliseconds. An empty cell means the metric
//! was not recorded for that build. Metrics first seen in a later build get a
//! new column and older rows are padded with empty cells.
//!
//! Every write rewrites the table into a temp file next to it and renames it
//! over the previous table, so readers never observe a partially written row.

use crate::error::{Error, Result};
use crate::model::{BuildNumber, MetricId, MetricSample};
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const BUILD_NUMBER_COLUMN: &str = "buildNumber";
pub const TIMESTAMP_COLUMN: &str = "timestamp";
const SEPARATOR: char = ';';
const FIXED_COLUMNS: usize = 2;

/// Read access to recorded metric values, as consumed by the chart plots.
pub trait MetricHistoryProvider: Send + Sync {
    /// The most recent `max_points` samples of `metric`, oldest first.
    ///
    /// A metric that was never recorded yields an empty series.
    fn read_series(&self, metric: &MetricId, max_points: usize) -> Result<Vec<MetricSample>>;

    /// Timestamp of the newest build in the history.
    fn timestamp_of_most_recent_sample(&self) -> Result<Option<DateTime<Utc>>>;
}

// ============================================================================
// Table
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Row {
    build_number: BuildNumber,
    timestamp: DateTime<Utc>,
    values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Table {
    metrics: Vec<MetricId>,
    rows: Vec<Row>,
}

impl Table {
    fn parse(path: &Path, text: &str) -> Result<Self> {
        let mut lines = text
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());

        let Some((header_idx, header)) = lines.next() else {
            return Ok(Self::default());
        };
        let metrics = parse_header(path, header_idx + 1, header)?;

        let mut rows = Vec::new();
        let mut seen = HashSet::new();
        for (idx, line) in lines {
            let line_no = idx + 1;
            let row = parse_row(path, line_no, line, metrics.len())?;
            if !seen.insert(row.build_number) {
                return Err(Error::corrupt(
                    path,
                    line_no,
                    format!("duplicate build number {}", row.build_number),
                ));
            }
            rows.push(row);
        }

        Ok(Self { metrics, rows })
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(BUILD_NUMBER_COLUMN);
        out.push(SEPARATOR);
        out.push_str(TIMESTAMP_COLUMN);
        for metric in &self.metrics {
            out.push(SEPARATOR);
            out.push_str(metric.as_str());
        }
        out.push('\n');

        for row in &self.rows {
            let _ = write!(
                out,
                "{}{SEPARATOR}{}",
                row.build_number,
                row.timestamp.timestamp_millis()
            );
            for value in &row.values {
                out.push(SEPARATOR);
                if let Some(value) = value {
                    let _ = write!(out, "{value}");
                }
            }
            out.push('\n');
        }
        out
    }

    fn column_of(&self, metric: &MetricId) -> Option<usize> {
        self.metrics.iter().position(|m| m == metric)
    }

    /// Column index for `metric`, adding an empty column if it is new.
    fn ensure_column(&mut self, metric: &MetricId) -> usize {
        if let Some(idx) = self.column_of(metric) {
            return idx;
        }
        self.metrics.push(metric.clone());
        for row in &mut self.rows {
            row.values.push(None);
        }
        self.metrics.len() - 1
    }

    /// Row for `build_number`; a new build is appended at the end.
    fn row_mut(&mut self, build_number: BuildNumber, timestamp: DateTime<Utc>) -> &mut Row {
        let width = self.metrics.len();
        let idx = if let Some(idx) = self
            .rows
            .iter()
            .position(|row| row.build_number == build_number)
        {
            self.rows[idx].timestamp = timestamp;
            idx
        } else {
            self.rows.push(Row {
                build_number,
                timestamp,
                values: vec![None; width],
            });
            self.rows.len() - 1
        };
        &mut self.rows[idx]
    }

    fn series(&self, metric: &MetricId) -> Vec<MetricSample> {
        let Some(column) = self.column_of(metric) else {
            return Vec::new();
        };
        let mut samples: Vec<MetricSample> = self
            .rows
            .iter()
            .filter_map(|row| {
                row.values[column]
                    .map(|value| MetricSample::new(row.build_number, row.timestamp, value))
            })
            .collect();
        samples.sort_by_key(|sample| sample.build_number);
        samples
    }

    fn most_recent_timestamp(&self) -> Option<DateTime<Utc>> {
        self.rows
            .iter()
            .max_by_key(|row| row.build_number)
            .map(|row| row.timestamp)
    }
}

/// Why `metric` cannot be stored as a header column, if it cannot.
fn invalid_column_name(metric: &MetricId) -> Option<&'static str> {
    let name = metric.as_str();
    if name.is_empty() {
        Some("is empty")
    } else if name.contains([SEPARATOR, '\n', '\r']) {
        Some("contains a separator or line break")
    } else if name == BUILD_NUMBER_COLUMN || name == TIMESTAMP_COLUMN {
        Some("collides with a fixed column")
    } else {
        None
    }
}

fn parse_header(path: &Path, line_no: usize, line: &str) -> Result<Vec<MetricId>> {
    let fields: Vec<&str> = line.split(SEPARATOR).collect();
    if fields.len() < FIXED_COLUMNS
        || fields[0] != BUILD_NUMBER_COLUMN
        || fields[1] != TIMESTAMP_COLUMN
    {
        return Err(Error::corrupt(
            path,
            line_no,
            format!("header must start with '{BUILD_NUMBER_COLUMN}{SEPARATOR}{TIMESTAMP_COLUMN}'"),
        ));
    }

    let mut metrics = Vec::with_capacity(fields.len() - FIXED_COLUMNS);
    for name in &fields[FIXED_COLUMNS..] {
        if name.is_empty() {
            return Err(Error::corrupt(path, line_no, "empty metric column name"));
        }
        let id = MetricId::new(*name);
        if metrics.contains(&id) {
            return Err(Error::corrupt(
                path,
                line_no,
                format!("duplicate metric column '{name}'"),
            ));
        }
        metrics.push(id);
    }
    Ok(metrics)
}

fn parse_row(path: &Path, line_no: usize, line: &str, metric_count: usize) -> Result<Row> {
    let fields: Vec<&str> = line.split(SEPARATOR).collect();
    let expected = FIXED_COLUMNS + metric_count;
    if fields.len() != expected {
        return Err(Error::corrupt(
            path,
            line_no,
            format!("expected {expected} fields, got {}", fields.len()),
        ));
    }

    let build_number = fields[0].trim().parse::<BuildNumber>().map_err(|_| {
        Error::corrupt(path, line_no, format!("invalid build number '{}'", fields[0]))
    })?;
    let timestamp = fields[1]
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| {
            Error::corrupt(path, line_no, format!("invalid timestamp '{}'", fields[1]))
        })?;

    let mut values = Vec::with_capacity(metric_count);
    for raw in &fields[FIXED_COLUMNS..] {
        let raw = raw.trim();
        if raw.is_empty() {
            values.push(None);
            continue;
        }
        match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => values.push(Some(value)),
            _ => {
                return Err(Error::corrupt(
                    path,
                    line_no,
                    format!("invalid metric value '{raw}'"),
                ));
            }
        }
    }

    Ok(Row {
        build_number,
        timestamp,
        values,
    })
}

// ============================================================================
// Store
// ============================================================================

/// File-backed metric history of one job.
pub struct MetricHistoryStore {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl MetricHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record (or overwrite) one metric value for one build.
    pub fn append_sample(&self, metric: &MetricId, sample: &MetricSample) -> Result<()> {
        self.append_build(
            sample.build_number,
            sample.timestamp,
            std::iter::once((metric, sample.value)),
        )
    }

    /// Record the values of several metrics for one build in a single rewrite.
    ///
    /// Values already stored for this build are overwritten; metrics not
    /// mentioned keep whatever the build's row already holds.
    pub fn append_build<'a>(
        &self,
        build_number: BuildNumber,
        timestamp: DateTime<Utc>,
        values: impl IntoIterator<Item = (&'a MetricId, f64)>,
    ) -> Result<()> {
        let values: Vec<(&MetricId, f64)> = values.into_iter().collect();
        if let Some((metric, reason)) = values
            .iter()
            .find_map(|(metric, _)| invalid_column_name(metric).map(|reason| (metric, reason)))
        {
            return Err(Error::validation(format!(
                "Metric name '{metric}' {reason} and cannot be recorded"
            )));
        }
        if let Some((metric, value)) = values.iter().find(|(_, value)| !value.is_finite()) {
            return Err(Error::validation(format!(
                "Value {value} for metric '{metric}' of build {build_number} is not finite"
            )));
        }

        let _guard = self
            .write_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let parent = self.parent_dir();
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::io(format!("create history directory {}", parent.display()), e)
        })?;
        let _lock = self.lock_exclusive()?;

        let mut table = self.load_table()?;
        let columns: Vec<(usize, f64)> = values
            .iter()
            .map(|(metric, value)| (table.ensure_column(metric), *value))
            .collect();
        let row = table.row_mut(build_number, timestamp);
        for (column, value) in columns {
            row.values[column] = Some(value);
        }

        self.write_table(&table)?;
        tracing::debug!(
            path = %self.path.display(),
            build_number,
            metrics = values.len(),
            "Recorded metric values"
        );
        Ok(())
    }

    /// Metrics that have a column in the history.
    pub fn metrics(&self) -> Result<Vec<MetricId>> {
        Ok(self.load_table()?.metrics)
    }

    fn parent_dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Advisory lock held for the duration of a rewrite; released when the handle drops.
    fn lock_exclusive(&self) -> Result<std::fs::File> {
        let lock_path = self.lock_path();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::io(format!("open lock file {}", lock_path.display()), e))?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| Error::io(format!("lock {}", lock_path.display()), e))?;
        Ok(file)
    }

    fn load_table(&self) -> Result<Table> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Table::parse(&self.path, &text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Table::default()),
            Err(e) => Err(Error::io(
                format!("read metric history {}", self.path.display()),
                e,
            )),
        }
    }

    fn write_table(&self, table: &Table) -> Result<()> {
        let parent = self.parent_dir();
        let mut temp_file = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::io("create temp metric history", e))?;
        temp_file
            .write_all(table.render().as_bytes())
            .and_then(|()| temp_file.as_file().sync_all())
            .map_err(|e| Error::io("write temp metric history", e))?;

        // Persist (atomic rename)
        temp_file.persist(&self.path).map_err(|e| {
            Error::io(
                format!("replace metric history {}", self.path.display()),
                e.error,
            )
        })?;
        Ok(())
    }
}

impl MetricHistoryProvider for MetricHistoryStore {
    fn read_series(&self, metric: &MetricId, max_points: usize) -> Result<Vec<MetricSample>> {
        let mut samples = self.load_table()?.series(metric);
        let skip = samples.len().saturating_sub(max_points);
        samples.drain(..skip);
        Ok(samples)
    }

    fn timestamp_of_most_recent_sample(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.load_table()?.most_recent_timestamp())
    }
}
