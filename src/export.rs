//! Export Formatter and delimited-file writer
//!
//! Rows are a tagged variant: faulty rows carry the missing-tag rendering,
//! normal rows carry every tag's presence. The two column sets only meet
//! when a full-batch export unions them.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::aggregator::BatchResultSet;
use crate::error::ExportError;
use crate::validator::FileResult;

const NOT_AVAILABLE: &str = "N/A";

/// Which subset of a batch to export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Faulty,
    Normal,
    All,
}

impl ExportKind {
    pub fn file_name(self) -> &'static str {
        match self {
            ExportKind::Faulty => "faulty_xml_files.csv",
            ExportKind::Normal => "normal_xml_files.csv",
            ExportKind::All => "all_xml_files.csv",
        }
    }

    pub fn columns(self) -> &'static [Column] {
        match self {
            ExportKind::Faulty => FaultyRow::COLUMNS,
            ExportKind::Normal => NormalRow::COLUMNS,
            ExportKind::All => Column::ALL,
        }
    }
}

impl fmt::Display for ExportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportKind::Faulty => f.write_str("faulty"),
            ExportKind::Normal => f.write_str("normal"),
            ExportKind::All => f.write_str("all"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    File,
    Meter,
    Status,
    MissingTags,
    TagValues,
}

impl Column {
    pub const ALL: &'static [Column] = &[
        Column::File,
        Column::Meter,
        Column::Status,
        Column::MissingTags,
        Column::TagValues,
    ];

    pub fn header(self) -> &'static str {
        match self {
            Column::File => "File",
            Column::Meter => "Meter",
            Column::Status => "Status",
            Column::MissingTags => "Missing Tags",
            Column::TagValues => "Tag Values",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultyRow {
    pub file: String,
    pub meter: String,
    pub missing_tags: String,
}

impl FaultyRow {
    pub const COLUMNS: &'static [Column] =
        &[Column::File, Column::Meter, Column::Status, Column::MissingTags];

    fn from_result(result: &FileResult) -> Self {
        let missing_tags = if result.missing_tags().is_empty() {
            NOT_AVAILABLE.to_string()
        } else {
            result.missing_tags().join(", ")
        };
        Self {
            file: result.file_name().to_string(),
            meter: result.identifier_or_sentinel().to_string(),
            missing_tags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalRow {
    pub file: String,
    pub meter: String,
    pub tag_values: String,
}

impl NormalRow {
    pub const COLUMNS: &'static [Column] =
        &[Column::File, Column::Meter, Column::Status, Column::TagValues];

    fn from_result(result: &FileResult, tags: &[String]) -> Self {
        Self {
            file: result.file_name().to_string(),
            meter: result.identifier_or_sentinel().to_string(),
            tag_values: render_tag_values(result, tags),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportRow {
    Faulty(FaultyRow),
    Normal(NormalRow),
}

impl ExportRow {
    pub fn status(&self) -> &'static str {
        match self {
            ExportRow::Faulty(_) => "Faulty",
            ExportRow::Normal(_) => "Normal",
        }
    }

    pub fn columns(&self) -> &'static [Column] {
        match self {
            ExportRow::Faulty(_) => FaultyRow::COLUMNS,
            ExportRow::Normal(_) => NormalRow::COLUMNS,
        }
    }

    /// Value of `column`; columns outside this row's set render as `N/A`
    pub fn cell(&self, column: Column) -> Cow<'_, str> {
        match (self, column) {
            (ExportRow::Faulty(row), Column::File) => Cow::Borrowed(row.file.as_str()),
            (ExportRow::Normal(row), Column::File) => Cow::Borrowed(row.file.as_str()),
            (ExportRow::Faulty(row), Column::Meter) => Cow::Borrowed(row.meter.as_str()),
            (ExportRow::Normal(row), Column::Meter) => Cow::Borrowed(row.meter.as_str()),
            (_, Column::Status) => Cow::Borrowed(self.status()),
            (ExportRow::Faulty(row), Column::MissingTags) => Cow::Borrowed(row.missing_tags.as_str()),
            (ExportRow::Normal(row), Column::TagValues) => Cow::Borrowed(row.tag_values.as_str()),
            _ => Cow::Borrowed(NOT_AVAILABLE),
        }
    }

    /// Column/value pairs for this row's own column set
    pub fn cells(&self) -> Vec<(Column, Cow<'_, str>)> {
        self.columns()
            .iter()
            .map(|&column| (column, self.cell(column)))
            .collect()
    }
}

/// One entry of the completion event's `table_data`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRow<'a> {
    #[serde(rename = "File")]
    pub file: &'a str,
    #[serde(rename = "Meter")]
    pub meter: &'a str,
    #[serde(rename = "Status")]
    pub status: &'static str,
    #[serde(rename = "Missing Tags")]
    pub missing_tags: String,
    #[serde(rename = "Tag Values")]
    pub tag_values: String,
}

/// `D1: yes | D2: no | ...` over the declared tags
pub fn render_tag_values(result: &FileResult, tags: &[String]) -> String {
    tags.iter()
        .map(|tag| {
            let flag = result
                .presence_of(tag)
                .map(|p| p.as_flag())
                .unwrap_or(NOT_AVAILABLE);
            format!("{tag}: {flag}")
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// `N/A` when tags were not checked, `None` when nothing is missing
pub fn render_missing_tags(result: &FileResult) -> String {
    if !result.tags_evaluated() {
        NOT_AVAILABLE.to_string()
    } else if result.missing_tags().is_empty() {
        "None".to_string()
    } else {
        result.missing_tags().join(", ")
    }
}

pub struct ExportFormatter;

impl ExportFormatter {
    pub fn project_faulty(results: &BatchResultSet) -> Result<Vec<ExportRow>, ExportError> {
        let rows: Vec<_> = results
            .faulty()
            .map(|r| ExportRow::Faulty(FaultyRow::from_result(r)))
            .collect();
        if rows.is_empty() {
            return Err(ExportError::NothingToExport {
                kind: ExportKind::Faulty,
            });
        }
        Ok(rows)
    }

    pub fn project_normal(results: &BatchResultSet) -> Result<Vec<ExportRow>, ExportError> {
        let tags = results.required_tags();
        let rows: Vec<_> = results
            .normal()
            .map(|r| ExportRow::Normal(NormalRow::from_result(r, tags)))
            .collect();
        if rows.is_empty() {
            return Err(ExportError::NothingToExport {
                kind: ExportKind::Normal,
            });
        }
        Ok(rows)
    }

    /// Every record, in completion order; empty for an empty batch
    pub fn project_all(results: &BatchResultSet) -> Vec<ExportRow> {
        let tags = results.required_tags();
        results
            .records()
            .iter()
            .map(|r| {
                if r.is_faulty() {
                    ExportRow::Faulty(FaultyRow::from_result(r))
                } else {
                    ExportRow::Normal(NormalRow::from_result(r, tags))
                }
            })
            .collect()
    }

    pub fn project(results: &BatchResultSet, kind: ExportKind) -> Result<Vec<ExportRow>, ExportError> {
        match kind {
            ExportKind::Faulty => Self::project_faulty(results),
            ExportKind::Normal => Self::project_normal(results),
            ExportKind::All => {
                let rows = Self::project_all(results);
                if rows.is_empty() {
                    return Err(ExportError::NothingToExport { kind });
                }
                Ok(rows)
            }
        }
    }

    /// Rows for the completion event's result table
    pub fn table_data(results: &BatchResultSet) -> Vec<TableRow<'_>> {
        let tags = results.required_tags();
        results
            .records()
            .iter()
            .map(|r| TableRow {
                file: r.file_name(),
                meter: r.identifier_or_sentinel(),
                status: if r.is_faulty() { "Faulty" } else { "Normal" },
                missing_tags: render_missing_tags(r),
                tag_values: if r.is_faulty() {
                    NOT_AVAILABLE.to_string()
                } else {
                    render_tag_values(r, tags)
                },
            })
            .collect()
    }
}

/// Writes projections as CSV files into one directory
#[derive(Debug, Clone)]
pub struct CsvExporter {
    directory: PathBuf,
}

impl CsvExporter {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write the `kind` projection and return the written path.
    ///
    /// Rows go to a temporary file in the target directory that is renamed
    /// into place, so a failed export never leaves a partial file.
    pub fn export(&self, results: &BatchResultSet, kind: ExportKind) -> Result<PathBuf, ExportError> {
        let rows = ExportFormatter::project(results, kind)?;

        std::fs::create_dir_all(&self.directory).map_err(|e| {
            ExportError::DirectoryUnavailable {
                path: self.directory.clone(),
                details: e.to_string(),
            }
        })?;

        let target = self.directory.join(kind.file_name());
        let staging = self
            .directory
            .join(format!(".{}.{}.tmp", kind.file_name(), Uuid::new_v4().simple()));

        if let Err(e) = write_rows(&staging, kind.columns(), &rows) {
            let _ = std::fs::remove_file(&staging);
            return Err(e);
        }
        std::fs::rename(&staging, &target).map_err(|e| {
            let _ = std::fs::remove_file(&staging);
            ExportError::Write {
                path: target.clone(),
                details: e.to_string(),
            }
        })?;

        info!(kind = %kind, rows = rows.len(), path = %target.display(), "export written");
        Ok(target)
    }
}

fn write_rows(path: &Path, columns: &[Column], rows: &[ExportRow]) -> Result<(), ExportError> {
    let write_error = |details: String| ExportError::Write {
        path: path.to_path_buf(),
        details,
    };

    let mut writer = csv::Writer::from_path(path).map_err(|e| write_error(e.to_string()))?;
    writer
        .write_record(columns.iter().map(|c| c.header()))
        .map_err(|e| write_error(e.to_string()))?;
    for row in rows {
        writer
            .write_record(columns.iter().map(|&c| row.cell(c).into_owned()))
            .map_err(|e| write_error(e.to_string()))?;
    }
    writer.flush().map_err(|e| write_error(e.to_string()))?;
    debug!(path = %path.display(), "staged export flushed");
    Ok(())
}

/// Candidate export directories: the configured one, then the user's
/// Documents and Desktop folders when they exist
pub fn suggested_export_directories(configured: &Path) -> Vec<PathBuf> {
    let mut suggestions = vec![configured.to_path_buf()];
    for candidate in [dirs::document_dir(), dirs::desktop_dir()].into_iter().flatten() {
        if candidate.is_dir() && !suggestions.contains(&candidate) {
            suggestions.push(candidate);
        }
    }
    suggestions
}
