use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::export::ExportKind;

/// Main application error type that encompasses all possible failure modes
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Batch rejected: {0}")]
    Intake(#[from] IntakeError),

    #[error("Export failed: {0}")]
    Export(#[from] ExportError),

    #[error("Invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Session not found: {id}")]
    SessionNotFound { id: Uuid },
}

/// Failure to turn raw bytes into a navigable document
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("document is empty")]
    EmptyDocument,

    #[error("document is too large for the parser ({size} bytes)")]
    TooLarge { size: usize },

    #[error("document could not be parsed: {details}")]
    Unrecoverable { details: String },

    #[error("document has no root element")]
    NoRootElement,
}

/// Why a single file could not be classified.
///
/// These never abort a batch; they are rendered into the `parse_error`
/// of that file's result.
#[derive(Error, Debug)]
pub enum FileFault {
    #[error("failed to read file: {0}")]
    Unreadable(#[from] std::io::Error),

    #[error("{0}")]
    Unparseable(#[from] ParseError),

    #[error("processing timed out after {0:?}")]
    TimedOut(Duration),

    #[error("worker fault: {0}")]
    Worker(String),
}

/// Batch-level intake failures; the batch never starts
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("No files part in the request")]
    NoFiles,

    #[error("No selected files")]
    NoFilesSelected,

    #[error("Invalid file type: {name}")]
    DisallowedFileType { name: String },

    #[error("Manifest {manifest} has no column naming a path or file")]
    NoPathColumn { manifest: PathBuf },

    #[error("Manifest {manifest} could not be read: {details}")]
    Manifest { manifest: PathBuf, details: String },

    #[error("Upload storage error: {path} - {details}")]
    Storage { path: PathBuf, details: String },

    #[error("Invalid discovery pattern '{pattern}': {details}")]
    Pattern { pattern: String, details: String },

    #[error("Path does not exist: {path}")]
    MissingPath { path: PathBuf },
}

/// Export failures; no partial file is left behind
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("No {kind} files to export")]
    NothingToExport { kind: ExportKind },

    #[error("Export directory unavailable: {path} - {details}")]
    DirectoryUnavailable { path: PathBuf, details: String },

    #[error("Export write failed: {path} - {details}")]
    Write { path: PathBuf, details: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AuditError>;

/// Parser result type alias
pub type ParseResult<T> = std::result::Result<T, ParseError>;
