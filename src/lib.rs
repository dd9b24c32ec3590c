//! # xml-tag-audit Library
//!
//! Batch auditing of XML documents for a required identifier element and a
//! fixed list of marker tags. Files are parsed concurrently through libxml2,
//! classified as normal or faulty, aggregated into a per-batch result set
//! with chart-ready statistics, and exported as CSV.

pub mod aggregator;
pub mod cli;
pub mod config;
pub mod error;
pub mod error_reporter;
pub mod export;
pub mod intake;
pub mod libxml2;
pub mod output;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod validator;

pub use aggregator::{BatchResultSet, ResultAggregator, TagStatistic, Visualization};
pub use cli::{Cli, OutputFormat, VerbosityLevel};
pub use config::{Config, ConfigManager};
pub use error::{AuditError, ExportError, FileFault, IntakeError, ParseError};
pub use error_reporter::ErrorReporter;
pub use export::{CsvExporter, ExportFormatter, ExportKind, ExportRow};
pub use intake::{Upload, UploadIntake, secure_filename};
pub use libxml2::{LibXml2Wrapper, XmlDocument};
pub use output::Output;
pub use progress::{BatchEvent, ProgressChannel, ProgressUpdate};
pub use scheduler::{BatchScheduler, SchedulerConfig, Validate};
pub use session::{Session, SessionStore};
pub use validator::{
    FileRef, FileResult, FileValidator, Presence, TagCheck, TagSchema, ValidationPolicy,
};
