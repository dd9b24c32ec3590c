use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::export::ExportKind;
use crate::validator::ValidationPolicy;

/// Verbosity levels for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum VerbosityLevel {
    /// Only show critical errors
    Quiet,
    /// Show standard information
    #[default]
    Normal,
    /// Show detailed information
    Verbose,
    /// Show all available debugging information
    Debug,
}

/// How the batch summary is printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Audit XML files for required tags
#[derive(Parser, Debug, Clone)]
#[command(name = "xml-tag-audit")]
#[command(about = "Check batches of XML files for a required identifier and marker tags")]
#[command(version)]
pub struct Cli {
    /// Directory or file to audit
    #[arg(
        required_unless_present = "manifest",
        conflicts_with = "manifest",
        help = "Directory or file to audit"
    )]
    pub path: Option<PathBuf>,

    /// CSV manifest listing files to audit
    #[arg(short = 'm', long = "manifest")]
    pub manifest: Option<PathBuf>,

    /// File extensions to process (comma-separated)
    #[arg(
        short = 'e',
        long = "extensions",
        help = "File extensions to process (e.g., 'xml,mtr')"
    )]
    pub extensions: Option<String>,

    /// Required tags, in report order (comma-separated)
    #[arg(long = "tags", value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Element holding the document identifier
    #[arg(long = "identifier")]
    pub identifier: Option<String>,

    /// Rule deciding which files are faulty
    #[arg(long = "policy", value_enum)]
    pub policy: Option<ValidationPolicy>,

    /// Do not check tags in files without an identifier
    #[arg(long = "skip-tags-without-identifier")]
    pub skip_tags_without_identifier: bool,

    /// Number of files parsed concurrently
    #[arg(short = 't', long = "workers")]
    pub workers: Option<usize>,

    /// Per-file timeout in seconds
    #[arg(long = "timeout")]
    pub timeout: Option<u64>,

    /// Reject malformed documents instead of recovering
    #[arg(long = "no-recover")]
    pub no_recover: bool,

    /// Write a CSV export after the batch (repeatable)
    #[arg(long = "export", value_enum, action = clap::ArgAction::Append)]
    pub export: Vec<ExportKind>,

    /// Directory for CSV exports
    #[arg(long = "export-dir")]
    pub export_dir: Option<PathBuf>,

    /// Directory where uploaded files are stored
    #[arg(long = "upload-dir")]
    pub upload_dir: Option<PathBuf>,

    /// Include file patterns (glob syntax)
    #[arg(long = "include", action = clap::ArgAction::Append)]
    pub include_patterns: Vec<String>,

    /// Exclude file patterns (glob syntax)
    #[arg(long = "exclude", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,

    /// Print every batch event as a server-sent-event frame on stdout
    #[arg(long = "events")]
    pub events: bool,

    /// Show a progress line on stderr
    #[arg(long = "progress")]
    pub progress: bool,

    /// Summary format
    #[arg(long = "format", value_enum)]
    pub output_format: Option<OutputFormat>,

    /// Increase output detail (-v, -vv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short = 'q', long = "quiet", conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file (TOML or JSON)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn get_extensions(&self) -> Option<Vec<String>> {
        self.extensions.as_ref().map(|extensions| {
            extensions
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        match (self.quiet, self.verbose) {
            (true, _) => VerbosityLevel::Quiet,
            (false, 0) => VerbosityLevel::Normal,
            (false, 1) => VerbosityLevel::Verbose,
            (false, _) => VerbosityLevel::Debug,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(path) = &self.path
            && !path.exists()
        {
            return Err(format!("Path does not exist: {}", path.display()));
        }
        if let Some(manifest) = &self.manifest
            && !manifest.is_file()
        {
            return Err(format!("Manifest does not exist: {}", manifest.display()));
        }
        if let Some(workers) = self.workers
            && workers == 0
        {
            return Err("Number of workers must be greater than 0".to_string());
        }
        if self.timeout == Some(0) {
            return Err("Timeout must be greater than 0".to_string());
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err("Tag names cannot be empty".to_string());
        }
        Ok(())
    }
}
