use crate::cli::VerbosityLevel;
use crate::error::{AuditError, ExportError, IntakeError};
use crate::progress::ProgressUpdate;

/// Error reporter with configurable verbosity
pub struct ErrorReporter {
    verbosity: VerbosityLevel,
    show_timestamps: bool,
}

impl ErrorReporter {
    /// Create a new error reporter with specified verbosity
    pub fn new(verbosity: VerbosityLevel) -> Self {
        Self {
            verbosity,
            show_timestamps: false,
        }
    }

    /// Reporter that prefixes each error line with a UTC `[HH:MM:SS]` stamp
    pub fn with_timestamps(verbosity: VerbosityLevel, show_timestamps: bool) -> Self {
        Self {
            verbosity,
            show_timestamps,
        }
    }

    /// Report an error on stderr with appropriate verbosity
    pub fn report_error(&self, error: &AuditError) {
        if let Some(formatted) = self.format_error(error) {
            eprintln!("{}", formatted);
        }
    }

    /// Rendering of `error` at this verbosity; `None` when it is suppressed
    pub fn format_error(&self, error: &AuditError) -> Option<String> {
        match self.verbosity {
            VerbosityLevel::Quiet => self
                .is_critical_error(error)
                .then(|| self.format_error_brief(error)),
            VerbosityLevel::Normal => Some(self.format_error_normal(error)),
            VerbosityLevel::Verbose => Some(self.format_error_verbose(error)),
            VerbosityLevel::Debug => Some(self.format_error_debug(error)),
        }
    }

    /// Report progress for a running batch
    pub fn report_progress(&self, update: &ProgressUpdate) {
        if let Some(line) = self.format_progress(update) {
            eprint!("{}", line);
            if update.processed == update.total {
                eprintln!(); // New line when complete
            }
        }
    }

    pub fn format_progress(&self, update: &ProgressUpdate) -> Option<String> {
        match self.verbosity {
            VerbosityLevel::Quiet => None,
            VerbosityLevel::Normal => Some(format!(
                "\rProgress: {}/{} ({:.2}%) faulty: {}",
                update.processed,
                update.total,
                update.percent(),
                update.faulty_count
            )),
            VerbosityLevel::Verbose | VerbosityLevel::Debug => Some(format!(
                "\rProgress: {}/{} ({:.2}%) faulty: {} - {}",
                update.processed,
                update.total,
                update.percent(),
                update.faulty_count,
                update.current_file
            )),
        }
    }

    /// Errors shown even in quiet mode
    fn is_critical_error(&self, error: &AuditError) -> bool {
        !matches!(
            error,
            AuditError::Export(ExportError::NothingToExport { .. })
        )
    }

    /// Format error for brief output (quiet mode)
    fn format_error_brief(&self, error: &AuditError) -> String {
        match error {
            AuditError::Intake(intake) => format!("REJECTED: {}", intake),
            AuditError::Export(export) => format!("EXPORT FAILED: {}", export),
            _ => format!("ERROR: {}", error),
        }
    }

    /// Format error for normal output
    fn format_error_normal(&self, error: &AuditError) -> String {
        let timestamp = if self.show_timestamps {
            format!("[{}] ", chrono::Utc::now().format("%H:%M:%S"))
        } else {
            String::new()
        };

        format!("{}{}", timestamp, error)
    }

    /// Format error for verbose output
    fn format_error_verbose(&self, error: &AuditError) -> String {
        let mut output = self.format_error_normal(error);
        if let Some(suggestion) = self.get_suggestion(error) {
            output.push_str("\nSuggestion: ");
            output.push_str(&suggestion);
        }
        output
    }

    /// Format error for debug output
    fn format_error_debug(&self, error: &AuditError) -> String {
        let mut output = self.format_error_verbose(error);
        output.push_str(&format!("\nDebug Info: {:?}", error));

        output.push_str("\nError Chain:");
        let mut current_error: &dyn std::error::Error = error;
        let mut level = 0;
        while let Some(source) = current_error.source() {
            output.push_str(&format!("\n  {}: {}", level + 1, source));
            current_error = source;
            level += 1;
        }

        output
    }

    fn get_suggestion(&self, error: &AuditError) -> Option<String> {
        let suggestion = match error {
            AuditError::Intake(IntakeError::DisallowedFileType { .. }) => {
                "Remove the file from the batch or add its extension with --extensions".to_string()
            }
            AuditError::Intake(IntakeError::NoPathColumn { .. }) => {
                "Add a manifest column whose header contains 'path' or 'file'".to_string()
            }
            AuditError::Intake(IntakeError::NoFiles | IntakeError::NoFilesSelected) => {
                "Supply at least one existing file".to_string()
            }
            AuditError::Intake(IntakeError::Pattern { .. }) => {
                "Check the --include/--exclude glob syntax".to_string()
            }
            AuditError::Export(ExportError::NothingToExport { kind }) => {
                format!("The batch has no {} files; choose another export", kind)
            }
            AuditError::Export(ExportError::DirectoryUnavailable { path, .. }) => {
                format!("Choose a writable directory instead of {}", path.display())
            }
            AuditError::Config(_) => {
                "Check the configuration file and XML_TAG_AUDIT_* variables".to_string()
            }
            _ => return None,
        };
        Some(suggestion)
    }
}
