//! Batch summary output
//!
//! Human-readable and JSON renderings of a finished batch.

use std::time::Duration;

use serde::Serialize;

use crate::aggregator::{BatchResultSet, TagStatistic};
use crate::cli::VerbosityLevel;
use crate::export::render_missing_tags;
use crate::validator::FileResult;

/// Output formatter for batch results
pub struct Output {
    verbosity: VerbosityLevel,
    show_colors: bool,
}

impl Output {
    pub fn new(verbosity: VerbosityLevel) -> Self {
        Self {
            verbosity,
            show_colors: atty::is(atty::Stream::Stdout),
        }
    }

    pub fn without_colors(verbosity: VerbosityLevel) -> Self {
        Self {
            verbosity,
            show_colors: false,
        }
    }

    fn colorize(&self, text: &str, color: &str) -> String {
        if self.show_colors {
            format!("\x1b[{}m{}\x1b[0m", color, text)
        } else {
            text.to_string()
        }
    }

    pub fn format_results(&self, results: &BatchResultSet, elapsed: Duration) -> String {
        let mut output = String::new();

        match self.verbosity {
            VerbosityLevel::Quiet => {
                if results.faulty_count() > 0 {
                    output.push_str(&format!(
                        "Faulty: {} of {}\n",
                        results.faulty_count(),
                        results.total()
                    ));
                }
            }
            VerbosityLevel::Normal | VerbosityLevel::Verbose | VerbosityLevel::Debug => {
                output.push_str(&self.format_summary(results, elapsed));

                if self.verbosity >= VerbosityLevel::Verbose {
                    for result in results.faulty() {
                        output.push_str(&self.format_file_result(result));
                        output.push('\n');
                    }
                }

                if self.verbosity == VerbosityLevel::Debug {
                    output.push_str(&self.format_tag_statistics(results.tag_statistics()));
                }
            }
        }

        output
    }

    pub fn format_file_result(&self, result: &FileResult) -> String {
        let meter = result.identifier_or_sentinel();

        if let Some(error) = result.parse_error() {
            return format!(
                "{}  {} - {}",
                self.colorize("⚠ ERROR", "33"),
                result.file_name(),
                error
            );
        }

        if result.is_faulty() {
            format!(
                "{}  {} (meter {}) - missing: {}",
                self.colorize("✗ FAULTY", "31"),
                result.file_name(),
                meter,
                render_missing_tags(result)
            )
        } else {
            format!(
                "{}  {} (meter {})",
                self.colorize("✓ NORMAL", "32"),
                result.file_name(),
                meter
            )
        }
    }

    fn format_summary(&self, results: &BatchResultSet, elapsed: Duration) -> String {
        let mut output = String::new();
        output.push_str("Audit Summary:\n");
        output.push_str(&format!("  Total files: {}\n", results.total()));
        output.push_str(&format!(
            "  {} {}\n",
            self.colorize("Normal:", "32"),
            results.normal_count()
        ));
        if results.faulty_count() > 0 {
            output.push_str(&format!(
                "  {} {}\n",
                self.colorize("Faulty:", "31"),
                results.faulty_count()
            ));
        }
        let unparseable = results.parse_failures().count();
        if unparseable > 0 {
            output.push_str(&format!(
                "  {} {}\n",
                self.colorize("Unparseable:", "33"),
                unparseable
            ));
        }
        output.push_str(&format!("  Duration: {}\n", format_duration(elapsed)));
        output
    }

    fn format_tag_statistics(&self, statistics: &[TagStatistic]) -> String {
        let mut output = String::new();
        output.push_str("\nTag Statistics:\n");
        let width = statistics.iter().map(|s| s.tag.len()).max().unwrap_or(0);
        for stat in statistics {
            output.push_str(&format!(
                "  {:<width$}  present {:>5}  missing {:>5}\n",
                stat.tag, stat.present, stat.absent
            ));
        }
        output
    }

    /// Machine-readable summary for `--format json`
    pub fn format_json(&self, results: &BatchResultSet, elapsed: Duration) -> String {
        #[derive(Serialize)]
        struct JsonSummary<'a> {
            total: usize,
            faulty: usize,
            normal: usize,
            duration_ms: u128,
            tag_statistics: &'a [TagStatistic],
            files: &'a [FileResult],
        }

        let summary = JsonSummary {
            total: results.total(),
            faulty: results.faulty_count(),
            normal: results.normal_count(),
            duration_ms: elapsed.as_millis(),
            tag_statistics: results.tag_statistics(),
            files: results.records(),
        };
        serde_json::to_string_pretty(&summary).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs_f64();
    if total_secs < 1.0 {
        format!("{:.0}ms", duration.as_millis())
    } else if total_secs < 60.0 {
        format!("{:.2}s", total_secs)
    } else {
        let mins = (total_secs / 60.0) as u64;
        let secs = total_secs % 60.0;
        format!("{}m{:.1}s", mins, secs)
    }
}
