//! Result Aggregator
//!
//! Running tallies over completed [`FileResult`]s. Owned by the scheduler's
//! reducer task, which is its only writer, so no locking is needed here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AuditError, Result};
use crate::validator::{FileResult, Presence};

/// Present/absent counts for one required tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagStatistic {
    pub tag: String,
    pub present: usize,
    pub absent: usize,
}

/// Frozen aggregate of one batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchResultSet {
    records: Vec<FileResult>,
    faulty_count: usize,
    normal_count: usize,
    tag_statistics: Vec<TagStatistic>,
    required_tags: Vec<String>,
    completed_at: DateTime<Utc>,
}

impl BatchResultSet {
    /// Records in completion order
    pub fn records(&self) -> &[FileResult] {
        &self.records
    }

    pub fn total(&self) -> usize {
        self.records.len()
    }

    pub fn faulty_count(&self) -> usize {
        self.faulty_count
    }

    pub fn normal_count(&self) -> usize {
        self.normal_count
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Per-tag tallies, in declared tag order
    pub fn tag_statistics(&self) -> &[TagStatistic] {
        &self.tag_statistics
    }

    pub fn required_tags(&self) -> &[String] {
        &self.required_tags
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    pub fn faulty(&self) -> impl Iterator<Item = &FileResult> {
        self.records.iter().filter(|r| r.is_faulty())
    }

    pub fn normal(&self) -> impl Iterator<Item = &FileResult> {
        self.records.iter().filter(|r| !r.is_faulty())
    }

    /// Records whose document could not be parsed
    pub fn parse_failures(&self) -> impl Iterator<Item = &FileResult> {
        self.records.iter().filter(|r| r.parse_error().is_some())
    }

    /// Chart data sent with the completion event
    pub fn visualization(&self) -> Visualization {
        let tag_labels = self.tag_statistics.iter().map(|s| s.tag.clone()).collect();
        let present = self.tag_statistics.iter().map(|s| s.present).collect();
        let absent = self.tag_statistics.iter().map(|s| s.absent).collect();

        Visualization {
            charts: Charts {
                faulty_chart: Chart::single(
                    "doughnut",
                    &["Normal Files", "Faulty Files"],
                    vec![self.normal_count, self.faulty_count],
                    &["#4CAF50", "#C8A2C8"],
                    &["#388E3C", "#d32f2f"],
                ),
                export_chart: Chart::single(
                    "bar",
                    &["Total Files", "Faulty Files", "Normal Files"],
                    vec![self.total(), self.faulty_count, self.normal_count],
                    &["#2196F3", "#C8A2C8", "#4CAF50"],
                    &["#1976D2", "#d32f2f", "#388E3C"],
                ),
                tag_chart: Chart {
                    kind: "bar",
                    data: ChartData {
                        labels: tag_labels,
                        datasets: vec![
                            Dataset::labelled("Present", present, "#4CAF50", "#388E3C"),
                            Dataset::labelled("Missing", absent, "#C8A2C8", "#d32f2f"),
                        ],
                    },
                },
            },
        }
    }
}

/// Chart.js-shaped chart definitions
#[derive(Debug, Clone, Serialize)]
pub struct Visualization {
    pub charts: Charts,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Charts {
    pub faulty_chart: Chart,
    pub export_chart: Chart,
    pub tag_chart: Chart,
}

#[derive(Debug, Clone, Serialize)]
pub struct Chart {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: ChartData,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartData {
    pub labels: Vec<String>,
    pub datasets: Vec<Dataset>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub data: Vec<usize>,
    pub background_color: Vec<String>,
    pub border_color: Vec<String>,
    pub border_width: u32,
}

impl Chart {
    fn single(
        kind: &'static str,
        labels: &[&str],
        data: Vec<usize>,
        background: &[&str],
        border: &[&str],
    ) -> Self {
        Chart {
            kind,
            data: ChartData {
                labels: labels.iter().map(|l| l.to_string()).collect(),
                datasets: vec![Dataset {
                    label: None,
                    data,
                    background_color: background.iter().map(|c| c.to_string()).collect(),
                    border_color: border.iter().map(|c| c.to_string()).collect(),
                    border_width: 1,
                }],
            },
        }
    }
}

impl Dataset {
    fn labelled(label: &str, data: Vec<usize>, background: &str, border: &str) -> Self {
        Dataset {
            label: Some(label.to_string()),
            data,
            background_color: vec![background.to_string()],
            border_color: vec![border.to_string()],
            border_width: 1,
        }
    }
}

/// Append-only accumulator that becomes a [`BatchResultSet`]
#[derive(Debug)]
pub struct ResultAggregator {
    records: Vec<FileResult>,
    faulty_count: usize,
    tag_statistics: Vec<TagStatistic>,
    tag_index: HashMap<String, usize>,
    finalized: bool,
}

impl ResultAggregator {
    pub fn new(required_tags: &[String]) -> Self {
        let tag_statistics = required_tags
            .iter()
            .map(|tag| TagStatistic {
                tag: tag.clone(),
                present: 0,
                absent: 0,
            })
            .collect();
        let tag_index = required_tags
            .iter()
            .enumerate()
            .map(|(i, tag)| (tag.clone(), i))
            .collect();

        Self {
            records: Vec::new(),
            faulty_count: 0,
            tag_statistics,
            tag_index,
            finalized: false,
        }
    }

    pub fn with_capacity(required_tags: &[String], expected: usize) -> Self {
        let mut aggregator = Self::new(required_tags);
        aggregator.records.reserve(expected);
        aggregator
    }

    /// Append one outcome and update the running tallies
    pub fn accumulate(&mut self, result: FileResult) -> Result<()> {
        if self.finalized {
            return Err(AuditError::InvalidState {
                operation: "accumulate",
                state: "the batch is finalized",
            });
        }

        if result.is_faulty() {
            self.faulty_count += 1;
        }
        if result.parse_error().is_none() {
            for check in result.tag_status() {
                if let Some(&i) = self.tag_index.get(&check.tag) {
                    let stat = &mut self.tag_statistics[i];
                    match check.presence {
                        Presence::Present => stat.present += 1,
                        Presence::Absent => stat.absent += 1,
                    }
                }
            }
        }
        self.records.push(result);
        Ok(())
    }

    pub fn processed(&self) -> usize {
        self.records.len()
    }

    pub fn faulty_count(&self) -> usize {
        self.faulty_count
    }

    /// Freeze the aggregate. Further calls to `accumulate` or `finalize` fail.
    pub fn finalize(&mut self) -> Result<BatchResultSet> {
        if self.finalized {
            return Err(AuditError::InvalidState {
                operation: "finalize",
                state: "the batch is finalized",
            });
        }
        self.finalized = true;

        let records = std::mem::take(&mut self.records);
        let faulty_count = self.faulty_count;
        Ok(BatchResultSet {
            normal_count: records.len() - faulty_count,
            faulty_count,
            records,
            required_tags: self.tag_statistics.iter().map(|s| s.tag.clone()).collect(),
            tag_statistics: std::mem::take(&mut self.tag_statistics),
            completed_at: Utc::now(),
        })
    }
}
