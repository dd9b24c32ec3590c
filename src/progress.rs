//! Progress Channel
//!
//! An ordered, single-consumer stream of [`BatchEvent`]s from the scheduler
//! to whoever started the batch. Every stream ends with exactly one terminal
//! event ([`BatchEvent::Complete`] or [`BatchEvent::Failed`]) and is then
//! closed.
//!
//! Events render to the JSON wire shapes used by the event stream and can be
//! framed as server-sent events (`data: {json}\n\n`).

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use crate::aggregator::{BatchResultSet, Visualization};
use crate::export::{ExportFormatter, TableRow};

/// Progress after one file's outcome has been consumed
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub processed: usize,
    pub total: usize,
    pub current_file: String,
    pub faulty_count: usize,
    /// `parse_error` of the file just consumed, if any
    pub error: Option<String>,
}

impl ProgressUpdate {
    /// Percentage complete, rounded to two decimals
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        let raw = self.processed as f64 / self.total as f64 * 100.0;
        (raw * 100.0).round() / 100.0
    }
}

/// Batch-level failure; the batch never started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub error: String,
}

#[derive(Debug, Clone)]
pub enum BatchEvent {
    Progress(ProgressUpdate),
    Complete(Arc<BatchResultSet>),
    Failed(BatchFailure),
}

#[derive(Serialize)]
struct ProgressPayload<'a> {
    progress: f64,
    current_file: &'a str,
    faulty_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct CompletePayload<'a> {
    complete: bool,
    total_processed: usize,
    faulty_files: usize,
    visualization: Visualization,
    table_data: Vec<TableRow<'a>>,
}

#[derive(Serialize)]
struct FailedPayload<'a> {
    error: &'a str,
}

impl BatchEvent {
    pub fn failed(error: impl fmt::Display) -> Self {
        BatchEvent::Failed(BatchFailure {
            error: error.to_string(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchEvent::Progress(_))
    }

    /// JSON object in the event-stream wire shape
    pub fn to_json(&self) -> serde_json::Value {
        let value = match self {
            BatchEvent::Progress(update) => serde_json::to_value(ProgressPayload {
                progress: update.percent(),
                current_file: &update.current_file,
                faulty_count: update.faulty_count,
                error: update.error.as_deref(),
            }),
            BatchEvent::Complete(results) => serde_json::to_value(CompletePayload {
                complete: true,
                total_processed: results.total(),
                faulty_files: results.faulty_count(),
                visualization: results.visualization(),
                table_data: ExportFormatter::table_data(results),
            }),
            BatchEvent::Failed(failure) => serde_json::to_value(FailedPayload {
                error: &failure.error,
            }),
        };
        payload_or_error(value)
    }

    /// Server-sent-event frame
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}

/// A payload that fails to serialize still reaches the consumer, as a failure frame
fn payload_or_error(value: serde_json::Result<serde_json::Value>) -> serde_json::Value {
    value.unwrap_or_else(|e| {
        error!(error = %e, "failed to serialize batch event");
        serde_json::json!({ "error": format!("Failed to serialize batch event: {e}") })
    })
}

/// Receiving end handed to the caller of a batch
#[derive(Debug)]
pub struct ProgressChannel {
    receiver: mpsc::Receiver<BatchEvent>,
}

impl ProgressChannel {
    /// Create a connected sender/channel pair
    pub fn bounded(capacity: usize) -> (ProgressSender, ProgressChannel) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            ProgressSender {
                sender,
                consumer_gone: false,
            },
            ProgressChannel { receiver },
        )
    }

    /// A channel that holds only a terminal failure event
    pub fn failed(error: impl fmt::Display) -> Self {
        let (sender, receiver) = mpsc::channel(1);
        // Capacity 1 and the receiver is alive, so this cannot fail
        let _ = sender.try_send(BatchEvent::failed(error));
        ProgressChannel { receiver }
    }

    /// Next event, or `None` once the stream is closed
    pub async fn recv(&mut self) -> Option<BatchEvent> {
        self.receiver.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<BatchEvent> {
        ReceiverStream::new(self.receiver)
    }

    /// Drain every event up to and including the terminal one
    pub async fn collect(mut self) -> Vec<BatchEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}

/// Sending end owned by the scheduler's reducer
#[derive(Debug)]
pub struct ProgressSender {
    sender: mpsc::Sender<BatchEvent>,
    consumer_gone: bool,
}

impl ProgressSender {
    /// Send one event. Once the consumer has hung up this becomes a no-op
    /// and returns `false`.
    pub async fn send(&mut self, event: BatchEvent) -> bool {
        if self.consumer_gone {
            return false;
        }
        if self.sender.send(event).await.is_err() {
            debug!("progress consumer disconnected; suppressing further events");
            self.consumer_gone = true;
        }
        !self.consumer_gone
    }

    pub fn consumer_gone(&self) -> bool {
        self.consumer_gone
    }
}
