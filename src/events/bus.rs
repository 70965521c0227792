//! Event bus for pipeline progress and log output
//!
//! Every observable thing the engine does is published here: pipeline and
//! step boundaries plus raw log traffic. Consumers render terminal output
//! or report results; they must not block.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Which stream a `Logs` payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdin,
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdin => write!(f, "stdin"),
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Identifying slice of a step carried in events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub id: String,
    pub safe_id: String,
    pub display_name: String,
}

/// Events published during a pipeline run
#[derive(Debug, Clone)]
pub enum Event {
    /// A pipeline run began
    BuildStarted {
        run_id: String,
        pipeline_name: String,
    },

    /// The full step list for a run is known
    BuildStepsAdded {
        run_id: String,
        steps: Vec<StepSummary>,
        store_step: Option<StepSummary>,
    },

    /// A step began executing
    BuildStepStarted {
        run_id: String,
        step: StepSummary,
        order: usize,
    },

    /// A step finished, successfully or not
    BuildStepFinished {
        run_id: String,
        step: StepSummary,
        order: usize,
        successful: bool,
        message: String,
        artifact_url: Option<String>,
    },

    /// The pipeline run finished
    BuildFinished {
        run_id: String,
        /// "passed" or "failed"
        result: String,
    },

    /// Everything, including after-steps, is done
    FullPipelineFinished {
        run_id: String,
        main_successful: bool,
        run_error: Option<String>,
    },

    /// A chunk of log output
    Logs {
        run_id: String,
        step_safe_id: String,
        stream: LogStream,
        text: String,
        hidden: bool,
    },
}

/// Broadcast emitter shared by one pipeline run.
///
/// Wraps a tokio broadcast channel; publishing without subscribers drops
/// events silently. Subscribers that fall behind see lagged errors.
pub struct Emitter {
    sender: broadcast::Sender<Event>,
    // Keep one receiver so the channel never closes
    _receiver: broadcast::Receiver<Event>,
}

impl Emitter {
    /// Capacity sized to absorb log bursts without lagging
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, _receiver }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event; returns the number of receivers reached
    pub fn emit(&self, event: Event) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Publish a `Logs` event
    pub fn emit_log(
        &self,
        run_id: &str,
        step_safe_id: &str,
        stream: LogStream,
        text: impl Into<String>,
        hidden: bool,
    ) {
        self.emit(Event::Logs {
            run_id: run_id.to_string(),
            step_safe_id: step_safe_id.to_string(),
            stream,
            text: text.into(),
            hidden,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Emitter {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let emitter = Emitter::new();
        let mut rx = emitter.subscribe();

        emitter.emit(Event::BuildStarted {
            run_id: "r1".to_string(),
            pipeline_name: "build".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::BuildStarted { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_logs() {
        let emitter = Emitter::new();
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit_log("r1", "s1", LogStream::Stdout, "hi\n", false);

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                Event::Logs { text, stream, hidden, .. } => {
                    assert_eq!(text, "hi\n");
                    assert_eq!(stream, LogStream::Stdout);
                    assert!(!hidden);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_dropped() {
        let emitter = Emitter::new();
        // Only the internal keep-alive receiver exists
        let reached = emitter.emit(Event::BuildFinished {
            run_id: "r1".to_string(),
            result: "passed".to_string(),
        });
        assert_eq!(reached, 1);
    }

    #[test]
    fn test_log_stream_display() {
        assert_eq!(LogStream::Stdin.to_string(), "stdin");
        assert_eq!(LogStream::Stdout.to_string(), "stdout");
        assert_eq!(LogStream::Stderr.to_string(), "stderr");
    }
}
