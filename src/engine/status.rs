//! Pull/push status stream processing
//!
//! The daemon reports image transfers as a stream of JSON messages. This
//! processor folds them into a single terminal line: per-layer progress
//! keyed by id, the last completion message, `\r` rewinds, and trailing
//! padding to erase longer previous output.

use std::collections::BTreeMap;

use bollard::models::{CreateImageInfo, PushImageInfo};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("{0}")]
    Stream(String),

    #[error("Docker push failed to complete")]
    PushIncomplete,
}

/// Normalized transfer status message
#[derive(Debug, Clone, Default)]
pub struct JsonMessage {
    pub status: String,
    pub id: String,
    pub progress: String,
    pub current: i64,
    pub total: i64,
    pub error: String,
    pub stream: String,
}

impl From<CreateImageInfo> for JsonMessage {
    fn from(info: CreateImageInfo) -> Self {
        Self {
            status: info.status.unwrap_or_default(),
            id: info.id.unwrap_or_default(),
            progress: info.progress.unwrap_or_default(),
            current: info
                .progress_detail
                .as_ref()
                .and_then(|d| d.current)
                .unwrap_or(0),
            total: info
                .progress_detail
                .as_ref()
                .and_then(|d| d.total)
                .unwrap_or(0),
            error: info.error.unwrap_or_default(),
            stream: String::new(),
        }
    }
}

impl From<PushImageInfo> for JsonMessage {
    fn from(info: PushImageInfo) -> Self {
        Self {
            status: info.status.unwrap_or_default(),
            id: String::new(),
            progress: info.progress.unwrap_or_default(),
            current: info
                .progress_detail
                .as_ref()
                .and_then(|d| d.current)
                .unwrap_or(0),
            total: info
                .progress_detail
                .as_ref()
                .and_then(|d| d.total)
                .unwrap_or(0),
            error: info.error.unwrap_or_default(),
            stream: String::new(),
        }
    }
}

const PROGRESS_STATUSES: &[&str] = &["Extracting", "Pushing", "Downloading", "Buffering"];

const COMPLETION_STATUSES: &[&str] = &[
    "Pull complete",
    "Download complete",
    "Image already pushed",
    "Image successfully pushed",
];

/// Stateful processor for one transfer stream
#[derive(Debug, Default)]
pub struct StatusProcessor {
    progress: BTreeMap<String, String>,
    last_message: String,
    prev_width: usize,
    digest: Option<String>,
    push_completed: bool,
}

impl StatusProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one message; returns a terminal line to display, or an error
    /// carried in the stream.
    pub fn process(&mut self, msg: &JsonMessage) -> Result<Option<String>, StatusError> {
        if !msg.error.is_empty() {
            return Err(StatusError::Stream(msg.error.clone()));
        }

        // Raw build-style output passes through untouched
        if !msg.stream.is_empty() {
            return Ok(Some(msg.stream.clone()));
        }

        if msg.status.is_empty() {
            return Ok(None);
        }

        if let Some(idx) = msg.status.find("digest:") {
            let rest = &msg.status[idx + "digest:".len()..];
            let digest = rest
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_string();
            if !digest.is_empty() {
                self.digest = Some(digest);
                self.push_completed = true;
            }
        }

        if PROGRESS_STATUSES.iter().any(|p| msg.status.starts_with(p)) {
            let key = if msg.id.is_empty() { "-".to_string() } else { msg.id.clone() };
            self.progress.insert(key, format_progress(msg));
            return Ok(Some(self.render()));
        }

        if COMPLETION_STATUSES.iter().any(|p| msg.status.starts_with(p)) {
            if msg.status.starts_with("Image already pushed")
                || msg.status.starts_with("Image successfully pushed")
            {
                self.push_completed = true;
            }
            if !msg.id.is_empty() {
                self.progress.remove(&msg.id);
            }
            self.last_message = if msg.id.is_empty() {
                msg.status.clone()
            } else {
                format!("{}: {}", msg.id, msg.status)
            };
            return Ok(Some(self.render()));
        }

        // Anything else replaces the headline message
        self.last_message = msg.status.clone();
        Ok(Some(self.render()))
    }

    /// The digest reported by the daemon, when one was observed
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Push success: a digest or an explicit completion message was seen
    pub fn finish_push(&self) -> Result<(), StatusError> {
        if self.push_completed {
            Ok(())
        } else {
            Err(StatusError::PushIncomplete)
        }
    }

    /// Terminal line ending the rewind sequence
    pub fn final_line(&mut self) -> String {
        let line = self.render();
        format!("{}\n", line)
    }

    fn render(&mut self) -> String {
        let mut parts = Vec::new();
        if !self.last_message.is_empty() {
            parts.push(self.last_message.clone());
        }
        parts.extend(self.progress.values().cloned());

        let line = parts.join("; ");
        let width = line.chars().count();
        let padding = self.prev_width.saturating_sub(width);
        self.prev_width = width;

        format!("\r{}{}", line, " ".repeat(padding))
    }
}

fn format_progress(msg: &JsonMessage) -> String {
    let label = if msg.id.is_empty() {
        msg.status.clone()
    } else {
        format!("{}: {}", msg.id, msg.status)
    };
    if msg.total > 0 {
        let pct = (msg.current * 100) / msg.total;
        format!("{} {}%", label, pct)
    } else {
        label
    }
}

/// Processor for image pulls
pub type PullStatusProcessor = StatusProcessor;

/// Processor for image pushes
pub type PushStatusProcessor = StatusProcessor;

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(status: &str, id: &str) -> JsonMessage {
        JsonMessage {
            status: status.to_string(),
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_progress_and_completion_lines() {
        let mut proc = StatusProcessor::new();

        let line = proc
            .process(&JsonMessage {
                status: "Downloading".to_string(),
                id: "aaa".to_string(),
                current: 50,
                total: 100,
                ..Default::default()
            })
            .unwrap()
            .unwrap();
        assert!(line.starts_with('\r'));
        assert!(line.contains("aaa: Downloading 50%"));

        let line = proc
            .process(&msg("Download complete", "aaa"))
            .unwrap()
            .unwrap();
        assert!(line.contains("aaa: Download complete"));
        assert!(!line.contains('%'));
    }

    #[test]
    fn test_padding_erases_longer_previous_line() {
        let mut proc = StatusProcessor::new();
        proc.process(&msg("Downloading a very long layer indeed", "aaa"))
            .unwrap();
        let line = proc.process(&msg("Pull complete", "aaa")).unwrap().unwrap();
        assert!(line.ends_with(' '));
    }

    #[test]
    fn test_error_is_surfaced() {
        let mut proc = StatusProcessor::new();
        let result = proc.process(&JsonMessage {
            error: "unauthorized".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(StatusError::Stream(e)) if e == "unauthorized"));
    }

    #[test]
    fn test_push_requires_digest_or_completion() {
        let mut proc = StatusProcessor::new();
        proc.process(&msg("Pushing", "layer1")).unwrap();
        assert!(matches!(
            proc.finish_push(),
            Err(StatusError::PushIncomplete)
        ));

        proc.process(&msg(
            "latest: digest: sha256:deadbeef size: 1234",
            "",
        ))
        .unwrap();
        assert!(proc.finish_push().is_ok());
        assert_eq!(proc.digest(), Some("sha256:deadbeef"));
    }
}
