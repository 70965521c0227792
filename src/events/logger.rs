//! Terminal renderer for pipeline events

use std::io::Write;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;

use super::bus::{Emitter, Event};

/// Renders non-hidden log traffic and step boundaries to stdout.
///
/// One logger per pipeline run; drop the handle to let it drain.
pub struct TerminalLogger;

impl TerminalLogger {
    /// Subscribe to the emitter and render until the channel closes
    pub fn start(emitter: &Emitter) -> JoinHandle<()> {
        let mut rx = emitter.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => render(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Log renderer lagged, dropped {} events", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

fn render(event: &Event) {
    match event {
        Event::BuildStarted { pipeline_name, .. } => {
            println!("--> Running {}", pipeline_name);
        }
        Event::BuildStepStarted { step, .. } => {
            println!("--> {}", step.display_name);
        }
        Event::BuildStepFinished {
            step,
            successful,
            message,
            ..
        } => {
            if !successful {
                let detail = if message.is_empty() {
                    String::new()
                } else {
                    format!(": {}", message)
                };
                println!("!!! {} failed{}", step.display_name, detail);
            }
        }
        Event::BuildFinished { result, .. } => {
            println!("--> Pipeline {}", result);
        }
        Event::FullPipelineFinished { .. } => {}
        Event::BuildStepsAdded { .. } => {}
        Event::Logs { text, hidden, .. } => {
            if !hidden {
                // Progress lines carry their own \r rewinds; pass bytes through
                let mut out = std::io::stdout();
                let _ = out.write_all(text.as_bytes());
                let _ = out.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogStream;

    #[tokio::test]
    async fn test_logger_drains_until_close() {
        let emitter = Emitter::new();
        let handle = TerminalLogger::start(&emitter);

        emitter.emit_log("r", "s", LogStream::Stdout, "visible\n", false);
        emitter.emit_log("r", "s", LogStream::Stdout, "masked\n", true);
        drop(emitter);

        handle.await.unwrap();
    }
}
