//! Guaranteed step-finished events

use crate::events::{Emitter, Event, StepSummary};

/// Emits `BuildStepFinished` exactly once, even when the phase unwinds.
///
/// Call `finish` with the real outcome; a finisher dropped without it
/// reports the step as interrupted.
pub struct Finisher {
    emitter: Emitter,
    run_id: String,
    step: StepSummary,
    order: usize,
    finished: bool,
}

impl Finisher {
    pub fn new(emitter: &Emitter, run_id: &str, step: &StepSummary, order: usize) -> Self {
        Self {
            emitter: emitter.clone(),
            run_id: run_id.to_string(),
            step: step.clone(),
            order,
            finished: false,
        }
    }

    pub fn finish(&mut self, successful: bool, message: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.emitter.emit(Event::BuildStepFinished {
            run_id: self.run_id.clone(),
            step: self.step.clone(),
            order: self.order,
            successful,
            message: message.to_string(),
            artifact_url: None,
        });
    }
}

impl Drop for Finisher {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(false, "interrupted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> StepSummary {
        StepSummary {
            id: "script".to_string(),
            safe_id: "script-1".to_string(),
            display_name: "script".to_string(),
        }
    }

    #[tokio::test]
    async fn test_finish_emits_once() {
        let emitter = Emitter::new();
        let mut rx = emitter.subscribe();

        let mut finisher = Finisher::new(&emitter, "r1", &summary(), 1);
        finisher.finish(true, "");
        finisher.finish(false, "ignored");
        drop(finisher);

        let event = rx.recv().await.unwrap();
        match event {
            Event::BuildStepFinished { successful, .. } => assert!(successful),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_without_finish_reports_interrupted() {
        let emitter = Emitter::new();
        let mut rx = emitter.subscribe();

        {
            let _finisher = Finisher::new(&emitter, "r1", &summary(), 1);
        }

        match rx.recv().await.unwrap() {
            Event::BuildStepFinished {
                successful,
                message,
                ..
            } => {
                assert!(!successful);
                assert_eq!(message, "interrupted");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
