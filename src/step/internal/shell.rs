//! `internal/shell`: hand the terminal to the pipeline container

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use super::InternalCore;
use crate::config::StepDefinition;
use crate::core::Environment;
use crate::step::{ExecContext, Step, StepContext, StepResult};

pub struct ShellStep {
    core: InternalCore,
}

impl ShellStep {
    pub fn new(definition: &StepDefinition) -> Self {
        Self {
            core: InternalCore::new("shell", definition),
        }
    }
}

#[async_trait]
impl Step for ShellStep {
    fn display_name(&self) -> &str {
        &self.core.display_name
    }

    fn id(&self) -> &str {
        &self.core.id
    }

    fn owner(&self) -> &str {
        self.core.owner()
    }

    fn safe_id(&self) -> &str {
        &self.core.safe_id
    }

    fn checkpoint(&self) -> Option<&str> {
        self.core.checkpoint.as_deref()
    }

    async fn fetch(&mut self, _ctx: &StepContext) -> StepResult<()> {
        Ok(())
    }

    fn init_env(&mut self, _ctx: &StepContext, _env: &mut Environment) -> StepResult<()> {
        Ok(())
    }

    /// Forward this process's stdin into the session until EOF or the
    /// session ends. Output arrives through the normal log events.
    async fn execute(&self, ctx: &ExecContext) -> StepResult<i32> {
        let session = &ctx.session;

        session
            .send(&[&format!("cd \"{}\"", ctx.options.source_path())])
            .await?;

        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        loop {
            tokio::select! {
                _ = session.context().cancelled() => {
                    debug!("Shell ended, session gone");
                    return Ok(0);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => session.send(&[line.as_str()]).await?,
                    Ok(None) => return Ok(0),
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}
