//! `internal/watch`: rerun a command when the source tree changes

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::debug;

use super::InternalCore;
use crate::config::StepDefinition;
use crate::core::Environment;
use crate::events::LogStream;
use crate::step::{ExecContext, Step, StepContext, StepResult};

/// Polling interval for the change scan
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

pub struct WatchStep {
    core: InternalCore,
    code: Option<String>,
}

impl WatchStep {
    pub fn new(definition: &StepDefinition) -> Self {
        let core = InternalCore::new("watch", definition);
        Self {
            code: core.data.get("code").cloned(),
            core,
        }
    }
}

/// Snapshot of mtimes under a directory, ignoring VCS noise
fn scan(dir: &Path) -> HashMap<std::path::PathBuf, SystemTime> {
    let mut snapshot = HashMap::new();
    for entry in walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| e.file_name().to_string_lossy() != ".git")
        .flatten()
    {
        if entry.file_type().is_file() {
            if let Ok(meta) = entry.metadata() {
                if let Ok(mtime) = meta.modified() {
                    snapshot.insert(entry.path().to_path_buf(), mtime);
                }
            }
        }
    }
    snapshot
}

#[async_trait]
impl Step for WatchStep {
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

    /// Poll the project for changes until the session goes away, running
    /// the configured code on every change.
    async fn execute(&self, ctx: &ExecContext) -> StepResult<i32> {
        let watched = ctx.options.project_path.clone();
        let mut snapshot = scan(&watched);

        ctx.emitter.emit_log(
            &ctx.options.run_id,
            &self.core.safe_id,
            LogStream::Stdout,
            format!("--> Watching {}\n", watched.display()),
            false,
        );

        loop {
            tokio::select! {
                _ = ctx.session.context().cancelled() => {
                    debug!("Watch ended, session gone");
                    return Ok(0);
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let current = scan(&watched);
            if current != snapshot {
                snapshot = current;
                ctx.emitter.emit_log(
                    &ctx.options.run_id,
                    &self.core.safe_id,
                    LogStream::Stdout,
                    "--> Changes detected\n".to_string(),
                    false,
                );

                if let Some(code) = &self.code {
                    let result = ctx.session.send_checked(&[code.as_str()]).await?;
                    if !result.success() {
                        ctx.emitter.emit_log(
                            &ctx.options.run_id,
                            &self.core.safe_id,
                            LogStream::Stderr,
                            format!("--> Exited with {}\n", result.exit_code),
                            false,
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_tracks_files_and_skips_git() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::write(tmp.path().join("main.rs"), "fn main() {}").unwrap();

        let snapshot = scan(tmp.path());
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.keys().next().unwrap().ends_with("main.rs"));
    }
}
