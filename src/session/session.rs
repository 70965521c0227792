//! Sentinel-based command protocol on an interactive shell
//!
//! A session writes command lines into the container's shell and
//! recognizes completion by echoing a random sentinel token plus `$?`
//! after each command. Output lines are republished as `Logs` events;
//! a sentinel glued to the tail of real output is split back apart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::transport::Transport;
use crate::core::PipelineOptions;
use crate::events::{Emitter, LogStream};

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Command timed out")]
    CommandTimeout,

    #[error("Command timed out after no response")]
    NoResponseTimeout,

    #[error("Command cancelled due to error")]
    Cancelled,

    #[error("Attach failed: {0}")]
    AttachFailed(String),

    #[error("Session is closed")]
    Closed,
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Outcome of one `send_checked` invocation.
///
/// A command that never produced its sentinel (timeout, silence,
/// cancellation) still yields a result: exit code -1, whatever output
/// was captured, and the failure that ended it.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub output: Vec<String>,
    /// Set when the sentinel was never observed
    pub failure: Option<SessionError>,
}

impl CommandResult {
    fn finished(exit_code: i32, output: Vec<String>) -> Self {
        Self {
            exit_code,
            output,
            failure: None,
        }
    }

    fn failed(output: Vec<String>, failure: SessionError) -> Self {
        Self {
            exit_code: -1,
            output,
            failure: Some(failure),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.failure.is_none()
    }

    /// Error message per the command contract, none on exit 0
    pub fn error(&self) -> Option<String> {
        if let Some(failure) = &self.failure {
            return Some(failure.to_string());
        }
        if self.success() {
            None
        } else {
            Some(format!("Command exited with exit code {}", self.exit_code))
        }
    }
}

/// How long a command-timeout drain keeps reading trailing output
const DRAIN_WINDOW: Duration = Duration::from_millis(100);

/// One interactive shell on top of a container attach.
///
/// Commands are strictly sequential; the receive side is owned by one
/// `send_checked` at a time.
pub struct Session {
    run_id: String,
    emitter: Emitter,
    send_tx: mpsc::Sender<String>,
    recv_rx: Mutex<mpsc::Receiver<String>>,
    session_ctx: CancellationToken,
    logs_hidden: AtomicBool,
    command_timeout: Duration,
    no_response_timeout: Duration,
}

impl Session {
    /// Attach the transport and wire up the session channels
    pub async fn attach(
        transport: &dyn Transport,
        ctx: CancellationToken,
        emitter: Emitter,
        options: &PipelineOptions,
    ) -> SessionResult<Arc<Session>> {
        let (send_tx, stdin_rx) = mpsc::channel(128);
        let (output_tx, recv_rx) = mpsc::channel(128);

        let session_ctx = transport.attach(ctx, stdin_rx, output_tx).await?;

        Ok(Arc::new(Session {
            run_id: options.run_id.clone(),
            emitter,
            send_tx,
            recv_rx: Mutex::new(recv_rx),
            session_ctx,
            logs_hidden: AtomicBool::new(false),
            command_timeout: options.command_timeout(),
            no_response_timeout: options.no_response_timeout(),
        }))
    }

    /// Mask subsequent log events
    pub fn hide_logs(&self) {
        self.logs_hidden.store(true, Ordering::SeqCst);
    }

    /// Stop masking log events
    pub fn show_logs(&self) {
        self.logs_hidden.store(false, Ordering::SeqCst);
    }

    fn hidden_mask(&self) -> bool {
        self.logs_hidden.load(Ordering::SeqCst)
    }

    /// Token cancelled when the attach ends
    pub fn context(&self) -> &CancellationToken {
        &self.session_ctx
    }

    /// Write lines to the shell's stdin, using the session's hidden mask
    pub async fn send(&self, lines: &[&str]) -> SessionResult<()> {
        self.send_with_hidden(self.hidden_mask(), lines).await
    }

    /// Write lines to the shell's stdin with an explicit hidden flag
    pub async fn send_with_hidden(&self, hidden: bool, lines: &[&str]) -> SessionResult<()> {
        for line in lines {
            // Cancelled before dispatch: no write, no event
            if self.session_ctx.is_cancelled() {
                return Err(SessionError::Cancelled);
            }

            let payload = format!("{}\n", line);
            self.send_tx
                .send(payload.clone())
                .await
                .map_err(|_| SessionError::Closed)?;

            self.emitter
                .emit_log(&self.run_id, "", LogStream::Stdin, payload, hidden);
        }
        Ok(())
    }

    /// Run command lines and wait for their combined exit code.
    ///
    /// Returns the exit code and captured output once the sentinel is
    /// observed. Command timeout, silence, and cancellation end the
    /// command with exit -1, the output captured so far, and the
    /// failure recorded on the result; `Err` is reserved for the send
    /// side (cancelled before dispatch, session closed).
    pub async fn send_checked(&self, lines: &[&str]) -> SessionResult<CommandResult> {
        let sentinel = uuid::Uuid::new_v4().simple().to_string();

        let mut recv = self.recv_rx.lock().await;

        self.send(lines).await?;
        self.send_with_hidden(true, &[&format!("echo {} $?", sentinel)])
            .await?;

        let mut parser = LineParser::new(sentinel);
        let mut output = Vec::new();
        let deadline = tokio::time::Instant::now() + self.command_timeout;

        loop {
            // Resolve the wake reason first; the receiver borrow must end
            // before the deadline path drains it again.
            let wake = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => Wake::CommandDeadline,
                received = tokio::time::timeout(self.no_response_timeout, recv.recv()) => {
                    match received {
                        Err(_) => Wake::NoResponse,
                        Ok(None) => Wake::Closed,
                        Ok(Some(chunk)) => Wake::Chunk(chunk),
                    }
                }
                _ = self.session_ctx.cancelled() => Wake::ParentCancel,
            };

            match wake {
                Wake::Chunk(chunk) => {
                    if let Some(exit_code) = self.consume(&mut parser, &chunk, &mut output) {
                        return Ok(CommandResult::finished(exit_code, output));
                    }
                }
                Wake::CommandDeadline => {
                    self.drain(&mut recv, &mut parser, &mut output).await;
                    debug!("Command hit its deadline");
                    return Ok(CommandResult::failed(output, SessionError::CommandTimeout));
                }
                Wake::NoResponse => {
                    return Ok(CommandResult::failed(
                        output,
                        SessionError::NoResponseTimeout,
                    ));
                }
                Wake::Closed | Wake::ParentCancel => {
                    return Ok(CommandResult::failed(output, SessionError::Cancelled));
                }
            }
        }
    }

    /// Feed one chunk through the parser, emitting log events; returns the
    /// exit code when the sentinel was seen.
    fn consume(
        &self,
        parser: &mut LineParser,
        chunk: &str,
        output: &mut Vec<String>,
    ) -> Option<i32> {
        let mask = self.hidden_mask();
        let mut exit = None;

        for event in parser.feed(chunk) {
            match event {
                LineEvent::Output(line) => {
                    self.emitter.emit_log(
                        &self.run_id,
                        "",
                        LogStream::Stdout,
                        format!("{}\n", line),
                        mask,
                    );
                    output.push(line);
                }
                LineEvent::Sentinel { line, exit_code } => {
                    self.emitter.emit_log(
                        &self.run_id,
                        "",
                        LogStream::Stdout,
                        format!("{}\n", line),
                        true,
                    );
                    exit = Some(exit_code);
                }
            }
        }
        exit
    }

    /// Keep reading briefly after a command deadline so trailing output
    /// still reaches the logs.
    async fn drain(
        &self,
        recv: &mut mpsc::Receiver<String>,
        parser: &mut LineParser,
        output: &mut Vec<String>,
    ) {
        let drain_deadline = tokio::time::Instant::now() + DRAIN_WINDOW;
        loop {
            match tokio::time::timeout_at(drain_deadline, recv.recv()).await {
                Ok(Some(chunk)) => {
                    self.consume(parser, &chunk, output);
                }
                _ => break,
            }
        }
    }
}

enum Wake {
    Chunk(String),
    CommandDeadline,
    NoResponse,
    Closed,
    ParentCancel,
}

enum LineEvent {
    Output(String),
    Sentinel { line: String, exit_code: i32 },
}

/// Splits a chunked byte stream into logical lines and recognizes the
/// sentinel, including one glued to the end of real output.
struct LineParser {
    sentinel: String,
    buffer: String,
}

impl LineParser {
    fn new(sentinel: String) -> Self {
        Self {
            sentinel,
            buffer: String::new(),
        }
    }

    fn feed(&mut self, chunk: &str) -> Vec<LineEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(idx) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=idx).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            self.split_line(line, &mut events);
        }

        events
    }

    fn split_line(&self, line: &str, events: &mut Vec<LineEvent>) {
        match line.find(&self.sentinel) {
            Some(0) => self.push_sentinel(line, events),
            Some(pos) => {
                // Sentinel glued to the tail of real output
                events.push(LineEvent::Output(line[..pos].to_string()));
                self.push_sentinel(&line[pos..], events);
            }
            None => {
                if !line.is_empty() {
                    events.push(LineEvent::Output(line.to_string()));
                }
            }
        }
    }

    fn push_sentinel(&self, line: &str, events: &mut Vec<LineEvent>) {
        let rest = line[self.sentinel.len()..].trim();
        match rest.parse::<i32>() {
            Ok(exit_code) => events.push(LineEvent::Sentinel {
                line: line.to_string(),
                exit_code,
            }),
            // Echoed-back command line or corrupted tail: not a result
            Err(_) => events.push(LineEvent::Output(line.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use async_trait::async_trait;

    /// Transport scripted by the test: hands out channel ends on attach
    struct ChannelTransport {
        wiring: std::sync::Mutex<Option<(mpsc::Receiver<String>, mpsc::Sender<String>)>>,
    }

    impl ChannelTransport {
        /// Returns (transport, command receiver, output sender)
        fn new() -> (Self, mpsc::Receiver<String>, mpsc::Sender<String>) {
            let (cmd_tx, cmd_rx) = mpsc::channel(64);
            let (out_tx, out_rx) = mpsc::channel(64);
            let transport = Self {
                wiring: std::sync::Mutex::new(Some((out_rx, cmd_tx))),
            };
            (transport, cmd_rx, out_tx)
        }
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn attach(
            &self,
            ctx: CancellationToken,
            mut stdin_rx: mpsc::Receiver<String>,
            output_tx: mpsc::Sender<String>,
        ) -> SessionResult<CancellationToken> {
            let (mut out_rx, cmd_tx) = self.wiring.lock().unwrap().take().unwrap();
            let derived = ctx.child_token();

            let forward_token = derived.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = forward_token.cancelled() => break,
                        chunk = out_rx.recv() => match chunk {
                            Some(chunk) => {
                                if output_tx.send(chunk).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
                forward_token.cancel();
            });

            tokio::spawn(async move {
                while let Some(line) = stdin_rx.recv().await {
                    if cmd_tx.send(line).await.is_err() {
                        break;
                    }
                }
            });

            Ok(derived)
        }
    }

    fn options(command_ms: u64, silence_ms: u64) -> PipelineOptions {
        PipelineOptions {
            run_id: "r1".to_string(),
            command_timeout_ms: command_ms,
            no_response_timeout_ms: silence_ms,
            ..Default::default()
        }
    }

    /// Pull the sentinel token out of the echoed check line
    fn sentinel_of(check_line: &str) -> String {
        check_line
            .trim()
            .strip_prefix("echo ")
            .unwrap()
            .split_whitespace()
            .next()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_send_checked_happy_path() {
        let (transport, mut cmd_rx, out_tx) = ChannelTransport::new();
        let emitter = Emitter::new();
        let mut events = emitter.subscribe();
        let session = Session::attach(
            &transport,
            CancellationToken::new(),
            emitter.clone(),
            &options(5_000, 5_000),
        )
        .await
        .unwrap();

        let driver = tokio::spawn(async move {
            let _cmd = cmd_rx.recv().await.unwrap();
            let check = cmd_rx.recv().await.unwrap();
            let sentinel = sentinel_of(&check);
            out_tx.send("hi\n".to_string()).await.unwrap();
            out_tx.send(format!("{} 0\n", sentinel)).await.unwrap();
        });

        let result = session.send_checked(&["echo hi"]).await.unwrap();
        driver.await.unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, vec!["hi"]);
        assert!(result.error().is_none());

        // stdin(cmd), stdin(check), stdout(hi), stdout(sentinel, hidden)
        let mut stdout_lines = Vec::new();
        let mut hidden_stdout = 0;
        while let Ok(event) = events.try_recv() {
            if let Event::Logs { stream, text, hidden, .. } = event {
                if stream == LogStream::Stdout {
                    if hidden {
                        hidden_stdout += 1;
                    } else {
                        stdout_lines.push(text);
                    }
                }
            }
        }
        assert_eq!(stdout_lines, vec!["hi\n"]);
        assert_eq!(hidden_stdout, 1);
    }

    #[tokio::test]
    async fn test_sentinel_glued_to_output() {
        let (transport, mut cmd_rx, out_tx) = ChannelTransport::new();
        let emitter = Emitter::new();
        let mut events = emitter.subscribe();
        let session = Session::attach(
            &transport,
            CancellationToken::new(),
            emitter.clone(),
            &options(5_000, 5_000),
        )
        .await
        .unwrap();

        let driver = tokio::spawn(async move {
            let _cmd = cmd_rx.recv().await.unwrap();
            let check = cmd_rx.recv().await.unwrap();
            let sentinel = sentinel_of(&check);
            out_tx.send(format!("abc{} 0\n", sentinel)).await.unwrap();
        });

        let result = session.send_checked(&["printf abc"]).await.unwrap();
        driver.await.unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, vec!["abc"]);

        // The sentinel line only ever appears as a hidden event
        while let Ok(event) = events.try_recv() {
            if let Event::Logs { stream: LogStream::Stdout, text, hidden, .. } = event {
                if !hidden {
                    assert_eq!(text, "abc\n");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_error() {
        let (transport, mut cmd_rx, out_tx) = ChannelTransport::new();
        let session = Session::attach(
            &transport,
            CancellationToken::new(),
            Emitter::new(),
            &options(5_000, 5_000),
        )
        .await
        .unwrap();

        tokio::spawn(async move {
            let _ = cmd_rx.recv().await;
            let check = cmd_rx.recv().await.unwrap();
            let sentinel = sentinel_of(&check);
            let _ = out_tx.send(format!("{} 42\n", sentinel)).await;
        });

        let result = session.send_checked(&["false"]).await.unwrap();
        assert_eq!(result.exit_code, 42);
        assert_eq!(
            result.error().unwrap(),
            "Command exited with exit code 42"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout_keeps_captured_output() {
        let (transport, mut cmd_rx, out_tx) = ChannelTransport::new();
        let session = Session::attach(
            &transport,
            CancellationToken::new(),
            Emitter::new(),
            &options(100, 50_000),
        )
        .await
        .unwrap();

        // Some output arrives, then the command hangs forever
        tokio::spawn(async move {
            let _cmd = cmd_rx.recv().await;
            let _check = cmd_rx.recv().await;
            let _ = out_tx.send("partial\n".to_string()).await;
            while cmd_rx.recv().await.is_some() {}
        });

        let result = session.send_checked(&["sleep 5"]).await.unwrap();
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.output, vec!["partial"]);
        assert!(matches!(
            result.failure,
            Some(SessionError::CommandTimeout)
        ));
        assert!(result.error().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_response_timeout() {
        let (transport, mut cmd_rx, _out_tx) = ChannelTransport::new();
        let session = Session::attach(
            &transport,
            CancellationToken::new(),
            Emitter::new(),
            &options(50_000, 100),
        )
        .await
        .unwrap();

        tokio::spawn(async move { while cmd_rx.recv().await.is_some() {} });

        let result = session.send_checked(&["true"]).await.unwrap();
        assert_eq!(result.exit_code, -1);
        assert!(result.output.is_empty());
        assert!(matches!(
            result.failure,
            Some(SessionError::NoResponseTimeout)
        ));
    }

    #[tokio::test]
    async fn test_cancel_mid_command_returns_minus_one() {
        let (transport, mut cmd_rx, _out_tx) = ChannelTransport::new();
        let ctx = CancellationToken::new();
        let session = Session::attach(
            &transport,
            ctx.clone(),
            Emitter::new(),
            &options(50_000, 50_000),
        )
        .await
        .unwrap();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            let _cmd = cmd_rx.recv().await;
            let _check = cmd_rx.recv().await;
            canceller.cancel();
        });

        let result = session.send_checked(&["true"]).await.unwrap();
        assert_eq!(result.exit_code, -1);
        assert!(matches!(result.failure, Some(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_send_after_cancel_emits_nothing() {
        let (transport, _cmd_rx, _out_tx) = ChannelTransport::new();
        let ctx = CancellationToken::new();
        let emitter = Emitter::new();
        let mut events = emitter.subscribe();
        let session = Session::attach(&transport, ctx.clone(), emitter.clone(), &options(5_000, 5_000))
            .await
            .unwrap();

        ctx.cancel();
        let err = session.send(&["echo nope"]).await.unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_line_parser_partial_chunks() {
        let mut parser = LineParser::new("SENT".to_string());
        assert!(parser.feed("par").is_empty());
        let events = parser.feed("tial\nSENT 0\n");
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], LineEvent::Output(l) if l == "partial"));
        assert!(matches!(&events[1], LineEvent::Sentinel { exit_code: 0, .. }));
    }
}
