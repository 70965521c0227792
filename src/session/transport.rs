//! Attach transport: container I/O as a pair of channels

use async_trait::async_trait;
use bollard::container::{AttachContainerOptions, AttachContainerResults};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::session::{SessionError, SessionResult};
use crate::engine::DockerClient;

/// Wires a container's stdin/stdout/stderr to channel endpoints.
///
/// `attach` returns a token derived from `ctx` that is cancelled when the
/// underlying attach ends, for any reason.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn attach(
        &self,
        ctx: CancellationToken,
        stdin_rx: mpsc::Receiver<String>,
        output_tx: mpsc::Sender<String>,
    ) -> SessionResult<CancellationToken>;
}

/// Transport over the Docker attach API
pub struct DockerTransport {
    client: DockerClient,
    container_id: String,
}

impl DockerTransport {
    pub fn new(client: DockerClient, container_id: String) -> Self {
        Self {
            client,
            container_id,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }
}

#[async_trait]
impl Transport for DockerTransport {
    async fn attach(
        &self,
        ctx: CancellationToken,
        mut stdin_rx: mpsc::Receiver<String>,
        output_tx: mpsc::Sender<String>,
    ) -> SessionResult<CancellationToken> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            ..Default::default()
        };

        let AttachContainerResults {
            mut output,
            mut input,
        } = self
            .client
            .client()
            .attach_container(&self.container_id, Some(options))
            .await
            .map_err(|e| SessionError::AttachFailed(e.to_string()))?;

        let derived = ctx.child_token();
        let container_id = self.container_id.clone();

        // Reader: container output -> output channel
        let reader_token = derived.clone();
        let reader_id = container_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_token.cancelled() => break,
                    chunk = output.next() => match chunk {
                        Some(Ok(log_output)) => {
                            let bytes = log_output.into_bytes();
                            if bytes.is_empty() {
                                continue;
                            }
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            if output_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("Error reading output from {}: {}", reader_id, e);
                            break;
                        }
                        None => break,
                    }
                }
            }
            debug!("Output stream ended for {}", reader_id);
            reader_token.cancel();
        });

        // Writer: stdin channel -> container input
        let writer_token = derived.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_token.cancelled() => break,
                    line = stdin_rx.recv() => match line {
                        Some(line) => {
                            if let Err(e) = input.write_all(line.as_bytes()).await {
                                warn!("Error writing to {}: {}", container_id, e);
                                break;
                            }
                            if let Err(e) = input.flush().await {
                                warn!("Error flushing stdin for {}: {}", container_id, e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!("Input handler ended for {}", container_id);
            writer_token.cancel();
        });

        Ok(derived)
    }
}
