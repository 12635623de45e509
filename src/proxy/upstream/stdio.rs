//! Stdio upstream client.
//!
//! # Responsibilities
//! - Spawn the server process with piped stdin/stdout
//! - Correlate newline-delimited JSON-RPC responses with pending requests
//! - Answer the few requests a server may send back (`ping`)
//!
//! # Design Decisions
//! - One reader task per child; requests from many downstream sessions share it
//! - The child is killed when the client is dropped
//! - stderr is inherited so server diagnostics reach the proxy's log stream

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::proxy::jsonrpc::{ErrorObject, Message, OutgoingNotification, OutgoingRequest, Response};
use crate::proxy::upstream::UpstreamError;

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, UpstreamError>>>>>;
type Writer = Arc<tokio::sync::Mutex<ChildStdin>>;

/// JSON-RPC client over a child process's stdio.
#[derive(Debug)]
pub struct StdioClient {
    writer: Writer,
    pending: PendingRequests,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    _child: Child,
}

impl StdioClient {
    /// Spawn `command` and start the reader task.
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self, UpstreamError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| UpstreamError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| UpstreamError::Protocol("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| UpstreamError::Protocol("child stdout not captured".to_string()))?;

        tracing::debug!(server, command, pid = ?child.id(), "Spawned upstream process");

        let writer: Writer = Arc::new(tokio::sync::Mutex::new(stdin));
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader_task(
            server.to_string(),
            stdout,
            writer.clone(),
            pending.clone(),
            closed.clone(),
        );

        Ok(Self {
            writer,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader,
            _child: child,
        })
    }

    /// Whether the child has closed its stdout.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, UpstreamError> {
        if self.is_closed() {
            return Err(UpstreamError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        // Removes the entry if this future is dropped (e.g. on timeout).
        let _guard = PendingRequestGuard {
            pending: self.pending.clone(),
            id,
        };

        write_message(&self.writer, &OutgoingRequest::new(id, method, &params))
            .await
            .map_err(closed_on_io)?;

        rx.await.unwrap_or(Err(UpstreamError::Closed))
    }

    pub async fn notify(&self, method: &str, params: Option<&Value>) -> Result<(), UpstreamError> {
        if self.is_closed() {
            return Err(UpstreamError::Closed);
        }
        write_message(&self.writer, &OutgoingNotification::new(method, params))
            .await
            .map_err(closed_on_io)
    }
}

impl Drop for StdioClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct PendingRequestGuard {
    pending: PendingRequests,
    id: u64,
}

impl Drop for PendingRequestGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}

/// A failed write to the child's stdin means the process is gone.
fn closed_on_io(error: UpstreamError) -> UpstreamError {
    match error {
        UpstreamError::Io(_) => UpstreamError::Closed,
        other => other,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn write_message<T: Serialize>(writer: &Writer, message: &T) -> Result<(), UpstreamError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    let mut stdin = writer.lock().await;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

fn spawn_reader_task(
    server: String,
    stdout: ChildStdout,
    writer: Writer,
    pending: PendingRequests,
    closed: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let value: Value = match serde_json::from_str(&line) {
                        Ok(value) => value,
                        Err(_) => {
                            tracing::debug!(server = %server, line = %line, "Ignoring non-JSON upstream output");
                            continue;
                        }
                    };
                    match Message::classify(value) {
                        Ok(Message::Response { id, result }) => {
                            let Some(id) = id.as_u64() else {
                                continue;
                            };
                            let tx = lock(&pending).remove(&id);
                            if let Some(tx) = tx {
                                let _ = tx.send(result.map_err(UpstreamError::Rpc));
                            }
                        }
                        Ok(Message::Request { id, method, .. }) => {
                            let reply = if method == "ping" {
                                Response::success(id, json!({}))
                            } else {
                                Response::failure(id, ErrorObject::method_not_found(&method))
                            };
                            if let Err(e) = write_message(&writer, &reply).await {
                                tracing::warn!(server = %server, method = %method, error = %e, "Failed to answer upstream request");
                            }
                        }
                        Ok(Message::Notification { method, .. }) => {
                            tracing::debug!(server = %server, method = %method, "Upstream notification");
                        }
                        Err((_, error)) => {
                            tracing::debug!(server = %server, error = %error.message, "Ignoring invalid upstream message");
                        }
                    }
                }
                Ok(None) => {
                    tracing::warn!(server = %server, "Upstream process closed stdout");
                    break;
                }
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "Failed to read from upstream process");
                    break;
                }
            }
        }
        closed.store(true, Ordering::SeqCst);
        drain_pending(&pending);
    })
}

fn drain_pending(pending: &PendingRequests) {
    let drained = std::mem::take(&mut *lock(pending));
    for (_id, tx) in drained {
        let _ = tx.send(Err(UpstreamError::Closed));
    }
}
