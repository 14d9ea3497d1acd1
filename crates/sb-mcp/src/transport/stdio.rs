//! Stdio transport
//!
//! Spawns a child process and speaks newline-delimited JSON-RPC over its
//! stdin/stdout. Stderr is captured into a small ring so start failures can
//! surface the process's own words.

use crate::protocol::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use parking_lot::{Mutex as SyncMutex, RwLock};
use sb_types::{BrokerError, BrokerResult};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lines of stderr retained for error reporting
const STDERR_RING: usize = 40;

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Normalize a response id for pending-map lookup
///
/// Servers occasionally answer with `id: null`; map it to a sentinel key.
fn normalize_response_id(id: &Value) -> String {
    match id {
        Value::Null => "__null_id__".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("\"{}\"", s),
        _ => id.to_string(),
    }
}

type PendingMap = Arc<RwLock<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

pub struct StdioTransport {
    child: Arc<RwLock<Option<Child>>>,

    /// Mutex (not RwLock) so concurrent writers serialize across awaits
    stdin: Arc<Mutex<Option<ChildStdin>>>,

    pending: PendingMap,

    next_id: Arc<RwLock<u64>>,

    closed: Arc<RwLock<bool>>,

    stderr_tail: Arc<SyncMutex<VecDeque<String>>>,

    reader_task: Arc<RwLock<Option<JoinHandle<()>>>>,
    stderr_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl StdioTransport {
    /// Spawn the child process and start the reader tasks
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> BrokerResult<Self> {
        info!("spawning MCP process: {} {:?}", command, args);

        let mut child = tokio::process::Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BrokerError::ServerNotRunning(format!("failed to spawn '{}': {}", command, e))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            BrokerError::ServerNotRunning("failed to capture child stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BrokerError::ServerNotRunning("failed to capture child stdout".to_string())
        })?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let closed = Arc::new(RwLock::new(false));
        let stderr_tail = Arc::new(SyncMutex::new(VecDeque::with_capacity(STDERR_RING)));

        let reader_task = Self::start_stdout_reader(stdout, pending.clone(), closed.clone());
        let stderr_task = stderr.map(|stderr| Self::start_stderr_reader(stderr, stderr_tail.clone()));

        Ok(Self {
            child: Arc::new(RwLock::new(Some(child))),
            stdin: Arc::new(Mutex::new(Some(stdin))),
            pending,
            next_id: Arc::new(RwLock::new(1)),
            closed,
            stderr_tail,
            reader_task: Arc::new(RwLock::new(Some(reader_task))),
            stderr_task: Arc::new(RwLock::new(stderr_task)),
        })
    }

    fn start_stdout_reader(
        stdout: ChildStdout,
        pending: PendingMap,
        closed: Arc<RwLock<bool>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        info!("MCP process stdout closed");
                        *closed.write() = true;
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }

                        match serde_json::from_str::<JsonRpcMessage>(trimmed) {
                            Ok(JsonRpcMessage::Response(response)) => {
                                let id = normalize_response_id(&response.id);
                                if let Some(sender) = pending.write().remove(&id) {
                                    if sender.send(response).is_err() {
                                        warn!("response receiver dropped for id {}", id);
                                    }
                                } else {
                                    warn!("response for unknown request id {}", id);
                                }
                            }
                            Ok(JsonRpcMessage::Notification(notification)) => {
                                debug!("upstream notification: {}", notification.method);
                            }
                            Ok(JsonRpcMessage::Request(_)) => {
                                warn!("ignoring unexpected request from server: {}", trimmed);
                            }
                            Err(e) => {
                                error!("unparseable JSON-RPC line: {} ({})", trimmed, e);
                            }
                        }
                    }
                    Err(e) => {
                        error!("error reading MCP process stdout: {}", e);
                        *closed.write() = true;
                        break;
                    }
                }
            }

            for (id, _) in pending.write().drain() {
                warn!("request {} terminated without response", id);
            }
        })
    }

    fn start_stderr_reader(
        stderr: tokio::process::ChildStderr,
        tail: Arc<SyncMutex<VecDeque<String>>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let mut tail = tail.lock();
                        if tail.len() == STDERR_RING {
                            tail.pop_front();
                        }
                        tail.push_back(line.trim_end().to_string());
                    }
                    Err(_) => break,
                }
            }
        })
    }

    /// Recent stderr lines, for start-failure diagnostics
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().iter().cloned().collect()
    }

    fn next_request_id(&self) -> u64 {
        let mut next_id = self.next_id.write();
        let id = *next_id;
        *next_id += 1;
        id
    }

    /// Whether the child process is still running
    pub fn is_alive(&self) -> bool {
        if *self.closed.read() {
            return false;
        }
        let mut child = self.child.write();
        match child.as_mut() {
            Some(process) => matches!(process.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn send_request(&self, mut request: JsonRpcRequest) -> BrokerResult<JsonRpcResponse> {
        if *self.closed.read() {
            return Err(BrokerError::ServerNotRunning("transport is closed".to_string()));
        }

        // Always assign a fresh id to avoid collisions across callers
        let request_id = {
            let id = self.next_request_id();
            request.id = Some(Value::Number(id.into()));
            id.to_string()
        };

        let (tx, rx) = oneshot::channel();
        self.pending.write().insert(request_id.clone(), tx);

        let mut payload = serde_json::to_string(&request).map_err(|e| {
            self.pending.write().remove(&request_id);
            BrokerError::Upstream(format!("failed to serialize request: {}", e))
        })?;
        payload.push('\n');

        self.write_line(&payload, Some(&request_id)).await?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| {
                self.pending.write().remove(&request_id);
                BrokerError::Upstream(format!("request timeout for id {}", request_id))
            })?
            .map_err(|_| {
                BrokerError::Upstream(format!("response channel closed for id {}", request_id))
            })?;

        Ok(response)
    }

    pub async fn send_notification(&self, notification: JsonRpcNotification) -> BrokerResult<()> {
        let mut payload = serde_json::to_string(&notification)
            .map_err(|e| BrokerError::Upstream(format!("failed to serialize notification: {}", e)))?;
        payload.push('\n');
        self.write_line(&payload, None).await
    }

    async fn write_line(&self, payload: &str, pending_id: Option<&str>) -> BrokerResult<()> {
        let cleanup = |this: &Self| {
            if let Some(id) = pending_id {
                this.pending.write().remove(id);
            }
        };

        let mut stdin_guard = self.stdin.lock().await;
        let stdin = match stdin_guard.as_mut() {
            Some(stdin) => stdin,
            None => {
                cleanup(self);
                return Err(BrokerError::ServerNotRunning("stdin not available".to_string()));
            }
        };

        if let Err(e) = stdin.write_all(payload.as_bytes()).await {
            cleanup(self);
            return Err(BrokerError::Upstream(format!("failed to write to stdin: {}", e)));
        }
        if let Err(e) = stdin.flush().await {
            cleanup(self);
            return Err(BrokerError::Upstream(format!("failed to flush stdin: {}", e)));
        }
        Ok(())
    }

    /// Kill the child and cancel the reader tasks
    pub async fn close(&self) -> BrokerResult<()> {
        *self.closed.write() = true;

        if let Some(task) = self.reader_task.write().take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.write().take() {
            task.abort();
        }

        let child = self.child.write().take();
        if let Some(mut process) = child {
            process
                .kill()
                .await
                .map_err(|e| BrokerError::Upstream(format!("failed to kill process: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_response_id() {
        assert_eq!(normalize_response_id(&Value::Null), "__null_id__");
        assert_eq!(normalize_response_id(&json!(42)), "42");
        assert_eq!(normalize_response_id(&json!("abc")), "\"abc\"");
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_command_fails() {
        let result = StdioTransport::spawn(
            "this-command-definitely-does-not-exist-4242",
            &[],
            &HashMap::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = StdioTransport::spawn("cat", &[], &HashMap::new())
            .await
            .expect("cat should spawn");
        assert!(transport.is_alive());

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!transport.is_alive());
    }
}
