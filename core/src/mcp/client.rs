//! MCP stdio client
//!
//! Hosts an MCP server as a supervised child process speaking line-delimited
//! JSON-RPC 2.0. Requests carry monotonically increasing ids correlated to
//! oneshot responders; stderr is drained into the log. When the process
//! exits, in-flight requests fail with `TransportLost` and the next call
//! reconnects under exponential backoff.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use super::protocol::{
    extract_resource_text, extract_tool_payload, initialize_params, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION,
};
use crate::error::{HarveyError, Result};

const INIT_TIMEOUT: Duration = Duration::from_secs(5);
const RESOURCE_TIMEOUT: Duration = Duration::from_secs(10);
const TOOL_TIMEOUT: Duration = Duration::from_secs(60);
const BACKOFF_START: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
const BACKOFF_JITTER: f64 = 0.2;

/// Launch configuration for the server subprocess
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Value for the child's module search path variable (PYTHONPATH)
    pub extra_path: Option<String>,
}

type PendingMap = HashMap<u64, oneshot::Sender<std::result::Result<Value, HarveyError>>>;

struct Connection {
    stdin: ChildStdin,
    child: Child,
}

/// MCP host for one server subprocess
pub struct McpClient {
    config: McpServerConfig,
    next_id: AtomicU64,
    pending: Arc<Mutex<PendingMap>>,
    connection: Mutex<Option<Connection>>,
    failed_connects: AtomicU32,
}

impl McpClient {
    pub fn new(config: McpServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            connection: Mutex::new(None),
            failed_connects: AtomicU32::new(0),
        })
    }

    /// Perform the `initialize` handshake eagerly. Optional; the first
    /// request connects on demand otherwise.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.ensure_connected().await
    }

    pub async fn list_tools(self: &Arc<Self>) -> Result<Vec<Value>> {
        let result = self.request("tools/list", None, TOOL_TIMEOUT).await?;
        Ok(result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn call_tool(self: &Arc<Self>, name: &str, arguments: Value) -> Result<Value> {
        let params = json!({"name": name, "arguments": arguments});
        let result = self.request("tools/call", Some(params), TOOL_TIMEOUT).await?;
        extract_tool_payload(name, result)
    }

    pub async fn read_resource(self: &Arc<Self>, uri: &str) -> Result<String> {
        let params = json!({"uri": uri});
        let result = self
            .request("resources/read", Some(params), RESOURCE_TIMEOUT)
            .await?;
        extract_resource_text(result)
    }

    /// Kill the child process and fail anything still pending.
    pub async fn shutdown(&self) {
        if let Some(mut connection) = self.connection.lock().await.take() {
            let _ = connection.child.start_kill();
        }
        fail_all_pending(&self.pending, "client shut down").await;
    }

    async fn request(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.ensure_connected().await?;
        self.request_inner(method, params, timeout).await
    }

    /// Issue a request over the current connection without the reconnect
    /// path; used directly during the handshake.
    async fn request_inner(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(id, sender);

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(err) = self.write_line(&serde_json::to_string(&request)?).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HarveyError::TransportLost {
                message: "MCP server closed the connection".into(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(HarveyError::Timeout { duration: timeout })
            }
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut connection = self.connection.lock().await;
        let Some(connection) = connection.as_mut() else {
            return Err(HarveyError::TransportLost {
                message: "MCP connection is down".into(),
            });
        };
        connection
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| HarveyError::TransportLost {
                message: format!("failed to write to MCP server: {e}"),
            })?;
        connection
            .stdin
            .write_all(b"\n")
            .await
            .map_err(|e| HarveyError::TransportLost {
                message: format!("failed to write to MCP server: {e}"),
            })?;
        connection.stdin.flush().await.map_err(|e| HarveyError::TransportLost {
            message: format!("failed to flush MCP stdin: {e}"),
        })
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        {
            let mut guard = self.connection.lock().await;
            if let Some(connection) = guard.as_mut() {
                match connection.child.try_wait() {
                    Ok(None) => return Ok(()),
                    _ => {
                        warn!("MCP server process exited; reconnecting");
                        *guard = None;
                    }
                }
            }
        }

        // Backoff grows with consecutive failed connects, jittered ±20%.
        let failures = self.failed_connects.load(Ordering::SeqCst);
        if failures > 0 {
            let delay = backoff_delay(failures);
            debug!(failures, delay_ms = delay.as_millis() as u64, "MCP reconnect backoff");
            tokio::time::sleep(delay).await;
        }

        match self.spawn_and_handshake().await {
            Ok(()) => {
                self.failed_connects.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                self.failed_connects.fetch_add(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn spawn_and_handshake(self: &Arc<Self>) -> Result<()> {
        info!(command = %self.config.command, "launching MCP server");
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(extra_path) = &self.config.extra_path {
            command.env("PYTHONPATH", extra_path);
        }

        let mut child = command.spawn().map_err(|e| HarveyError::TransportLost {
            message: format!("failed to launch MCP server '{}': {e}", self.config.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| HarveyError::TransportLost {
            message: "MCP server stdin unavailable".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| HarveyError::TransportLost {
            message: "MCP server stdout unavailable".into(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| HarveyError::TransportLost {
            message: "MCP server stderr unavailable".into(),
        })?;

        // Reader task: route responses to their pending requests until EOF,
        // then fail whatever is left.
        let pending = self.pending.clone();
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => route_line(&pending, &line).await,
                    Ok(None) => break,
                    Err(err) => {
                        error!(error = %err, "error reading from MCP server");
                        break;
                    }
                }
            }
            fail_all_pending(&pending, "MCP server stdout closed").await;
            if let Some(client) = client.upgrade() {
                client.connection.lock().await.take();
            }
        });

        // Stderr drains into the log.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "mcp_server", "{line}");
            }
        });

        *self.connection.lock().await = Some(Connection { stdin, child });

        // initialize handshake, then the initialized notification.
        let result = self
            .request_inner("initialize", Some(initialize_params()), INIT_TIMEOUT)
            .await?;
        let negotiated = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        if negotiated != MCP_PROTOCOL_VERSION {
            debug!(negotiated, "MCP server negotiated a different protocol revision");
        }
        let notification = JsonRpcNotification::new("notifications/initialized");
        self.write_line(&serde_json::to_string(&notification)?).await?;
        info!(command = %self.config.command, "MCP server ready");
        Ok(())
    }
}

/// Parse one stdout line and complete the matching pending request.
async fn route_line(pending: &Arc<Mutex<PendingMap>>, line: &str) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let response: JsonRpcResponse = match serde_json::from_str(trimmed) {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "discarding unparseable MCP message");
            return;
        }
    };
    let Some(id) = response.id else {
        // Server-initiated notification; nothing subscribes to these.
        debug!("ignoring MCP notification");
        return;
    };
    let Some(sender) = pending.lock().await.remove(&id) else {
        warn!(id, "MCP response for unknown request id");
        return;
    };
    let outcome = match response.error {
        Some(error) => Err(HarveyError::ToolInternal {
            name: "mcp".into(),
            message: error.message,
            code: Some(error.code),
        }),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };
    let _ = sender.send(outcome);
}

async fn fail_all_pending(pending: &Arc<Mutex<PendingMap>>, reason: &str) {
    let mut pending = pending.lock().await;
    for (_, sender) in pending.drain() {
        let _ = sender.send(Err(HarveyError::TransportLost {
            message: reason.to_string(),
        }));
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = BACKOFF_START.as_millis() as f64 * 2f64.powi(failures.saturating_sub(1) as i32);
    let capped = exp.min(BACKOFF_CAP.as_millis() as f64);
    let spread = capped * BACKOFF_JITTER;
    let jittered = capped + rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis(jittered.max(0.0) as u64)
}
