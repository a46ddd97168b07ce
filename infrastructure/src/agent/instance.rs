//! One spawned agent process, wrapped as an [`AgentTransport`].
//!
//! [`AgentInstance::spawn`] launches `<command> serve --port N --repo PATH`,
//! waits for the child to announce readiness on stdout, then connects over
//! TCP on localhost. A single background reader task owns the read half:
//! responses are correlated back to waiting requests by id, and every
//! `session.event` notification is fanned out to all registered event
//! subscribers. Sessions are multiplexed over the one connection, so any
//! number of sessions can run against the same instance concurrently.

use crate::agent::protocol::{
    CreateSessionParams, CreateSessionResult, JsonRpcRequest, JsonRpcResponse, SendParams, methods,
};
use crate::agent::wire::{self, Incoming};
use async_trait::async_trait;
use sage_application::error::has_transient_marker;
use sage_application::ports::{AgentTransport, EventSubscription, GatewayError, InstanceConfig};
use sage_domain::AgentEvent;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Upper bound on any single request/response round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Substring of the stdout line that announces the listening port.
const READY_MARKER: &str = "listening on port";

/// How long the failure path waits for the dead child's stderr.
const STDERR_GRACE: Duration = Duration::from_secs(2);

type PendingMap = Arc<RwLock<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;
type SubscriberList = Arc<std::sync::RwLock<Vec<mpsc::UnboundedSender<AgentEvent>>>>;

/// A live connection to one agent process.
#[derive(Debug)]
pub struct AgentInstance {
    port: u16,
    config: InstanceConfig,
    writer: Arc<Mutex<BufWriter<OwnedWriteHalf>>>,
    pending: PendingMap,
    subscribers: SubscriberList,
    // Taken on close; Drop falls back to start_kill for abnormal exits.
    child: std::sync::Mutex<Option<Child>>,
    closed: AtomicBool,
}

/// Why the child never announced a port.
#[derive(Debug)]
enum ReadyFailure {
    /// stdout closed before the announcement; the child exited.
    Exited,
    /// The announcement line carried no parseable port number.
    BadAnnouncement(String),
}

impl AgentInstance {
    /// Spawns the agent executable and connects to it.
    ///
    /// The child is asked to bind `port`; failures to do so surface as
    /// [`GatewayError::PortUnavailable`] so the pool can retry elsewhere.
    pub async fn spawn(
        command: &str,
        port: u16,
        config: &InstanceConfig,
        ready_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let binary = which::which(command).map_err(|_| {
            GatewayError::SpawnFailed(format!("agent binary '{command}' not found on PATH"))
        })?;

        debug!(
            technology = %config.technology,
            port,
            repo = %config.repo_path.display(),
            "spawning {}",
            binary.display()
        );

        let mut cmd = Command::new(&binary);
        cmd.arg("serve")
            .arg("--port")
            .arg(port.to_string())
            .arg("--repo")
            .arg(&config.repo_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(model) = &config.model {
            cmd.arg("--model").arg(model);
        }

        // Linux: have the kernel SIGTERM the child when this process dies.
        // Covers the cases where Drop never runs (SIGKILL, OOM kill).
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayError::SpawnFailed(format!("{}: {e}", binary.display())))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            GatewayError::SpawnFailed("agent stdout was not captured".to_string())
        })?;
        let mut stdout_reader = BufReader::new(stdout);

        let ready_port = match tokio::time::timeout(
            ready_timeout,
            await_ready_line(&mut stdout_reader),
        )
        .await
        {
            Ok(Ok(announced)) => announced,
            Ok(Err(ReadyFailure::Exited)) => {
                let stderr_text = capture_stderr(&mut child).await;
                let _ = child.start_kill();
                return Err(classify_startup_failure(port, &stderr_text));
            }
            Ok(Err(ReadyFailure::BadAnnouncement(line))) => {
                let _ = child.start_kill();
                return Err(GatewayError::SpawnFailed(format!(
                    "unexpected ready announcement from agent: {line}"
                )));
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(GatewayError::Timeout(format!(
                    "agent on port {port} not ready within {}s",
                    ready_timeout.as_secs()
                )));
            }
        };

        info!(port = ready_port, technology = %config.technology, "agent ready, connecting");

        let stream = TcpStream::connect(("127.0.0.1", ready_port))
            .await
            .map_err(|e| {
                let _ = child.start_kill();
                GatewayError::Connection(format!("connect to agent on port {ready_port}: {e}"))
            })?;

        // The child keeps logging after startup; keep its pipes drained so
        // it never blocks on a full pipe buffer.
        spawn_output_drain("stdout", stdout_reader);
        if let Some(stderr) = child.stderr.take() {
            spawn_output_drain("stderr", BufReader::new(stderr));
        }

        Ok(Self::over_stream(stream, ready_port, config.clone(), Some(child)))
    }

    /// Builds the transport over an established connection and starts the
    /// reader task. Shared by [`spawn`](Self::spawn) and the tests, which
    /// substitute a plain TCP stream for the child process.
    fn over_stream(
        stream: TcpStream,
        port: u16,
        config: InstanceConfig,
        child: Option<Child>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();

        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let subscribers: SubscriberList = Arc::new(std::sync::RwLock::new(Vec::new()));

        tokio::spawn(reader_loop(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&subscribers),
        ));

        Self {
            port,
            config,
            writer: Arc::new(Mutex::new(BufWriter::new(write_half))),
            pending,
            subscribers,
            child: std::sync::Mutex::new(child),
            closed: AtomicBool::new(false),
        }
    }

    /// The port the agent actually bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sends a request and waits for the correlated response.
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportClosed);
        }

        let request_id = request.id;
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(request_id, tx);

        if let Err(e) = self.send_frame(&request).await {
            self.pending.write().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            // The reader cleared the pending map: connection is gone.
            Ok(Err(_)) => Err(GatewayError::TransportClosed),
            Err(_) => {
                self.pending.write().await.remove(&request_id);
                Err(GatewayError::Timeout(format!(
                    "{} request timed out after {}s",
                    request.method,
                    REQUEST_TIMEOUT.as_secs()
                )))
            }
        }
    }

    async fn send_frame(&self, request: &JsonRpcRequest) -> Result<(), GatewayError> {
        let json = serde_json::to_string(request)
            .map_err(|e| GatewayError::RequestFailed(format!("encode {}: {e}", request.method)))?;
        trace!("agent send: {json}");

        let mut writer = self.writer.lock().await;
        wire::write_frame(&mut *writer, &json)
            .await
            .map_err(|e| GatewayError::Connection(format!("write to agent: {e}")))
    }
}

#[async_trait]
impl AgentTransport for AgentInstance {
    async fn create_session(&self) -> Result<String, GatewayError> {
        let params = CreateSessionParams {
            model: self.config.model.clone(),
            system_prompt: self.config.system_prompt.clone(),
        };
        let params = serde_json::to_value(&params)
            .map_err(|e| GatewayError::RequestFailed(format!("encode session.create: {e}")))?;

        let response = self
            .request(JsonRpcRequest::new(methods::SESSION_CREATE, Some(params)))
            .await?;
        let result = expect_result(response, methods::SESSION_CREATE)?;

        let created: CreateSessionResult = serde_json::from_value(result).map_err(|e| {
            GatewayError::Session(format!("malformed session.create result: {e}"))
        })?;

        debug!(session_id = %created.session_id, port = self.port, "session created");
        Ok(created.session_id)
    }

    fn subscribe_events(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        EventSubscription::new(rx)
    }

    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<(), GatewayError> {
        let params = SendParams {
            session_id: session_id.to_string(),
            prompt: prompt.to_string(),
        };
        let params = serde_json::to_value(&params)
            .map_err(|e| GatewayError::RequestFailed(format!("encode session.send: {e}")))?;

        let response = self
            .request(JsonRpcRequest::new(methods::SESSION_SEND, Some(params)))
            .await?;
        expect_result(response, methods::SESSION_SEND)?;

        trace!(session_id, "prompt acknowledged");
        Ok(())
    }

    async fn close(&self) -> Result<(), GatewayError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let child = self
            .child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(mut child) = child {
            info!(port = self.port, "stopping agent instance");
            // Killing the child drops the TCP peer; the reader loop then
            // observes EOF and fails any in-flight requests.
            let _ = child.kill().await;
        }

        Ok(())
    }
}

impl Drop for AgentInstance {
    fn drop(&mut self) {
        let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = guard.as_mut() {
            debug!(port = self.port, "agent instance dropped, killing child");
            let _ = child.start_kill();
        }
    }
}

// ==================== internals ====================

/// Background reader loop, sole owner of the read half.
///
/// Responses are handed to the waiter registered under their id; events are
/// broadcast to every subscriber. When the connection drops, both maps are
/// cleared so waiters and subscriptions observe the closure.
async fn reader_loop(read_half: OwnedReadHalf, pending: PendingMap, subscribers: SubscriberList) {
    let mut reader = BufReader::new(read_half);

    loop {
        let body = match wire::read_frame(&mut reader).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                debug!("agent connection closed");
                break;
            }
            Err(e) => {
                warn!("agent connection failed: {e}");
                break;
            }
        };

        trace!("agent recv: {}", String::from_utf8_lossy(&body));

        match wire::decode_frame(&body) {
            Some(Incoming::Response(response)) => {
                let Some(id) = response.id else {
                    continue;
                };
                let waiter = pending.write().await.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!("no waiter for response id={id}"),
                }
            }
            Some(Incoming::Notification(notification)) => {
                if notification.method != methods::SESSION_EVENT {
                    trace!("ignoring notification method={}", notification.method);
                    continue;
                }
                let Some(params) = notification.params else {
                    debug!("session.event without params");
                    continue;
                };
                match wire::event_from_params(&params) {
                    Some(event) => broadcast(&subscribers, event),
                    None => debug!("session.event with undecodable payload"),
                }
            }
            None => {}
        }
    }

    // Dropping the senders is what unblocks the receivers.
    pending.write().await.clear();
    subscribers
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}

fn broadcast(subscribers: &SubscriberList, event: AgentEvent) {
    let mut subs = subscribers.write().unwrap_or_else(|e| e.into_inner());
    // A failed send means the subscription was dropped; prune it.
    subs.retain(|tx| tx.send(event.clone()).is_ok());
}

/// Unwraps a response, turning an RPC-level error into a session error.
fn expect_result(
    response: JsonRpcResponse,
    method: &str,
) -> Result<serde_json::Value, GatewayError> {
    if let Some(error) = response.error {
        return Err(GatewayError::Session(format!(
            "{method} failed: {} (code {})",
            error.message, error.code
        )));
    }
    Ok(response.result.unwrap_or(serde_json::Value::Null))
}

/// Reads stdout lines until the port announcement.
async fn await_ready_line<R>(reader: &mut R) -> Result<u16, ReadyFailure>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await.map_err(|_| ReadyFailure::Exited)?;
        if bytes_read == 0 {
            return Err(ReadyFailure::Exited);
        }

        let trimmed = line.trim();
        debug!("agent startup: {trimmed}");

        if let Some(index) = trimmed.find(READY_MARKER) {
            let rest = &trimmed[index + READY_MARKER.len()..];
            return rest
                .trim()
                .parse::<u16>()
                .map_err(|_| ReadyFailure::BadAnnouncement(trimmed.to_string()));
        }
    }
}

/// Salvages whatever the dead child wrote to stderr.
async fn capture_stderr(child: &mut Child) -> String {
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut text = String::new();
    // read_to_string appends as it goes, so a timeout still leaves the
    // partial output in place.
    let _ = tokio::time::timeout(STDERR_GRACE, stderr.read_to_string(&mut text)).await;
    text
}

/// Maps a failed startup to the right gateway error.
///
/// Port conflicts must come back as [`GatewayError::PortUnavailable`] so the
/// pool's port scan moves on; other transient-looking output becomes a
/// retryable connection error, and the rest is a hard spawn failure.
fn classify_startup_failure(port: u16, stderr: &str) -> GatewayError {
    let detail = stderr.trim();
    let lower = detail.to_lowercase();

    if lower.contains("address in use") || lower.contains("already in use") {
        GatewayError::PortUnavailable(port)
    } else if detail.is_empty() {
        GatewayError::SpawnFailed("agent exited before announcing its port".to_string())
    } else if has_transient_marker(detail) {
        GatewayError::Connection(detail.to_string())
    } else {
        GatewayError::SpawnFailed(detail.to_string())
    }
}

fn spawn_output_drain<R>(stream_name: &'static str, mut reader: BufReader<R>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => trace!("agent {stream_name}: {}", line.trim_end()),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use sage_domain::Technology;
    use serde_json::json;
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    fn test_config() -> InstanceConfig {
        InstanceConfig {
            technology: Technology::new("react"),
            repo_path: PathBuf::from("/srv/repos/react"),
            model: None,
            system_prompt: None,
        }
    }

    async fn connected_pair() -> (AgentInstance, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let instance = AgentInstance::over_stream(client, addr.port(), test_config(), None);
        (instance, server)
    }

    #[tokio::test]
    async fn test_create_session_correlates_response_by_id() {
        let (instance, server) = connected_pair().await;

        let server_task = tokio::spawn(async move {
            let (read_half, write_half) = server.into_split();
            let mut reader = BufReader::new(read_half);
            let mut writer = BufWriter::new(write_half);

            let body = wire::read_frame(&mut reader).await.unwrap().unwrap();
            let request: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(request["method"], "session.create");
            let id = request["id"].as_u64().unwrap();

            let response =
                json!({"jsonrpc": "2.0", "id": id, "result": {"sessionId": "sess-test"}});
            wire::write_frame(&mut writer, &response.to_string()).await.unwrap();

            // Event whose envelope carries the session id
            let event = json!({
                "jsonrpc": "2.0",
                "method": "session.event",
                "params": {"sessionId": "sess-test", "event": {"type": "assistant.message.delta", "content": "hi"}}
            });
            wire::write_frame(&mut writer, &event.to_string()).await.unwrap();

            // Keep the connection alive until the client has asserted
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut events = instance.subscribe_events();
        let session_id = instance.create_session().await.unwrap();
        assert_eq!(session_id, "sess-test");

        let event = events.next_event().await.unwrap();
        assert_eq!(event.content(), Some("hi"));
        assert_eq!(event.session_id(), Some("sess-test"));

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rpc_error_becomes_session_error() {
        let (instance, server) = connected_pair().await;

        tokio::spawn(async move {
            let (read_half, write_half) = server.into_split();
            let mut reader = BufReader::new(read_half);
            let mut writer = BufWriter::new(write_half);

            let body = wire::read_frame(&mut reader).await.unwrap().unwrap();
            let request: serde_json::Value = serde_json::from_slice(&body).unwrap();
            let id = request["id"].as_u64().unwrap();

            let response = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": null,
                "error": {"code": -32001, "message": "repo not indexed", "data": null}
            });
            wire::write_frame(&mut writer, &response.to_string()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let err = instance.send_prompt("sess-1", "hello").await.unwrap_err();
        match err {
            GatewayError::Session(message) => {
                assert!(message.contains("repo not indexed"), "got: {message}");
            }
            other => panic!("expected session error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_drop_fails_pending_request() {
        let (instance, server) = connected_pair().await;

        tokio::spawn(async move {
            let (read_half, _write_half) = server.into_split();
            let mut reader = BufReader::new(read_half);
            // Consume the request, then drop the connection without replying
            let _ = wire::read_frame(&mut reader).await;
        });

        let err = instance.create_session().await.unwrap_err();
        assert!(
            matches!(err, GatewayError::TransportClosed | GatewayError::Connection(_)),
            "got: {err:?}"
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (instance, _server) = connected_pair().await;
        instance.close().await.unwrap();
        instance.close().await.unwrap();
        assert!(matches!(
            instance.create_session().await,
            Err(GatewayError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_ready_line_parses_port() {
        let output = b"starting techsage-agent 0.4\nindexing /srv/repos/react\ntechsage-agent listening on port 50012\n";
        let mut reader = output.as_slice();
        assert_eq!(await_ready_line(&mut reader).await.unwrap(), 50012);
    }

    #[tokio::test]
    async fn test_ready_line_reports_exit_and_garbage() {
        let mut empty = b"".as_slice();
        assert!(matches!(
            await_ready_line(&mut empty).await,
            Err(ReadyFailure::Exited)
        ));

        let mut garbage = b"listening on port banana\n".as_slice();
        assert!(matches!(
            await_ready_line(&mut garbage).await,
            Err(ReadyFailure::BadAnnouncement(_))
        ));
    }

    #[test]
    fn test_startup_failure_classification() {
        assert!(matches!(
            classify_startup_failure(49152, "bind 127.0.0.1:49152: address already in use"),
            GatewayError::PortUnavailable(49152)
        ));
        assert!(matches!(
            classify_startup_failure(49152, "upstream connection refused"),
            GatewayError::Connection(_)
        ));
        assert!(matches!(
            classify_startup_failure(49152, "unknown flag: --frob"),
            GatewayError::SpawnFailed(_)
        ));
        match classify_startup_failure(49152, "   ") {
            GatewayError::SpawnFailed(message) => assert!(message.contains("announcing")),
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_rejects_missing_binary() {
        let err = AgentInstance::spawn(
            "definitely-not-a-real-agent-binary",
            49152,
            &test_config(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        match err {
            GatewayError::SpawnFailed(message) => {
                assert!(message.contains("definitely-not-a-real-agent-binary"));
            }
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_classifies_silent_early_exit() {
        // `true` exists everywhere, ignores its arguments, and exits
        // immediately without printing a ready line.
        let err = AgentInstance::spawn("true", 49153, &test_config(), Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            GatewayError::SpawnFailed(message) => {
                assert!(message.contains("announcing"), "got: {message}");
            }
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }
}
