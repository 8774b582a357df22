//! Worker handle: one external interpreter process plus its message
//! channel.
//!
//! Every request sends exactly one frame and awaits exactly one correlated
//! response. Worker-pushed output frames and stderr chatter are routed to
//! listener callbacks instead of being parsed as protocol traffic.

pub mod backend;
pub mod launch;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock as StdRwLock};
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::{Message, MessageChannel, MessageKind};
use crate::codec::{decode_column, encode_column, Column, ColumnType};
use crate::error::{Result, WorkerError};

pub use backend::{BackendKind, BackendProfile};
pub use launch::LaunchSpec;

/// Bound on the startup handshake: the worker must announce readiness
/// within this window or construction fails.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between the shutdown request and a forced kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Caller-supplied configuration applied to a checked-out worker: the
/// host's variable-naming convention and the outputs it expects the
/// workspace to populate.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub variable_prefix: String,
    pub expected_outputs: Vec<String>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            variable_prefix: "host_".to_string(),
            expected_outputs: Vec::new(),
        }
    }
}

// ─── Out-of-band output ──────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    /// Raw stderr chatter from the worker process.
    Stderr,
    /// An output frame pushed through the protocol.
    Protocol,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputLevel {
    Info,
    Warn,
    Error,
    Debug,
}

/// One out-of-band line routed to listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub source: OutputSource,
    pub level: OutputLevel,
    pub content: String,
}

pub type OutputListener = Arc<dyn Fn(&OutputLine) + Send + Sync>;

/// Shared level-classification pattern for worker chatter.
fn level_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?P<level>INFO|WARN|WARNING|ERROR|DEBUG|TRACE|FATAL)").ok())
        .as_ref()
}

fn parse_output_level(line: &str) -> OutputLevel {
    if let Some(re) = level_pattern() {
        if let Some(caps) = re.captures(line) {
            if let Some(level) = caps.name("level") {
                return match level.as_str() {
                    "ERROR" | "FATAL" => OutputLevel::Error,
                    "WARN" | "WARNING" => OutputLevel::Warn,
                    "DEBUG" | "TRACE" => OutputLevel::Debug,
                    _ => OutputLevel::Info,
                };
            }
        }
    }
    OutputLevel::Info
}

// ─── Protocol payloads ───────────────────────────────────────

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    source: &'a str,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    stdout: String,
    stderr: String,
}

#[derive(Serialize)]
struct VariableRequest<'a> {
    name: &'a str,
}

#[derive(Serialize, Deserialize)]
struct VariableHeader {
    name: String,
    column_type: String,
    length: u64,
}

#[derive(Serialize)]
struct AutoCompleteRequest<'a> {
    source: &'a str,
    cursor: usize,
}

#[derive(Deserialize)]
struct FailurePayload {
    message: String,
}

#[derive(Deserialize)]
struct OutputPayload {
    line: String,
}

/// One entry of a workspace listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariableInfo {
    pub name: String,
    pub type_name: String,
    pub value: String,
}

/// One autocompletion candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Suggestion {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub doc: Option<String>,
}

/// Aggregated, non-throwing result of `close()`. Cleanup failures end up
/// here and in the log, never as an error to the caller.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.errors.is_empty() {
            write!(f, "clean")
        } else {
            write!(f, "{}", self.errors.join("; "))
        }
    }
}

// ─── Worker handle ───────────────────────────────────────────

/// Handle to one live worker process and its duplex channel.
pub struct WorkerHandle {
    id: Uuid,
    backend: BackendKind,
    channel: MessageChannel,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Option<u32>,
    next_request_id: AtomicU32,
    /// Serializes requests so at most one is outstanding per handle.
    request_gate: tokio::sync::Mutex<()>,
    listeners: Arc<StdRwLock<Vec<OutputListener>>>,
    closed: AtomicBool,
    stderr_task: StdMutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Spawn a worker process and wait for its readiness handshake.
    pub async fn launch(spec: &LaunchSpec, backend: BackendKind) -> Result<Self> {
        let mut command = spec.command(backend.profile().extra_args);
        let mut child = command.spawn().map_err(|e| {
            WorkerError::Construction(format!(
                "failed to spawn worker '{}': {}",
                spec.program, e
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Construction("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Construction("worker stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkerError::Construction("worker stderr not captured".into()))?;
        let pid = child.id();

        let channel = MessageChannel::spawn(stdout, stdin);
        let listeners: Arc<StdRwLock<Vec<OutputListener>>> =
            Arc::new(StdRwLock::new(Vec::new()));

        // Stderr is out-of-band chatter, never protocol: classify and route
        // to listeners.
        let stderr_listeners = listeners.clone();
        let stderr_task = tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let output = OutputLine {
                    source: OutputSource::Stderr,
                    level: parse_output_level(&line),
                    content: line,
                };
                notify_listeners(&stderr_listeners, &output);
            }
        });

        let handle = Self {
            id: Uuid::new_v4(),
            backend,
            channel,
            child: tokio::sync::Mutex::new(Some(child)),
            pid,
            next_request_id: AtomicU32::new(1),
            request_gate: tokio::sync::Mutex::new(()),
            listeners,
            closed: AtomicBool::new(false),
            stderr_task: StdMutex::new(Some(stderr_task)),
        };

        if let Err(e) = handle.await_ready().await {
            handle.close().await;
            return Err(e);
        }
        tracing::info!(worker = %handle.id, pid = ?pid, backend = backend.profile().label, "worker ready");
        Ok(handle)
    }

    /// Wrap an already-connected transport without owning a process. Used
    /// by embedders that manage the peer themselves and by tests.
    pub fn from_transport<R, W>(reader: R, writer: W, backend: BackendKind) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            backend,
            channel: MessageChannel::spawn(reader, writer),
            child: tokio::sync::Mutex::new(None),
            pid: None,
            next_request_id: AtomicU32::new(1),
            request_gate: tokio::sync::Mutex::new(()),
            listeners: Arc::new(StdRwLock::new(Vec::new())),
            closed: AtomicBool::new(false),
            stderr_task: StdMutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn add_output_listener(&self, listener: OutputListener) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Whether the process is running and the channel has not failed.
    pub async fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::Acquire)
            || self.channel.is_closed()
            || self.channel.failure_reason().is_some()
        {
            return false;
        }
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            // Transport-only handles live and die with the channel.
            None => true,
            Some(child) => matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Execute a source snippet, returning captured stdout and stderr.
    pub async fn execute(&self, source: &str) -> Result<(String, String)> {
        let response = self
            .request(MessageKind::Execute, to_json(&ExecuteRequest { source })?)
            .await?;
        let output: ExecuteResponse = from_json(&response.payload)?;
        Ok((output.stdout, output.stderr))
    }

    /// Put a column into the worker workspace under `name`.
    pub async fn put_variable(&self, name: &str, column: &Column) -> Result<()> {
        let header = VariableHeader {
            name: name.to_string(),
            column_type: column.column_type().label().to_string(),
            length: column.len() as u64,
        };
        let header_bytes = to_json(&header)?;
        let column_bytes = encode_column(column, self.backend.profile().wire_rev);
        let mut payload = Vec::with_capacity(4 + header_bytes.len() + column_bytes.len());
        payload.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        payload.extend_from_slice(&header_bytes);
        payload.extend_from_slice(&column_bytes);
        self.request(MessageKind::PutVariable, payload).await?;
        Ok(())
    }

    /// Get a column from the worker workspace.
    pub async fn get_variable(&self, name: &str) -> Result<Column> {
        let response = self
            .request(MessageKind::GetVariable, to_json(&VariableRequest { name })?)
            .await?;
        let (header, column_bytes) = split_variable_payload(&response.payload)?;
        let ty = ColumnType::from_label(&header.column_type).ok_or_else(|| {
            WorkerError::Format(format!("unknown column type '{}'", header.column_type))
        })?;
        decode_column(
            column_bytes,
            ty,
            header.length as usize,
            self.backend.profile().wire_rev,
        )
    }

    /// List workspace variables.
    pub async fn list_variables(&self) -> Result<Vec<VariableInfo>> {
        let response = self.request(MessageKind::ListVariables, Vec::new()).await?;
        from_json(&response.payload)
    }

    /// Autocompletion candidates for `source` at byte offset `cursor`.
    pub async fn auto_complete(&self, source: &str, cursor: usize) -> Result<Vec<Suggestion>> {
        let response = self
            .request(
                MessageKind::AutoComplete,
                to_json(&AutoCompleteRequest { source, cursor })?,
            )
            .await?;
        from_json(&response.payload)
    }

    /// Apply caller configuration by executing the backend's prologue
    /// snippet in the workspace.
    pub async fn configure(&self, options: &WorkerOptions) -> Result<()> {
        let snippet = self.backend.profile().configure_snippet(options);
        self.execute(&snippet).await?;
        Ok(())
    }

    /// Tear down loops and process. Idempotent; cleanup failures are
    /// aggregated into the returned report and logged, never thrown, so a
    /// crashed worker is still closeable.
    pub async fn close(&self) -> CleanupReport {
        if self.closed.swap(true, Ordering::AcqRel) {
            return CleanupReport::default();
        }
        let mut report = CleanupReport::default();

        if self.channel.failure_reason().is_none() && !self.channel.is_closed() {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self
                .channel
                .send(Message::new(id, MessageKind::Shutdown, Vec::new()))
                .await
            {
                report.errors.push(format!("shutdown request: {}", e));
            }
        }
        self.channel.close().await;

        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(worker = %self.id, %status, "worker exited");
                }
                Ok(Err(e)) => report.errors.push(format!("wait: {}", e)),
                Err(_) => {
                    tracing::warn!(worker = %self.id, "worker did not exit in time, killing");
                    if let Err(e) = child.start_kill() {
                        report.errors.push(format!("kill: {}", e));
                    }
                    if let Err(e) = child.wait().await {
                        report.errors.push(format!("wait after kill: {}", e));
                    }
                }
            }
        }
        drop(guard);

        if let Some(task) = self
            .stderr_task
            .lock()
            .expect("stderr task lock poisoned")
            .take()
        {
            task.abort();
        }

        if !report.is_clean() {
            tracing::warn!(worker = %self.id, report = %report, "worker cleanup reported errors");
        }
        report
    }

    /// Wait for the readiness handshake, routing any early output frames.
    async fn await_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
        loop {
            let message = tokio::time::timeout_at(deadline, self.channel.receive())
                .await
                .map_err(|_| {
                    WorkerError::Construction(format!(
                        "worker did not signal readiness within {:?}",
                        STARTUP_TIMEOUT
                    ))
                })?
                .map_err(|e| {
                    WorkerError::Construction(format!("worker failed before readiness: {}", e))
                })?;
            match message.kind {
                MessageKind::Ready => return Ok(()),
                MessageKind::Output => self.route_output(&message),
                other => {
                    return Err(WorkerError::Construction(format!(
                        "unexpected {:?} message before readiness",
                        other
                    )));
                }
            }
        }
    }

    /// Send one request and await its correlated response. Output frames
    /// are routed to listeners; unrelated responses are logged and skipped.
    async fn request(&self, kind: MessageKind, payload: Vec<u8>) -> Result<Arc<Message>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WorkerError::Channel("worker handle closed".into()));
        }
        let _gate = self.request_gate.lock().await;
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.channel.send(Message::new(id, kind, payload)).await?;
        loop {
            let message = self.channel.receive().await?;
            match message.kind {
                MessageKind::Output => self.route_output(&message),
                MessageKind::Success if message.id == id => return Ok(message),
                MessageKind::Failure if message.id == id => {
                    let reason = match from_json::<FailurePayload>(&message.payload) {
                        Ok(failure) => failure.message,
                        Err(_) => String::from_utf8_lossy(&message.payload).into_owned(),
                    };
                    return Err(WorkerError::Worker(reason));
                }
                _ => {
                    tracing::warn!(
                        worker = %self.id,
                        expected = id,
                        got = message.id,
                        kind = ?message.kind,
                        "skipping uncorrelated message"
                    );
                }
            }
        }
    }

    fn route_output(&self, message: &Message) {
        let content = match from_json::<OutputPayload>(&message.payload) {
            Ok(payload) => payload.line,
            Err(_) => String::from_utf8_lossy(&message.payload).into_owned(),
        };
        let line = OutputLine {
            source: OutputSource::Protocol,
            level: parse_output_level(&content),
            content,
        };
        notify_listeners(&self.listeners, &line);
    }
}

fn notify_listeners(listeners: &StdRwLock<Vec<OutputListener>>, line: &OutputLine) {
    tracing::debug!(source = ?line.source, level = ?line.level, "{}", line.content);
    for listener in listeners.read().expect("listener lock poisoned").iter() {
        listener(line);
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| WorkerError::Format(format!("encode payload: {}", e)))
}

fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| WorkerError::Format(format!("decode payload: {}", e)))
}

/// Split a `[u32 header_len][header json][column bytes]` payload.
fn split_variable_payload(payload: &[u8]) -> Result<(VariableHeader, &[u8])> {
    if payload.len() < 4 {
        return Err(WorkerError::Format("variable payload too short".into()));
    }
    let header_len = (&payload[..4])
        .read_u32::<LittleEndian>()
        .map_err(|e| WorkerError::Format(format!("variable header length: {}", e)))?
        as usize;
    let body = &payload[4..];
    if body.len() < header_len {
        return Err(WorkerError::Format(format!(
            "variable header truncated: need {} bytes, have {}",
            header_len,
            body.len()
        )));
    }
    let header: VariableHeader = from_json(&body[..header_len])?;
    Ok((header, &body[header_len..]))
}
