//! NDJSON control protocol over a Unix socket.
//!
//! Each line is a [`RequestEnvelope`]; each answer a [`ResponseEnvelope`]
//! with the same id. A `subscribe` request turns the connection into a
//! stream of [`NotificationEnvelope`] lines.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bscript_kernel::{
    CompleteRequest, ExecutionRequest, HistoryRequest, InspectRequest, InterruptHandle,
    KernelError, Notification,
};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::daemon::ControlMsg;
use crate::error::HostError;

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub v: u8,
    pub id: String,
    pub cmd: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RequestEnvelope {
    pub fn new(cmd: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            cmd: cmd.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

/// One notification pushed to a subscribed connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub notification: Notification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlError {
    pub code: String,
    pub message: String,
}

impl ControlError {
    fn invalid_request(msg: impl Into<String>) -> Self {
        Self {
            code: "invalid_request".into(),
            message: msg.into(),
        }
    }

    fn unknown_method(cmd: &str) -> Self {
        Self {
            code: "unknown_method".into(),
            message: format!("unknown command '{cmd}'"),
        }
    }

    fn decode(msg: impl Into<String>) -> Self {
        Self {
            code: "decode_error".into(),
            message: msg.into(),
        }
    }

    fn host(err: HostError) -> Self {
        let code = match &err {
            HostError::Kernel(KernelError::KernelUnavailable(_)) => "kernel_unavailable",
            _ => "host_error",
        };
        Self {
            code: code.into(),
            message: err.to_string(),
        }
    }

    fn daemon_gone() -> Self {
        Self::host(HostError::Control("kernel daemon is not running".into()))
    }
}

#[derive(Debug, Deserialize)]
struct ExecutePayload {
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    execution_counter: Option<u64>,
    code: String,
    #[serde(default)]
    silent: bool,
    #[serde(default)]
    store_history: Option<bool>,
    #[serde(default)]
    allow_stdin: bool,
    #[serde(default)]
    user_expressions: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CompletePayload {
    #[serde(default)]
    session: Option<String>,
    code: String,
    #[serde(default)]
    cursor_pos: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct InspectPayload {
    #[serde(default)]
    session: Option<String>,
    code: String,
    #[serde(default)]
    cursor_pos: Option<usize>,
    #[serde(default)]
    detail_level: u8,
}

#[derive(Debug, Deserialize)]
struct IsCompletePayload {
    code: String,
}

#[derive(Debug, Deserialize)]
struct HistoryPayload {
    #[serde(default)]
    session: Option<String>,
    #[serde(default = "default_last_n")]
    last_n: usize,
}

fn default_last_n() -> usize {
    10
}

/// Per-connection defaults: a session id and an execution counter used when
/// the request does not carry its own.
struct ConnState {
    session: String,
    counter: u64,
}

/// Minimal control server (Unix socket, NDJSON framing) that translates protocol
/// requests into daemon control messages and waits for responses.
pub struct ControlServer {
    path: PathBuf,
    control_tx: mpsc::Sender<ControlMsg>,
    shutdown_tx: broadcast::Sender<()>,
    interrupt: Option<InterruptHandle>,
    notifications: Option<broadcast::Sender<Notification>>,
}

impl ControlServer {
    pub fn new<P: Into<PathBuf>>(
        path: P,
        control_tx: mpsc::Sender<ControlMsg>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            path: path.into(),
            control_tx,
            shutdown_tx,
            interrupt: None,
            notifications: None,
        }
    }

    /// Interrupts are delivered directly, bypassing the daemon queue.
    pub fn with_interrupt(mut self, interrupt: Option<InterruptHandle>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_notifications(mut self, tx: broadcast::Sender<Notification>) -> Self {
        self.notifications = Some(tx);
        self
    }

    /// Binds the socket, replacing a stale one.
    pub fn bind(&self) -> Result<UnixListener, HostError> {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
        let listener = UnixListener::bind(&self.path).map_err(|e| {
            HostError::Control(format!(
                "failed to bind control socket {}: {e}",
                self.path.display()
            ))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(listener)
    }

    pub async fn serve(self, listener: UnixListener) -> Result<(), HostError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let conn = Connection {
                                control_tx: self.control_tx.clone(),
                                shutdown_tx: self.shutdown_tx.clone(),
                                interrupt: self.interrupt.clone(),
                                notifications: self.notifications.clone(),
                            };
                            tokio::spawn(conn.handle(stream));
                        }
                        Err(err) => tracing::warn!("control accept failed: {err}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    let _ = std::fs::remove_file(&self.path);
                    break;
                }
            }
        }
        tracing::debug!("control server stopped");
        Ok(())
    }
}

struct Connection {
    control_tx: mpsc::Sender<ControlMsg>,
    shutdown_tx: broadcast::Sender<()>,
    interrupt: Option<InterruptHandle>,
    notifications: Option<broadcast::Sender<Notification>>,
}

impl Connection {
    async fn handle(self, stream: UnixStream) {
        let (r, mut w) = stream.into_split();
        let mut reader = BufReader::new(r);
        let mut line = String::new();
        let mut state = ConnState {
            session: uuid::Uuid::new_v4().to_string(),
            counter: 0,
        };

        while let Ok(n) = reader.read_line(&mut line).await {
            if n == 0 {
                break;
            }
            if line.trim().is_empty() {
                line.clear();
                continue;
            }
            let (resp, subscribe) = match serde_json::from_str::<RequestEnvelope>(&line) {
                Ok(req) => {
                    let subscribe = req.cmd == "subscribe";
                    let resp = self.handle_request(req, &mut state).await;
                    (resp, subscribe)
                }
                Err(e) => (
                    ResponseEnvelope {
                        id: String::new(),
                        ok: false,
                        result: None,
                        error: Some(ControlError::decode(e.to_string())),
                    },
                    false,
                ),
            };
            // Subscribe before acknowledging so nothing published after the ack is missed.
            let notifications = match (&self.notifications, subscribe && resp.ok) {
                (Some(tx), true) => Some(tx.subscribe()),
                _ => None,
            };
            if write_line(&mut w, &resp).await.is_err() {
                return;
            }
            line.clear();
            if let Some(rx) = notifications {
                self.stream_notifications(w, rx).await;
                return;
            }
        }
    }

    async fn stream_notifications(
        &self,
        mut w: OwnedWriteHalf,
        mut rx: broadcast::Receiver<Notification>,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(notification) => {
                        let envelope = NotificationEnvelope { notification };
                        if write_line(&mut w, &envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "notification subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    async fn handle_request(&self, req: RequestEnvelope, state: &mut ConnState) -> ResponseEnvelope {
        let id = req.id.clone();
        let res = if req.v != PROTOCOL_VERSION {
            Err(ControlError::invalid_request("unsupported protocol version"))
        } else {
            self.dispatch(&req.cmd, req.payload, state).await
        };
        match res {
            Ok(val) => ResponseEnvelope {
                id,
                ok: true,
                result: Some(val),
                error: None,
            },
            Err(e) => ResponseEnvelope {
                id,
                ok: false,
                result: None,
                error: Some(e),
            },
        }
    }

    async fn dispatch(
        &self,
        cmd: &str,
        payload: serde_json::Value,
        state: &mut ConnState,
    ) -> Result<serde_json::Value, ControlError> {
        match cmd {
            "execute" => {
                let p: ExecutePayload = decode_payload(payload)?;
                let execution_counter = match p.execution_counter {
                    Some(counter) => counter,
                    None => {
                        state.counter += 1;
                        state.counter
                    }
                };
                let request = ExecutionRequest {
                    session: p.session.unwrap_or_else(|| state.session.clone()),
                    execution_counter,
                    code: p.code,
                    silent: p.silent,
                    store_history: p.store_history.unwrap_or(true),
                    allow_stdin: p.allow_stdin,
                    user_expressions: p.user_expressions,
                };
                let reply = self
                    .call(|resp| ControlMsg::Execute { request, resp })
                    .await?;
                to_json(&reply)
            }
            "complete" => {
                let p: CompletePayload = decode_payload(payload)?;
                let request = CompleteRequest {
                    session: Some(p.session.unwrap_or_else(|| state.session.clone())),
                    cursor_pos: p.cursor_pos.unwrap_or_else(|| p.code.chars().count()),
                    code: p.code,
                };
                let reply = self
                    .call(|resp| ControlMsg::Complete { request, resp })
                    .await?
                    .map_err(ControlError::host)?;
                to_json(&reply)
            }
            "inspect" => {
                let p: InspectPayload = decode_payload(payload)?;
                let request = InspectRequest {
                    session: Some(p.session.unwrap_or_else(|| state.session.clone())),
                    cursor_pos: p.cursor_pos.unwrap_or_else(|| p.code.chars().count()),
                    code: p.code,
                    detail_level: p.detail_level,
                };
                let reply = self
                    .call(|resp| ControlMsg::Inspect { request, resp })
                    .await?
                    .map_err(ControlError::host)?;
                to_json(&reply)
            }
            "is-complete" => {
                let p: IsCompletePayload = decode_payload(payload)?;
                let reply = self
                    .call(|resp| ControlMsg::IsComplete { code: p.code, resp })
                    .await?
                    .map_err(ControlError::host)?;
                to_json(&reply)
            }
            "kernel-info" => {
                let reply = self
                    .call(|resp| ControlMsg::KernelInfo { resp })
                    .await?
                    .map_err(ControlError::host)?;
                to_json(&reply)
            }
            "history" => {
                let p: HistoryPayload = decode_payload(payload)?;
                let request = HistoryRequest {
                    session: p.session,
                    last_n: p.last_n,
                };
                let entries = self
                    .call(|resp| ControlMsg::History { request, resp })
                    .await?
                    .map_err(ControlError::host)?;
                to_json(&entries)
            }
            "interrupt" => {
                let delivered = match &self.interrupt {
                    Some(handle) => {
                        handle.interrupt();
                        true
                    }
                    None => false,
                };
                Ok(json!({ "delivered": delivered }))
            }
            "session" => Ok(json!({ "session": state.session })),
            "subscribe" => {
                if self.notifications.is_none() {
                    return Err(ControlError::invalid_request(
                        "notifications are not available",
                    ));
                }
                Ok(json!({ "subscribed": true }))
            }
            "shutdown" => {
                let shutdown_tx = self.shutdown_tx.clone();
                let report = self
                    .call(|resp| ControlMsg::Shutdown { resp, shutdown_tx })
                    .await?
                    .map_err(ControlError::host)?;
                to_json(&report)
            }
            other => Err(ControlError::unknown_method(other)),
        }
    }

    /// Sends a control message built around a fresh reply channel and awaits the reply.
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlMsg,
    ) -> Result<T, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.control_tx
            .send(build(tx))
            .await
            .map_err(|_| ControlError::daemon_gone())?;
        rx.await.map_err(|_| ControlError::daemon_gone())
    }
}

fn decode_payload<T: DeserializeOwned>(payload: serde_json::Value) -> Result<T, ControlError> {
    serde_json::from_value(payload).map_err(|e| ControlError::decode(e.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, ControlError> {
    serde_json::to_value(value).map_err(|e| ControlError::decode(e.to_string()))
}

async fn write_line<T: Serialize>(w: &mut OwnedWriteHalf, value: &T) -> std::io::Result<()> {
    let mut json = serde_json::to_string(value).map_err(std::io::Error::other)?;
    json.push('\n');
    w.write_all(json.as_bytes()).await
}

/// Minimal control client used by tests and the CLI.
pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (r, w) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(r),
            writer: w,
        })
    }

    pub async fn request(&mut self, envelope: &RequestEnvelope) -> std::io::Result<ResponseEnvelope> {
        write_line(&mut self.writer, envelope).await?;
        self.read_json().await
    }

    /// Sends `cmd` and returns its result, turning protocol errors into [`HostError::Control`].
    pub async fn call(
        &mut self,
        cmd: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HostError> {
        let resp = self.request(&RequestEnvelope::new(cmd, payload)).await?;
        if resp.ok {
            return Ok(resp.result.unwrap_or(serde_json::Value::Null));
        }
        let message = resp
            .error
            .map(|e| format!("{}: {}", e.code, e.message))
            .unwrap_or_else(|| "request failed".into());
        Err(HostError::Control(message))
    }

    /// Next pushed notification after a successful `subscribe`; `None` once the server hangs up.
    pub async fn next_notification(&mut self) -> std::io::Result<Option<Notification>> {
        match self.read_json::<NotificationEnvelope>().await {
            Ok(envelope) => Ok(Some(envelope.notification)),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn read_json<T: DeserializeOwned>(&mut self) -> std::io::Result<T> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "control connection closed",
            ));
        }
        serde_json::from_str(&line).map_err(std::io::Error::other)
    }
}
