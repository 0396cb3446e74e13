//! JSON-RPC session over a language server's stdio streams
//!
//! One session per subprocess. A dedicated reader task decodes incoming
//! frames and resolves them against a pending-request table keyed by
//! request id, so callers suspend independently and responses may arrive in
//! any order. A writer task serializes all outgoing traffic, preserving
//! issuance order on the wire.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::protocol::{
    self, error_codes, IdGenerator, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcResponseOut,
};
use crate::types::{IncomingNotification, InitializeResult, ServerRequest};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::ShuttingDown => "shutting down",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// A request awaiting its response. Resolved exactly once: by matching
/// response, timeout, cancellation, or session teardown.
struct PendingSlot {
    tx: oneshot::Sender<Result<serde_json::Value>>,
    method: String,
    issued_at: Instant,
}

type PendingMap = Arc<Mutex<HashMap<i64, PendingSlot>>>;
type NotificationHandler = Box<dyn Fn(Option<&serde_json::Value>) + Send + Sync>;
type HandlerMap = Arc<RwLock<HashMap<String, Vec<NotificationHandler>>>>;

/// An issued request whose response has not arrived yet. Await it with
/// [`PendingCall::wait`], or cancel through [`RpcSession::cancel`] using its
/// id.
pub struct PendingCall {
    id: i64,
    method: String,
    rx: oneshot::Receiver<Result<serde_json::Value>>,
    pending: PendingMap,
}

impl PendingCall {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Suspend until the response arrives or the budget elapses. On timeout
    /// the request id is retired, so a late response is discarded by lookup
    /// miss.
    pub async fn wait(self, budget: Duration) -> Result<serde_json::Value> {
        match timeout(budget, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::SessionFailure(
                "response channel dropped".to_string(),
            )),
            Err(_) => {
                if self.pending.lock().await.remove(&self.id).is_some() {
                    tracing::debug!("retired request id {} ({}) after timeout", self.id, self.method);
                }
                Err(Error::RequestTimeout {
                    method: self.method,
                    timeout: budget,
                })
            }
        }
    }
}

/// JSON-RPC session over one pair of subprocess streams.
pub struct RpcSession {
    name: String,
    state: Arc<RwLock<SessionState>>,
    pending: PendingMap,
    handlers: HandlerMap,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    ids: IdGenerator,
}

impl RpcSession {
    /// Build a session over a reader/writer pair and start its background
    /// reader and writer tasks. The streams are exclusively owned by this
    /// session from here on.
    pub fn new<R, W>(name: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let state = Arc::new(RwLock::new(SessionState::Uninitialized));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let handlers: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        {
            let name = name.to_string();
            tokio::spawn(async move {
                Self::writer_loop(writer, outbound_rx, &name).await;
            });
        }

        {
            let name = name.to_string();
            let state = state.clone();
            let pending = pending.clone();
            let handlers = handlers.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                Self::reader_loop(
                    BufReader::new(reader),
                    state,
                    pending,
                    handlers,
                    outbound,
                    &name,
                )
                .await;
            });
        }

        Self {
            name: name.to_string(),
            state,
            pending,
            handlers,
            outbound,
            ids: IdGenerator::new(),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Register a handler for a server notification method. Handlers run on
    /// the reader task, in registration order, in the order notifications
    /// arrive.
    pub async fn on_notification(
        &self,
        method: &str,
        handler: impl Fn(Option<&serde_json::Value>) + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .await
            .entry(method.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    /// Perform the initialize handshake: initialize request, await the
    /// response, then the initialized notification.
    pub async fn initialize(
        &self,
        params: serde_json::Value,
        budget: Duration,
    ) -> Result<InitializeResult> {
        {
            let state = self.state.read().await;
            if *state != SessionState::Uninitialized {
                return Err(Error::NotReady(state.to_string()));
            }
        }
        *self.state.write().await = SessionState::Initializing;

        let result = match self.request_inner("initialize", Some(params), budget).await {
            Ok(result) => result,
            Err(e) => {
                *self.state.write().await = SessionState::Closed;
                return Err(e);
            }
        };

        let init: InitializeResult = serde_json::from_value(result).unwrap_or_else(|e| {
            tracing::warn!("[{}] unparseable initialize result: {}", self.name, e);
            InitializeResult {
                capabilities: Default::default(),
                server_info: None,
            }
        });

        self.notify("initialized", Some(serde_json::json!({})))?;
        *self.state.write().await = SessionState::Ready;

        if let Some(info) = &init.server_info {
            tracing::info!(
                "[{}] initialized: {} {}",
                self.name,
                info.name,
                info.version.as_deref().unwrap_or("")
            );
        } else {
            tracing::info!("[{}] initialized", self.name);
        }

        Ok(init)
    }

    /// Issue a request and suspend the caller until its response, error, or
    /// timeout. Valid only in the Ready state.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        budget: Duration,
    ) -> Result<serde_json::Value> {
        self.issue(method, params).await?.wait(budget).await
    }

    /// Issue a request without waiting. The returned [`PendingCall`] exposes
    /// the request id for cancellation.
    pub async fn issue(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<PendingCall> {
        {
            let state = self.state.read().await;
            if *state != SessionState::Ready {
                return Err(Error::NotReady(state.to_string()));
            }
        }
        self.issue_inner(method, params).await
    }

    /// Fire-and-forget notification.
    pub fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let encoded = JsonRpcNotification::new(method, params).encode()?;
        self.outbound
            .send(encoded)
            .map_err(|_| Error::SessionFailure("writer task is gone".to_string()))
    }

    /// Best-effort cancellation: sends `$/cancelRequest` and immediately
    /// resolves the local pending request with [`Error::Cancelled`],
    /// regardless of whether the server honors it.
    pub async fn cancel(&self, id: i64) {
        if let Some(slot) = self.pending.lock().await.remove(&id) {
            tracing::debug!("[{}] cancelled request {} ({})", self.name, id, slot.method);
            let _ = slot.tx.send(Err(Error::Cancelled));
        }
        let _ = self.notify("$/cancelRequest", Some(serde_json::json!({ "id": id })));
    }

    /// Best-effort shutdown: shutdown request, then exit notification. The
    /// session ends Closed regardless of how the server responds.
    pub async fn shutdown(&self, budget: Duration) {
        {
            let state = self.state.read().await;
            if *state == SessionState::Closed {
                return;
            }
        }
        *self.state.write().await = SessionState::ShuttingDown;

        if let Err(e) = self.request_inner("shutdown", None, budget).await {
            tracing::debug!("[{}] shutdown request failed: {}", self.name, e);
        }
        if let Err(e) = self.notify("exit", None) {
            tracing::debug!("[{}] exit notification failed: {}", self.name, e);
        }

        *self.state.write().await = SessionState::Closed;
    }

    /// Register a pending request and queue its frame for writing. The slot
    /// is registered before the write so a fast response can never miss it.
    async fn issue_inner(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<PendingCall> {
        let id = self.ids.next();
        let encoded = JsonRpcRequest::new(id, method, params).encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id,
            PendingSlot {
                tx,
                method: method.to_string(),
                issued_at: Instant::now(),
            },
        );

        if self.outbound.send(encoded).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::SessionFailure("writer task is gone".to_string()));
        }

        Ok(PendingCall {
            id,
            method: method.to_string(),
            rx,
            pending: self.pending.clone(),
        })
    }

    /// Request without the Ready-state gate, for handshake and shutdown.
    async fn request_inner(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        budget: Duration,
    ) -> Result<serde_json::Value> {
        self.issue_inner(method, params).await?.wait(budget).await
    }

    // ========== Background tasks ==========

    async fn writer_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>, name: &str)
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(data) = rx.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                tracing::error!("[{}] writer error: {}", name, e);
                break;
            }
            if let Err(e) = writer.flush().await {
                tracing::error!("[{}] flush error: {}", name, e);
                break;
            }
        }
        tracing::debug!("[{}] writer loop ended", name);
    }

    async fn reader_loop<R>(
        mut reader: BufReader<R>,
        state: Arc<RwLock<SessionState>>,
        pending: PendingMap,
        handlers: HandlerMap,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        name: &str,
    ) where
        R: AsyncRead + Unpin,
    {
        loop {
            match protocol::read_frame(&mut reader).await {
                Ok(Some(message)) => {
                    Self::dispatch(message, &pending, &handlers, &outbound, name).await;
                }
                Ok(None) => {
                    let last = *state.read().await;
                    *state.write().await = SessionState::Closed;
                    if matches!(last, SessionState::ShuttingDown | SessionState::Closed) {
                        tracing::debug!("[{}] server closed its output stream", name);
                        Self::fail_all(&pending, name, || {
                            Error::SessionFailure("session closed".to_string())
                        })
                        .await;
                    } else {
                        tracing::warn!(
                            "[{}] server output stream ended unexpectedly (state: {})",
                            name,
                            last
                        );
                        Self::fail_all(&pending, name, || Error::ProcessCrashed).await;
                    }
                    return;
                }
                Err(e) => {
                    // No way to resynchronize on a byte stream; the session
                    // is done.
                    tracing::error!("[{}] fatal transport error: {}", name, e);
                    *state.write().await = SessionState::Closed;
                    let msg = e.to_string();
                    Self::fail_all(&pending, name, || Error::SessionFailure(msg.clone())).await;
                    return;
                }
            }
        }
    }

    async fn dispatch(
        message: serde_json::Value,
        pending: &PendingMap,
        handlers: &HandlerMap,
        outbound: &mpsc::UnboundedSender<Vec<u8>>,
        name: &str,
    ) {
        let has_id = message.get("id").map(|v| !v.is_null()).unwrap_or(false);
        let has_method = message.get("method").is_some();

        if has_id && has_method {
            match serde_json::from_value::<ServerRequest>(message) {
                Ok(request) => Self::answer_server_request(&request, outbound, name),
                Err(e) => tracing::warn!("[{}] unparseable server request: {}", name, e),
            }
            return;
        }

        if has_id {
            match serde_json::from_value::<JsonRpcResponse>(message) {
                Ok(response) => Self::resolve_response(response, pending, name).await,
                Err(e) => tracing::warn!("[{}] unparseable response: {}", name, e),
            }
            return;
        }

        if has_method {
            match serde_json::from_value::<IncomingNotification>(message) {
                Ok(notification) => Self::dispatch_notification(&notification, handlers, name).await,
                Err(e) => tracing::warn!("[{}] unparseable notification: {}", name, e),
            }
            return;
        }

        tracing::warn!("[{}] message is neither request, response, nor notification", name);
    }

    async fn resolve_response(response: JsonRpcResponse, pending: &PendingMap, name: &str) {
        let Some(id) = response.id else {
            tracing::warn!("[{}] response without id", name);
            return;
        };

        let slot = pending.lock().await.remove(&id);
        match slot {
            Some(slot) => {
                tracing::debug!(
                    "[{}] response for {} ({}) after {:?}",
                    name,
                    id,
                    slot.method,
                    slot.issued_at.elapsed()
                );
                let result = match response.error {
                    Some(err) => Err(Error::RequestFailure {
                        code: err.code,
                        message: err.message,
                    }),
                    None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
                };
                let _ = slot.tx.send(result);
            }
            None => {
                // Timed out, cancelled, or never ours; discarded by design
                tracing::debug!("[{}] discarding response for retired id {}", name, id);
            }
        }
    }

    /// Answer a server-to-client request per its method contract, or reject
    /// it with "method not found".
    fn answer_server_request(
        request: &ServerRequest,
        outbound: &mpsc::UnboundedSender<Vec<u8>>,
        name: &str,
    ) {
        let id = request.id.clone();
        let response = match request.method.as_str() {
            "window/workDoneProgress/create" | "client/registerCapability"
            | "window/showMessageRequest" => JsonRpcResponseOut::success_null(id),
            "workspace/configuration" => {
                let count = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("items"))
                    .and_then(|items| items.as_array())
                    .map(|items| items.len())
                    .unwrap_or(1);
                JsonRpcResponseOut::success(
                    id,
                    serde_json::Value::Array(vec![serde_json::Value::Null; count]),
                )
            }
            other => {
                tracing::debug!("[{}] rejecting server request '{}'", name, other);
                JsonRpcResponseOut::error(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("method not found: {}", other),
                )
            }
        };

        match response.encode() {
            Ok(encoded) => {
                let _ = outbound.send(encoded);
            }
            Err(e) => tracing::warn!("[{}] failed to encode server-request reply: {}", name, e),
        }
    }

    async fn dispatch_notification(
        notification: &IncomingNotification,
        handlers: &HandlerMap,
        name: &str,
    ) {
        match notification.method.as_str() {
            "window/logMessage" | "window/showMessage" => {
                if let Some(msg) = notification
                    .params
                    .as_ref()
                    .and_then(|p| p.get("message"))
                    .and_then(|m| m.as_str())
                {
                    tracing::debug!("[{}] server message: {}", name, msg);
                }
            }
            "$/progress" => tracing::trace!("[{}] progress notification", name),
            other => tracing::trace!("[{}] notification: {}", name, other),
        }

        let handlers = handlers.read().await;
        if let Some(list) = handlers.get(&notification.method) {
            for handler in list {
                handler(notification.params.as_ref());
            }
        }
    }

    async fn fail_all(pending: &PendingMap, name: &str, make_err: impl Fn() -> Error) {
        let mut map = pending.lock().await;
        if map.is_empty() {
            return;
        }
        tracing::warn!("[{}] failing {} outstanding request(s)", name, map.len());
        for (id, slot) in map.drain() {
            tracing::debug!("[{}] failing pending request {} ({})", name, id, slot.method);
            let _ = slot.tx.send(Err(make_err()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    type StubReader = BufReader<ReadHalf<DuplexStream>>;
    type StubWriter = WriteHalf<DuplexStream>;

    /// Session over an in-memory pipe plus the server-side halves.
    fn pipe_session(name: &str) -> (RpcSession, StubReader, StubWriter) {
        let (client, server) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let session = RpcSession::new(name, client_read, client_write);
        (session, BufReader::new(server_read), server_write)
    }

    async fn stub_read(reader: &mut StubReader) -> serde_json::Value {
        protocol::read_frame(reader).await.unwrap().unwrap()
    }

    async fn stub_write(writer: &mut StubWriter, value: serde_json::Value) {
        let body = serde_json::to_string(&value).unwrap();
        let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        writer.write_all(framed.as_bytes()).await.unwrap();
        writer.flush().await.unwrap();
    }

    async fn stub_respond(writer: &mut StubWriter, id: i64, result: serde_json::Value) {
        stub_write(
            writer,
            serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        )
        .await;
    }

    /// Drive the server side of the initialize handshake.
    async fn stub_handshake(reader: &mut StubReader, writer: &mut StubWriter) {
        loop {
            let msg = stub_read(reader).await;
            match msg["method"].as_str() {
                Some("initialize") => {
                    let id = msg["id"].as_i64().unwrap();
                    stub_respond(
                        writer,
                        id,
                        serde_json::json!({
                            "capabilities": { "documentSymbolProvider": true },
                            "serverInfo": { "name": "stub", "version": "0.0" }
                        }),
                    )
                    .await;
                }
                Some("initialized") => return,
                other => panic!("unexpected message during handshake: {:?}", other),
            }
        }
    }

    async fn ready_session(name: &str) -> (RpcSession, StubReader, StubWriter) {
        let (session, mut reader, mut writer) = pipe_session(name);
        let handshake = async {
            stub_handshake(&mut reader, &mut writer).await;
            (reader, writer)
        };
        let init = session.initialize(serde_json::json!({}), Duration::from_secs(5));
        let ((reader, writer), init) = tokio::join!(handshake, init);
        init.unwrap();
        (session, reader, writer)
    }

    #[tokio::test]
    async fn test_initialize_handshake() {
        let (session, _reader, _writer) = ready_session("handshake").await;
        assert_eq!(session.state().await, SessionState::Ready);
    }

    #[tokio::test]
    async fn test_call_rejected_before_initialize() {
        let (session, _reader, _writer) = pipe_session("early");
        let err = session
            .call("textDocument/documentSymbol", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
    }

    #[tokio::test]
    async fn test_out_of_order_response_correlation() {
        let (session, mut reader, mut writer) = ready_session("ooo").await;

        let stub = tokio::spawn(async move {
            let first = stub_read(&mut reader).await;
            let second = stub_read(&mut reader).await;
            let first_id = first["id"].as_i64().unwrap();
            let second_id = second["id"].as_i64().unwrap();
            // Answer in reverse order of issuance
            stub_respond(&mut writer, second_id, serde_json::json!("second")).await;
            stub_respond(&mut writer, first_id, serde_json::json!("first")).await;
            (reader, writer)
        });

        let budget = Duration::from_secs(5);
        let (a, b) = tokio::join!(
            session.call("op/a", None, budget),
            session.call("op/b", None, budget)
        );
        // Requests are written in issuance order, so op/a has the lower id
        assert_eq!(a.unwrap(), serde_json::json!("first"));
        assert_eq!(b.unwrap(), serde_json::json!("second"));
        stub.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_retires_id_and_session_stays_usable() {
        let (session, mut reader, mut writer) = ready_session("timeout").await;

        let stub = tokio::spawn(async move {
            // First request: hold the response until after the caller gives up
            let first = stub_read(&mut reader).await;
            let first_id = first["id"].as_i64().unwrap();

            // Second request: send the stale response first, then the real one
            let second = stub_read(&mut reader).await;
            let second_id = second["id"].as_i64().unwrap();
            stub_respond(&mut writer, first_id, serde_json::json!("too-late")).await;
            stub_respond(&mut writer, second_id, serde_json::json!("fresh")).await;
            (reader, writer)
        });

        let err = session
            .call("slow/op", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { .. }));

        // The late response for the retired id must not leak into this call
        let result = session
            .call("fast/op", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("fresh"));
        stub.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_resolves_locally_and_notifies_server() {
        let (session, mut reader, _writer) = ready_session("cancel").await;

        let call = session.issue("slow/op", None).await.unwrap();
        let id = call.id();

        let request = stub_read(&mut reader).await;
        assert_eq!(request["id"].as_i64().unwrap(), id);

        session.cancel(id).await;
        let err = call.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let cancel_notification = stub_read(&mut reader).await;
        assert_eq!(cancel_notification["method"], "$/cancelRequest");
        assert_eq!(cancel_notification["params"]["id"].as_i64().unwrap(), id);
    }

    #[tokio::test]
    async fn test_server_error_surfaces_as_request_failure() {
        let (session, mut reader, mut writer) = ready_session("err").await;

        let stub = tokio::spawn(async move {
            let req = stub_read(&mut reader).await;
            let id = req["id"].as_i64().unwrap();
            stub_write(
                &mut writer,
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32602, "message": "bad params" }
                }),
            )
            .await;
            (reader, writer)
        });

        let err = session
            .call("bad/op", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::RequestFailure { code: -32602, ref message } if message == "bad params")
        );
        stub.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_server_request_rejected_with_method_not_found() {
        let (_session, mut reader, mut writer) = ready_session("srvreq").await;

        stub_write(
            &mut writer,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 99,
                "method": "custom/extension",
                "params": {}
            }),
        )
        .await;

        let reply = stub_read(&mut reader).await;
        assert_eq!(reply["id"], 99);
        assert_eq!(reply["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_known_server_requests_acknowledged() {
        let (_session, mut reader, mut writer) = ready_session("ack").await;

        stub_write(
            &mut writer,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "window/workDoneProgress/create",
                "params": { "token": "t" }
            }),
        )
        .await;
        let reply = stub_read(&mut reader).await;
        assert_eq!(reply["id"], 1);
        assert!(reply["result"].is_null());
        assert!(reply.get("error").is_none());

        stub_write(
            &mut writer,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "workspace/configuration",
                "params": { "items": [{ "section": "a" }, { "section": "b" }] }
            }),
        )
        .await;
        let reply = stub_read(&mut reader).await;
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["result"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_notifications_dispatched_in_arrival_order() {
        let (session, _reader, mut writer) = ready_session("notify").await;

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            session
                .on_notification("textDocument/publishDiagnostics", move |params| {
                    let uri = params
                        .and_then(|p| p.get("uri"))
                        .and_then(|u| u.as_str())
                        .unwrap_or_default()
                        .to_string();
                    seen.lock().unwrap().push(uri);
                })
                .await;
        }

        for name in ["one", "two", "three"] {
            stub_write(
                &mut writer,
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": "textDocument/publishDiagnostics",
                    "params": { "uri": name, "diagnostics": [] }
                }),
            )
            .await;
        }

        // Let the reader task drain the pipe
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_stream_eof_fails_inflight_with_process_crashed() {
        let (session, mut reader, writer) = ready_session("crash").await;

        let call = session.issue("slow/op", None).await.unwrap();
        let _request = stub_read(&mut reader).await;

        // Simulate the subprocess dying: both server-side halves go away
        drop(writer);
        drop(reader);

        let err = call.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::ProcessCrashed));
        assert_eq!(session.state().await, SessionState::Closed);

        // New calls are rejected once the session is closed
        let err = session
            .call("more/work", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal() {
        let (session, mut reader, mut writer) = ready_session("garbage").await;

        let call = session.issue("slow/op", None).await.unwrap();
        let _request = stub_read(&mut reader).await;

        writer
            .write_all(b"Content-Length: not-a-number\r\n\r\n")
            .await
            .unwrap();
        writer.flush().await.unwrap();

        let err = call.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::SessionFailure(_)));
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_closes_regardless_of_response() {
        let (session, _reader, _writer) = ready_session("bye").await;
        // Server never answers the shutdown request
        session.shutdown(Duration::from_millis(100)).await;
        assert_eq!(session.state().await, SessionState::Closed);

        // Idempotent
        session.shutdown(Duration::from_millis(100)).await;
        assert_eq!(session.state().await, SessionState::Closed);
    }
}
