//! LSP client core
//!
//! [`LspClient`] multiplexes requests over one [`Transport`] at a time and
//! keeps the server's view of the workspace in step with local edits.
//!
//! Outbound frames go through a single FIFO channel per connection, drained
//! by a writer task, so the server sees them in call order. Until the
//! handshake completes, requests and notifications wait in a queue that is
//! flushed right after `initialized`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::capabilities::CapabilityGate;
use super::pending::{PendingRequestTable, RequestHandle, RequestKey, RequestState};
use super::protocol::{
    CancelParams, ClientCapabilities, ClientInfo, DidChangeTextDocumentParams,
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, InitializeParams, InitializeResult,
    Message, MessageParams, MessageType, Notification, Range, RegistrationParams, Request,
    RequestId, Response, ResponseError, ServerCapabilities, TextDocumentClientCapabilities,
    TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem,
    TextDocumentSyncKind, UnregistrationParams, VersionedTextDocumentIdentifier,
    WorkspaceFolder, error_codes,
};
use super::transport::{SubscriptionId, Transport};
use crate::config::ClientConfig;
use crate::error::{LspError, TetherResult, WorkspaceError};
use crate::infra::retry::{with_retry, with_retry_if};
use crate::models::TextChange;
use crate::models::text::{apply_change, position_at};
use crate::workspace::mapping::sync_recorded;
use crate::workspace::{
    CloseOutcome, EditHistory, OpenDocument, OpenOutcome, SyncedFile, Workspace,
    WorkspaceMapping, lock,
};

pub type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;
pub type RequestHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ResponseError>> + Send + Sync>;
pub type UnhandledHandler = Arc<dyn Fn(&str, Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// `initialize` sent, waiting for the answer
    Connecting,
    Initialized,
}

/// A request result together with the mapping that translates it into the
/// current document state
#[derive(Debug)]
pub struct Mapped<T> {
    pub value: T,
    pub mapping: WorkspaceMapping,
}

enum Outbound {
    Request { id: u64, text: String },
    Message(String),
    /// Answered once every earlier frame has been handed to the transport
    Flush(oneshot::Sender<()>),
}

impl Outbound {
    fn request_id(&self) -> Option<u64> {
        match self {
            Self::Request { id, .. } => Some(*id),
            _ => None,
        }
    }
}

struct Connection {
    transport: Arc<dyn Transport>,
    subscription: SubscriptionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    writer: JoinHandle<()>,
}

#[derive(Default)]
struct Link {
    connection: Option<Connection>,
    initialized: bool,
    /// Bumped on every attach and teardown so a stale handshake can tell
    generation: u64,
    /// Frames issued before the handshake completed
    queue: VecDeque<Outbound>,
}

impl Link {
    /// Outbound channel, once the handshake is complete
    fn ready(&self) -> Option<&mpsc::UnboundedSender<Outbound>> {
        self.connection
            .as_ref()
            .filter(|_| self.initialized)
            .map(|connection| &connection.outbound)
    }
}

#[derive(Default)]
struct Handlers {
    notifications: HashMap<String, NotificationHandler>,
    requests: HashMap<String, RequestHandler>,
    unhandled: Option<UnhandledHandler>,
}

pub struct LspClient {
    config: ClientConfig,
    workspace: Arc<dyn Workspace>,
    history: Arc<Mutex<EditHistory>>,
    pending: Arc<PendingRequestTable>,
    capabilities: CapabilityGate,
    state: watch::Sender<ConnectionState>,
    // Lock order: link, then history, then the workspace's own lock
    link: Mutex<Link>,
    handlers: RwLock<Handlers>,
    sweeper: JoinHandle<()>,
    this: Weak<LspClient>,
}

impl LspClient {
    /// Create a disconnected client. Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig, workspace: Arc<dyn Workspace>) -> Arc<Self> {
        let pending = Arc::new(PendingRequestTable::new());
        let sweeper = tokio::spawn(Arc::clone(&pending).drive_timeouts());
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new_cyclic(|this| Self {
            config,
            workspace,
            history: Arc::new(Mutex::new(EditHistory::new())),
            pending,
            capabilities: CapabilityGate::new(),
            state,
            link: Mutex::new(Link::default()),
            handlers: RwLock::new(Handlers::default()),
            sweeper,
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Arc<dyn Workspace> {
        &self.workspace
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Resolves once the handshake with the current (or next) server is done
    pub async fn wait_initialized(&self) {
        let mut state = self.state.subscribe();
        // The sender lives as long as the client, so this only returns once initialized
        let _ = state.wait_for(|s| *s == ConnectionState::Initialized).await;
    }

    pub fn capabilities(&self) -> &CapabilityGate {
        &self.capabilities
    }

    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities.capabilities()
    }

    /// `None` while the server's capabilities are not known yet
    pub fn has_capability(&self, name: &str) -> Option<bool> {
        self.capabilities.has_capability(name)
    }

    pub fn request_state(&self, id: u64) -> Option<RequestState> {
        self.pending.state(id)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Attach to `transport` and run the `initialize` handshake.
    ///
    /// Any previous connection is dropped first. On success the open
    /// documents are replayed with `didOpen` and queued frames are flushed.
    pub async fn connect(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<InitializeResult, LspError> {
        let params = serde_json::to_value(self.initialize_params())?;
        let (generation, outbound) = self.attach(transport);

        let handle = self.pending.create(
            "initialize",
            self.config.timeout_for("initialize"),
            None,
        );
        let id = handle.id();
        match encode_request(id, "initialize", Some(params)) {
            Ok(text) => {
                if outbound.send(Outbound::Request { id, text }).is_err() {
                    self.pending.reject(id, LspError::NotConnected);
                }
            }
            Err(e) => {
                self.pending.reject(id, LspError::Protocol(e.to_string()));
            }
        }

        let result = match handle.await {
            Ok(value) => serde_json::from_value::<InitializeResult>(value).map_err(LspError::from),
            Err(e) => Err(e),
        };
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Initialize failed: {}", e);
                self.detach(generation);
                return Err(e);
            }
        };

        self.capabilities.set(result.capabilities.clone());
        if let Err(e) = self.complete_handshake(generation) {
            self.detach(generation);
            return Err(e);
        }

        match &result.server_info {
            Some(info) => tracing::info!(
                "Connected to {} {}",
                info.name,
                info.version.as_deref().unwrap_or("")
            ),
            None => tracing::info!("Connected to language server"),
        }
        Ok(result)
    }

    /// Drop the current connection.
    ///
    /// Requests already handed to it are rejected with `NotConnected`;
    /// requests still waiting for a handshake stay queued for the next one.
    pub fn disconnect(&self) {
        let mut link = lock(&self.link);
        self.teardown(&mut link);
        drop(link);
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// `shutdown` request, `exit` notification, then disconnect
    pub async fn shutdown(&self) -> Result<(), LspError> {
        if self.state() != ConnectionState::Initialized {
            self.disconnect();
            return Ok(());
        }

        let result = self.request::<()>("shutdown", None).await;
        match &result {
            Ok(()) => {
                if let Err(e) = self.notify("exit", None) {
                    tracing::debug!("Could not send exit: {}", e);
                }
                self.flush().await;
            }
            Err(e) => tracing::debug!("Shutdown request failed: {}", e),
        }

        self.disconnect();
        tracing::info!("Language server connection closed");
        result
    }

    /// Wait until every frame handed to the connection so far has reached
    /// the transport. Queued frames are not covered.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        let sent = lock(&self.link)
            .connection
            .as_ref()
            .is_some_and(|connection| connection.outbound.send(Outbound::Flush(done)).is_ok());
        if sent {
            let _ = wait.await;
        }
    }

    fn attach(&self, transport: Arc<dyn Transport>) -> (u64, mpsc::UnboundedSender<Outbound>) {
        let mut link = lock(&self.link);
        self.teardown(&mut link);
        let generation = link.generation;

        let this = self.this.clone();
        let subscription = transport.subscribe(Arc::new(move |raw: &str| {
            if let Some(client) = this.upgrade() {
                client.receive_message(raw);
            }
        }));

        let (outbound, frames) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(
            Arc::clone(&transport),
            frames,
            Arc::clone(&self.pending),
        ));
        link.connection = Some(Connection {
            transport,
            subscription,
            outbound: outbound.clone(),
            writer,
        });
        drop(link);

        self.state.send_replace(ConnectionState::Connecting);
        tracing::debug!("Attached transport, sending initialize");
        (generation, outbound)
    }

    /// Tear down after a failed handshake, unless a newer connect took over
    fn detach(&self, generation: u64) {
        let mut link = lock(&self.link);
        if link.generation != generation {
            return;
        }
        self.teardown(&mut link);
        drop(link);
        self.state.send_replace(ConnectionState::Disconnected);
    }

    fn teardown(&self, link: &mut Link) {
        link.initialized = false;
        link.generation += 1;
        self.capabilities.clear();

        let Some(connection) = link.connection.take() else {
            return;
        };
        connection.transport.unsubscribe(connection.subscription);
        connection.writer.abort();

        let queued: HashSet<u64> = link.queue.iter().filter_map(Outbound::request_id).collect();
        let lost = self.pending.reject_unqueued(&queued);
        tracing::debug!(
            "Disconnected; {} requests rejected, {} frames kept for the next connection",
            lost,
            link.queue.len()
        );
    }

    fn complete_handshake(&self, generation: u64) -> Result<(), LspError> {
        let mut link = lock(&self.link);
        if link.generation != generation {
            return Err(LspError::NotConnected);
        }
        let outbound = link
            .connection
            .as_ref()
            .map(|connection| connection.outbound.clone())
            .ok_or(LspError::NotConnected)?;
        let push = |frame: Outbound| outbound.send(frame).map_err(|_| LspError::NotConnected);

        push(Outbound::Message(encode_notification(
            "initialized",
            Some(json!({})),
        )?))?;

        // Edits made while disconnected are folded into the replayed text
        sync_recorded(&self.history, self.workspace.as_ref());
        let documents = self.workspace.files();
        for doc in &documents {
            push(Outbound::Message(did_open_frame(doc)?))?;
        }

        let queued = link.queue.len();
        while let Some(frame) = link.queue.pop_front() {
            push(frame)?;
        }
        link.initialized = true;
        drop(link);

        tracing::debug!(
            "Handshake complete: replayed {} documents, flushed {} queued frames",
            documents.len(),
            queued
        );
        self.state.send_replace(ConnectionState::Initialized);
        Ok(())
    }

    fn initialize_params(&self) -> InitializeParams {
        let root_uri = self.config.root_uri.clone();
        let workspace_folders = root_uri.as_ref().map(|uri| {
            vec![WorkspaceFolder {
                uri: uri.clone(),
                name: folder_name(uri),
            }]
        });

        InitializeParams {
            process_id: Some(std::process::id()),
            root_uri,
            workspace_folders,
            capabilities: client_capabilities(),
            client_info: Some(ClientInfo {
                name: self.config.client_name.clone(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            initialization_options: self.config.initialization_options.clone(),
        }
    }

    // ========================================================================
    // Requests and notifications
    // ========================================================================

    /// Send a request and wait for its result
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, LspError> {
        let value = self.start_request(method, params, None)?.await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`request`](Self::request), cancellable through `key`
    pub async fn request_with_key<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        key: &RequestKey,
    ) -> Result<T, LspError> {
        let value = self.start_request(method, params, Some(key.clone()))?.await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Issue a request without waiting; the handle resolves with the raw result
    pub fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<RequestHandle, LspError> {
        self.start_request(method, params, None)
    }

    /// Like [`send_request`](Self::send_request), cancellable through `key`
    pub fn send_request_with_key(
        &self,
        method: &str,
        params: Option<Value>,
        key: &RequestKey,
    ) -> Result<RequestHandle, LspError> {
        self.start_request(method, params, Some(key.clone()))
    }

    pub async fn request_with_retry<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, LspError> {
        let config = self.config.retry_config();
        with_retry(&config, || self.request(method, params.clone())).await
    }

    /// Retrying request whose attempts all use `key`. Cancelling the key
    /// cancels the current attempt and stops further ones.
    pub async fn request_with_retry_and_key<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        key: &RequestKey,
    ) -> Result<T, LspError> {
        let config = self.config.retry_config();
        with_retry_if(
            &config,
            || {
                let params = params.clone();
                async move {
                    if key.is_cancelled() {
                        return Err(LspError::RequestCancelled);
                    }
                    self.request_with_key(method, params, key).await
                }
            },
            |e| e.is_recoverable() && !key.is_cancelled(),
        )
        .await
    }

    /// Ask the server to cancel the request registered under `key`.
    ///
    /// A request that never left the queue is rejected locally with
    /// `RequestCancelled`. Otherwise `$/cancelRequest` is sent and the
    /// request stays pending until the server answers. Returns false if no
    /// live request uses `key`.
    pub fn cancel(&self, key: &RequestKey) -> bool {
        key.mark_cancelled();
        let Some((id, state)) = self.pending.find_by_key(key) else {
            return false;
        };

        let mut link = lock(&self.link);
        if state == RequestState::Queued {
            let before = link.queue.len();
            link.queue.retain(|frame| frame.request_id() != Some(id));
            if link.queue.len() < before {
                drop(link);
                tracing::debug!("Request {} cancelled before it was sent", id);
                self.pending.reject(id, LspError::RequestCancelled);
                return true;
            }
        }
        if state == RequestState::CancelRequested {
            return true;
        }

        self.pending.mark_cancel_requested(id);
        let frame = serde_json::to_value(CancelParams {
            id: RequestId::Number(id),
        })
        .map_err(LspError::from)
        .and_then(|params| encode_notification("$/cancelRequest", Some(params)))
        .map(Outbound::Message)
            .and_then(|frame| enqueue(&mut link, frame));
        if let Err(e) = frame {
            tracing::warn!("Could not send cancellation for request {}: {}", id, e);
        }
        true
    }

    /// Send a notification; before the handshake it waits in the queue
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), LspError> {
        let frame = Outbound::Message(encode_notification(method, params)?);
        enqueue(&mut lock(&self.link), frame)
    }

    fn start_request(
        &self,
        method: &str,
        params: Option<Value>,
        key: Option<RequestKey>,
    ) -> Result<RequestHandle, LspError> {
        let mut link = lock(&self.link);
        self.start_request_in(&mut link, method, params, key)
    }

    fn start_request_in(
        &self,
        link: &mut Link,
        method: &str,
        params: Option<Value>,
        key: Option<RequestKey>,
    ) -> Result<RequestHandle, LspError> {
        if self.config.enforce_capabilities
            && self.capabilities.supports_method(method) == Some(false)
        {
            return Err(LspError::Unsupported {
                method: method.to_string(),
            });
        }

        let handle = self.pending.create(method, self.config.timeout_for(method), key);
        let id = handle.id();
        let sent = encode_request(id, method, params)
            .and_then(|text| enqueue(link, Outbound::Request { id, text }));
        if let Err(e) = sent {
            self.pending.reject(id, LspError::NotConnected);
            return Err(e);
        }
        tracing::trace!("LSP request {}: {}", id, method);
        Ok(handle)
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Register a document; the first holder triggers `didOpen`
    pub fn open_file(&self, uri: &str, language_id: &str, text: &str) -> TetherResult<OpenOutcome> {
        let link = lock(&self.link);
        let outcome = self.workspace.open_file(uri, language_id, text)?;
        if let (OpenOutcome::Opened(doc), Some(outbound)) = (&outcome, link.ready()) {
            send_frame(outbound, did_open_frame(doc)?)?;
        }
        Ok(outcome)
    }

    /// Release a document; the last holder triggers `didClose`
    pub fn close_file(&self, uri: &str) -> TetherResult<CloseOutcome> {
        let link = lock(&self.link);
        let mut history = lock(&self.history);
        let outcome = self.workspace.close_file(uri)?;
        if outcome != CloseOutcome::Closed {
            return Ok(outcome);
        }
        history.forget(uri);
        drop(history);

        if let Some(outbound) = link.ready() {
            let params = DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier::new(uri),
            };
            let frame = encode_notification(
                "textDocument/didClose",
                Some(serde_json::to_value(params).map_err(LspError::from)?),
            )?;
            send_frame(outbound, frame)?;
        }
        Ok(outcome)
    }

    /// Record local edits; the server hears about them on the next [`sync`](Self::sync)
    pub fn update_file(&self, uri: &str, changes: &[TextChange]) -> Result<(), WorkspaceError> {
        self.workspace.update_file(uri, changes)
    }

    /// Push every pending edit batch to the server as `didChange`.
    ///
    /// Versions advance even while disconnected; the connect-time `didOpen`
    /// replay then carries the text. A server without `textDocumentSync`
    /// takes no `didChange`, so its edits stay pending. Returns the number
    /// of documents synced.
    pub fn sync(&self) -> TetherResult<usize> {
        let link = lock(&self.link);
        self.sync_in(&link)
    }

    fn sync_in(&self, link: &Link) -> TetherResult<usize> {
        let Some(outbound) = link.ready() else {
            let synced = sync_recorded(&self.history, self.workspace.as_ref());
            if !synced.is_empty() {
                tracing::debug!(
                    "Not initialized; {} documents will be replayed on connect",
                    synced.len()
                );
            }
            return Ok(synced.len());
        };

        let kind = self
            .capabilities
            .sync_kind()
            .unwrap_or(TextDocumentSyncKind::Full);
        // The server only knows the didOpen text; edits stay pending so
        // mappings compose them on top of it
        if kind == TextDocumentSyncKind::None {
            return Ok(0);
        }

        let synced = sync_recorded(&self.history, self.workspace.as_ref());
        for file in &synced {
            let params = self.did_change_params(file, kind);
            let frame = encode_notification(
                "textDocument/didChange",
                Some(serde_json::to_value(params).map_err(LspError::from)?),
            )?;
            send_frame(outbound, frame)?;
        }
        Ok(synced.len())
    }

    fn did_change_params(
        &self,
        file: &SyncedFile,
        kind: TextDocumentSyncKind,
    ) -> DidChangeTextDocumentParams {
        let content_changes = match kind {
            TextDocumentSyncKind::Incremental
                if file.text.len() > self.config.full_sync_threshold =>
            {
                incremental_changes(file).unwrap_or_else(|| vec![full_text_change(file)])
            }
            _ => vec![full_text_change(file)],
        };
        DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: file.uri.clone(),
                version: file.version,
            },
            content_changes,
        }
    }

    // ========================================================================
    // Mapping
    // ========================================================================

    /// Snapshot the synced version of every open document.
    ///
    /// History for those documents is retained until the mapping is dropped.
    pub fn mapping(&self) -> WorkspaceMapping {
        WorkspaceMapping::new(Arc::clone(&self.history), Arc::clone(&self.workspace))
    }

    /// Sync, snapshot and send in one step, after the handshake.
    ///
    /// The returned mapping translates positions in the result (which the
    /// server computed against the synced text) into the current text.
    pub async fn mapped_request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> TetherResult<Mapped<T>> {
        self.start_mapped(method, params, None).await
    }

    /// Like [`mapped_request`](Self::mapped_request), cancellable through `key`
    pub async fn mapped_request_with_key<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        key: &RequestKey,
    ) -> TetherResult<Mapped<T>> {
        self.start_mapped(method, params, Some(key)).await
    }

    async fn start_mapped<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        key: Option<&RequestKey>,
    ) -> TetherResult<Mapped<T>> {
        let (mapping, handle) = loop {
            self.wait_initialized().await;
            if key.is_some_and(RequestKey::is_cancelled) {
                return Err(LspError::RequestCancelled.into());
            }
            if let Some(started) = self.try_start_mapped(method, params.clone(), key)? {
                break started;
            }
        };
        let value = handle.await?;
        let value = serde_json::from_value(value).map_err(LspError::from)?;
        Ok(Mapped { value, mapping })
    }

    /// Run `f` with a mapping that is released when it returns
    pub async fn with_mapping<T>(&self, f: impl AsyncFnOnce(&WorkspaceMapping) -> T) -> T {
        let mapping = self.mapping();
        let result = f(&mapping).await;
        mapping.release();
        result
    }

    fn try_start_mapped(
        &self,
        method: &str,
        params: Option<Value>,
        key: Option<&RequestKey>,
    ) -> TetherResult<Option<(WorkspaceMapping, RequestHandle)>> {
        let mut link = lock(&self.link);
        // Lost the connection between the wakeup and here
        if link.ready().is_none() {
            return Ok(None);
        }
        self.sync_in(&link)?;
        let mapping = self.mapping();
        let handle = self.start_request_in(&mut link, method, params, key.cloned())?;
        Ok(Some((mapping, handle)))
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Handle a server notification; takes precedence over the built-in ones
    pub fn on_notification<F>(&self, method: &str, handler: F) -> Result<(), LspError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers_mut();
        check_method_name(method, handlers.notifications.contains_key(method))?;
        handlers
            .notifications
            .insert(method.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Like [`on_notification`](Self::on_notification) with decoded params.
    /// Params that do not decode are logged and dropped.
    pub fn on_notification_typed<P, F>(&self, method: &str, handler: F) -> Result<(), LspError>
    where
        P: DeserializeOwned,
        F: Fn(P) + Send + Sync + 'static,
    {
        let name = method.to_string();
        self.on_notification(method, move |params| {
            match serde_json::from_value::<P>(params) {
                Ok(params) => handler(params),
                Err(e) => tracing::warn!("Malformed {} params: {}", name, e),
            }
        })
    }

    pub fn remove_notification_handler(&self, method: &str) -> bool {
        self.handlers_mut().notifications.remove(method).is_some()
    }

    /// Answer a server-to-client request
    pub fn on_request<F, Fut>(&self, method: &str, handler: F) -> Result<(), LspError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ResponseError>> + Send + 'static,
    {
        let mut handlers = self.handlers_mut();
        check_method_name(method, handlers.requests.contains_key(method))?;
        handlers
            .requests
            .insert(method.to_string(), Arc::new(move |params| handler(params).boxed()));
        Ok(())
    }

    /// Receives notifications nothing else handled
    pub fn on_unhandled<F>(&self, handler: F)
    where
        F: Fn(&str, Value) + Send + Sync + 'static,
    {
        self.handlers_mut().unhandled = Some(Arc::new(handler));
    }

    fn handlers(&self) -> RwLockReadGuard<'_, Handlers> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers_mut(&self) -> RwLockWriteGuard<'_, Handlers> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Dispatch one inbound message by shape
    pub fn receive_message(&self, raw: &str) {
        tracing::trace!("LSP <- {}", raw);
        match Message::parse(raw) {
            Ok(Message::Response(response)) => self.handle_response(response),
            Ok(Message::Notification(notification)) => self.handle_notification(notification),
            Ok(Message::Request(request)) => self.handle_server_request(request),
            Err(e) => tracing::warn!("Dropping malformed message: {}", e),
        }
    }

    fn handle_response(&self, response: Response) {
        let Some(id) = response.id.as_ref().and_then(RequestId::as_u64) else {
            tracing::warn!("Dropping response without a usable id: {:?}", response.id);
            return;
        };
        match response.into_result() {
            Ok(value) => self.pending.resolve(id, value),
            Err(error) => self.pending.reject(id, LspError::from(error)),
        };
    }

    fn handle_notification(&self, notification: Notification) {
        let method = notification.method;
        let params = notification.params.unwrap_or(Value::Null);

        let handler = self.handlers().notifications.get(&method).cloned();
        if let Some(handler) = handler {
            handler(params);
            return;
        }

        match method.as_str() {
            "window/logMessage" => log_server_message("log", params),
            "window/showMessage" => log_server_message("message", params),
            _ => {
                let fallback = self.handlers().unhandled.clone();
                match fallback {
                    Some(fallback) => fallback(&method, params),
                    None => tracing::trace!("Unhandled notification: {}", method),
                }
            }
        }
    }

    fn handle_server_request(&self, request: Request) {
        let id = request.id;
        let params = request.params.unwrap_or(Value::Null);

        let handler = self.handlers().requests.get(&request.method).cloned();
        if let Some(handler) = handler {
            let this = self.this.clone();
            let answer = handler(params);
            tokio::spawn(async move {
                let result = answer.await;
                if let Some(client) = this.upgrade() {
                    client.respond(id, result);
                }
            });
            return;
        }

        let result = match request.method.as_str() {
            "client/registerCapability" => serde_json::from_value::<RegistrationParams>(params)
                .map(|p| {
                    self.capabilities.register(p.registrations);
                    Value::Null
                })
                .map_err(invalid_params),
            "client/unregisterCapability" => {
                serde_json::from_value::<UnregistrationParams>(params)
                    .map(|p| {
                        self.capabilities.unregister(&p.unregistrations);
                        Value::Null
                    })
                    .map_err(invalid_params)
            }
            "window/workDoneProgress/create" => Ok(Value::Null),
            "workspace/configuration" => {
                let items = params
                    .get("items")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                Ok(Value::Array(vec![Value::Null; items]))
            }
            method => {
                tracing::debug!("Unhandled server request: {}", method);
                Err(ResponseError::method_not_found(method))
            }
        };
        self.respond(id, result);
    }

    /// Responses skip the pre-initialization queue; the server may ask
    /// things while `initialize` is still pending.
    fn respond(&self, id: RequestId, result: Result<Value, ResponseError>) {
        let response = match result {
            Ok(value) => Response::success(id, value),
            Err(error) => Response::failure(id, error),
        };
        let text = match serde_json::to_string(&response) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Could not encode response: {}", e);
                return;
            }
        };

        let link = lock(&self.link);
        let sent = link
            .connection
            .as_ref()
            .is_some_and(|connection| connection.outbound.send(Outbound::Message(text)).is_ok());
        if !sent {
            tracing::debug!("No connection to answer server request {:?}", response.id);
        }
    }
}

impl Drop for LspClient {
    fn drop(&mut self) {
        self.sweeper.abort();
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(connection) = link.connection.take() {
            connection.transport.unsubscribe(connection.subscription);
            connection.writer.abort();
        }
    }
}

/// Drains one connection's outbound channel in order
async fn write_loop(
    transport: Arc<dyn Transport>,
    mut frames: mpsc::UnboundedReceiver<Outbound>,
    pending: Arc<PendingRequestTable>,
) {
    while let Some(frame) = frames.recv().await {
        match frame {
            Outbound::Request { id, text } => {
                if !pending.mark_dispatched(id, Instant::now()) {
                    tracing::debug!("Request {} settled before it was sent", id);
                    continue;
                }
                tracing::trace!("LSP -> {}", text);
                if let Err(e) = transport.send(&text).await {
                    tracing::warn!("Send failed for request {}: {}", id, e);
                    pending.reject(id, LspError::Transport(e));
                }
            }
            Outbound::Message(text) => {
                tracing::trace!("LSP -> {}", text);
                if let Err(e) = transport.send(&text).await {
                    tracing::warn!("Send failed: {}", e);
                }
            }
            Outbound::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Hand a frame to the connection, or queue it until the handshake completes
fn enqueue(link: &mut Link, frame: Outbound) -> Result<(), LspError> {
    match link.ready() {
        Some(outbound) => outbound
            .send(frame)
            .map_err(|_| LspError::NotConnected),
        None => {
            link.queue.push_back(frame);
            Ok(())
        }
    }
}

fn send_frame(outbound: &mpsc::UnboundedSender<Outbound>, text: String) -> Result<(), LspError> {
    outbound
        .send(Outbound::Message(text))
        .map_err(|_| LspError::NotConnected)
}

fn encode_request(id: u64, method: &str, params: Option<Value>) -> Result<String, LspError> {
    Ok(serde_json::to_string(&Request::new(id, method, params))?)
}

fn encode_notification(method: &str, params: Option<Value>) -> Result<String, LspError> {
    Ok(serde_json::to_string(&Notification::new(method, params))?)
}

fn did_open_frame(doc: &OpenDocument) -> Result<String, LspError> {
    let params = DidOpenTextDocumentParams {
        text_document: TextDocumentItem {
            uri: doc.uri.clone(),
            language_id: doc.language_id.clone(),
            version: doc.version,
            text: doc.synced_text.to_string(),
        },
    };
    encode_notification("textDocument/didOpen", Some(serde_json::to_value(params)?))
}

fn full_text_change(file: &SyncedFile) -> TextDocumentContentChangeEvent {
    TextDocumentContentChangeEvent {
        range: None,
        text: file.text.to_string(),
    }
}

/// Sequential range edits, each positioned against the text left by the
/// previous one. `None` if a change does not apply.
fn incremental_changes(file: &SyncedFile) -> Option<Vec<TextDocumentContentChangeEvent>> {
    let mut text = file.previous_text.to_string();
    let mut events = Vec::with_capacity(file.changes.len());
    for change in &file.changes {
        let range = Range::new(position_at(&text, change.from), position_at(&text, change.to));
        apply_change(&mut text, change).ok()?;
        events.push(TextDocumentContentChangeEvent {
            range: Some(range),
            text: change.insert.clone(),
        });
    }
    Some(events)
}

fn log_server_message(kind: &str, params: Value) {
    let MessageParams { typ, message } = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => {
            tracing::warn!("Malformed server {}: {}", kind, e);
            return;
        }
    };
    match typ {
        MessageType::Error => tracing::error!("LSP {}: {}", kind, message),
        MessageType::Warning => tracing::warn!("LSP {}: {}", kind, message),
        MessageType::Info => tracing::info!("LSP {}: {}", kind, message),
        MessageType::Log | MessageType::Debug => tracing::debug!("LSP {}: {}", kind, message),
    }
}

fn check_method_name(method: &str, taken: bool) -> Result<(), LspError> {
    if method.trim().is_empty() {
        return Err(LspError::HandlerConflict(
            "method name must not be empty".to_string(),
        ));
    }
    if taken {
        return Err(LspError::HandlerConflict(format!(
            "a handler for {} is already registered",
            method
        )));
    }
    Ok(())
}

fn invalid_params(e: serde_json::Error) -> ResponseError {
    ResponseError::new(error_codes::INVALID_PARAMS, e.to_string())
}

fn folder_name(uri: &str) -> String {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("workspace")
        .to_string()
}

fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        general: Some(json!({ "positionEncodings": ["utf-16"] })),
        window: Some(json!({
            "workDoneProgress": true,
            "showMessage": {}
        })),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(json!({
                "dynamicRegistration": true,
                "didSave": false,
                "willSave": false,
                "willSaveWaitUntil": false
            })),
            completion: Some(json!({
                "dynamicRegistration": true,
                "completionItem": {
                    "snippetSupport": false,
                    "documentationFormat": ["markdown", "plaintext"],
                    "insertReplaceSupport": false
                },
                "contextSupport": true
            })),
            hover: Some(json!({
                "dynamicRegistration": true,
                "contentFormat": ["markdown", "plaintext"]
            })),
            signature_help: Some(json!({
                "dynamicRegistration": true,
                "signatureInformation": {
                    "documentationFormat": ["markdown", "plaintext"],
                    "parameterInformation": { "labelOffsetSupport": true },
                    "activeParameterSupport": true
                },
                "contextSupport": true
            })),
            formatting: Some(json!({ "dynamicRegistration": true })),
            range_formatting: Some(json!({ "dynamicRegistration": true })),
            rename: Some(json!({
                "dynamicRegistration": true,
                "prepareSupport": true
            })),
            publish_diagnostics: Some(json!({ "versionSupport": true })),
        }),
        workspace: Some(json!({
            "configuration": true,
            "workspaceFolders": true,
            "applyEdit": false
        })),
    }
}
