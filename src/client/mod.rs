//! The broker's authoritative view of one upstream language server.
//!
//! A `LanguageClient` owns the server connection, the shared document set,
//! the capability registry, the diagnostic cache and the response cache.
//! Bindings attach around it: they feed it per-client document trackers and
//! subscribe to its fan-out surface. All document mutation is serialized on
//! one worker task, so invariants hold without locks across suspension
//! points.

mod handlers;
mod sync;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use lsp_types::{
    ApplyWorkspaceEditParams, ApplyWorkspaceEditResponse, Diagnostic, InitializeParams,
    InitializeResult, PublishDiagnosticsParams, ShowDocumentParams, ShowDocumentResult, Url,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{RequestCache, fingerprint};
use crate::capabilities::CapabilityRegistry;
use crate::config::MutualizerOptions;
use crate::dispatch::RequestFanout;
use crate::documents::{Document, DocumentSnapshot, SaveEvent, TextDocuments, WillSaveEvent};
use crate::error::{Error, Result};
use crate::events::{DisposableCollection, Emitter};
use crate::methods;
use crate::rpc::{CloseCause, Connection};
use crate::scheduling::{Debouncer, with_timeout};

/// Why the client went away: we tore it down, or the server transport did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeReason {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Starting,
    Ready,
    Disposed,
}

pub(crate) enum SyncEvent {
    Open(DocumentSnapshot),
    Close(Url),
    Flush(oneshot::Sender<()>),
    Save(SaveEvent),
    WillSave(WillSaveEvent),
}

pub struct LanguageClient {
    options: MutualizerOptions,
    connection: Arc<Connection>,
    lifecycle: Mutex<Lifecycle>,
    start_cell: tokio::sync::OnceCell<()>,
    registry: RwLock<Option<Arc<CapabilityRegistry>>>,
    initialize_params: Mutex<Option<InitializeParams>>,
    pub(crate) documents: DashMap<Url, Document>,
    pub(crate) diagnostics: DashMap<Url, Vec<Diagnostic>>,
    pub(crate) cache: Arc<RequestCache>,
    pub(crate) trackers: Mutex<Vec<(u64, Arc<TextDocuments>)>>,
    next_tracker_id: AtomicU64,
    pub(crate) pending_changes: Mutex<HashMap<Url, DocumentSnapshot>>,
    pub(crate) sync_tx: mpsc::UnboundedSender<SyncEvent>,
    pub(crate) debouncer: Debouncer,

    pub on_dispose: Emitter<DisposeReason>,
    pub on_diagnostics: Emitter<PublishDiagnosticsParams>,
    pub on_document_open: Emitter<Url>,
    pub on_document_changed: Emitter<Url>,
    pub on_document_closed: Emitter<Url>,
    /// Fires whenever the set of watched-file registrations changes.
    pub on_watched_files_changed: Emitter<()>,

    pub code_lens_refresh: RequestFanout<(), ()>,
    pub semantic_tokens_refresh: RequestFanout<(), ()>,
    pub diagnostics_refresh: RequestFanout<(), ()>,
    pub inlay_hint_refresh: RequestFanout<(), ()>,
    pub inline_value_refresh: RequestFanout<(), ()>,
    pub apply_edit: RequestFanout<ApplyWorkspaceEditParams, Option<ApplyWorkspaceEditResponse>>,
    pub show_document: RequestFanout<ShowDocumentParams, Option<ShowDocumentResult>>,

    disposables: DisposableCollection,
}

impl LanguageClient {
    pub fn new(connection: Arc<Connection>, options: MutualizerOptions) -> Arc<Self> {
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let cache = options.build_cache();

        // The debounced flush funnels through the sync worker so edits
        // recorded just before a flush are always consumed by it.
        let debounce_tx = sync_tx.clone();
        let debouncer = Debouncer::new(
            options.change_debounce,
            Arc::new(move || {
                let tx = debounce_tx.clone();
                Box::pin(async move {
                    let (ack_tx, ack_rx) = oneshot::channel();
                    if tx.send(SyncEvent::Flush(ack_tx)).is_ok() {
                        let _ = ack_rx.await;
                    }
                }) as BoxFuture<'static, ()>
            }),
        );

        let client = Arc::new(LanguageClient {
            options,
            connection,
            lifecycle: Mutex::new(Lifecycle::Idle),
            start_cell: tokio::sync::OnceCell::new(),
            registry: RwLock::new(None),
            initialize_params: Mutex::new(None),
            documents: DashMap::new(),
            diagnostics: DashMap::new(),
            cache,
            trackers: Mutex::new(Vec::new()),
            next_tracker_id: AtomicU64::new(0),
            pending_changes: Mutex::new(HashMap::new()),
            sync_tx,
            debouncer,
            on_dispose: Emitter::new(),
            on_diagnostics: Emitter::new(),
            on_document_open: Emitter::new(),
            on_document_changed: Emitter::new(),
            on_document_closed: Emitter::new(),
            on_watched_files_changed: Emitter::new(),
            code_lens_refresh: RequestFanout::new(),
            semantic_tokens_refresh: RequestFanout::new(),
            diagnostics_refresh: RequestFanout::new(),
            inlay_hint_refresh: RequestFanout::new(),
            inline_value_refresh: RequestFanout::new(),
            apply_edit: RequestFanout::new(),
            show_document: RequestFanout::new(),
            disposables: DisposableCollection::new(),
        });

        let worker = tokio::spawn(sync::run_sync_worker(Arc::downgrade(&client), sync_rx));
        client.disposables.push_task(worker);

        let weak = Arc::downgrade(&client);
        let close_subscription = client.connection.on_close(move |cause| {
            if cause == CloseCause::Remote {
                if let Some(client) = weak.upgrade() {
                    info!("server transport closed remotely; disposing language client");
                    client.dispose_from_transport(DisposeReason::Remote);
                }
            }
        });
        client.disposables.push(close_subscription);

        client
    }

    pub fn options(&self) -> &MutualizerOptions {
        &self.options
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn registry(&self) -> Option<Arc<CapabilityRegistry>> {
        self.registry.read().clone()
    }

    pub fn is_disposed(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Disposed
    }

    pub fn is_ready(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Ready
    }

    pub(crate) fn initialize_params(&self) -> Option<InitializeParams> {
        self.initialize_params.lock().clone()
    }

    pub fn open_document_uris(&self) -> Vec<Url> {
        self.documents.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn diagnostics_for(&self, uri: &Url) -> Option<Vec<Diagnostic>> {
        self.diagnostics.get(uri).map(|entry| entry.value().clone())
    }

    /// Starts the client against the upstream server. Idempotent: the first
    /// caller's `initialize` params win and every later caller joins the same
    /// handshake. A failed start leaves the client Disposed.
    pub async fn start(self: &Arc<Self>, params: InitializeParams) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::ConnectionClosed);
        }
        let this = self.clone();
        self.start_cell
            .get_or_try_init(move || async move { this.do_start(params).await })
            .await
            .map(|_| ())
    }

    async fn do_start(self: Arc<Self>, mut params: InitializeParams) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Disposed {
                return Err(Error::ConnectionClosed);
            }
            *lifecycle = Lifecycle::Starting;
        }

        // When file events are intercepted the broker itself is the watcher,
        // whatever the first client advertised.
        if self.options.intercept_did_change_watched_file {
            let workspace = params.capabilities.workspace.get_or_insert_with(Default::default);
            let watched = workspace
                .did_change_watched_files
                .get_or_insert_with(Default::default);
            watched.dynamic_registration = Some(true);
        }
        *self.initialize_params.lock() = Some(params.clone());

        match self.handshake(params).await {
            Ok(()) => {
                let mut lifecycle = self.lifecycle.lock();
                // Disposal may have raced the handshake; do not resurrect.
                if *lifecycle == Lifecycle::Disposed {
                    return Err(Error::ConnectionClosed);
                }
                *lifecycle = Lifecycle::Ready;
                info!("language client ready");
                Ok(())
            }
            Err(e) => {
                warn!("language client start failed: {}", e);
                self.dispose_from_transport(DisposeReason::Local);
                Err(e)
            }
        }
    }

    async fn handshake(self: &Arc<Self>, params: InitializeParams) -> Result<()> {
        handlers::install(self);
        self.connection.listen();

        let params_value = serde_json::to_value(&params)
            .map_err(|e| Error::Transport(format!("unserializable initialize params: {}", e)))?;
        let result_value = self.connection.request("initialize", Some(params_value)).await?;
        let initialize_result: InitializeResult = serde_json::from_value(result_value)
            .map_err(|e| Error::Transport(format!("malformed initialize result: {}", e)))?;

        *self.registry.write() = Some(Arc::new(CapabilityRegistry::new(
            initialize_result.capabilities,
        )));

        self.connection
            .send_notification("initialized", Some(serde_json::json!({})));

        let sections = &self.options.synchronize_configuration_sections;
        if !sections.is_empty() {
            let mut settings = serde_json::Map::new();
            for section in sections {
                let value = self
                    .options
                    .get_configuration
                    .as_ref()
                    .and_then(|resolve| resolve(Some(section)))
                    .unwrap_or(Value::Null);
                settings.insert(section.clone(), value);
            }
            self.connection.send_notification(
                "workspace/didChangeConfiguration",
                Some(serde_json::json!({ "settings": Value::Object(settings) })),
            );
        }
        Ok(())
    }

    /// Graceful local teardown: `shutdown`, `exit`, transport close. Safe to
    /// call in any state, including mid-start.
    pub async fn dispose(&self) {
        if !self.begin_dispose() {
            return;
        }
        let _ = with_timeout(
            Duration::from_secs(2),
            self.connection.request("shutdown", None),
        )
        .await;
        self.connection.send_notification("exit", None);
        self.connection.close(CloseCause::Local);
        self.finish_dispose(DisposeReason::Local);
    }

    /// Synchronous disposal used from transport callbacks and failed starts.
    fn dispose_from_transport(&self, reason: DisposeReason) {
        if !self.begin_dispose() {
            return;
        }
        self.connection.close(match reason {
            DisposeReason::Local => CloseCause::Local,
            DisposeReason::Remote => CloseCause::Remote,
        });
        self.finish_dispose(reason);
    }

    fn begin_dispose(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Disposed {
            return false;
        }
        *lifecycle = Lifecycle::Disposed;
        true
    }

    fn finish_dispose(&self, reason: DisposeReason) {
        self.debouncer.clear();
        self.pending_changes.lock().clear();
        self.cache.clear();
        self.disposables.dispose();
        self.on_dispose.fire(&reason);
        debug!(?reason, "language client disposed");
    }

    /// Forces the debounced change pipeline through before anything that must
    /// observe post-flush state.
    pub async fn flush_pending(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.sync_tx.send(SyncEvent::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Proxies one client request to the server, flushing pending edits first
    /// so stale state never answers fresh questions. Idempotent requests go
    /// through the response cache; the out-of-band cancellation token is
    /// linked to `$/cancelRequest` upstream.
    pub async fn forward_request(
        &self,
        method: &str,
        params: Option<Value>,
        token: CancellationToken,
    ) -> Result<Value> {
        self.flush_pending().await;
        if self.is_disposed() {
            return Err(Error::ConnectionClosed);
        }

        if methods::is_cacheable(method) {
            let fp = fingerprint(method, params.as_ref());
            let connection = self.connection.clone();
            let method = method.to_string();
            let shared = self.cache.get_or_insert_with(fp, move || {
                issue_request(connection, method, params, token)
            });
            shared.await
        } else {
            issue_request(self.connection.clone(), method.to_string(), params, token).await
        }
    }
}

/// Sends one upstream request, relaying a cancellation of `token` as
/// `$/cancelRequest`. The future still resolves with whatever the server
/// answers (usually `RequestCancelled`).
fn issue_request(
    connection: Arc<Connection>,
    method: String,
    params: Option<Value>,
    token: CancellationToken,
) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        let pending = connection.send_request(&method, params);
        let id = pending.id;
        let response = pending.response();
        tokio::pin!(response);
        tokio::select! {
            result = &mut response => result,
            _ = token.cancelled() => {
                connection.cancel(id);
                response.await
            }
        }
    })
}
