//! One attached client: handshake, forwarding, gating, disposal.
//!
//! `bind_language_client` drives a client connection from its `initialize`
//! request to the end of its life and resolves with who ended it. Everything
//! the binding opens — tracker subscriptions, fan-out handlers, the client
//! connection itself — is released through one disposable collection, so a
//! client can come and go without leaking anything into the shared
//! `LanguageClient`.

use std::sync::Arc;

use futures::future::BoxFuture;
use lsp_types::{
    ApplyWorkspaceEditParams, ApplyWorkspaceEditResponse, DidChangeTextDocumentParams,
    DidChangeWatchedFilesParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, DocumentChangeOperation, DocumentChanges, InitializeParams,
    Registration, ShowDocumentResult, Url, WillSaveTextDocumentParams,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::client::LanguageClient;
use crate::documents::TextDocuments;
use crate::error::{Error, ResponseError, Result, codes};
use crate::events::DisposableCollection;
use crate::methods;
use crate::rpc::{CloseCause, Connection};
use crate::scheduling::with_timeout;

/// Who ended a binding's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCause {
    /// The client transport closed; other clients and the server continue.
    Client,
    /// The shared language client was disposed underneath us.
    Server,
}

/// Sync methods the broker performs itself; never replayed to clients as
/// dynamic registrations.
const BROKER_OWNED_REGISTRATIONS: &[&str] = &[
    "textDocument/didOpen",
    "textDocument/didClose",
    "textDocument/didChange",
    "workspace/didChangeWorkspaceFolders",
];

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| Error::Transport(format!("invalid params: {}", e)))
}

fn parse_params_or_log<T: DeserializeOwned>(method: &str, params: Option<Value>) -> Option<T> {
    match parse_params(params) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("dropping malformed {}: {}", method, e);
            None
        }
    }
}

/// Attaches one client connection to the shared language client and blocks
/// until either side goes away.
pub async fn bind_language_client(
    client: Arc<LanguageClient>,
    connection: Arc<Connection>,
) -> Result<EndCause> {
    if client.is_disposed() {
        return Err(Error::ConnectionClosed);
    }

    let disposables = DisposableCollection::new();
    let tracker = Arc::new(TextDocuments::new());

    // The shared document set follows this tracker from now on; detaching it
    // on disposal closes whatever only this client still had open.
    disposables.push(client.synchronize(tracker.clone()));

    // Cached diagnostics reach a late joiner the moment it opens the URI.
    {
        let client = client.clone();
        let connection = connection.clone();
        disposables.push(tracker.on_did_open.subscribe(move |snapshot| {
            if let Some(diagnostics) = client.diagnostics_for(&snapshot.uri) {
                trace!("serving cached diagnostics for {}", snapshot.uri);
                connection.send_notification(
                    "textDocument/publishDiagnostics",
                    Some(serde_json::json!({
                        "uri": snapshot.uri,
                        "diagnostics": diagnostics,
                    })),
                );
            }
        }));
    }

    let (init_tx, init_rx) = oneshot::channel::<Result<Value>>();
    install_handshake_handlers(&client, &connection, init_tx);
    let initialized_rx = install_lifecycle_handlers(&connection);
    install_text_sync_handlers(&client, &connection, &tracker, &disposables);
    install_forwarded_handlers(&client, &connection, &disposables);
    install_fallback_handler(&client, &connection);

    connection.listen();

    let timeout = client.options().client_initialization_timeout;

    // The initialize handler itself starts (or joins) the language client and
    // answers with the transformed capabilities; here we only wait for it,
    // bounded by the handshake deadline.
    let raw_initialize = match with_timeout(timeout, async {
        tokio::select! {
            raw = init_rx => raw.unwrap_or(Err(Error::ConnectionClosed)),
            _ = connection.closed() => Err(Error::ConnectionClosed),
        }
    })
    .await
    {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) | Err(e) => {
            disposables.dispose();
            connection.close(CloseCause::Local);
            return Err(e);
        }
    };

    match with_timeout(timeout, async {
        tokio::select! {
            received = initialized_rx => received.map_err(|_| Error::ConnectionClosed),
            _ = connection.closed() => Err(Error::ConnectionClosed),
        }
    })
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) | Err(e) => {
            disposables.dispose();
            connection.close(CloseCause::Local);
            return Err(e);
        }
    }

    replay_registrations(&client, &connection).await;
    subscribe_registration_stream(&client, &connection, &disposables);
    subscribe_diagnostics(&client, &connection, &tracker, &disposables);
    subscribe_refreshes(&client, &connection, &raw_initialize, &disposables);
    subscribe_apply_edit(&client, &connection, &tracker, &disposables);
    subscribe_show_document(&client, &connection, &disposables);

    // Attached. Block until one side ends it.
    let (server_end_tx, server_end_rx) = oneshot::channel::<()>();
    {
        let tx = parking_lot::Mutex::new(Some(server_end_tx));
        disposables.push(client.on_dispose.subscribe(move |_reason| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(());
            }
        }));
    }

    let cause = if client.is_disposed() {
        EndCause::Server
    } else {
        tokio::select! {
            _ = connection.closed() => EndCause::Client,
            _ = server_end_rx => EndCause::Server,
        }
    };

    info!(peer = %connection.peer(), ?cause, "binding ended");
    disposables.dispose();
    connection.close(CloseCause::Local);
    Ok(cause)
}

fn install_handshake_handlers(
    client: &Arc<LanguageClient>,
    connection: &Arc<Connection>,
    init_tx: oneshot::Sender<Result<Value>>,
) {
    let client = client.clone();
    let init_tx = parking_lot::Mutex::new(Some(init_tx));
    connection.on_request("initialize", move |params, _token| {
        let client = client.clone();
        let raw = params.clone().unwrap_or(Value::Null);
        let mut init_tx = init_tx.lock().take();
        Box::pin(async move {
            let parsed: InitializeParams =
                parse_params(params).map_err(|e| e.into_response_error())?;
            if let Err(e) = client.start(parsed).await {
                // Unblock the waiting binding with the real failure instead
                // of letting it run into the handshake deadline.
                if let Some(init_tx) = init_tx.take() {
                    let _ = init_tx.send(Err(e.clone()));
                }
                return Err(e.into_response_error());
            }

            let Some(registry) = client.registry() else {
                return Err(ResponseError::new(
                    codes::SERVER_NOT_INITIALIZED,
                    "language client has no capabilities",
                ));
            };
            let capabilities =
                registry.transformed_capabilities(client.options().disable_save_notifications);

            // Unblock the binding task only once the start succeeded.
            if let Some(init_tx) = init_tx.take() {
                let _ = init_tx.send(Ok(raw));
            }

            Ok(serde_json::json!({
                "capabilities": capabilities,
                "serverInfo": { "name": client.options().server_name },
            }))
        })
    });
}

fn install_lifecycle_handlers(connection: &Arc<Connection>) -> oneshot::Receiver<()> {
    let (initialized_tx, initialized_rx) = oneshot::channel::<()>();
    let initialized_tx = parking_lot::Mutex::new(Some(initialized_tx));
    connection.on_notification("initialized", move |_params| {
        if let Some(tx) = initialized_tx.lock().take() {
            let _ = tx.send(());
        }
    });

    // Shutdown/exit end only this client; the server link belongs to the
    // broker and follows its own lifecycle.
    connection.on_request("shutdown", |_params, _token| {
        Box::pin(async { Ok(Value::Null) })
    });
    {
        // Weak: the handler lives inside the connection it closes.
        let weak = Arc::downgrade(connection);
        connection.on_notification("exit", move |_params| {
            if let Some(connection) = weak.upgrade() {
                connection.close(CloseCause::Remote);
            }
        });
    }

    initialized_rx
}

fn install_text_sync_handlers(
    client: &Arc<LanguageClient>,
    connection: &Arc<Connection>,
    tracker: &Arc<TextDocuments>,
    disposables: &DisposableCollection,
) {
    let t = tracker.clone();
    disposables.push(connection.on_notification("textDocument/didOpen", move |params| {
        if let Some(params) = parse_params_or_log::<DidOpenTextDocumentParams>("didOpen", params) {
            t.handle_did_open(params);
        }
    }));

    let t = tracker.clone();
    disposables.push(connection.on_notification("textDocument/didChange", move |params| {
        if let Some(params) = parse_params_or_log::<DidChangeTextDocumentParams>("didChange", params)
        {
            t.handle_did_change(params);
        }
    }));

    let t = tracker.clone();
    disposables.push(connection.on_notification("textDocument/didClose", move |params| {
        if let Some(params) = parse_params_or_log::<DidCloseTextDocumentParams>("didClose", params) {
            t.handle_did_close(params);
        }
    }));

    let t = tracker.clone();
    disposables.push(connection.on_notification("textDocument/didSave", move |params| {
        if let Some(params) = parse_params_or_log::<DidSaveTextDocumentParams>("didSave", params) {
            t.handle_did_save(params);
        }
    }));

    let t = tracker.clone();
    disposables.push(connection.on_notification("textDocument/willSave", move |params| {
        if let Some(params) = parse_params_or_log::<WillSaveTextDocumentParams>("willSave", params) {
            t.handle_will_save(params);
        }
    }));

    // A request, not a notification: the client expects edits back.
    let c = client.clone();
    disposables.push(
        connection.on_request("textDocument/willSaveWaitUntil", move |params, _token| {
            let c = c.clone();
            Box::pin(async move {
                let raw = params.clone().unwrap_or(Value::Null);
                let parsed: WillSaveTextDocumentParams =
                    parse_params(params).map_err(|e| e.into_response_error())?;
                c.will_save_wait_until(raw, &parsed.text_document.uri)
                    .await
                    .map_err(|e| e.into_response_error())
            })
        }),
    );

    // Per-client configuration cannot be reconciled across N clients.
    disposables.push(
        connection.on_notification("workspace/didChangeConfiguration", |_params| {
            debug!("swallowing client didChangeConfiguration");
        }),
    );

    let c = client.clone();
    disposables.push(
        connection.on_notification("workspace/didChangeWatchedFiles", move |params| {
            if let Some(params) =
                parse_params_or_log::<DidChangeWatchedFilesParams>("didChangeWatchedFiles", params)
            {
                c.notify_file_changes(params.changes);
            }
        }),
    );
}

fn install_forwarded_handlers(
    client: &Arc<LanguageClient>,
    connection: &Arc<Connection>,
    disposables: &DisposableCollection,
) {
    for method in methods::FORWARDED_REQUESTS {
        let c = client.clone();
        disposables.push(connection.on_request(method, move |params, token| {
            let c = c.clone();
            Box::pin(async move {
                c.forward_request(method, params, token)
                    .await
                    .map_err(|e| e.into_response_error())
            }) as BoxFuture<'static, std::result::Result<Value, ResponseError>>
        }));
    }
}

fn install_fallback_handler(client: &Arc<LanguageClient>, connection: &Arc<Connection>) {
    let handler = client.options().unknown_client_request_handler.clone();
    let prefixes = client.options().forward_unknown_prefixes.clone();
    let c = client.clone();
    connection.set_fallback_request_handler(Arc::new(move |method, params, token| {
        let handler = handler.clone();
        let prefixes = prefixes.clone();
        let c = c.clone();
        Box::pin(async move {
            if let Some(handler) = handler {
                return handler(method, params, token).await;
            }
            if prefixes.iter().any(|prefix| method.starts_with(prefix)) {
                return c
                    .forward_request(&method, params, token)
                    .await
                    .map_err(|e| e.into_response_error());
            }
            Err(ResponseError::method_not_found(&method))
        })
    }));
}

/// Replays currently-held dynamic registrations, minus the sync
/// methods the broker owns and, when file events are intercepted, the
/// watched-files registrations the client will never serve.
async fn replay_registrations(client: &Arc<LanguageClient>, connection: &Arc<Connection>) {
    let Some(registry) = client.registry() else { return };
    let intercept_watched = client.options().intercept_did_change_watched_file;
    let replay: Vec<Registration> = registry
        .registrations()
        .into_iter()
        .filter(|r| retain_for_client(r, intercept_watched))
        .collect();
    if replay.is_empty() {
        return;
    }
    let request = connection.request(
        "client/registerCapability",
        Some(serde_json::json!({ "registrations": replay })),
    );
    match with_timeout(std::time::Duration::from_secs(10), request).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) | Err(e) => {
            warn!(peer = %connection.peer(), "registration replay failed: {}", e);
        }
    }
}

fn retain_for_client(registration: &Registration, intercept_watched: bool) -> bool {
    if BROKER_OWNED_REGISTRATIONS.contains(&registration.method.as_str()) {
        return false;
    }
    if intercept_watched && registration.method == crate::capabilities::DID_CHANGE_WATCHED_FILES_METHOD
    {
        return false;
    }
    true
}

/// Registrations arriving after attach flow through the registry's change
/// events and reach every live client, same filter as the replay.
fn subscribe_registration_stream(
    client: &Arc<LanguageClient>,
    connection: &Arc<Connection>,
    disposables: &DisposableCollection,
) {
    let Some(registry) = client.registry() else { return };
    let intercept_watched = client.options().intercept_did_change_watched_file;

    let conn = connection.clone();
    disposables.push(registry.on_registration.subscribe(move |added| {
        let replay: Vec<Registration> = added
            .iter()
            .filter(|r| retain_for_client(r, intercept_watched))
            .cloned()
            .collect();
        if replay.is_empty() {
            return;
        }
        let conn = conn.clone();
        tokio::spawn(async move {
            let _ = conn
                .request(
                    "client/registerCapability",
                    Some(serde_json::json!({ "registrations": replay })),
                )
                .await;
        });
    }));

    let conn = connection.clone();
    disposables.push(registry.on_unregistration.subscribe(move |removed| {
        let replay: Vec<_> = removed
            .iter()
            .filter(|r| !BROKER_OWNED_REGISTRATIONS.contains(&r.method.as_str()))
            .cloned()
            .collect();
        if replay.is_empty() {
            return;
        }
        let conn = conn.clone();
        tokio::spawn(async move {
            let _ = conn
                .request(
                    "client/unregisterCapability",
                    Some(serde_json::json!({ "unregisterations": replay })),
                )
                .await;
        });
    }));
}

/// Diagnostics are forwarded only while the URI is open in this client.
fn subscribe_diagnostics(
    client: &Arc<LanguageClient>,
    connection: &Arc<Connection>,
    tracker: &Arc<TextDocuments>,
    disposables: &DisposableCollection,
) {
    let tracker = tracker.clone();
    let conn = connection.clone();
    disposables.push(client.on_diagnostics.subscribe(move |params| {
        if !tracker.contains(&params.uri) {
            return;
        }
        match serde_json::to_value(params) {
            Ok(value) => conn.send_notification("textDocument/publishDiagnostics", Some(value)),
            Err(e) => warn!("unserializable diagnostics for {}: {}", params.uri, e),
        }
    }));
}

fn refresh_supported(raw_initialize: &Value, section: &str) -> bool {
    raw_initialize
        .pointer(&format!("/capabilities/workspace/{}/refreshSupport", section))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Server-initiated refresh requests reach a client iff it advertised the
/// matching `refreshSupport` during its handshake.
fn subscribe_refreshes(
    client: &Arc<LanguageClient>,
    connection: &Arc<Connection>,
    raw_initialize: &Value,
    disposables: &DisposableCollection,
) {
    let refreshes = [
        ("codeLens", "workspace/codeLens/refresh", &client.code_lens_refresh),
        (
            "semanticTokens",
            "workspace/semanticTokens/refresh",
            &client.semantic_tokens_refresh,
        ),
        (
            "diagnostics",
            "workspace/diagnostic/refresh",
            &client.diagnostics_refresh,
        ),
        ("inlayHint", "workspace/inlayHint/refresh", &client.inlay_hint_refresh),
        (
            "inlineValue",
            "workspace/inlineValue/refresh",
            &client.inline_value_refresh,
        ),
    ];
    for (section, method, fanout) in refreshes {
        if !refresh_supported(raw_initialize, section) {
            continue;
        }
        let conn = connection.clone();
        disposables.push(fanout.on_request(move |_params, _token| {
            let conn = conn.clone();
            Box::pin(async move { conn.request(method, None).await.map(|_| ()) })
        }));
    }
}

/// ApplyEdit: filter to this client's open documents, rewrite versions to the
/// client's view, forward. The binding claims ownership of the edit (returns
/// an answer to the merger) only when something survived the filter.
fn subscribe_apply_edit(
    client: &Arc<LanguageClient>,
    connection: &Arc<Connection>,
    tracker: &Arc<TextDocuments>,
    disposables: &DisposableCollection,
) {
    let tracker = tracker.clone();
    let conn = connection.clone();
    disposables.push(client.apply_edit.on_request(move |params, _token| {
        let tracker = tracker.clone();
        let conn = conn.clone();
        Box::pin(async move {
            let (filtered, claims) = filter_workspace_edit(params, &tracker);
            // A misbehaving client must not poison the edit for the others;
            // it merely fails to claim it.
            let forward = async {
                let value = serde_json::to_value(filtered)
                    .map_err(|e| Error::Transport(format!("unserializable edit: {}", e)))?;
                let response = conn.request("workspace/applyEdit", Some(value)).await?;
                serde_json::from_value::<ApplyWorkspaceEditResponse>(response)
                    .map_err(|e| Error::Transport(format!("malformed applyEdit response: {}", e)))
            };
            match forward.await {
                Ok(response) => Ok(claims.then_some(response)),
                Err(e) => {
                    warn!(peer = %conn.peer(), "applyEdit forwarding failed: {}", e);
                    Ok(None)
                }
            }
        })
    }));
}

fn subscribe_show_document(
    client: &Arc<LanguageClient>,
    connection: &Arc<Connection>,
    disposables: &DisposableCollection,
) {
    let conn = connection.clone();
    disposables.push(client.show_document.on_request(move |params, _token| {
        let conn = conn.clone();
        Box::pin(async move {
            let value = serde_json::to_value(params)
                .map_err(|e| Error::Transport(format!("unserializable params: {}", e)))?;
            let response = conn.request("window/showDocument", Some(value)).await?;
            let response: ShowDocumentResult = serde_json::from_value(response)
                .map_err(|e| Error::Transport(format!("malformed showDocument response: {}", e)))?;
            Ok(Some(response))
        })
    }));
}

/// Restricts a workspace edit to documents open in `tracker` and stamps each
/// surviving document edit with the version this client holds. Returns the
/// filtered params and whether any document edit survived.
///
/// The client's version is knowingly used instead of the server's; see the
/// applyEdit note in DESIGN.md.
fn filter_workspace_edit(
    mut params: ApplyWorkspaceEditParams,
    tracker: &TextDocuments,
) -> (ApplyWorkspaceEditParams, bool) {
    let mut survived = false;
    let open = |uri: &Url| tracker.contains(uri);

    if let Some(changes) = params.edit.changes.as_mut() {
        changes.retain(|uri, _| open(uri));
        survived |= !changes.is_empty();
    }

    match params.edit.document_changes.take() {
        None => {}
        Some(DocumentChanges::Edits(edits)) => {
            let kept: Vec<_> = edits
                .into_iter()
                .filter(|edit| open(&edit.text_document.uri))
                .map(|mut edit| {
                    edit.text_document.version = tracker.version_of(&edit.text_document.uri);
                    edit
                })
                .collect();
            survived |= !kept.is_empty();
            params.edit.document_changes = Some(DocumentChanges::Edits(kept));
        }
        Some(DocumentChanges::Operations(operations)) => {
            let mut kept = Vec::new();
            let mut kept_edit = false;
            for operation in operations {
                match operation {
                    DocumentChangeOperation::Edit(mut edit) => {
                        if open(&edit.text_document.uri) {
                            edit.text_document.version =
                                tracker.version_of(&edit.text_document.uri);
                            kept_edit = true;
                            kept.push(DocumentChangeOperation::Edit(edit));
                        }
                    }
                    // Resource operations only travel with a binding that
                    // also owns at least one document edit of this batch.
                    other => kept.push(other),
                }
            }
            if !kept_edit {
                kept.retain(|operation| matches!(operation, DocumentChangeOperation::Edit(_)));
            }
            survived |= kept_edit;
            params.edit.document_changes = Some(DocumentChanges::Operations(kept));
        }
    }

    (params, survived)
}
