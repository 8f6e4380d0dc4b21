//! Handlers installed on the server connection during `start`, before the
//! connection begins reading. One table, mirroring what the server may send
//! a conforming client; anything else is answered with MethodNotFound by the
//! connection itself.

use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use lsp_types::{
    ApplyWorkspaceEditParams, ApplyWorkspaceEditResponse, ConfigurationParams, LogMessageParams,
    MessageType, PublishDiagnosticsParams, RegistrationParams, ShowDocumentParams,
    ShowDocumentResult, ShowMessageParams, UnregistrationParams,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::capabilities::DID_CHANGE_WATCHED_FILES_METHOD;
use crate::dispatch::RequestFanout;
use crate::error::{ResponseError, codes};

use super::LanguageClient;

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ResponseError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| ResponseError::new(codes::INVALID_PARAMS, format!("invalid params: {}", e)))
}

fn gone() -> ResponseError {
    ResponseError::new(codes::REQUEST_CANCELLED, "language client disposed")
}

pub(super) fn install(client: &Arc<LanguageClient>) {
    let connection = client.connection().clone();

    // Dynamic capability registration: delegate to the registry, then
    // replay didOpen for late registrations.
    let weak = Arc::downgrade(client);
    connection.on_request("client/registerCapability", move |params, _token| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(client) = weak.upgrade() else { return Err(gone()) };
            let params: RegistrationParams = parse_params(params)?;
            let Some(registry) = client.registry() else {
                return Err(ResponseError::new(
                    codes::SERVER_NOT_INITIALIZED,
                    "registration before initialize completed",
                ));
            };
            let added = registry.handle_registration(params);
            client.replay_did_open(&added);
            if added.iter().any(|r| r.method == DID_CHANGE_WATCHED_FILES_METHOD) {
                client.on_watched_files_changed.fire(&());
            }
            Ok(Value::Null)
        })
    });

    let weak = Arc::downgrade(client);
    connection.on_request("client/unregisterCapability", move |params, _token| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(client) = weak.upgrade() else { return Err(gone()) };
            let params: UnregistrationParams = parse_params(params)?;
            let Some(registry) = client.registry() else {
                return Err(ResponseError::new(
                    codes::SERVER_NOT_INITIALIZED,
                    "unregistration before initialize completed",
                ));
            };
            let removed = registry.handle_unregistration(params);
            if removed.iter().any(|r| r.method == DID_CHANGE_WATCHED_FILES_METHOD) {
                client.on_watched_files_changed.fire(&());
            }
            Ok(Value::Null)
        })
    });

    // Configuration requests collapse every scope onto the injected resolver.
    let weak = Arc::downgrade(client);
    connection.on_request("workspace/configuration", move |params, _token| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(client) = weak.upgrade() else { return Err(gone()) };
            let params: ConfigurationParams = parse_params(params)?;
            let results: Vec<Value> = params
                .items
                .iter()
                .map(|item| {
                    client
                        .options()
                        .get_configuration
                        .as_ref()
                        .and_then(|resolve| resolve(item.section.as_deref()))
                        .unwrap_or(Value::Null)
                })
                .collect();
            Ok(Value::Array(results))
        })
    });

    install_refresh(client, "workspace/codeLens/refresh", |c| &c.code_lens_refresh);
    install_refresh(client, "workspace/semanticTokens/refresh", |c| {
        &c.semantic_tokens_refresh
    });
    install_refresh(client, "workspace/diagnostic/refresh", |c| &c.diagnostics_refresh);
    install_refresh(client, "workspace/inlayHint/refresh", |c| &c.inlay_hint_refresh);
    install_refresh(client, "workspace/inlineValue/refresh", |c| &c.inline_value_refresh);

    // Exactly one binding should own a workspace edit; the merger answers
    // `applied: false` when zero or several claim it.
    let weak = Arc::downgrade(client);
    connection.on_request("workspace/applyEdit", move |params, token| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(client) = weak.upgrade() else { return Err(gone()) };
            let params: ApplyWorkspaceEditParams = parse_params(params)?;
            let response = client
                .apply_edit
                .single(
                    params,
                    token,
                    Some(ApplyWorkspaceEditResponse {
                        applied: false,
                        failure_reason: None,
                        failed_change: None,
                    }),
                )
                .await
                .map_err(|e| e.into_response_error())?;
            serde_json::to_value(response)
                .map_err(|e| ResponseError::internal(format!("unserializable response: {}", e)))
        })
    });

    // Show-document goes to every client; the first one that actually showed
    // it wins, and with nobody listening the server learns it failed.
    let weak = Arc::downgrade(client);
    connection.on_request("window/showDocument", move |params, token| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(client) = weak.upgrade() else { return Err(gone()) };
            let params: ShowDocumentParams = parse_params(params)?;
            let answers = client.show_document.invoke(params, token).await;
            let mut first: Option<ShowDocumentResult> = None;
            for answer in answers.into_iter().flatten().flatten() {
                if answer.success {
                    first = Some(answer);
                    break;
                }
                first.get_or_insert(answer);
            }
            let result = first.unwrap_or(ShowDocumentResult { success: false });
            serde_json::to_value(result)
                .map_err(|e| ResponseError::internal(format!("unserializable response: {}", e)))
        })
    });

    connection.on_request("window/showMessageRequest", move |params, _token| {
        Box::pin(async move {
            warn!(
                "server asked for user interaction the broker cannot provide: {:?}",
                params
            );
            Ok(Value::Null)
        })
    });

    connection.on_request("window/workDoneProgress/create", move |_params, _token| {
        Box::pin(async move { Ok(Value::Null) })
    });

    // Server-initiated execute-command makes no sense through a broker.
    connection.on_request("workspace/executeCommand", move |params, _token| {
        Box::pin(async move {
            info!("ignoring server-initiated executeCommand: {:?}", params);
            Ok(Value::Null)
        })
    });

    let weak = Arc::downgrade(client);
    connection.on_request("workspace/workspaceFolders", move |_params, _token| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(client) = weak.upgrade() else { return Err(gone()) };
            let folders = client
                .initialize_params()
                .and_then(|params| params.workspace_folders);
            serde_json::to_value(folders)
                .map_err(|e| ResponseError::internal(format!("unserializable response: {}", e)))
        })
    });

    // Diagnostics are cached per open URI so late-joining clients receive
    // the current squiggles on open.
    let weak = Arc::downgrade(client);
    connection.on_notification("textDocument/publishDiagnostics", move |params| {
        let Some(client) = weak.upgrade() else { return };
        let params: PublishDiagnosticsParams = match parse_params(params) {
            Ok(params) => params,
            Err(e) => {
                warn!("malformed publishDiagnostics: {}", e);
                return;
            }
        };
        if client.documents.contains_key(&params.uri) {
            client
                .diagnostics
                .insert(params.uri.clone(), params.diagnostics.clone());
        }
        client.on_diagnostics.fire(&params);
    });

    connection.on_notification("window/logMessage", |params| {
        if let Ok(params) = parse_params::<LogMessageParams>(params) {
            log_message("server log", params.typ, &params.message);
        }
    });

    connection.on_notification("window/showMessage", |params| {
        if let Ok(params) = parse_params::<ShowMessageParams>(params) {
            log_message("server message", params.typ, &params.message);
        }
    });

    connection.on_notification("telemetry/event", |params| {
        debug!("server telemetry: {:?}", params);
    });

    if let Some(hook) = client.options().unhandled_notification_handler.clone() {
        connection.set_unhandled_notification_handler(Arc::new(move |method, params| {
            hook(method, params);
        }));
    } else {
        connection.set_unhandled_notification_handler(Arc::new(|method, params| {
            trace!("dropping unhandled server notification {}: {:?}", method, params);
        }));
    }
}

fn install_refresh(
    client: &Arc<LanguageClient>,
    method: &'static str,
    fanout: impl Fn(&LanguageClient) -> &RequestFanout<(), ()> + Send + Sync + 'static,
) {
    let weak: Weak<LanguageClient> = Arc::downgrade(client);
    client.connection().on_request(method, move |_params, token| {
        let weak = weak.clone();
        let fanout = fanout_ref(&weak, &fanout);
        Box::pin(async move {
            let Some(fanout) = fanout else { return Err(gone()) };
            fanout
                .all_void((), token)
                .await
                .map(|_| Value::Null)
                .map_err(|e| e.into_response_error())
        }) as BoxFuture<'static, Result<Value, ResponseError>>
    });
}

fn fanout_ref(
    weak: &Weak<LanguageClient>,
    accessor: &(impl Fn(&LanguageClient) -> &RequestFanout<(), ()> + Send + Sync),
) -> Option<RequestFanout<(), ()>> {
    weak.upgrade().map(|client| accessor(&client).clone())
}

fn log_message(context: &str, typ: MessageType, message: &str) {
    match typ {
        MessageType::ERROR => error!("{}: {}", context, message),
        MessageType::WARNING => warn!("{}: {}", context, message),
        MessageType::INFO => info!("{}: {}", context, message),
        _ => debug!("{}: {}", context, message),
    }
}
