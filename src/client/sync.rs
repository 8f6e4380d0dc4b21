//! Document synchronization between per-client trackers and the server.
//!
//! One worker task serializes every mutation of the shared document set, so
//! the per-URI ordering guarantees (`didOpen → didChange* → didSave? →
//! didClose`, strictly monotonic versions) fall out of queue order. Edits
//! are recorded synchronously in the notification dispatch and consumed by
//! the debounced flush, which also runs on the worker.

use std::sync::{Arc, Weak};

use lsp_types::{
    FileEvent, Registration, TextDocumentIdentifier, TextDocumentSyncKind, Url,
    VersionedTextDocumentIdentifier,
};
use ropey::Rope;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::capabilities::{SyncNotification, selector_matches};
use crate::diff::{full_replace, lsp_diff};
use crate::documents::{Document, DocumentSnapshot, SaveEvent, TextDocuments, WillSaveEvent};
use crate::error::{Error, Result};
use crate::events::Disposable;

use super::{LanguageClient, SyncEvent};

pub(crate) async fn run_sync_worker(
    client: Weak<LanguageClient>,
    mut rx: mpsc::UnboundedReceiver<SyncEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(client) = client.upgrade() else { break };
        match event {
            SyncEvent::Open(snapshot) => client.process_open(snapshot),
            SyncEvent::Close(uri) => client.process_close(uri),
            SyncEvent::Flush(ack) => {
                client.process_flush();
                let _ = ack.send(());
            }
            SyncEvent::Save(save) => client.process_save(save),
            SyncEvent::WillSave(will_save) => client.process_will_save(will_save),
        }
    }
    trace!("document sync worker terminated");
}

impl LanguageClient {
    /// Attaches a per-client document tracker. Every open/close/change/save
    /// event feeds the shared document set; the returned disposable detaches
    /// the tracker and closes whatever documents only it still referenced.
    pub fn synchronize(self: &Arc<Self>, tracker: Arc<TextDocuments>) -> Disposable {
        let id = self
            .next_tracker_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.trackers.lock().push((id, tracker.clone()));

        let mut subscriptions = Vec::new();

        let weak = Arc::downgrade(self);
        subscriptions.push(tracker.on_did_open.subscribe(move |snapshot| {
            if let Some(client) = weak.upgrade() {
                let _ = client.sync_tx.send(SyncEvent::Open(snapshot.clone()));
            }
        }));

        let weak = Arc::downgrade(self);
        subscriptions.push(tracker.on_did_change_content.subscribe(move |snapshot| {
            if let Some(client) = weak.upgrade() {
                client
                    .pending_changes
                    .lock()
                    .insert(snapshot.uri.clone(), snapshot.clone());
                client.debouncer.trigger();
            }
        }));

        let weak = Arc::downgrade(self);
        subscriptions.push(tracker.on_did_close.subscribe(move |uri| {
            if let Some(client) = weak.upgrade() {
                let _ = client.sync_tx.send(SyncEvent::Close(uri.clone()));
            }
        }));

        let weak = Arc::downgrade(self);
        subscriptions.push(tracker.on_did_save.subscribe(move |save| {
            if let Some(client) = weak.upgrade() {
                let _ = client.sync_tx.send(SyncEvent::Save(save.clone()));
            }
        }));

        let weak = Arc::downgrade(self);
        subscriptions.push(tracker.on_will_save.subscribe(move |will_save| {
            if let Some(client) = weak.upgrade() {
                let _ = client.sync_tx.send(SyncEvent::WillSave(will_save.clone()));
            }
        }));

        // Documents the tracker already held when it attached.
        for snapshot in tracker.all() {
            let _ = self.sync_tx.send(SyncEvent::Open(snapshot));
        }

        let weak = Arc::downgrade(self);
        Disposable::new(move || {
            for subscription in subscriptions {
                subscription.dispose();
            }
            if let Some(client) = weak.upgrade() {
                client.trackers.lock().retain(|(t_id, _)| *t_id != id);
                for snapshot in tracker.all() {
                    let _ = client.sync_tx.send(SyncEvent::Close(snapshot.uri));
                }
            }
        })
    }

    fn is_referenced_by_any_tracker(&self, uri: &Url) -> bool {
        self.trackers
            .lock()
            .iter()
            .any(|(_, tracker)| tracker.contains(uri))
    }

    fn notification_options(
        &self,
        notification: SyncNotification,
        uri: &Url,
        language_id: &str,
    ) -> Option<crate::capabilities::NotificationOptions> {
        self.registry()
            .and_then(|registry| {
                registry.text_document_notification_options(notification, uri, language_id)
            })
    }

    fn process_open(&self, snapshot: DocumentSnapshot) {
        if self.is_disposed() || self.documents.contains_key(&snapshot.uri) {
            return;
        }
        let document = Document {
            uri: snapshot.uri.clone(),
            language_id: snapshot.language_id.clone(),
            version: 1,
            text: Rope::from_str(&snapshot.text),
        };
        self.documents.insert(snapshot.uri.clone(), document);

        if self
            .notification_options(SyncNotification::DidOpen, &snapshot.uri, &snapshot.language_id)
            .is_some()
        {
            self.connection.send_notification(
                "textDocument/didOpen",
                Some(json!({
                    "textDocument": {
                        "uri": snapshot.uri,
                        "languageId": snapshot.language_id,
                        "version": 1,
                        "text": snapshot.text,
                    }
                })),
            );
        }

        self.cache.clear();
        self.on_document_open.fire(&snapshot.uri);
        debug!("opened {}", snapshot.uri);
    }

    fn process_close(&self, uri: Url) {
        if self.is_disposed() || self.is_referenced_by_any_tracker(&uri) {
            return;
        }
        self.pending_changes.lock().remove(&uri);
        let Some((_, document)) = self.documents.remove(&uri) else {
            return;
        };

        if self
            .notification_options(SyncNotification::DidClose, &uri, &document.language_id)
            .is_some()
        {
            self.connection.send_notification(
                "textDocument/didClose",
                Some(json!({
                    "textDocument": TextDocumentIdentifier { uri: uri.clone() }
                })),
            );
        }

        self.diagnostics.remove(&uri);
        self.cache.clear();
        self.on_document_closed.fire(&uri);
        debug!("closed {}", uri);
    }

    fn process_flush(&self) {
        if self.is_disposed() {
            return;
        }
        let pending = std::mem::take(&mut *self.pending_changes.lock());
        for (uri, snapshot) in pending {
            self.flush_one(uri, snapshot);
        }
    }

    fn flush_one(&self, uri: Url, snapshot: DocumentSnapshot) {
        let (old_text, language_id, new_version) = {
            let Some(mut document) = self.documents.get_mut(&uri) else {
                trace!("dropping pending change for unopened {}", uri);
                return;
            };
            if document.text == snapshot.text.as_str() {
                return;
            }
            let old_text = document.text.to_string();
            document.text = Rope::from_str(&snapshot.text);
            document.version += 1;
            (old_text, document.language_id.clone(), document.version)
        };

        let sync_kind = self
            .notification_options(SyncNotification::DidChange, &uri, &language_id)
            .map(|options| options.sync_kind)
            .unwrap_or(TextDocumentSyncKind::NONE);

        if sync_kind != TextDocumentSyncKind::NONE {
            let changes = if sync_kind == TextDocumentSyncKind::INCREMENTAL {
                match lsp_diff(&old_text, &snapshot.text, self.options().diff_budget) {
                    Ok(changes) => changes,
                    Err(Error::Timeout(budget)) => {
                        debug!(
                            "diff for {} exceeded {:?}; falling back to a full replace",
                            uri, budget
                        );
                        vec![full_replace(&snapshot.text)]
                    }
                    Err(e) => {
                        warn!("diff for {} failed ({}); sending a full replace", uri, e);
                        vec![full_replace(&snapshot.text)]
                    }
                }
            } else {
                vec![full_replace(&snapshot.text)]
            };

            if !changes.is_empty() {
                self.connection.send_notification(
                    "textDocument/didChange",
                    Some(json!({
                        "textDocument": VersionedTextDocumentIdentifier {
                            uri: uri.clone(),
                            version: new_version,
                        },
                        "contentChanges": changes,
                    })),
                );
            }
        }

        self.cache.clear();
        self.on_document_changed.fire(&uri);
        trace!("flushed {} at version {}", uri, new_version);
    }

    fn process_save(&self, save: SaveEvent) {
        if self.is_disposed() || self.options().disable_save_notifications {
            return;
        }
        let Some(document) = self.documents.get(&save.uri) else {
            return;
        };
        let language_id = document.language_id.clone();
        let stored_text = document.text.to_string();
        drop(document);

        let Some(options) =
            self.notification_options(SyncNotification::DidSave, &save.uri, &language_id)
        else {
            return;
        };
        let text = options
            .include_text
            .then(|| save.text.unwrap_or(stored_text));
        self.connection.send_notification(
            "textDocument/didSave",
            Some(json!({
                "textDocument": TextDocumentIdentifier { uri: save.uri },
                "text": text,
            })),
        );
    }

    fn process_will_save(&self, will_save: WillSaveEvent) {
        if self.is_disposed() || self.options().disable_save_notifications {
            return;
        }
        let Some(language_id) = self
            .documents
            .get(&will_save.uri)
            .map(|document| document.language_id.clone())
        else {
            return;
        };
        if self
            .notification_options(SyncNotification::WillSave, &will_save.uri, &language_id)
            .is_none()
        {
            return;
        }
        self.connection.send_notification(
            "textDocument/willSave",
            Some(json!({
                "textDocument": TextDocumentIdentifier { uri: will_save.uri },
                "reason": will_save.reason,
            })),
        );
    }

    /// Client-issued `textDocument/willSaveWaitUntil`: forwarded as a request
    /// when the server advertises it, otherwise answered with no edits.
    pub async fn will_save_wait_until(
        &self,
        params: serde_json::Value,
        uri: &Url,
    ) -> Result<serde_json::Value> {
        self.flush_pending().await;
        if self.is_disposed() {
            return Err(Error::ConnectionClosed);
        }
        if self.options().disable_save_notifications {
            return Ok(serde_json::Value::Null);
        }
        let Some(language_id) = self
            .documents
            .get(uri)
            .map(|document| document.language_id.clone())
        else {
            return Ok(serde_json::Value::Null);
        };
        if self
            .notification_options(SyncNotification::WillSaveWaitUntil, uri, &language_id)
            .is_none()
        {
            return Ok(serde_json::Value::Null);
        }
        self.connection
            .request("textDocument/willSaveWaitUntil", Some(params))
            .await
    }

    /// Replays `didOpen` for every stored document matching one of the newly
    /// registered `textDocument/didOpen` selectors. Servers that register
    /// open interest late would otherwise never hear about the documents that
    /// are already open.
    pub(crate) fn replay_did_open(&self, added: &[Registration]) {
        for registration in added {
            if registration.method != crate::capabilities::DID_OPEN_METHOD {
                continue;
            }
            let selector = registration
                .register_options
                .as_ref()
                .and_then(|options| options.get("documentSelector"))
                .cloned()
                .and_then(|selector| serde_json::from_value(selector).ok());

            for entry in self.documents.iter() {
                let document = entry.value();
                if !selector_matches(selector.as_ref(), &document.uri, &document.language_id) {
                    continue;
                }
                debug!(
                    "replaying didOpen for {} after late registration {}",
                    document.uri, registration.id
                );
                self.connection.send_notification(
                    "textDocument/didOpen",
                    Some(json!({
                        "textDocument": {
                            "uri": document.uri,
                            "languageId": document.language_id,
                            "version": document.version,
                            "text": document.text.to_string(),
                        }
                    })),
                );
            }
        }
    }

    /// Programmatic file-change entry point used when the broker intercepts
    /// the watched-files capability. Events are filtered against the
    /// dynamically registered watchers before a single upstream notification.
    pub fn notify_file_changes(&self, events: Vec<FileEvent>) {
        let Some(registry) = self.registry() else { return };
        let watched: Vec<FileEvent> = events
            .into_iter()
            .filter(|event| registry.is_path_watched(event.uri.path(), event.typ))
            .collect();
        if watched.is_empty() {
            return;
        }
        self.connection.send_notification(
            "workspace/didChangeWatchedFiles",
            Some(json!({ "changes": watched })),
        );
    }
}
