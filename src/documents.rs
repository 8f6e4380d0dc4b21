//! Document state on both sides of the broker.
//!
//! [`Document`] is the broker's authoritative server-visible copy (one per
//! URI, version counted from 1). [`TextDocuments`] is the per-client mirror a
//! binding feeds from that client's text-sync notifications; the
//! `LanguageClient` subscribes to its event streams to reconcile the shared
//! state.

use dashmap::DashMap;
use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, Position, TextDocumentContentChangeEvent, TextDocumentSaveReason,
    Url, WillSaveTextDocumentParams,
};
use ropey::Rope;
use tracing::{debug, warn};

use crate::events::Emitter;

/// The authoritative copy of one open document, as the server sees it.
#[derive(Debug, Clone)]
pub struct Document {
    pub uri: Url,
    pub language_id: String,
    /// Server-visible version, bumped by exactly one per flushed change.
    pub version: i32,
    pub text: Rope,
}

/// An immutable snapshot passed through tracker events.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub uri: Url,
    pub language_id: String,
    /// The client's own version for this document.
    pub version: i32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct SaveEvent {
    pub uri: Url,
    pub text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WillSaveEvent {
    pub uri: Url,
    pub reason: TextDocumentSaveReason,
}

struct TrackedDocument {
    language_id: String,
    version: i32,
    text: Rope,
}

/// Per-binding document mirror. Mutation happens inline in the notification
/// dispatch, so event subscribers always observe post-change state in the
/// order the client produced it.
#[derive(Default)]
pub struct TextDocuments {
    docs: DashMap<Url, TrackedDocument>,
    pub on_did_open: Emitter<DocumentSnapshot>,
    pub on_did_close: Emitter<Url>,
    pub on_did_change_content: Emitter<DocumentSnapshot>,
    pub on_did_save: Emitter<SaveEvent>,
    pub on_will_save: Emitter<WillSaveEvent>,
}

impl TextDocuments {
    pub fn new() -> Self {
        TextDocuments {
            docs: DashMap::new(),
            on_did_open: Emitter::new(),
            on_did_close: Emitter::new(),
            on_did_change_content: Emitter::new(),
            on_did_save: Emitter::new(),
            on_will_save: Emitter::new(),
        }
    }

    pub fn all(&self) -> Vec<DocumentSnapshot> {
        self.docs
            .iter()
            .map(|entry| snapshot(entry.key(), entry.value()))
            .collect()
    }

    pub fn get(&self, uri: &Url) -> Option<DocumentSnapshot> {
        self.docs.get(uri).map(|doc| snapshot(uri, doc.value()))
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.docs.contains_key(uri)
    }

    pub fn version_of(&self, uri: &Url) -> Option<i32> {
        self.docs.get(uri).map(|doc| doc.version)
    }

    pub fn handle_did_open(&self, params: DidOpenTextDocumentParams) {
        let item = params.text_document;
        let tracked = TrackedDocument {
            language_id: item.language_id,
            version: item.version,
            text: Rope::from_str(&item.text),
        };
        let snap = snapshot(&item.uri, &tracked);
        if self.docs.insert(item.uri.clone(), tracked).is_some() {
            warn!("client re-opened {} without closing it first", item.uri);
        }
        self.on_did_open.fire(&snap);
    }

    pub fn handle_did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        let snap = {
            let Some(mut doc) = self.docs.get_mut(&uri) else {
                warn!("didChange for untracked document {}", uri);
                return;
            };
            apply_content_changes(&mut doc.text, &params.content_changes);
            doc.version = params.text_document.version;
            snapshot(&uri, doc.value())
        };
        self.on_did_change_content.fire(&snap);
    }

    pub fn handle_did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        if self.docs.remove(&uri).is_none() {
            debug!("didClose for untracked document {}", uri);
            return;
        }
        self.on_did_close.fire(&uri);
    }

    pub fn handle_did_save(&self, params: DidSaveTextDocumentParams) {
        let uri = params.text_document.uri;
        if !self.docs.contains_key(&uri) {
            return;
        }
        self.on_did_save.fire(&SaveEvent {
            uri,
            text: params.text,
        });
    }

    pub fn handle_will_save(&self, params: WillSaveTextDocumentParams) {
        let uri = params.text_document.uri;
        if !self.docs.contains_key(&uri) {
            return;
        }
        self.on_will_save.fire(&WillSaveEvent {
            uri,
            reason: params.reason,
        });
    }
}

fn snapshot(uri: &Url, doc: &TrackedDocument) -> DocumentSnapshot {
    DocumentSnapshot {
        uri: uri.clone(),
        language_id: doc.language_id.clone(),
        version: doc.version,
        text: doc.text.to_string(),
    }
}

/// Applies LSP content changes in the order received. Ranged changes address
/// UTF-16 code units; a change without a range replaces the whole text.
pub fn apply_content_changes(text: &mut Rope, changes: &[TextDocumentContentChangeEvent]) {
    for change in changes {
        match change.range {
            Some(range) => {
                let start = position_to_char(text, range.start);
                let end = position_to_char(text, range.end).max(start);
                text.remove(start..end);
                text.insert(start, &change.text);
            }
            None => *text = Rope::from_str(&change.text),
        }
    }
}

/// Clamps out-of-range positions the way every tolerant LSP peer does:
/// line past the end means end-of-document, character past the line end
/// means end-of-line.
fn position_to_char(text: &Rope, position: Position) -> usize {
    let line = position.line as usize;
    if line >= text.len_lines() {
        return text.len_chars();
    }
    let line_start = text.line_to_char(line);
    let line_slice = text.line(line);
    let character = (position.character as usize).min(line_slice.len_utf16_cu());
    line_start + line_slice.utf16_cu_to_char(character)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{Range, TextDocumentItem, VersionedTextDocumentIdentifier};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn uri(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn open(docs: &TextDocuments, uri_str: &str, text: &str) {
        docs.handle_did_open(DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri(uri_str),
                language_id: "plaintext".to_string(),
                version: 1,
                text: text.to_string(),
            },
        });
    }

    fn change(line: u32, start: u32, end: u32, text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range: Some(Range {
                start: Position { line, character: start },
                end: Position { line, character: end },
            }),
            range_length: None,
            text: text.to_string(),
        }
    }

    #[test]
    fn incremental_changes_apply_in_utf16_space() {
        let docs = TextDocuments::new();
        open(&docs, "inmemory://m.txt", "🎉ab\nsecond");

        // The emoji is two UTF-16 units, so "ab" starts at character 2.
        docs.handle_did_change(DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: uri("inmemory://m.txt"),
                version: 2,
            },
            content_changes: vec![change(0, 2, 3, "X")],
        });

        let snap = docs.get(&uri("inmemory://m.txt")).unwrap();
        assert_eq!(snap.text, "🎉Xb\nsecond");
        assert_eq!(snap.version, 2);
    }

    #[test]
    fn full_text_change_replaces_everything() {
        let docs = TextDocuments::new();
        open(&docs, "inmemory://m.txt", "old");
        docs.handle_did_change(DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: uri("inmemory://m.txt"),
                version: 2,
            },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: "entirely new".to_string(),
            }],
        });
        assert_eq!(docs.get(&uri("inmemory://m.txt")).unwrap().text, "entirely new");
    }

    #[test]
    fn out_of_range_positions_are_clamped() {
        let docs = TextDocuments::new();
        open(&docs, "inmemory://m.txt", "ab");
        docs.handle_did_change(DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: uri("inmemory://m.txt"),
                version: 2,
            },
            content_changes: vec![change(0, 1, 99, "!")],
        });
        assert_eq!(docs.get(&uri("inmemory://m.txt")).unwrap().text, "a!");
    }

    #[test]
    fn close_removes_and_fires() {
        let docs = TextDocuments::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let closed_clone = closed.clone();
        let _sub = docs
            .on_did_close
            .subscribe(move |_| {
                closed_clone.fetch_add(1, Ordering::SeqCst);
            });

        open(&docs, "inmemory://m.txt", "text");
        docs.handle_did_close(DidCloseTextDocumentParams {
            text_document: lsp_types::TextDocumentIdentifier {
                uri: uri("inmemory://m.txt"),
            },
        });

        assert!(!docs.contains(&uri("inmemory://m.txt")));
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // A second close for the same URI is ignored.
        docs.handle_did_close(DidCloseTextDocumentParams {
            text_document: lsp_types::TextDocumentIdentifier {
                uri: uri("inmemory://m.txt"),
            },
        });
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn save_events_only_fire_for_tracked_documents() {
        let docs = TextDocuments::new();
        let saves = Arc::new(AtomicUsize::new(0));
        let saves_clone = saves.clone();
        let _sub = docs.on_did_save.subscribe(move |_| {
            saves_clone.fetch_add(1, Ordering::SeqCst);
        });

        docs.handle_did_save(DidSaveTextDocumentParams {
            text_document: lsp_types::TextDocumentIdentifier {
                uri: uri("inmemory://other.txt"),
            },
            text: None,
        });
        assert_eq!(saves.load(Ordering::SeqCst), 0);

        open(&docs, "inmemory://m.txt", "text");
        docs.handle_did_save(DidSaveTextDocumentParams {
            text_document: lsp_types::TextDocumentIdentifier {
                uri: uri("inmemory://m.txt"),
            },
            text: Some("text".to_string()),
        });
        assert_eq!(saves.load(Ordering::SeqCst), 1);
    }
}
