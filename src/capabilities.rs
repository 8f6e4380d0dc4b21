//! Server capability tracking: the static `initialize` result plus the
//! stream of dynamic (un)registrations, with document-selector matching and
//! the transformed view handed to downstream clients.

use globset::GlobBuilder;
use lsp_types::{
    DidChangeWatchedFilesRegistrationOptions, DocumentSelector, FileChangeType, FileSystemWatcher,
    GlobPattern, OneOf, Registration, RegistrationParams, SaveOptions, ServerCapabilities,
    TextDocumentSyncCapability, TextDocumentSyncKind, TextDocumentSyncOptions,
    TextDocumentSyncSaveOptions, Unregistration, UnregistrationParams, Url, WatchKind,
};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::events::Emitter;

pub const DID_OPEN_METHOD: &str = "textDocument/didOpen";
pub const DID_CLOSE_METHOD: &str = "textDocument/didClose";
pub const DID_CHANGE_METHOD: &str = "textDocument/didChange";
pub const DID_SAVE_METHOD: &str = "textDocument/didSave";
pub const WILL_SAVE_METHOD: &str = "textDocument/willSave";
pub const WILL_SAVE_WAIT_UNTIL_METHOD: &str = "textDocument/willSaveWaitUntil";
pub const DID_CHANGE_WATCHED_FILES_METHOD: &str = "workspace/didChangeWatchedFiles";

/// The text-document sync notifications the broker itself drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncNotification {
    DidOpen,
    DidClose,
    DidChange,
    DidSave,
    WillSave,
    WillSaveWaitUntil,
}

impl SyncNotification {
    pub fn method(self) -> &'static str {
        match self {
            SyncNotification::DidOpen => DID_OPEN_METHOD,
            SyncNotification::DidClose => DID_CLOSE_METHOD,
            SyncNotification::DidChange => DID_CHANGE_METHOD,
            SyncNotification::DidSave => DID_SAVE_METHOD,
            SyncNotification::WillSave => WILL_SAVE_METHOD,
            SyncNotification::WillSaveWaitUntil => WILL_SAVE_WAIT_UNTIL_METHOD,
        }
    }
}

/// What applies to a document for one sync notification. `sync_kind` only
/// matters for didChange, `include_text` only for didSave.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotificationOptions {
    pub sync_kind: TextDocumentSyncKind,
    pub include_text: bool,
}

/// `textDocumentSync` expanded from either wire shape into one flat view.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSyncOptions {
    pub open_close: bool,
    pub change: TextDocumentSyncKind,
    pub will_save: bool,
    pub will_save_wait_until: bool,
    pub save: Option<SaveOptions>,
}

/// The wire shape shared by the text-document registration option variants;
/// parsed leniently so unknown servers cannot poison the registry.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextDocumentRegistrationOptionsRaw {
    #[serde(default)]
    document_selector: Option<DocumentSelector>,
    #[serde(default)]
    sync_kind: Option<TextDocumentSyncKind>,
    #[serde(default)]
    include_text: Option<bool>,
}

pub struct CapabilityRegistry {
    capabilities: ServerCapabilities,
    registrations: RwLock<Vec<Registration>>,
    pub on_registration: Emitter<Vec<Registration>>,
    pub on_unregistration: Emitter<Vec<Unregistration>>,
}

impl CapabilityRegistry {
    pub fn new(capabilities: ServerCapabilities) -> Self {
        CapabilityRegistry {
            capabilities,
            registrations: RwLock::new(Vec::new()),
            on_registration: Emitter::new(),
            on_unregistration: Emitter::new(),
        }
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.registrations.read().clone()
    }

    /// Adds every registration whose id is not already present and returns
    /// that subset. Some servers re-send registrations with ids they already
    /// used; duplicates are dropped without an error.
    pub fn handle_registration(&self, params: RegistrationParams) -> Vec<Registration> {
        let mut added = Vec::new();
        {
            let mut registrations = self.registrations.write();
            for registration in params.registrations {
                if registrations.iter().any(|r| r.id == registration.id) {
                    debug!(
                        "ignoring duplicate registration id {} for {}",
                        registration.id, registration.method
                    );
                    continue;
                }
                registrations.push(registration.clone());
                added.push(registration);
            }
        }
        if !added.is_empty() {
            self.on_registration.fire(&added);
        }
        added
    }

    /// Removes every matching id and returns the subset actually removed.
    pub fn handle_unregistration(&self, params: UnregistrationParams) -> Vec<Unregistration> {
        let mut removed = Vec::new();
        {
            let mut registrations = self.registrations.write();
            for unregistration in params.unregisterations {
                let before = registrations.len();
                registrations.retain(|r| r.id != unregistration.id);
                if registrations.len() != before {
                    removed.push(unregistration);
                }
            }
        }
        if !removed.is_empty() {
            self.on_unregistration.fire(&removed);
        }
        removed
    }

    /// Expands `textDocumentSync` from the initialize result. A bare sync
    /// kind `k` means `{openClose: k != None, change: k, save: {includeText:
    /// false}}`; kind `None` disables everything.
    pub fn resolved_sync_options(&self) -> ResolvedSyncOptions {
        match &self.capabilities.text_document_sync {
            Some(TextDocumentSyncCapability::Kind(kind)) => {
                if *kind == TextDocumentSyncKind::NONE {
                    ResolvedSyncOptions {
                        open_close: false,
                        change: TextDocumentSyncKind::NONE,
                        will_save: false,
                        will_save_wait_until: false,
                        save: None,
                    }
                } else {
                    ResolvedSyncOptions {
                        open_close: true,
                        change: *kind,
                        will_save: false,
                        will_save_wait_until: false,
                        save: Some(SaveOptions {
                            include_text: Some(false),
                        }),
                    }
                }
            }
            Some(TextDocumentSyncCapability::Options(options)) => ResolvedSyncOptions {
                open_close: options.open_close.unwrap_or(false),
                change: options.change.unwrap_or(TextDocumentSyncKind::NONE),
                will_save: options.will_save.unwrap_or(false),
                will_save_wait_until: options.will_save_wait_until.unwrap_or(false),
                save: options.save.as_ref().and_then(|save| match save {
                    TextDocumentSyncSaveOptions::Supported(true) => Some(SaveOptions {
                        include_text: Some(false),
                    }),
                    TextDocumentSyncSaveOptions::Supported(false) => None,
                    TextDocumentSyncSaveOptions::SaveOptions(options) => Some(options.clone()),
                }),
            },
            None => ResolvedSyncOptions {
                open_close: false,
                change: TextDocumentSyncKind::NONE,
                will_save: false,
                will_save_wait_until: false,
                save: None,
            },
        }
    }

    /// Resolves whether `notification` applies to a document: first via the
    /// registration synthesized from the static `textDocumentSync`, then via
    /// the first dynamic registration whose selector matches.
    pub fn text_document_notification_options(
        &self,
        notification: SyncNotification,
        uri: &Url,
        language_id: &str,
    ) -> Option<NotificationOptions> {
        if let Some(options) = self.static_notification_options(notification) {
            return Some(options);
        }

        let method = notification.method();
        for registration in self.registrations.read().iter() {
            if registration.method != method {
                continue;
            }
            let raw = parse_registration_options(registration);
            if selector_matches(raw.document_selector.as_ref(), uri, language_id) {
                return Some(NotificationOptions {
                    sync_kind: raw.sync_kind.unwrap_or(TextDocumentSyncKind::INCREMENTAL),
                    include_text: raw.include_text.unwrap_or(false),
                });
            }
        }
        None
    }

    fn static_notification_options(
        &self,
        notification: SyncNotification,
    ) -> Option<NotificationOptions> {
        let resolved = self.resolved_sync_options();
        let enabled = match notification {
            SyncNotification::DidOpen | SyncNotification::DidClose => resolved.open_close,
            SyncNotification::DidChange => resolved.change != TextDocumentSyncKind::NONE,
            SyncNotification::DidSave => resolved.save.is_some(),
            SyncNotification::WillSave => resolved.will_save,
            SyncNotification::WillSaveWaitUntil => resolved.will_save_wait_until,
        };
        enabled.then(|| NotificationOptions {
            sync_kind: resolved.change,
            include_text: resolved
                .save
                .as_ref()
                .and_then(|save| save.include_text)
                .unwrap_or(false),
        })
    }

    /// Tests a path against every dynamically registered file watcher.
    /// A watcher with no kind watches create, change and delete.
    pub fn is_path_watched(&self, path: &str, change: FileChangeType) -> bool {
        let Some(kind) = watch_kind_for(change) else {
            return false;
        };
        self.registrations
            .read()
            .iter()
            .filter(|r| r.method == DID_CHANGE_WATCHED_FILES_METHOD)
            .filter_map(|r| {
                r.register_options.clone().and_then(|options| {
                    serde_json::from_value::<DidChangeWatchedFilesRegistrationOptions>(options).ok()
                })
            })
            .flat_map(|options| options.watchers)
            .any(|watcher| watcher_matches(&watcher, path, kind))
    }

    pub fn has_watcher_registrations(&self) -> bool {
        self.registrations
            .read()
            .iter()
            .any(|r| r.method == DID_CHANGE_WATCHED_FILES_METHOD)
    }

    /// The capability set advertised to a freshly attached client. The broker
    /// always syncs incrementally against the server and owns open/close, so
    /// clients must send openClose + incremental changes and never willSave;
    /// workspace-folder requests cannot be forwarded from a collapsed view.
    pub fn transformed_capabilities(&self, disable_save_notifications: bool) -> ServerCapabilities {
        let resolved = self.resolved_sync_options();
        let mut capabilities = self.capabilities.clone();

        capabilities.text_document_sync =
            Some(TextDocumentSyncCapability::Options(TextDocumentSyncOptions {
                open_close: Some(true),
                change: Some(TextDocumentSyncKind::INCREMENTAL),
                will_save: Some(false),
                will_save_wait_until: if disable_save_notifications {
                    None
                } else {
                    Some(resolved.will_save_wait_until)
                },
                save: if disable_save_notifications {
                    None
                } else {
                    resolved.save.map(TextDocumentSyncSaveOptions::SaveOptions)
                },
            }));

        if let Some(workspace) = capabilities.workspace.as_mut() {
            if let Some(folders) = workspace.workspace_folders.as_mut() {
                folders.supported = Some(false);
            }
        }

        capabilities
    }
}

fn parse_registration_options(registration: &Registration) -> TextDocumentRegistrationOptionsRaw {
    match &registration.register_options {
        None => TextDocumentRegistrationOptionsRaw::default(),
        Some(options) => match serde_json::from_value(options.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    "unparseable register options for {} ({}): {}",
                    registration.method, registration.id, e
                );
                TextDocumentRegistrationOptionsRaw::default()
            }
        },
    }
}

/// A missing selector matches every document. A present selector matches if
/// any of its filters does; a filter matches when each of its stated
/// conditions (language, scheme, glob over the URI path) holds.
pub fn selector_matches(
    selector: Option<&DocumentSelector>,
    uri: &Url,
    language_id: &str,
) -> bool {
    let Some(selector) = selector else { return true };
    selector.iter().any(|filter| {
        if let Some(language) = &filter.language {
            if language != language_id {
                return false;
            }
        }
        if let Some(scheme) = &filter.scheme {
            if scheme != uri.scheme() {
                return false;
            }
        }
        if let Some(pattern) = &filter.pattern {
            if !glob_matches(pattern, uri.path()) {
                return false;
            }
        }
        true
    })
}

/// Glob bodies always use `/`; `*` stays within one path segment, `**`
/// crosses segments.
pub fn glob_matches(pattern: &str, path: &str) -> bool {
    match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(glob) => glob.compile_matcher().is_match(path),
        Err(e) => {
            warn!("rejecting malformed glob {:?}: {}", pattern, e);
            false
        }
    }
}

/// Matches a watcher glob, including relative patterns where the document
/// must live under the base URI's path. Only the ancestry check goes through
/// `Path`, so platform separators apply there and nowhere else.
pub fn matches_glob_pattern(pattern: &GlobPattern, path: &str) -> bool {
    match pattern {
        GlobPattern::String(glob) => glob_matches(glob, path),
        GlobPattern::Relative(relative) => {
            let base_path = match &relative.base_uri {
                OneOf::Left(folder) => folder.uri.path().to_string(),
                OneOf::Right(url) => url.path().to_string(),
            };
            let candidate = std::path::Path::new(path);
            match candidate.strip_prefix(std::path::Path::new(&base_path)) {
                Ok(rest) => {
                    let rest = rest.to_string_lossy().replace('\\', "/");
                    glob_matches(&relative.pattern, &rest)
                }
                Err(_) => false,
            }
        }
    }
}

fn watcher_matches(watcher: &FileSystemWatcher, path: &str, kind: WatchKind) -> bool {
    let watched_kinds = watcher.kind.unwrap_or(WatchKind::all());
    watched_kinds.contains(kind) && matches_glob_pattern(&watcher.glob_pattern, path)
}

fn watch_kind_for(change: FileChangeType) -> Option<WatchKind> {
    match change {
        FileChangeType::CREATED => Some(WatchKind::Create),
        FileChangeType::CHANGED => Some(WatchKind::Change),
        FileChangeType::DELETED => Some(WatchKind::Delete),
        _ => None,
    }
}
