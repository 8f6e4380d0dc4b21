//! Injection points for embedding the broker.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cache::RequestCache;
use crate::diff::DEFAULT_DIFF_BUDGET;
use crate::error::ResponseError;

pub const DEFAULT_CLIENT_INITIALIZATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CHANGE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Resolves a configuration section for server-initiated
/// `workspace/configuration` requests. Scope is deliberately ignored: N
/// clients cannot each own "the" workspace configuration.
pub type ConfigurationResolver = Arc<dyn Fn(Option<&str>) -> Option<Value> + Send + Sync>;

/// Handles a client request outside the forwarded set.
pub type UnknownRequestHandler = Arc<
    dyn Fn(String, Option<Value>, CancellationToken) -> BoxFuture<'static, Result<Value, ResponseError>>
        + Send
        + Sync,
>;

/// Observes server notifications the broker has no handler for.
pub type NotificationHook = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

pub type CacheFactory = Arc<dyn Fn() -> Arc<RequestCache> + Send + Sync>;

#[derive(Clone)]
pub struct MutualizerOptions {
    /// Advertised in `serverInfo` of every client handshake.
    pub server_name: String,
    /// Sections pushed via `workspace/didChangeConfiguration` right after the
    /// server handshake.
    pub synchronize_configuration_sections: Vec<String>,
    pub get_configuration: Option<ConfigurationResolver>,
    /// Suppresses the will/did-save pathways entirely and strips the save
    /// capabilities advertised to clients.
    pub disable_save_notifications: bool,
    /// When set, the broker claims the watched-files client capability and
    /// file events enter through `LanguageClient::notify_file_changes`.
    pub intercept_did_change_watched_file: bool,
    /// Cache used for the idempotent forwarded requests. `None` keeps the
    /// built-in in-memory cache.
    pub create_cache: Option<CacheFactory>,
    /// Deadline for a client to complete `initialize`/`initialized`.
    pub client_initialization_timeout: Duration,
    /// Trailing window batching client edits before one `didChange`.
    pub change_debounce: Duration,
    /// Budget for the incremental diff before falling back to a full replace.
    pub diff_budget: Duration,
    pub unknown_client_request_handler: Option<UnknownRequestHandler>,
    pub unhandled_notification_handler: Option<NotificationHook>,
    /// Client request prefixes (vendor namespaces) forwarded to the server
    /// even though they are outside the forwarded set.
    pub forward_unknown_prefixes: Vec<String>,
}

impl Default for MutualizerOptions {
    fn default() -> Self {
        MutualizerOptions {
            server_name: "lsp-mutualizer".to_string(),
            synchronize_configuration_sections: Vec::new(),
            get_configuration: None,
            disable_save_notifications: false,
            intercept_did_change_watched_file: false,
            create_cache: None,
            client_initialization_timeout: DEFAULT_CLIENT_INITIALIZATION_TIMEOUT,
            change_debounce: DEFAULT_CHANGE_DEBOUNCE,
            diff_budget: DEFAULT_DIFF_BUDGET,
            unknown_client_request_handler: None,
            unhandled_notification_handler: None,
            forward_unknown_prefixes: Vec::new(),
        }
    }
}

impl MutualizerOptions {
    pub fn build_cache(&self) -> Arc<RequestCache> {
        match &self.create_cache {
            Some(factory) => factory(),
            None => RequestCache::new(),
        }
    }
}
