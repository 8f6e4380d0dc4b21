//! Memoization of idempotent upstream requests.
//!
//! Entries are shared futures keyed on a fingerprint of the request, so
//! identical concurrent requests from different clients collapse onto one
//! upstream call and every caller observes the same outcome, failures
//! included. Any document mutation flushes the whole cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::Result;

/// Stable hash of `(method, params)`. Per-caller plumbing — the out-of-band
/// cancellation token and the `workDoneToken`/`partialResultToken` progress
/// fields — is excluded, so one client cancelling or progress-tagging a
/// request cannot split the cache for the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(blake3::Hash);

pub fn fingerprint(method: &str, params: Option<&Value>) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(method.as_bytes());
    hasher.update(&[0]);
    if let Some(params) = params {
        let canonical = strip_progress_tokens(params);
        hasher.update(
            serde_json::to_string(&canonical)
                .expect("JSON value serialization is infallible")
                .as_bytes(),
        );
    }
    Fingerprint(hasher.finalize())
}

fn strip_progress_tokens(params: &Value) -> Value {
    let mut params = params.clone();
    if let Some(object) = params.as_object_mut() {
        object.remove("workDoneToken");
        object.remove("partialResultToken");
    }
    params
}

pub type SharedResponse = Shared<BoxFuture<'static, Result<Value>>>;

#[derive(Default)]
pub struct RequestCache {
    entries: Mutex<FxHashMap<Fingerprint, SharedResponse>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RequestCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the entry for `fingerprint`, creating it with `issue` on a
    /// miss. The returned future may still be pending; concurrent callers of
    /// the same fingerprint share it.
    pub fn get_or_insert_with(
        &self,
        fingerprint: Fingerprint,
        issue: impl FnOnce() -> BoxFuture<'static, Result<Value>>,
    ) -> SharedResponse {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(&fingerprint) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return entry.clone();
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let entry = issue().shared();
        entries.insert(fingerprint, entry.clone());
        entry
    }

    /// Drops every entry. Called on each document open, change and close,
    /// before the corresponding event fires.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ResponseError};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fingerprints_ignore_progress_tokens_but_not_arguments() {
        let base = json!({"textDocument": {"uri": "file:///a"}, "position": {"line": 1, "character": 2}});
        let mut tagged = base.clone();
        tagged["workDoneToken"] = json!("wd-1");
        tagged["partialResultToken"] = json!("pr-1");

        assert_eq!(
            fingerprint("textDocument/hover", Some(&base)),
            fingerprint("textDocument/hover", Some(&tagged))
        );

        let mut moved = base.clone();
        moved["position"]["character"] = json!(3);
        assert_ne!(
            fingerprint("textDocument/hover", Some(&base)),
            fingerprint("textDocument/hover", Some(&moved))
        );
        assert_ne!(
            fingerprint("textDocument/hover", Some(&base)),
            fingerprint("textDocument/definition", Some(&base))
        );
    }

    #[tokio::test]
    async fn identical_requests_collapse_to_one_upstream_call() {
        let cache = RequestCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = fingerprint("textDocument/hover", None);

        let issue = |calls: Arc<AtomicUsize>| {
            move || -> BoxFuture<'static, Result<Value>> {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(json!({"contents": "docs"})) })
            }
        };

        let first = cache.get_or_insert_with(fp, issue(calls.clone()));
        let second = cache.get_or_insert_with(fp, issue(calls.clone()));

        assert_eq!(first.await.unwrap(), json!({"contents": "docs"}));
        assert_eq!(second.await.unwrap(), json!({"contents": "docs"}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.hit_count(), 1);
    }

    #[tokio::test]
    async fn clear_forces_a_fresh_upstream_call() {
        let cache = RequestCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = fingerprint("textDocument/hover", None);

        for _ in 0..2 {
            let calls = calls.clone();
            let entry = cache.get_or_insert_with(fp, move || {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(Value::Null) })
            });
            entry.await.unwrap();
            cache.clear();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_shared_until_the_next_clear() {
        let cache = RequestCache::new();
        let fp = fingerprint("textDocument/hover", None);

        let entry = cache.get_or_insert_with(fp, || {
            Box::pin(async {
                Err(Error::Response(ResponseError::internal("backend fell over")))
            })
        });
        assert!(entry.await.is_err());

        // Still the same failed entry: no new upstream call is issued.
        let again = cache.get_or_insert_with(fp, || {
            panic!("a cached failure must not re-issue the request")
        });
        assert!(again.await.is_err());
    }
}
