//! Multi-subscriber dispatch for inbound server→client requests.
//!
//! A refresh request or `workspace/applyEdit` arrives once from the server
//! but concerns every attached client. Each binding registers a handler; the
//! fanout invokes a snapshot of them concurrently and merges the answers
//! under a policy.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::Disposable;

type Handler<P, R> =
    Arc<dyn Fn(P, CancellationToken) -> BoxFuture<'static, Result<R>> + Send + Sync>;

struct FanoutInner<P, R> {
    handlers: Mutex<Vec<(u64, Handler<P, R>)>>,
    next_id: AtomicU64,
}

pub struct RequestFanout<P, R> {
    inner: Arc<FanoutInner<P, R>>,
}

impl<P, R> Clone for RequestFanout<P, R> {
    fn clone(&self) -> Self {
        RequestFanout {
            inner: self.inner.clone(),
        }
    }
}

impl<P, R> Default for RequestFanout<P, R>
where
    P: Clone + Send + 'static,
    R: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P, R> RequestFanout<P, R>
where
    P: Clone + Send + 'static,
    R: Send + 'static,
{
    pub fn new() -> Self {
        RequestFanout {
            inner: Arc::new(FanoutInner {
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn on_request(
        &self,
        handler: impl Fn(P, CancellationToken) -> BoxFuture<'static, Result<R>> + Send + Sync + 'static,
    ) -> Disposable {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push((id, Arc::new(handler)));
        let inner = Arc::downgrade(&self.inner);
        Disposable::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.handlers.lock().retain(|(h_id, _)| *h_id != id);
            }
        })
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Invokes a snapshot of the current handlers concurrently.
    pub async fn invoke(&self, params: P, token: CancellationToken) -> Vec<Result<R>> {
        let snapshot: Vec<Handler<P, R>> = self
            .inner
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        join_all(
            snapshot
                .into_iter()
                .map(|handler| handler(params.clone(), token.clone())),
        )
        .await
    }

    /// Succeeds iff every subscriber succeeded; otherwise the first error.
    /// No subscribers is a vacuous success.
    pub async fn all_void(&self, params: P, token: CancellationToken) -> Result<()> {
        for result in self.invoke(params, token).await {
            result?;
        }
        Ok(())
    }
}

impl<P, R> RequestFanout<P, Option<R>>
where
    P: Clone + Send + 'static,
    R: Send + 'static,
{
    /// Filters out `None` answers and requires exactly one subscriber to have
    /// answered. Zero or several answers yield `default` when provided and
    /// [`Error::HandlerCountMismatch`] otherwise. Handler errors win over the
    /// count check.
    pub async fn single(
        &self,
        params: P,
        token: CancellationToken,
        default: Option<R>,
    ) -> Result<R> {
        let mut answers = Vec::new();
        for result in self.invoke(params, token).await {
            if let Some(answer) = result? {
                answers.push(answer);
            }
        }
        match answers.len() {
            1 => Ok(answers.pop().expect("exactly one answer")),
            n => default.ok_or(Error::HandlerCountMismatch(n)),
        }
    }
}
