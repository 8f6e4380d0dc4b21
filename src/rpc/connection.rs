//! A symmetric JSON-RPC connection over any framed byte stream.
//!
//! Both sides of the broker use the same type: the single upstream server
//! link and every downstream client link. Handlers are registered before
//! `listen` starts pumping messages, so no early inbound traffic can race a
//! half-installed endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, ResponseError, Result};
use crate::events::{Disposable, Emitter};
use crate::rpc::{CANCEL_REQUEST_METHOD, Message, RequestId, framing};

/// Why a connection ended: we closed it, or the peer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    Local,
    Remote,
}

pub type RequestHandler = Arc<
    dyn Fn(Option<Value>, CancellationToken) -> BoxFuture<'static, std::result::Result<Value, ResponseError>>
        + Send
        + Sync,
>;

/// Fallback for methods with no registered handler; receives the method name.
pub type FallbackRequestHandler = Arc<
    dyn Fn(String, Option<Value>, CancellationToken) -> BoxFuture<'static, std::result::Result<Value, ResponseError>>
        + Send
        + Sync,
>;

pub type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Fallback for notifications with no registered handler.
pub type UnhandledNotificationHandler = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum Outbound {
    Message(Message),
    Shutdown,
}

#[derive(Deserialize)]
struct CancelParams {
    id: RequestId,
}

pub struct Connection {
    peer: String,
    io: Mutex<Option<(BoxReader, BoxWriter)>>,
    outgoing_tx: mpsc::UnboundedSender<Outbound>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    pending: DashMap<i64, oneshot::Sender<Result<Value>>>,
    request_handlers: Arc<DashMap<String, RequestHandler>>,
    notification_handlers: Arc<DashMap<String, NotificationHandler>>,
    fallback_request_handler: Mutex<Option<FallbackRequestHandler>>,
    unhandled_notification_handler: Mutex<Option<UnhandledNotificationHandler>>,
    inbound_cancellations: DashMap<RequestId, CancellationToken>,
    next_id: AtomicI64,
    closed_tx: watch::Sender<bool>,
    close_cause: Mutex<Option<CloseCause>>,
    on_close: Emitter<CloseCause>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// An in-flight outbound request. Dropping it abandons the response without
/// cancelling the peer; use [`Connection::cancel`] for that.
pub struct PendingRequest {
    pub id: i64,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingRequest {
    pub async fn response(self) -> Result<Value> {
        self.rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }
}

impl Connection {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        peer: impl Into<String>,
    ) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Connection {
            peer: peer.into(),
            io: Mutex::new(Some((Box::new(reader), Box::new(writer)))),
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            pending: DashMap::new(),
            request_handlers: Arc::new(DashMap::new()),
            notification_handlers: Arc::new(DashMap::new()),
            fallback_request_handler: Mutex::new(None),
            unhandled_notification_handler: Mutex::new(None),
            inbound_cancellations: DashMap::new(),
            next_id: AtomicI64::new(1),
            closed_tx,
            close_cause: Mutex::new(None),
            on_close: Emitter::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Starts the reader and writer tasks. Must be called once, after every
    /// handler that early traffic may target has been registered.
    pub fn listen(self: &Arc<Self>) {
        let Some((reader, mut writer)) = self.io.lock().take() else {
            debug!(peer = %self.peer, "listen called twice; ignoring");
            return;
        };
        let mut outgoing_rx = self
            .outgoing_rx
            .lock()
            .take()
            .expect("outgoing receiver present until first listen");

        let conn = self.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(outbound) = outgoing_rx.recv().await {
                match outbound {
                    Outbound::Shutdown => break,
                    Outbound::Message(message) => {
                        if let Err(e) = framing::write_message(&mut writer, &message.encode()).await {
                            debug!(peer = %conn.peer, "write failed: {}", e);
                            conn.close(CloseCause::Remote);
                            break;
                        }
                    }
                }
            }
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
            trace!(peer = %conn.peer, "writer task terminated");
        });

        let conn = self.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                match framing::read_message(&mut reader).await {
                    Ok(Some(payload)) => match Message::decode(&payload) {
                        Ok(message) => conn.dispatch(message),
                        Err(e) => warn!(peer = %conn.peer, "dropping malformed message: {}", e),
                    },
                    Ok(None) => {
                        debug!(peer = %conn.peer, "peer closed the stream");
                        conn.close(CloseCause::Remote);
                        break;
                    }
                    Err(e) => {
                        debug!(peer = %conn.peer, "read failed: {}", e);
                        conn.close(CloseCause::Remote);
                        break;
                    }
                }
            }
            trace!(peer = %conn.peer, "reader task terminated");
        });

        self.tasks.lock().extend([writer_task, reader_task]);
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        match message {
            Message::Response { id, result } => {
                let RequestId::Number(id) = id else {
                    warn!(peer = %self.peer, "response with non-numeric id {}; dropping", id);
                    return;
                };
                match self.pending.remove(&id) {
                    Some((_, tx)) => {
                        let _ = tx.send(result.map_err(Error::Response));
                    }
                    None => trace!(peer = %self.peer, "response for unknown request {}", id),
                }
            }
            Message::Notification { method, params } => {
                if method == CANCEL_REQUEST_METHOD {
                    self.handle_cancel(params);
                    return;
                }
                if let Some(handler) = self.notification_handlers.get(&method).map(|h| h.value().clone()) {
                    handler(params);
                    return;
                }
                if let Some(handler) = self.unhandled_notification_handler.lock().clone() {
                    handler(&method, params.as_ref());
                } else {
                    trace!(peer = %self.peer, "dropping unhandled notification {}", method);
                }
            }
            Message::Request { id, method, params } => {
                let token = CancellationToken::new();
                self.inbound_cancellations.insert(id.clone(), token.clone());

                let handler = self.request_handlers.get(&method).map(|h| h.value().clone());
                let fallback = handler
                    .is_none()
                    .then(|| self.fallback_request_handler.lock().clone())
                    .flatten();

                let conn = self.clone();
                tokio::spawn(async move {
                    let result = match (handler, fallback) {
                        (Some(handler), _) => handler(params, token).await,
                        (None, Some(fallback)) => fallback(method, params, token).await,
                        (None, None) => {
                            debug!(peer = %conn.peer, "no handler for request {}", method);
                            Err(ResponseError::method_not_found(&method))
                        }
                    };
                    conn.inbound_cancellations.remove(&id);
                    conn.send_response(id, result);
                });
            }
        }
    }

    fn handle_cancel(&self, params: Option<Value>) {
        let Some(params) = params else { return };
        match serde_json::from_value::<CancelParams>(params) {
            Ok(cancel) => {
                if let Some(entry) = self.inbound_cancellations.get(&cancel.id) {
                    trace!(peer = %self.peer, "cancelling inbound request {}", cancel.id);
                    entry.cancel();
                }
            }
            Err(e) => warn!(peer = %self.peer, "malformed $/cancelRequest: {}", e),
        }
    }

    /// Issues a request; the returned handle resolves with the peer's answer.
    pub fn send_request(&self, method: &str, params: Option<Value>) -> PendingRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if !self.is_closed() {
            self.pending.insert(id, tx);
            let sent = self
                .outgoing_tx
                .send(Outbound::Message(Message::Request {
                    id: RequestId::Number(id),
                    method: method.to_string(),
                    params,
                }))
                .is_ok();
            // A close may have drained `pending` between the insert and now;
            // fail the request instead of leaving the caller hanging.
            if !sent || self.is_closed() {
                if let Some((_, tx)) = self.pending.remove(&id) {
                    let _ = tx.send(Err(Error::ConnectionClosed));
                }
            }
        }
        PendingRequest { id, rx }
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.send_request(method, params).response().await
    }

    pub fn send_notification(&self, method: &str, params: Option<Value>) {
        if self.is_closed() {
            trace!(peer = %self.peer, "dropping notification {} on closed connection", method);
            return;
        }
        let _ = self.outgoing_tx.send(Outbound::Message(Message::Notification {
            method: method.to_string(),
            params,
        }));
    }

    /// Asks the peer to cancel an outbound request previously issued with
    /// [`send_request`]. The response (usually `RequestCancelled`) still
    /// arrives through the pending handle.
    pub fn cancel(&self, id: i64) {
        self.send_notification(
            CANCEL_REQUEST_METHOD,
            Some(serde_json::json!({ "id": id })),
        );
    }

    pub fn send_response(&self, id: RequestId, result: std::result::Result<Value, ResponseError>) {
        if self.is_closed() {
            return;
        }
        let _ = self
            .outgoing_tx
            .send(Outbound::Message(Message::Response { id, result }));
    }

    pub fn on_request(
        &self,
        method: &str,
        handler: impl Fn(Option<Value>, CancellationToken) -> BoxFuture<'static, std::result::Result<Value, ResponseError>>
        + Send
        + Sync
        + 'static,
    ) -> Disposable {
        self.register_request_handler(method, Arc::new(handler))
    }

    pub fn register_request_handler(&self, method: &str, handler: RequestHandler) -> Disposable {
        self.request_handlers.insert(method.to_string(), handler);
        let handlers = self.request_handlers.clone();
        let method = method.to_string();
        Disposable::new(move || {
            handlers.remove(&method);
        })
    }

    pub fn on_notification(
        &self,
        method: &str,
        handler: impl Fn(Option<Value>) + Send + Sync + 'static,
    ) -> Disposable {
        self.notification_handlers
            .insert(method.to_string(), Arc::new(handler));
        let handlers = self.notification_handlers.clone();
        let method = method.to_string();
        Disposable::new(move || {
            handlers.remove(&method);
        })
    }

    pub fn set_fallback_request_handler(&self, handler: FallbackRequestHandler) {
        *self.fallback_request_handler.lock() = Some(handler);
    }

    pub fn set_unhandled_notification_handler(&self, handler: UnhandledNotificationHandler) {
        *self.unhandled_notification_handler.lock() = Some(handler);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    pub fn close_cause(&self) -> Option<CloseCause> {
        *self.close_cause.lock()
    }

    /// Subscribes to the close event. If the connection is already closed the
    /// callback fires immediately with the recorded cause.
    pub fn on_close(&self, callback: impl Fn(CloseCause) + Send + Sync + 'static) -> Disposable {
        if let Some(cause) = self.close_cause() {
            callback(cause);
            return Disposable::noop();
        }
        self.on_close.subscribe(move |cause| callback(*cause))
    }

    /// Resolves once the connection has closed (either direction).
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Tears the connection down: fails every pending outbound request with
    /// `ConnectionClosed`, cancels in-flight inbound handlers, stops the IO
    /// tasks and fires the close event. Idempotent.
    pub fn close(&self, cause: CloseCause) {
        {
            let mut recorded = self.close_cause.lock();
            if recorded.is_some() {
                return;
            }
            *recorded = Some(cause);
        }
        let _ = self.closed_tx.send(true);
        let _ = self.outgoing_tx.send(Outbound::Shutdown);

        let pending_ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in pending_ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
        }

        let cancellations: Vec<CancellationToken> = self
            .inbound_cancellations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for token in cancellations {
            token.cancel();
        }

        debug!(peer = %self.peer, ?cause, "connection closed");
        self.on_close.fire(&cause);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Connection::new(a_read, a_write, "left"),
            Connection::new(b_read, b_write, "right"),
        )
    }

    #[tokio::test]
    async fn request_and_response_round_trip() {
        let (left, right) = pair();
        right.on_request("math/add", |params, _token| {
            Box::pin(async move {
                let params = params.unwrap_or(Value::Null);
                let a = params["a"].as_i64().unwrap_or(0);
                let b = params["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            })
        });
        left.listen();
        right.listen();

        let result = left
            .request("math/add", Some(json!({"a": 2, "b": 3})))
            .await
            .unwrap();
        assert_eq!(result, json!(5));
    }

    #[tokio::test]
    async fn unknown_request_gets_method_not_found() {
        let (left, right) = pair();
        left.listen();
        right.listen();

        let err = left.request("does/notExist", None).await.unwrap_err();
        match err {
            Error::Response(response) => {
                assert_eq!(response.code, crate::error::codes::METHOD_NOT_FOUND)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn notifications_reach_registered_handlers() {
        let (left, right) = pair();
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        right.on_notification("ping", move |params| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(params);
            }
        });
        left.listen();
        right.listen();

        left.send_notification("ping", Some(json!({"n": 1})));
        let received = rx.await.unwrap();
        assert_eq!(received, Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn cancel_request_cancels_the_inbound_token() {
        let (left, right) = pair();
        right.on_request("slow/op", |_params, token| {
            Box::pin(async move {
                token.cancelled().await;
                Err(ResponseError::new(
                    crate::error::codes::REQUEST_CANCELLED,
                    "cancelled",
                ))
            })
        });
        left.listen();
        right.listen();

        let pending = left.send_request("slow/op", None);
        left.cancel(pending.id);
        let err = pending.response().await.unwrap_err();
        match err {
            Error::Response(response) => {
                assert_eq!(response.code, crate::error::codes::REQUEST_CANCELLED)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn remote_close_fails_pending_requests() {
        let (left, right) = pair();
        right.on_request("never/answers", |_params, _token| {
            Box::pin(async move {
                std::future::pending::<()>().await;
                unreachable!()
            })
        });
        left.listen();
        right.listen();

        let pending = left.send_request("never/answers", None);
        right.close(CloseCause::Local);
        assert_eq!(pending.response().await.unwrap_err(), Error::ConnectionClosed);

        left.closed().await;
        assert_eq!(left.close_cause(), Some(CloseCause::Remote));
    }

    #[tokio::test]
    async fn close_fires_subscribers_and_late_subscribers() {
        let (left, _right) = pair();
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let _sub = left.on_close(move |cause| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(cause);
            }
        });
        left.close(CloseCause::Local);
        assert_eq!(rx.await.unwrap(), CloseCause::Local);

        let late = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let late_clone = late.clone();
        let _late_sub = left.on_close(move |_| late_clone.store(true, Ordering::SeqCst));
        assert!(late.load(Ordering::SeqCst));
    }
}
