//! In-process harness: a scripted fake language server and raw test clients,
//! all speaking framed JSON-RPC over `tokio::io::duplex` pipes through the
//! same connection layer the broker uses in production.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use lsp_mutualizer::binding::{EndCause, bind_language_client};
use lsp_mutualizer::client::LanguageClient;
use lsp_mutualizer::config::MutualizerOptions;
use lsp_mutualizer::error::Result;
use lsp_mutualizer::rpc::Connection;

pub const WAIT: Duration = Duration::from_secs(5);

/// Debounce short enough to keep the tests snappy but long enough that two
/// consecutive edits still coalesce.
pub fn test_options() -> MutualizerOptions {
    MutualizerOptions {
        change_debounce: Duration::from_millis(50),
        client_initialization_timeout: Duration::from_secs(2),
        ..MutualizerOptions::default()
    }
}

#[derive(Default)]
struct Recorded {
    notifications: Vec<(String, Value)>,
    requests: Vec<(String, Value)>,
}

/// One recorded endpoint: every unhandled inbound message lands here, and
/// requests are answered from a per-method response table (null by default).
pub struct Recorder {
    pub connection: Arc<Connection>,
    recorded: Arc<Mutex<Recorded>>,
    changed: Arc<Notify>,
    responses: Arc<Mutex<HashMap<String, Value>>>,
}

impl Recorder {
    fn attach(connection: Arc<Connection>) -> Self {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let changed = Arc::new(Notify::new());
        let responses: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));

        {
            let recorded = recorded.clone();
            let changed = changed.clone();
            connection.set_unhandled_notification_handler(Arc::new(move |method, params| {
                recorded
                    .lock()
                    .notifications
                    .push((method.to_string(), params.cloned().unwrap_or(Value::Null)));
                changed.notify_waiters();
            }));
        }
        {
            let recorded = recorded.clone();
            let changed = changed.clone();
            let responses = responses.clone();
            connection.set_fallback_request_handler(Arc::new(move |method, params, _token| {
                recorded
                    .lock()
                    .requests
                    .push((method.clone(), params.unwrap_or(Value::Null)));
                changed.notify_waiters();
                let response = responses.lock().get(&method).cloned().unwrap_or(Value::Null);
                Box::pin(async move { Ok(response) })
            }));
        }

        Recorder {
            connection,
            recorded,
            changed,
            responses,
        }
    }

    pub fn set_response(&self, method: &str, value: Value) {
        self.responses.lock().insert(method.to_string(), value);
    }

    pub fn notifications(&self, method: &str) -> Vec<Value> {
        self.recorded
            .lock()
            .notifications
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.recorded
            .lock()
            .requests
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn request_count(&self, method: &str) -> usize {
        self.requests(method).len()
    }

    /// Waits until `method` has been seen at least `count` times (requests
    /// and notifications both count).
    pub async fn wait_for(&self, method: &str, count: usize) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let seen: Vec<Value> = {
                let recorded = self.recorded.lock();
                recorded
                    .notifications
                    .iter()
                    .chain(recorded.requests.iter())
                    .filter(|(m, _)| m == method)
                    .map(|(_, params)| params.clone())
                    .collect()
            };
            if seen.len() >= count {
                return seen;
            }
            let notified = self.changed.notified();
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {}x {} (saw {})",
                    count,
                    method,
                    seen.len()
                );
            }
            let _ = tokio::time::timeout(Duration::from_millis(100), notified).await;
        }
    }

    /// Lets in-flight traffic settle, then asserts nothing more arrived.
    pub async fn assert_no_more(&self, method: &str, count: usize) {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let seen = self.notifications(method).len() + self.request_count(method);
        assert_eq!(seen, count, "unexpected extra {} traffic", method);
    }
}

/// The fake upstream server plus the broker-side language client around it.
pub struct Harness {
    pub server: Recorder,
    pub client: Arc<LanguageClient>,
}

pub fn default_capabilities() -> Value {
    json!({
        // Incremental sync with open/close and save support.
        "textDocumentSync": 2,
        "hoverProvider": true,
        "completionProvider": {},
    })
}

pub fn harness(capabilities: Value, options: MutualizerOptions) -> Harness {
    let (broker_side, server_side) = tokio::io::duplex(1 << 20);
    let (broker_read, broker_write) = tokio::io::split(broker_side);
    let (server_read, server_write) = tokio::io::split(server_side);

    let server_connection = Connection::new(server_read, server_write, "fake-server");
    {
        let capabilities = capabilities.clone();
        server_connection.on_request("initialize", move |_params, _token| {
            let capabilities = capabilities.clone();
            Box::pin(async move {
                Ok(json!({
                    "capabilities": capabilities,
                    "serverInfo": { "name": "fake-server" },
                }))
            })
        });
        server_connection.on_request("shutdown", |_params, _token| {
            Box::pin(async { Ok(Value::Null) })
        });
    }
    let server = Recorder::attach(server_connection);
    server.connection.listen();

    let broker_connection = Connection::new(broker_read, broker_write, "server");
    let client = LanguageClient::new(broker_connection, options);

    Harness { server, client }
}

/// A raw LSP client attached through a real binding.
pub struct TestClient {
    pub recorder: Recorder,
    pub binding: JoinHandle<Result<EndCause>>,
    pub initialize_result: Value,
}

impl TestClient {
    /// Runs the full attach protocol and returns once `initialized` is out.
    pub async fn attach(harness: &Harness, name: &str, client_capabilities: Value) -> Self {
        let (client_side, binding_side) = tokio::io::duplex(1 << 20);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (binding_read, binding_write) = tokio::io::split(binding_side);

        let binding_connection =
            Connection::new(binding_read, binding_write, format!("client:{}", name));
        let binding = tokio::spawn(bind_language_client(
            harness.client.clone(),
            binding_connection,
        ));

        let connection = Connection::new(client_read, client_write, format!("test:{}", name));
        let recorder = Recorder::attach(connection);
        recorder.connection.listen();

        let initialize_result = tokio::time::timeout(
            WAIT,
            recorder.connection.request(
                "initialize",
                Some(json!({
                    "processId": null,
                    "rootUri": null,
                    "capabilities": client_capabilities,
                })),
            ),
        )
        .await
        .expect("initialize timed out")
        .expect("initialize failed");
        assert!(initialize_result.get("capabilities").is_some());

        recorder
            .connection
            .send_notification("initialized", Some(json!({})));

        // Let the binding finish its post-initialized wiring before the test
        // starts pumping traffic.
        tokio::time::sleep(Duration::from_millis(50)).await;

        TestClient {
            recorder,
            binding,
            initialize_result,
        }
    }

    pub fn open(&self, uri: &str, language_id: &str, text: &str) {
        self.recorder.connection.send_notification(
            "textDocument/didOpen",
            Some(json!({
                "textDocument": {
                    "uri": uri,
                    "languageId": language_id,
                    "version": 1,
                    "text": text,
                }
            })),
        );
    }

    pub fn change_full(&self, uri: &str, version: i32, text: &str) {
        self.recorder.connection.send_notification(
            "textDocument/didChange",
            Some(json!({
                "textDocument": { "uri": uri, "version": version },
                "contentChanges": [{ "text": text }],
            })),
        );
    }

    pub fn close(&self, uri: &str) {
        self.recorder.connection.send_notification(
            "textDocument/didClose",
            Some(json!({ "textDocument": { "uri": uri } })),
        );
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        tokio::time::timeout(WAIT, self.recorder.connection.request(method, Some(params)))
            .await
            .expect("request timed out")
    }

    pub async fn end_cause(self) -> EndCause {
        tokio::time::timeout(WAIT, self.binding)
            .await
            .expect("binding did not end in time")
            .expect("binding task panicked")
            .expect("binding ended with an error")
    }
}

pub fn hover_params(uri: &str, line: u32, character: u32) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character },
    })
}
