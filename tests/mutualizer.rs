//! End-to-end scenarios: real bindings and a real language client wired to a
//! scripted fake server over in-memory pipes.

mod common;

use std::time::Duration;

use serde_json::{Value, json};

use common::{Harness, TestClient, default_capabilities, harness, hover_params, test_options};
use lsp_mutualizer::binding::{EndCause, bind_language_client};
use lsp_mutualizer::error::{Error, codes};
use lsp_mutualizer::rpc::{CloseCause, Connection};

const M_JSON: &str = "inmemory://m.json";
const A_JSON: &str = "inmemory://a.json";
const B_JSON: &str = "inmemory://b.json";

async fn attach(harness: &Harness, name: &str) -> TestClient {
    TestClient::attach(harness, name, json!({})).await
}

#[tokio::test]
async fn s1_shared_file_edits_coalesce_and_late_joiner_gets_diagnostics() {
    let h = harness(default_capabilities(), test_options());
    let a = attach(&h, "a").await;

    a.open(M_JSON, "json", "{}");
    h.server.wait_for("textDocument/didOpen", 1).await;

    // Two quick edits inside one debounce window.
    a.change_full(M_JSON, 2, "{\"x\": 1}");
    a.change_full(M_JSON, 3, "{\"x\": 12}");
    let changes = h.server.wait_for("textDocument/didChange", 1).await;
    h.server.assert_no_more("textDocument/didChange", 1).await;
    assert_eq!(changes[0]["textDocument"]["version"], json!(2));

    // The server publishes diagnostics for the shared document.
    h.server.connection.send_notification(
        "textDocument/publishDiagnostics",
        Some(json!({
            "uri": M_JSON,
            "diagnostics": [{
                "range": {
                    "start": {"line": 0, "character": 0},
                    "end": {"line": 0, "character": 1},
                },
                "message": "something is off",
            }],
        })),
    );
    a.recorder.wait_for("textDocument/publishDiagnostics", 1).await;

    // A late joiner opens the same URI: no second didOpen reaches the
    // server, and the cached squiggles arrive immediately.
    let b = attach(&h, "b").await;
    b.open(M_JSON, "json", "{\"x\": 12}");
    let cached = b.recorder.wait_for("textDocument/publishDiagnostics", 1).await;
    assert_eq!(cached[0]["diagnostics"][0]["message"], json!("something is off"));
    h.server.assert_no_more("textDocument/didOpen", 1).await;
}

#[tokio::test]
async fn s2_independent_files_do_not_interfere() {
    let h = harness(default_capabilities(), test_options());
    let a = attach(&h, "a").await;
    let b = attach(&h, "b").await;

    a.open(A_JSON, "json", "{\"a\": true}");
    b.open(B_JSON, "json", "{\"b\": true}");
    let opens = h.server.wait_for("textDocument/didOpen", 2).await;
    let opened: Vec<&str> = opens
        .iter()
        .map(|o| o["textDocument"]["uri"].as_str().unwrap())
        .collect();
    assert!(opened.contains(&A_JSON) && opened.contains(&B_JSON));

    a.change_full(A_JSON, 2, "{\"a\": false}");
    let changes = h.server.wait_for("textDocument/didChange", 1).await;
    assert_eq!(changes[0]["textDocument"]["uri"], json!(A_JSON));
    h.server.assert_no_more("textDocument/didChange", 1).await;

    a.close(A_JSON);
    let closes = h.server.wait_for("textDocument/didClose", 1).await;
    assert_eq!(closes[0]["textDocument"]["uri"], json!(A_JSON));
    h.server.assert_no_more("textDocument/didClose", 1).await;

    let still_open = h.client.open_document_uris();
    assert_eq!(still_open.len(), 1);
    assert_eq!(still_open[0].as_str(), B_JSON);
}

#[tokio::test]
async fn s3_identical_hovers_collapse_to_one_upstream_call() {
    let h = harness(default_capabilities(), test_options());
    let a = attach(&h, "a").await;
    let b = attach(&h, "b").await;

    a.open(M_JSON, "json", "{}");
    h.server.wait_for("textDocument/didOpen", 1).await;
    h.server
        .set_response("textDocument/hover", json!({"contents": "shared docs"}));

    let (from_a, from_b) = tokio::join!(
        a.request("textDocument/hover", hover_params(M_JSON, 1, 2)),
        b.request("textDocument/hover", hover_params(M_JSON, 1, 2)),
    );
    assert_eq!(from_a.unwrap(), json!({"contents": "shared docs"}));
    assert_eq!(from_b.unwrap(), json!({"contents": "shared docs"}));
    assert_eq!(h.server.request_count("textDocument/hover"), 1);
}

#[tokio::test]
async fn s4_document_mutation_invalidates_the_cache() {
    let h = harness(default_capabilities(), test_options());
    let a = attach(&h, "a").await;
    let b = attach(&h, "b").await;

    a.open(M_JSON, "json", "{}");
    h.server.wait_for("textDocument/didOpen", 1).await;
    h.server
        .set_response("textDocument/hover", json!({"contents": "docs"}));

    a.request("textDocument/hover", hover_params(M_JSON, 1, 2))
        .await
        .unwrap();
    assert_eq!(h.server.request_count("textDocument/hover"), 1);

    // A types a character; once the debounced flush went out the cache is
    // empty and the next hover goes upstream again.
    a.change_full(M_JSON, 2, "{ }");
    h.server.wait_for("textDocument/didChange", 1).await;
    b.request("textDocument/hover", hover_params(M_JSON, 1, 2))
        .await
        .unwrap();
    assert_eq!(h.server.request_count("textDocument/hover"), 2);
}

#[tokio::test]
async fn s5_exhausted_diff_budget_falls_back_to_one_full_replace() {
    let mut options = test_options();
    options.diff_budget = Duration::ZERO;
    let h = harness(default_capabilities(), options);
    let a = attach(&h, "a").await;

    let old_text = "x".repeat(200_000);
    let new_text = "y".repeat(200_000);
    a.open(M_JSON, "json", &old_text);
    h.server.wait_for("textDocument/didOpen", 1).await;

    a.change_full(M_JSON, 2, &new_text);
    let changes = h.server.wait_for("textDocument/didChange", 1).await;
    h.server.assert_no_more("textDocument/didChange", 1).await;

    let content_changes = changes[0]["contentChanges"].as_array().unwrap();
    assert_eq!(content_changes.len(), 1);
    // A full-text change carries no range.
    assert!(content_changes[0].get("range").is_none_or(Value::is_null));
    assert_eq!(content_changes[0]["text"].as_str().unwrap(), new_text);
    assert_eq!(changes[0]["textDocument"]["version"], json!(2));
}

#[tokio::test]
async fn s6_server_disconnect_ends_every_binding_and_blocks_new_attaches() {
    let h = harness(default_capabilities(), test_options());
    let a = attach(&h, "a").await;
    let b = attach(&h, "b").await;

    h.server.connection.close(CloseCause::Local);

    assert_eq!(a.end_cause().await, EndCause::Server);
    assert_eq!(b.end_cause().await, EndCause::Server);
    assert!(h.client.is_disposed());

    // A subsequent attach fails cleanly.
    let (_client_side, binding_side) = tokio::io::duplex(4096);
    let (read, write) = tokio::io::split(binding_side);
    let connection = Connection::new(read, write, "client:late");
    let err = bind_language_client(h.client.clone(), connection)
        .await
        .unwrap_err();
    assert_eq!(err, Error::ConnectionClosed);
}

#[tokio::test]
async fn client_disconnect_only_ends_that_binding() {
    let h = harness(default_capabilities(), test_options());
    let a = attach(&h, "a").await;
    let b = attach(&h, "b").await;

    a.open(A_JSON, "json", "{}");
    b.open(B_JSON, "json", "{}");
    h.server.wait_for("textDocument/didOpen", 2).await;

    a.recorder.connection.close(CloseCause::Local);
    assert_eq!(a.end_cause().await, EndCause::Client);

    // A's documents are closed on the server, B's stay, the broker lives on.
    let closes = h.server.wait_for("textDocument/didClose", 1).await;
    assert_eq!(closes[0]["textDocument"]["uri"], json!(A_JSON));
    assert!(!h.client.is_disposed());

    h.server
        .set_response("textDocument/hover", json!({"contents": "still here"}));
    let hover = b
        .request("textDocument/hover", hover_params(B_JSON, 0, 0))
        .await
        .unwrap();
    assert_eq!(hover, json!({"contents": "still here"}));
}

#[tokio::test]
async fn refresh_requests_are_gated_on_client_capabilities() {
    let h = harness(default_capabilities(), test_options());
    let a = TestClient::attach(
        &h,
        "a",
        json!({"workspace": {"codeLens": {"refreshSupport": true}}}),
    )
    .await;
    let b = attach(&h, "b").await;

    h.server
        .connection
        .request("workspace/codeLens/refresh", None)
        .await
        .unwrap();

    a.recorder.wait_for("workspace/codeLens/refresh", 1).await;
    b.recorder.assert_no_more("workspace/codeLens/refresh", 0).await;
}

#[tokio::test]
async fn apply_edit_is_filtered_rewritten_and_claimed_by_one_binding() {
    let h = harness(default_capabilities(), test_options());
    let a = attach(&h, "a").await;
    let b = attach(&h, "b").await;

    a.open(A_JSON, "json", "{}");
    b.open(B_JSON, "json", "{}");
    h.server.wait_for("textDocument/didOpen", 2).await;

    // The client-side version of a.json moves to 5; the broker must stamp
    // the forwarded edit with that, not the server's idea of the version.
    a.change_full(A_JSON, 5, "{\"edited\": true}");
    h.server.wait_for("textDocument/didChange", 1).await;

    a.recorder
        .set_response("workspace/applyEdit", json!({"applied": true}));
    b.recorder
        .set_response("workspace/applyEdit", json!({"applied": false}));

    let response = h
        .server
        .connection
        .request(
            "workspace/applyEdit",
            Some(json!({
                "edit": {
                    "documentChanges": [{
                        "textDocument": { "uri": A_JSON, "version": 99 },
                        "edits": [],
                    }],
                }
            })),
        )
        .await
        .unwrap();
    assert_eq!(response["applied"], json!(true));

    let to_a = a.recorder.wait_for("workspace/applyEdit", 1).await;
    let forwarded = &to_a[0]["edit"]["documentChanges"][0];
    assert_eq!(forwarded["textDocument"]["uri"], json!(A_JSON));
    assert_eq!(forwarded["textDocument"]["version"], json!(5));

    // The other client still hears about the edit, just with nothing in it.
    let to_b = b.recorder.wait_for("workspace/applyEdit", 1).await;
    assert_eq!(
        to_b[0]["edit"]["documentChanges"].as_array().map(Vec::len),
        Some(0)
    );
}

#[tokio::test]
async fn dynamic_registrations_replay_to_clients_minus_broker_owned_methods() {
    let h = harness(default_capabilities(), test_options());
    let a = attach(&h, "a").await;

    a.open(A_JSON, "json", "{}");
    h.server.wait_for("textDocument/didOpen", 1).await;

    h.server
        .connection
        .request(
            "client/registerCapability",
            Some(json!({
                "registrations": [
                    {"id": "r-completion", "method": "textDocument/completion", "registerOptions": {}},
                    {"id": "r-open", "method": "textDocument/didOpen", "registerOptions": {"documentSelector": null}},
                ]
            })),
        )
        .await
        .unwrap();

    // Live clients hear about the completion registration only.
    let to_a = a.recorder.wait_for("client/registerCapability", 1).await;
    let registrations = to_a[0]["registrations"].as_array().unwrap();
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0]["id"], json!("r-completion"));

    // The late didOpen registration replays the open document to the server.
    h.server.wait_for("textDocument/didOpen", 2).await;

    // A client attaching later receives the same filtered replay.
    let b = attach(&h, "b").await;
    let to_b = b.recorder.wait_for("client/registerCapability", 1).await;
    let replayed = to_b[0]["registrations"].as_array().unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0]["id"], json!("r-completion"));
}

#[tokio::test]
async fn advertised_capabilities_are_transformed_for_clients() {
    let capabilities = json!({
        // Full sync as a bare kind, plus workspace folder support.
        "textDocumentSync": 1,
        "workspace": {"workspaceFolders": {"supported": true}},
    });
    let h = harness(capabilities, test_options());
    let a = attach(&h, "a").await;

    let advertised = &a.initialize_result["capabilities"];
    assert_eq!(advertised["textDocumentSync"]["openClose"], json!(true));
    // Incremental toward clients no matter what the server speaks.
    assert_eq!(advertised["textDocumentSync"]["change"], json!(2));
    assert_eq!(advertised["textDocumentSync"]["willSave"], json!(false));
    assert_eq!(
        advertised["workspace"]["workspaceFolders"]["supported"],
        json!(false)
    );
    assert_eq!(a.initialize_result["serverInfo"]["name"], json!("lsp-mutualizer"));
}

#[tokio::test]
async fn client_configuration_notifications_are_swallowed() {
    let h = harness(default_capabilities(), test_options());
    let a = attach(&h, "a").await;

    a.recorder.connection.send_notification(
        "workspace/didChangeConfiguration",
        Some(json!({"settings": {"everything": true}})),
    );
    h.server
        .assert_no_more("workspace/didChangeConfiguration", 0)
        .await;
}

#[tokio::test]
async fn watched_file_events_are_filtered_by_server_registrations() {
    let h = harness(default_capabilities(), test_options());
    let a = attach(&h, "a").await;

    // Nothing registered: events are dropped.
    a.recorder.connection.send_notification(
        "workspace/didChangeWatchedFiles",
        Some(json!({"changes": [{"uri": "file:///app/Cargo.toml", "type": 2}]})),
    );
    h.server
        .assert_no_more("workspace/didChangeWatchedFiles", 0)
        .await;

    h.server
        .connection
        .request(
            "client/registerCapability",
            Some(json!({
                "registrations": [{
                    "id": "w1",
                    "method": "workspace/didChangeWatchedFiles",
                    "registerOptions": {"watchers": [{"globPattern": "**/*.toml"}]},
                }]
            })),
        )
        .await
        .unwrap();

    a.recorder.connection.send_notification(
        "workspace/didChangeWatchedFiles",
        Some(json!({"changes": [
            {"uri": "file:///app/Cargo.toml", "type": 2},
            {"uri": "file:///app/readme.md", "type": 2},
        ]})),
    );
    let forwarded = h.server.wait_for("workspace/didChangeWatchedFiles", 1).await;
    let changes = forwarded[0]["changes"].as_array().unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["uri"], json!("file:///app/Cargo.toml"));
}

#[tokio::test]
async fn requests_outside_the_forwarded_set_get_method_not_found() {
    let h = harness(default_capabilities(), test_options());
    let a = attach(&h, "a").await;

    // Both a made-up method and a real LSP method the broker does not proxy
    // (document symbols) take the unknown-request path.
    for method in ["custom/brandNewThing", "textDocument/documentSymbol"] {
        let err = a.request(method, json!({})).await.unwrap_err();
        match err {
            Error::Response(response) => assert_eq!(response.code, codes::METHOD_NOT_FOUND),
            other => panic!("unexpected error for {}: {:?}", method, other),
        }
    }
    assert_eq!(h.server.request_count("textDocument/documentSymbol"), 0);
}

#[tokio::test]
async fn did_change_versions_increase_by_one_per_flush() {
    let h = harness(default_capabilities(), test_options());
    let a = attach(&h, "a").await;

    a.open(M_JSON, "json", "v0");
    h.server.wait_for("textDocument/didOpen", 1).await;

    a.change_full(M_JSON, 7, "v1");
    h.server.wait_for("textDocument/didChange", 1).await;
    a.change_full(M_JSON, 19, "v2");
    let changes = h.server.wait_for("textDocument/didChange", 2).await;

    // Whatever versions clients use, the server sees 2, 3, ...
    let versions: Vec<i64> = changes
        .iter()
        .map(|c| c["textDocument"]["version"].as_i64().unwrap())
        .collect();
    assert_eq!(versions, vec![2, 3]);
}
