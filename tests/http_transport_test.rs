//! Event-stream transport integration tests
//!
//! Runs `HttpTransport` against a `wiremock` mock server.
//!
//! # wiremock body helpers
//!
//! Use `set_body_raw(bytes, mime)` for SSE responses so that the
//! `Content-Type` is exactly `text/event-stream`. `set_body_string` forces
//! `text/plain` and would send the transport down the JSON branch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use capwire::config::Config;
use capwire::transport::http::{HttpTransport, PROTOCOL_VERSION_HEADER, SESSION_HEADER};
use capwire::transport::Transport;
use capwire::types::LATEST_PROTOCOL_VERSION;
use capwire::{ConnectionManager, ConnectionState};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A connected transport pointing at the given base URL.
async fn make_transport(base_url: &str) -> HttpTransport {
    let transport = HttpTransport::new(
        url::Url::parse(base_url).expect("valid url"),
        HashMap::new(),
        Duration::from_secs(5),
    )
    .expect("client builds");
    transport.connect().await.expect("connect");
    transport
}

/// Collect every buffered message, stopping at the first quiet `deadline`.
async fn drain_receive(transport: &HttpTransport, deadline: Duration) -> Vec<String> {
    let mut messages = Vec::new();
    let mut stream = transport.receive();
    while let Ok(Some(msg)) = tokio::time::timeout(deadline, stream.next()).await {
        messages.push(msg);
    }
    messages
}

const REQUEST: &str = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#;

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_json_response_is_forwarded_to_receive() {
    let server = MockServer::start().await;
    let body = r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "application/json"),
        )
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri()).await;
    transport.send(REQUEST.to_string()).await.expect("send");

    let messages = drain_receive(&transport, Duration::from_millis(200)).await;
    assert_eq!(messages, vec![body.to_string()]);
}

#[tokio::test]
async fn test_sse_events_are_forwarded_in_order() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "id: 1\n",
        "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"first\":true}}\n",
        "\n",
        "id: 2\n",
        "data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"second\":true}}\n",
        "\n",
    );
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri()).await;
    transport.send(REQUEST.to_string()).await.expect("send");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let messages = drain_receive(&transport, Duration::from_millis(200)).await;
    assert_eq!(messages.len(), 2, "got: {messages:?}");
    let first: Value = serde_json::from_str(&messages[0]).unwrap();
    let second: Value = serde_json::from_str(&messages[1]).unwrap();
    assert_eq!(first["result"]["first"], true);
    assert_eq!(second["result"]["second"], true);
}

#[tokio::test]
async fn test_sse_keepalives_are_dropped() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "event: ping\n",
        "data: {}\n",
        "\n",
        "data: [PING]\n",
        "\n",
        "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n",
        "\n",
    );
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri()).await;
    transport.send(REQUEST.to_string()).await.expect("send");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let messages = drain_receive(&transport, Duration::from_millis(200)).await;
    assert_eq!(messages.len(), 1, "got: {messages:?}");
}

#[tokio::test]
async fn test_accepted_delivers_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri()).await;
    transport
        .send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.to_string())
        .await
        .expect("202 is a successful send");

    let messages = drain_receive(&transport, Duration::from_millis(100)).await;
    assert!(messages.is_empty());
}

// ---------------------------------------------------------------------------
// Headers and errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_protocol_version_header_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header(PROTOCOL_VERSION_HEADER, LATEST_PROTOCOL_VERSION))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri()).await;
    transport.send(REQUEST.to_string()).await.expect("send");
}

#[tokio::test]
async fn test_session_id_is_echoed_on_later_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header(SESSION_HEADER, "session-abc"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(SESSION_HEADER, "session-abc")
                .set_body_raw(
                    br#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_vec(),
                    "application/json",
                ),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri()).await;
    transport.send(REQUEST.to_string()).await.expect("first send");
    assert_eq!(transport.session_id().await.as_deref(), Some("session-abc"));

    transport.send(REQUEST.to_string()).await.expect("second send");
}

#[tokio::test]
async fn test_expired_session_clears_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header(SESSION_HEADER, "session-abc"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(SESSION_HEADER, "session-abc")
                .set_body_raw(br#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_vec(), "application/json"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri()).await;
    transport.send(REQUEST.to_string()).await.expect("first send");

    let err = transport.send(REQUEST.to_string()).await.unwrap_err();
    assert!(err.to_string().contains("session expired"), "got: {err}");
    assert_eq!(transport.session_id().await, None);
}

#[tokio::test]
async fn test_unauthorized_reports_challenge() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", r#"Bearer realm="caps""#),
        )
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri()).await;
    let err = transport.send(REQUEST.to_string()).await.unwrap_err();

    let message = err.to_string();
    assert!(message.contains("unauthorized"), "got: {message}");
    assert!(message.contains("realm"), "got: {message}");
}

#[tokio::test]
async fn test_send_before_connect_fails() {
    let transport = HttpTransport::new(
        url::Url::parse("http://127.0.0.1:9").unwrap(),
        HashMap::new(),
        Duration::from_secs(1),
    )
    .unwrap();

    assert!(transport.send(REQUEST.to_string()).await.is_err());
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

/// Answers by method, echoing the request id.
struct ScriptedProvider;

impl Respond for ScriptedProvider {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
            return ResponseTemplate::new(400);
        };
        let Some(id) = body.get("id").cloned() else {
            return ResponseTemplate::new(202);
        };
        let result = match body["method"].as_str() {
            Some("initialize") => json!({
                "protocolVersion": LATEST_PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "wiremock", "version": "0.0.1" }
            }),
            Some("tools/list") => json!({ "tools": [{ "name": "echo", "inputSchema": {} }] }),
            _ => json!({}),
        };
        ResponseTemplate::new(200).set_body_raw(
            json!({ "jsonrpc": "2.0", "id": id, "result": result })
                .to_string()
                .into_bytes(),
            "application/json",
        )
    }
}

#[tokio::test]
async fn test_manager_negotiates_and_requests_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ScriptedProvider)
        .mount(&server)
        .await;

    let transport = HttpTransport::new(
        url::Url::parse(&server.uri()).unwrap(),
        HashMap::new(),
        Duration::from_secs(5),
    )
    .unwrap();
    let mut config = Config::default();
    config.connection.heartbeat_interval_ms = 0;
    let manager = ConnectionManager::new(Arc::new(transport), &config);

    let negotiated = manager.connect().await.expect("handshake over http");
    assert_eq!(negotiated.server_info.name, "wiremock");
    assert_eq!(manager.state(), ConnectionState::Ready);

    let listed = manager.request("tools/list", json!({})).await.unwrap();
    assert_eq!(listed["tools"][0]["name"], "echo");

    manager.close().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Closed);
}
