//! Shared fixtures: a scripted provider behind `FakeTransport`.
//!
//! The provider answers `initialize`, `ping`, the three listings,
//! `resources/read` and `tools/call`. Batched requests are answered with a
//! batch in reverse order so tests exercise id-based matching. Every frame
//! the client sends is recorded for inspection.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capwire::config::Config;
use capwire::transport::fake::{FakeControl, FakeTransport, FakeTransportHandle};
use capwire::types::LATEST_PROTOCOL_VERSION;
use capwire::{ConnectionManager, ConnectionState, InvocationExecutor};
use serde_json::{json, Value};

/// What the scripted provider offers.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub templates: Vec<Value>,
    pub contents: HashMap<String, String>,
    pub page_size: Option<usize>,
    pub offer_tools: bool,
    pub offer_resources: bool,
}

impl Default for ProviderSpec {
    fn default() -> Self {
        Self {
            tools: vec![
                json!({ "name": "echo", "inputSchema": { "type": "object" } }),
                json!({
                    "name": "typed",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "a": { "type": "number" },
                            "b": { "type": "string", "enum": ["x", "y"] }
                        },
                        "required": ["a", "b"]
                    }
                }),
                json!({ "name": "slow", "inputSchema": {} }),
            ],
            resources: vec![json!({ "uri": "mem://doc", "name": "doc", "mimeType": "text/plain" })],
            templates: vec![json!({ "uriTemplate": "mem://docs/{name}", "name": "docs" })],
            contents: HashMap::from([("mem://doc".to_string(), "hello world".to_string())]),
            page_size: None,
            offer_tools: true,
            offer_resources: true,
        }
    }
}

#[derive(Debug, Default)]
struct Switches {
    hold_calls: AtomicBool,
    mute_pings: AtomicBool,
}

/// Test-side view of the scripted provider.
#[derive(Debug, Clone)]
pub struct FakeProvider {
    control: FakeControl,
    frames: Arc<Mutex<Vec<Value>>>,
    switches: Arc<Switches>,
}

impl FakeProvider {
    pub fn spawn(mut handle: FakeTransportHandle, spec: ProviderSpec) -> Self {
        let provider = Self {
            control: handle.control(),
            frames: Arc::new(Mutex::new(Vec::new())),
            switches: Arc::new(Switches::default()),
        };
        let task = provider.clone();
        tokio::spawn(async move {
            while let Some(raw) = handle.next_outbound().await {
                let Ok(frame) = serde_json::from_str::<Value>(&raw) else {
                    continue;
                };
                task.frames.lock().unwrap().push(frame.clone());
                let reply = match &frame {
                    Value::Array(items) => {
                        let mut replies: Vec<Value> =
                            items.iter().filter_map(|r| task.answer(&spec, r)).collect();
                        replies.reverse();
                        (!replies.is_empty()).then(|| Value::Array(replies))
                    }
                    single => task.answer(&spec, single),
                };
                if let Some(reply) = reply {
                    task.control.inject(reply);
                }
            }
        });
        provider
    }

    fn answer(&self, spec: &ProviderSpec, request: &Value) -> Option<Value> {
        let id = request.get("id")?.clone();
        let method = request.get("method")?.as_str()?;
        let params = request.get("params").cloned().unwrap_or(json!({}));

        let result: Result<Value, (i64, &str)> = match method {
            "initialize" => {
                let mut capabilities = json!({});
                if spec.offer_tools {
                    capabilities["tools"] = json!({ "listChanged": true });
                }
                if spec.offer_resources {
                    capabilities["resources"] = json!({ "listChanged": true });
                }
                Ok(json!({
                    "protocolVersion": LATEST_PROTOCOL_VERSION,
                    "capabilities": capabilities,
                    "serverInfo": { "name": "scripted", "version": "1.0.0" }
                }))
            }
            "ping" => {
                if self.switches.mute_pings.load(Ordering::SeqCst) {
                    return None;
                }
                Ok(json!({}))
            }
            "tools/list" => Ok(page("tools", &spec.tools, &params, spec.page_size)),
            "resources/list" => Ok(page("resources", &spec.resources, &params, spec.page_size)),
            "resources/templates/list" => Ok(page(
                "resourceTemplates",
                &spec.templates,
                &params,
                spec.page_size,
            )),
            "resources/read" => {
                let uri = params["uri"].as_str().unwrap_or_default().to_string();
                let text = spec.contents.get(&uri).cloned().or_else(|| {
                    uri.strip_prefix("mem://docs/")
                        .map(|name| format!("doc {}", name))
                });
                match text {
                    Some(text) => Ok(json!({
                        "contents": [{ "uri": uri, "mimeType": "text/plain", "text": text }]
                    })),
                    None => Err((-32002, "Resource not found")),
                }
            }
            "tools/call" => {
                if self.switches.hold_calls.load(Ordering::SeqCst) {
                    return None;
                }
                match params["name"].as_str() {
                    Some("slow") => return None,
                    Some("fail") => Err((-32000, "operation failed")),
                    _ => Ok(json!({
                        "content": [{ "type": "text", "text": params["arguments"].to_string() }],
                        "isError": false
                    })),
                }
            }
            _ => Err((-32601, "Method not found")),
        };

        Some(match result {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message }
            }),
        })
    }

    pub fn control(&self) -> FakeControl {
        self.control.clone()
    }

    /// Stop answering `tools/call` (requests are recorded but dropped).
    pub fn hold_calls(&self, hold: bool) {
        self.switches.hold_calls.store(hold, Ordering::SeqCst);
    }

    pub fn mute_pings(&self, mute: bool) {
        self.switches.mute_pings.store(mute, Ordering::SeqCst);
    }

    /// Every request with `method`, in the order they were received.
    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .flat_map(|frame| match frame {
                Value::Array(items) => items.clone(),
                single => vec![single.clone()],
            })
            .filter(|r| r["method"] == method)
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.requests(method).len()
    }

    /// How many transmissions carried at least one `method` request.
    pub fn frames_with(&self, method: &str) -> usize {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| match frame {
                Value::Array(items) => items.iter().any(|r| r["method"] == method),
                single => single["method"] == method,
            })
            .count()
    }
}

fn page(key: &str, items: &[Value], params: &Value, page_size: Option<usize>) -> Value {
    let offset: usize = params["cursor"]
        .as_str()
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let size = page_size.unwrap_or(items.len().max(1));
    let end = (offset + size).min(items.len());
    let mut body = json!({ key: items[offset.min(end)..end].to_vec() });
    if end < items.len() {
        body["nextCursor"] = json!(end.to_string());
    }
    body
}

/// Config tuned for fast tests: no heartbeat, short delays.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.connection.heartbeat_interval_ms = 0;
    config.connection.connect_timeout_ms = 1_000;
    config.connection.request_timeout_ms = 2_000;
    config.connection.reconnect.base_delay_ms = 10;
    config.connection.reconnect.max_delay_ms = 100;
    config.connection.reconnect.jitter_ratio = 0.0;
    config.batching.window_ms = 2;
    config
}

/// A connected manager talking to a scripted provider.
pub async fn connect_manager(config: &Config, spec: ProviderSpec) -> (ConnectionManager, FakeProvider) {
    let (transport, handle) = FakeTransport::new();
    let provider = FakeProvider::spawn(handle, spec);
    let manager = ConnectionManager::new(Arc::new(transport), config);
    manager.connect().await.expect("connect should succeed");
    (manager, provider)
}

/// A connected executor talking to a scripted provider.
pub async fn connect_executor(
    config: &Config,
    spec: ProviderSpec,
) -> (InvocationExecutor, FakeProvider) {
    let (transport, handle) = FakeTransport::new();
    let provider = FakeProvider::spawn(handle, spec);
    let connection = ConnectionManager::new(Arc::new(transport), config);
    let executor = InvocationExecutor::new(connection, config);
    executor.connect().await.expect("connect should succeed");
    (executor, provider)
}

/// Poll `condition` every few milliseconds until it holds or `within`
/// elapses.
pub async fn wait_until(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_state(
    manager: &ConnectionManager,
    state: ConnectionState,
    within: Duration,
) -> bool {
    wait_until(within, || manager.state() == state).await
}
