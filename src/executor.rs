//! Invocation pipeline
//!
//! [`InvocationExecutor`] is the interface callers use. It composes the
//! capability registry, validator, sanitizer, access controller and cache
//! on top of a [`ConnectionManager`]:
//!
//! ```text
//! call:      resolve -> validate -> sanitize -> authorize -> dispatch
//! read:      resolve -> authorize -> cache -> dispatch -> cache update
//! discovery: authorize -> cache -> dispatch -> cache update -> registry
//! ```
//!
//! Every local rejection (validation, permission, rate limit, quota,
//! unsupported capability) happens before anything is written to the wire.
//! Operation results are never cached.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::access::AccessController;
use crate::cache::{CacheManager, CacheScope};
use crate::codec::fingerprint;
use crate::config::Config;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::error::{CapwireError, Result};
use crate::negotiator::{CapabilityRegistry, NegotiatedCapabilities, UriTemplate};
use crate::types::{
    ArgumentSchema, CacheClass, CallToolParams, CallToolResponse, Capability, CapabilityKind,
    ContentPolicy, ListResourceTemplatesResponse, ListResourcesResponse, ListToolsResponse, Page,
    ReadResourceParams, ReadResourceResponse, ResourceContents, METHOD_RESOURCES_READ,
    METHOD_TOOLS_CALL,
};
use crate::validation::{Sanitizer, Validator};

/// Character window over text contents, applied after the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadRange {
    pub offset: usize,
    /// `None` reads to the end.
    pub length: Option<usize>,
}

impl ReadRange {
    pub fn new(offset: usize, length: usize) -> Self {
        Self {
            offset,
            length: Some(length),
        }
    }

    fn apply(&self, text: &str) -> String {
        let chars = text.chars().skip(self.offset);
        match self.length {
            Some(length) => chars.take(length).collect(),
            None => chars.collect(),
        }
    }
}

/// Outcome of a resource read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub uri: String,
    pub contents: Vec<ResourceContents>,
    /// Whether the contents came from the cache.
    pub from_cache: bool,
}

impl ReadResult {
    /// All text contents joined in order.
    pub fn text(&self) -> String {
        self.contents
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect()
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Replaces the configured request timeout.
    pub timeout: Option<Duration>,
    /// Cancels the call when fired.
    pub cancel: Option<CancellationToken>,
}

/// Guard against providers that hand out the same cursor forever.
const MAX_PAGES: usize = 1_000;

type Flight = Shared<BoxFuture<'static, std::result::Result<Value, Arc<anyhow::Error>>>>;

/// Cacheable requests currently on the wire, keyed by fingerprint.
/// Concurrent misses for the same key share one request.
#[derive(Default)]
struct InFlight {
    flights: Mutex<HashMap<String, Flight>>,
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.flights.lock().unwrap_or_else(|p| p.into_inner()).len();
        f.debug_struct("InFlight").field("len", &len).finish()
    }
}

impl InFlight {
    /// Join the flight for `key`, or start one with `start`.
    async fn join(
        &self,
        key: &str,
        start: impl FnOnce() -> BoxFuture<'static, Result<Value>>,
    ) -> Result<Value> {
        let flight = {
            let mut flights = self.flights.lock().unwrap_or_else(|p| p.into_inner());
            match flights.get(key) {
                Some(flight) => flight.clone(),
                None => {
                    let run = start();
                    let flight = async move { run.await.map_err(Arc::new) }.boxed().shared();
                    flights.insert(key.to_string(), flight.clone());
                    flight
                }
            }
        };

        let outcome = flight.clone().await;
        {
            let mut flights = self.flights.lock().unwrap_or_else(|p| p.into_inner());
            if flights.get(key).is_some_and(|f| f.ptr_eq(&flight)) {
                flights.remove(key);
            }
        }
        outcome.map_err(|e| match crate::error::classify(&e) {
            Some(kind) => kind.replicate().into(),
            None => anyhow::anyhow!("{e:#}"),
        })
    }
}

/// Discovery, read and call against one provider session.
#[derive(Debug)]
pub struct InvocationExecutor {
    connection: ConnectionManager,
    registry: Arc<CapabilityRegistry>,
    cache: Arc<CacheManager>,
    validator: Validator,
    sanitizer: Sanitizer,
    access: AccessController,
    in_flight: InFlight,
    listener: Option<JoinHandle<()>>,
}

impl Drop for InvocationExecutor {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

impl InvocationExecutor {
    /// Build an executor over `connection` using the cache and access
    /// sections of `config`.
    ///
    /// When called inside a Tokio runtime, a background task drops cached
    /// discovery results whenever the provider reports a changed capability
    /// list or the connection recovers.
    pub fn new(connection: ConnectionManager, config: &Config) -> Self {
        let registry = Arc::new(CapabilityRegistry::new());
        let cache = Arc::new(CacheManager::new(config.cache.clone()));

        let listener = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(watch_list_changes(
                connection.subscribe(),
                Arc::clone(&registry),
                Arc::clone(&cache),
            ))),
            Err(_) => {
                tracing::warn!("no tokio runtime; capability list changes will not be tracked");
                None
            }
        };

        Self {
            connection,
            registry,
            cache,
            validator: Validator::new(),
            sanitizer: Sanitizer::new(),
            access: AccessController::new(config.access.clone()),
            in_flight: InFlight::default(),
            listener,
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn access(&self) -> &AccessController {
        &self.access
    }

    /// Connect and negotiate. See [`ConnectionManager::connect`].
    pub async fn connect(&self) -> Result<Arc<NegotiatedCapabilities>> {
        self.connection.connect().await
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }

    /// Declare a capability locally, for instance to attach a content
    /// policy. Later discovery, including after a list change, keeps the
    /// declared policy.
    pub fn register(&self, capability: Capability) -> Arc<Capability> {
        self.registry.declare(capability)
    }

    // -----------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------

    /// Fetch one page of capabilities of `kind`.
    ///
    /// # Errors
    ///
    /// [`CapwireError::UnsupportedCapability`] if `kind` was not negotiated,
    /// access errors, or any connection-level failure of the request.
    pub async fn list(&self, kind: CapabilityKind, cursor: Option<&str>) -> Result<Page<Capability>> {
        self.negotiated()?.ensure(kind)?;
        let method = kind.list_method();
        self.access.authorize(kind, method)?;

        let params = match cursor {
            Some(cursor) => json!({ "cursor": cursor }),
            None => json!({}),
        };
        let key = fingerprint(kind, method, &params);
        let raw = match self.cache.get(&key) {
            Some(hit) => {
                tracing::debug!(%kind, version = hit.version, "discovery cache hit");
                hit.value
            }
            None => {
                let class = self.cache.config().discovery_class;
                self.dispatch_cached(key, method, params, class, CacheScope::Discovery, kind)
                    .await?
            }
        };
        self.register_page(kind, raw)
    }

    /// Follow cursors until the last page.
    pub async fn list_all(&self, kind: CapabilityKind) -> Result<Vec<Capability>> {
        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self.list(kind, cursor.as_deref()).await?;
            items.extend(page.items);
            match page.next_cursor {
                Some(next) if seen.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    tracing::warn!(%kind, cursor = %next, "provider repeated a cursor, stopping");
                    break;
                }
                None => break,
            }
        }
        Ok(items)
    }

    pub async fn list_operations(&self) -> Result<Vec<Capability>> {
        self.list_all(CapabilityKind::Operation).await
    }

    pub async fn list_resources(&self) -> Result<Vec<Capability>> {
        self.list_all(CapabilityKind::Resource).await
    }

    pub async fn list_templates(&self) -> Result<Vec<Capability>> {
        self.list_all(CapabilityKind::Template).await
    }

    fn register_page(&self, kind: CapabilityKind, raw: Value) -> Result<Page<Capability>> {
        let cache = self.cache.config();
        let (items, next_cursor) = match kind {
            CapabilityKind::Operation => {
                let page: ListToolsResponse = serde_json::from_value(raw)?;
                let items = page
                    .tools
                    .into_iter()
                    .map(|tool| Capability {
                        kind,
                        schema: ArgumentSchema::from_wire(&tool.input_schema),
                        name: tool.name,
                        title: tool.title,
                        description: tool.description,
                        mime_type: None,
                        cache_class: CacheClass::Never,
                        content_policy: ContentPolicy::default(),
                    })
                    .collect::<Vec<_>>();
                (items, page.next_cursor)
            }
            CapabilityKind::Resource => {
                let page: ListResourcesResponse = serde_json::from_value(raw)?;
                let items = page
                    .resources
                    .into_iter()
                    .map(|resource| Capability {
                        kind,
                        cache_class: cache.class_for(&resource.uri, cache.read_class),
                        name: resource.uri,
                        title: Some(resource.name),
                        description: resource.description,
                        mime_type: resource.mime_type,
                        schema: ArgumentSchema::default(),
                        content_policy: ContentPolicy::default(),
                    })
                    .collect::<Vec<_>>();
                (items, page.next_cursor)
            }
            CapabilityKind::Template => {
                let page: ListResourceTemplatesResponse = serde_json::from_value(raw)?;
                let items = page
                    .resource_templates
                    .into_iter()
                    .map(|template| Capability {
                        kind,
                        schema: UriTemplate::parse(&template.uri_template)
                            .map(|t| t.schema())
                            .unwrap_or_default(),
                        cache_class: cache.class_for(&template.uri_template, cache.read_class),
                        name: template.uri_template,
                        title: Some(template.name),
                        description: template.description,
                        mime_type: template.mime_type,
                        content_policy: ContentPolicy::default(),
                    })
                    .collect::<Vec<_>>();
                (items, page.next_cursor)
            }
        };

        let items = items
            .into_iter()
            .map(|capability| (*self.registry.upsert(capability)).clone())
            .collect();
        Ok(Page { items, next_cursor })
    }

    /// Registry lookup, refreshing discovery once on a miss.
    async fn resolve(&self, kind: CapabilityKind, name: &str) -> Result<Arc<Capability>> {
        if let Some(capability) = self.registry.get(kind, name) {
            return Ok(capability);
        }
        tracing::debug!(%kind, name, "capability not registered, refreshing discovery");
        self.list_all(kind).await?;
        self.registry
            .get(kind, name)
            .ok_or_else(|| CapwireError::UnknownCapability(format!("{}:{}", kind, name)).into())
    }

    // -----------------------------------------------------------------
    // Invocation
    // -----------------------------------------------------------------

    /// Invoke an operation with the default timeout.
    pub async fn call(&self, name: &str, args: Value) -> Result<CallToolResponse> {
        self.call_with(name, args, CallOptions::default()).await
    }

    /// Invoke an operation.
    ///
    /// # Errors
    ///
    /// [`CapwireError::Validation`] with every violation found,
    /// [`CapwireError::PermissionDenied`], [`CapwireError::RateLimited`] or
    /// [`CapwireError::QuotaExceeded`] before anything is sent; afterwards
    /// [`CapwireError::Timeout`], [`CapwireError::Cancelled`],
    /// [`CapwireError::ConnectionLost`] or [`CapwireError::Remote`].
    pub async fn call_with(
        &self,
        name: &str,
        args: Value,
        options: CallOptions,
    ) -> Result<CallToolResponse> {
        let kind = CapabilityKind::Operation;
        self.negotiated()?.ensure(kind)?;
        let capability = self.resolve(kind, name).await?;

        self.validator.check(&capability, &args)?;
        let arguments = self.sanitizer.sanitize(&capability.content_policy, &args);
        self.access.authorize(kind, name)?;

        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        })?;
        let raw = self
            .connection
            .request_with(METHOD_TOOLS_CALL, params, options.timeout, options.cancel)
            .await?;
        let response: CallToolResponse = serde_json::from_value(raw)?;
        if response.is_error {
            tracing::debug!(operation = name, "provider reported an operation error");
        }
        Ok(response)
    }

    /// Read a resource by URI.
    ///
    /// URIs that are neither listed nor match a known template are still
    /// read, with the configured default read class.
    pub async fn read(&self, uri: &str, range: Option<ReadRange>) -> Result<ReadResult> {
        let kind = CapabilityKind::Resource;
        self.negotiated()?.ensure(kind)?;
        let cache = self.cache.config();
        let class = match self.registry.get(kind, uri) {
            Some(capability) => capability.cache_class,
            None => match self.registry.match_template(uri) {
                Some((template, _)) => template.cache_class,
                None => cache.class_for(uri, cache.read_class),
            },
        };
        self.access.authorize(kind, uri)?;
        self.fetch(uri, class, range).await
    }

    /// Expand a template with `args`, validate them, then read the result.
    pub async fn read_template(
        &self,
        pattern: &str,
        args: Value,
        range: Option<ReadRange>,
    ) -> Result<ReadResult> {
        let kind = CapabilityKind::Template;
        self.negotiated()?.ensure(kind)?;
        let capability = self.resolve(kind, pattern).await?;
        let template = match self.registry.template(pattern) {
            Some(template) => template,
            None => UriTemplate::parse(pattern)?,
        };

        let checked = Capability {
            schema: template.schema(),
            ..(*capability).clone()
        };
        self.validator.check(&checked, &args)?;
        let args = self.sanitizer.sanitize(&capability.content_policy, &args);
        self.access.authorize(kind, pattern)?;

        let uri = template.expand(&args)?;
        self.fetch(&uri, capability.cache_class, range).await
    }

    async fn fetch(
        &self,
        uri: &str,
        class: CacheClass,
        range: Option<ReadRange>,
    ) -> Result<ReadResult> {
        let kind = CapabilityKind::Resource;
        let key = fingerprint(kind, uri, &Value::Null);
        let (raw, from_cache) = match self.cache.get(&key) {
            Some(hit) => (hit.value, true),
            None => {
                let params = serde_json::to_value(ReadResourceParams {
                    uri: uri.to_string(),
                })?;
                let value = self
                    .dispatch_cached(key, METHOD_RESOURCES_READ, params, class, CacheScope::Read, kind)
                    .await?;
                (value, false)
            }
        };

        let response: ReadResourceResponse = serde_json::from_value(raw)?;
        let contents = match range {
            Some(range) => response
                .contents
                .into_iter()
                .map(|mut c| {
                    c.text = c.text.map(|text| range.apply(&text));
                    c
                })
                .collect(),
            None => response.contents,
        };
        Ok(ReadResult {
            uri: uri.to_string(),
            contents,
            from_cache,
        })
    }

    /// Send a cacheable request and store the answer under `key`.
    /// Concurrent misses on the same key share one request; uncached
    /// classes always go to the wire.
    async fn dispatch_cached(
        &self,
        key: String,
        method: &'static str,
        params: Value,
        class: CacheClass,
        scope: CacheScope,
        kind: CapabilityKind,
    ) -> Result<Value> {
        if class == CacheClass::Never {
            return self.connection.request(method, params).await;
        }
        let connection = self.connection.clone();
        let cache = Arc::clone(&self.cache);
        let flight_key = key.clone();
        self.in_flight
            .join(&flight_key, move || {
                async move {
                    let value = connection.request(method, params).await?;
                    cache.insert(key, value.clone(), class, scope, kind);
                    Ok(value)
                }
                .boxed()
            })
            .await
    }

    fn negotiated(&self) -> Result<Arc<NegotiatedCapabilities>> {
        self.connection.negotiated().ok_or_else(|| {
            CapwireError::NotConnected(self.connection.state().to_string()).into()
        })
    }
}

/// Drop discovery results the provider says are stale.
async fn watch_list_changes(
    mut events: broadcast::Receiver<ConnectionEvent>,
    registry: Arc<CapabilityRegistry>,
    cache: Arc<CacheManager>,
) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::CapabilityListChanged { kinds }) => {
                for kind in kinds {
                    let dropped = cache.invalidate_discovery(Some(kind));
                    registry.clear(kind);
                    tracing::debug!(%kind, dropped, "invalidated discovery cache");
                }
            }
            Ok(ConnectionEvent::StateChanged {
                from: ConnectionState::Degraded,
                to: ConnectionState::Ready,
            }) => {
                // The provider may have changed while we were away.
                cache.invalidate_discovery(None);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "missed connection events, dropping discovery cache");
                cache.invalidate_discovery(None);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
