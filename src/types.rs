//! Wire payload types and capability model
//!
//! This module defines the method names, handshake payloads, discovery
//! pages and invocation payloads exchanged with a capability provider, plus
//! the provider-independent [`Capability`] description used by the rest of
//! the runtime. Struct fields are `camelCase` on the wire via
//! `#[serde(rename_all = "camelCase")]`, and `Option<>` fields are omitted
//! from JSON when `None`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Envelope version tag carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// The most recent supported protocol revision.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-11-25";

/// Every protocol revision accepted during negotiation, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[LATEST_PROTOCOL_VERSION, "2025-06-18", "2025-03-26"];

/// Lifecycle: client sends `initialize` to open a session.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Lifecycle: client confirms the handshake.
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
/// Liveness probe.
pub const METHOD_PING: &str = "ping";
/// Request a page of available operations.
pub const METHOD_TOOLS_LIST: &str = "tools/list";
/// Invoke a named operation.
pub const METHOD_TOOLS_CALL: &str = "tools/call";
/// Request a page of available resources.
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
/// Read the contents of a resource by URI.
pub const METHOD_RESOURCES_READ: &str = "resources/read";
/// Request a page of resource templates.
pub const METHOD_RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";

/// Provider notifies that the operation list has changed.
pub const NOTIF_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
/// Provider notifies that the resource (and template) list has changed.
pub const NOTIF_RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
/// Provider notifies that the prompt list has changed.
pub const NOTIF_PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";

// ---------------------------------------------------------------------------
// Capability model
// ---------------------------------------------------------------------------

/// The three kinds of capability a provider can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    /// A callable operation (`tools/*`).
    Operation,
    /// A readable resource addressed by URI (`resources/*`).
    Resource,
    /// A parameterized URI template (`resources/templates/*`).
    Template,
}

impl CapabilityKind {
    /// All kinds, in declaration order.
    pub const ALL: [CapabilityKind; 3] = [
        CapabilityKind::Operation,
        CapabilityKind::Resource,
        CapabilityKind::Template,
    ];

    /// Stable lowercase name, also used in access policies.
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Operation => "operation",
            CapabilityKind::Resource => "resource",
            CapabilityKind::Template => "template",
        }
    }

    /// Parse the lowercase name produced by [`CapabilityKind::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "operation" => Some(CapabilityKind::Operation),
            "resource" => Some(CapabilityKind::Resource),
            "template" => Some(CapabilityKind::Template),
            _ => None,
        }
    }

    /// The discovery method that lists capabilities of this kind.
    pub fn list_method(&self) -> &'static str {
        match self {
            CapabilityKind::Operation => METHOD_TOOLS_LIST,
            CapabilityKind::Resource => METHOD_RESOURCES_LIST,
            CapabilityKind::Template => METHOD_RESOURCES_TEMPLATES_LIST,
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TTL class assigned to cacheable results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheClass {
    /// Rarely changes; long TTL.
    Static,
    /// Changes occasionally; medium TTL.
    #[default]
    Dynamic,
    /// Changes often; short TTL.
    Volatile,
    /// Never cached.
    Never,
}

/// Character policy applied to string arguments before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPolicy {
    /// Remove control and invisible formatting characters (newline and tab
    /// are kept).
    #[serde(default = "default_true")]
    pub strip_control: bool,
    /// Remove `<` and `>`.
    #[serde(default)]
    pub strip_markup: bool,
    /// Additional characters to remove.
    #[serde(default)]
    pub disallowed: String,
}

fn default_true() -> bool {
    true
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self {
            strip_control: true,
            strip_markup: false,
            disallowed: String::new(),
        }
    }
}

/// JSON-schema primitive type names understood by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "integer",
            SchemaType::Boolean => "boolean",
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::Null => "null",
        };
        f.write_str(s)
    }
}

/// A `type` keyword: either a single type or a union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeSpec {
    One(SchemaType),
    Many(Vec<SchemaType>),
}

impl TypeSpec {
    /// The allowed types as a slice.
    pub fn types(&self) -> &[SchemaType] {
        match self {
            TypeSpec::One(t) => std::slice::from_ref(t),
            TypeSpec::Many(ts) => ts,
        }
    }
}

/// Schema for a single argument (a subset of JSON Schema).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<TypeSpec>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Top-level argument schema of a capability (`inputSchema` on the wire).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgumentSchema {
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
    /// When `Some(false)`, arguments not named in `properties` are rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
}

impl ArgumentSchema {
    /// Parse a raw `inputSchema`, falling back to an empty schema when the
    /// provider sends something this validator does not understand.
    pub fn from_wire(value: &serde_json::Value) -> Self {
        match serde_json::from_value::<ArgumentSchema>(value.clone()) {
            Ok(schema) => schema,
            Err(e) => {
                tracing::debug!("unparseable input schema, accepting any arguments: {e}");
                ArgumentSchema::default()
            }
        }
    }
}

/// Provider-independent description of one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    /// What kind of capability this is.
    pub kind: CapabilityKind,
    /// Operation name, resource URI, or template URI pattern.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Argument schema (operations and templates).
    #[serde(default)]
    pub schema: ArgumentSchema,
    /// TTL class for cacheable results.
    #[serde(default)]
    pub cache_class: CacheClass,
    /// Sanitization applied to string arguments.
    #[serde(default)]
    pub content_policy: ContentPolicy,
}

/// One page of a paginated discovery listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Opaque cursor for the next page; `None` on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Name and version of a client or provider implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

/// Capability flags exchanged during the handshake.
///
/// The client sends the set it wants; the provider answers with the set it
/// offers. `tools` gates operations; `resources` gates resources and
/// templates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<serde_json::Value>,
}

impl CapabilityFlags {
    /// Whether these flags cover the given capability kind.
    pub fn covers(&self, kind: CapabilityKind) -> bool {
        match kind {
            CapabilityKind::Operation => self.tools.is_some(),
            CapabilityKind::Resource | CapabilityKind::Template => self.resources.is_some(),
        }
    }

    /// Whether the provider announced `listChanged` notifications for `kind`.
    pub fn list_changed(&self, kind: CapabilityKind) -> bool {
        let flag = match kind {
            CapabilityKind::Operation => self.tools.as_ref(),
            CapabilityKind::Resource | CapabilityKind::Template => self.resources.as_ref(),
        };
        flag.and_then(|v| v.get("listChanged"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// The preferred (newest) version.
    pub protocol_version: String,
    /// Every version the client can speak, newest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_versions: Vec<String>,
    pub capabilities: CapabilityFlags,
    pub client_info: Implementation,
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: CapabilityFlags,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// ---------------------------------------------------------------------------
// Discovery payloads
// ---------------------------------------------------------------------------

/// Cursor parameter shared by every list method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaginatedParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// An operation as advertised by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

/// A resource as advertised by `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResource {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A template as advertised by `resources/templates/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResourceTemplate {
    pub uri_template: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResponse {
    #[serde(default)]
    pub tools: Vec<WireTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResponse {
    #[serde(default)]
    pub resources: Vec<WireResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourceTemplatesResponse {
    #[serde(default)]
    pub resource_templates: Vec<WireResourceTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// Invocation payloads
// ---------------------------------------------------------------------------

/// Parameters of `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

/// One content block of an operation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: ResourceContents,
    },
    #[serde(other)]
    Unknown,
}

/// Result of `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResponse {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<serde_json::Value>,
    /// Operation-level failure reported by the provider.
    #[serde(default)]
    pub is_error: bool,
}

/// Parameters of `resources/read`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceParams {
    pub uri: String,
}

/// Contents of a resource: text or base64 blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// Result of `resources/read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResourceResponse {
    #[serde(default)]
    pub contents: Vec<ResourceContents>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_kind_round_trips_through_str() {
        for kind in CapabilityKind::ALL {
            assert_eq!(CapabilityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CapabilityKind::parse("prompt"), None);
    }

    #[test]
    fn test_flags_cover_kinds() {
        let flags = CapabilityFlags {
            resources: Some(serde_json::json!({ "listChanged": true })),
            ..Default::default()
        };
        assert!(!flags.covers(CapabilityKind::Operation));
        assert!(flags.covers(CapabilityKind::Resource));
        assert!(flags.covers(CapabilityKind::Template));
        assert!(flags.list_changed(CapabilityKind::Template));
        assert!(!flags.list_changed(CapabilityKind::Operation));
    }

    #[test]
    fn test_argument_schema_parses_input_schema() {
        let raw = serde_json::json!({
            "type": "object",
            "properties": {
                "a": { "type": "number", "minimum": 0 },
                "b": { "type": "string", "enum": ["x", "y"] }
            },
            "required": ["a", "b"]
        });
        let schema = ArgumentSchema::from_wire(&raw);
        assert_eq!(schema.required, vec!["a", "b"]);
        assert_eq!(schema.properties["a"].minimum, Some(0.0));
        assert_eq!(
            schema.properties["b"].schema_type,
            Some(TypeSpec::One(SchemaType::String))
        );
    }

    #[test]
    fn test_argument_schema_falls_back_on_garbage() {
        let schema = ArgumentSchema::from_wire(&serde_json::json!({ "properties": 5 }));
        assert!(schema.properties.is_empty());
    }

    #[test]
    fn test_unknown_content_block_type_is_tolerated() {
        let resp: CallToolResponse = serde_json::from_value(serde_json::json!({
            "content": [
                { "type": "text", "text": "hi" },
                { "type": "hologram", "depth": 3 }
            ]
        }))
        .unwrap();
        assert_eq!(resp.content[0], ContentBlock::Text { text: "hi".into() });
        assert_eq!(resp.content[1], ContentBlock::Unknown);
        assert!(!resp.is_error);
    }

    #[test]
    fn test_initialize_params_wire_shape() {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            supported_versions: vec!["2025-03-26".to_string()],
            capabilities: CapabilityFlags::default(),
            client_info: Implementation {
                name: "capwire".into(),
                version: "0.1.0".into(),
            },
        };
        let v = serde_json::to_value(&params).unwrap();
        assert_eq!(v["protocolVersion"], LATEST_PROTOCOL_VERSION);
        assert_eq!(v["clientInfo"]["name"], "capwire");
        assert!(v["capabilities"].as_object().unwrap().is_empty());
    }
}
