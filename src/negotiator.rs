//! Capability negotiation and the capability registry
//!
//! [`CapabilityNegotiator`] builds the `initialize` handshake and checks the
//! provider's answer. It performs no I/O itself: the connection manager
//! sends the handshake and hands the response to
//! [`CapabilityNegotiator::accept`], which yields the
//! [`NegotiatedCapabilities`] for the session.
//!
//! [`CapabilityRegistry`] maps `(kind, name)` to the capability definition
//! learned from discovery, so callers resolve capabilities by name instead
//! of branching on method strings. Resource templates are matched against
//! concrete URIs through [`UriTemplate`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde_json::Value;

use crate::error::{CapwireError, Result};
use crate::types::{
    ArgumentSchema, Capability, CapabilityFlags, CapabilityKind, ContentPolicy, Implementation,
    InitializeParams, InitializeResponse, PropertySchema, SchemaType, TypeSpec,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::validation::{Violation, ViolationKind};

/// Builds the handshake and validates the provider's reply.
#[derive(Debug, Clone)]
pub struct CapabilityNegotiator {
    client_info: Implementation,
    desired: BTreeSet<CapabilityKind>,
    supported_versions: Vec<String>,
}

impl CapabilityNegotiator {
    /// A negotiator asking for every capability kind with the built-in
    /// protocol version range.
    pub fn new(client_info: Implementation) -> Self {
        Self {
            client_info,
            desired: CapabilityKind::ALL.into_iter().collect(),
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }

    /// Restrict the capability kinds requested from the provider.
    pub fn with_desired(mut self, kinds: impl IntoIterator<Item = CapabilityKind>) -> Self {
        self.desired = kinds.into_iter().collect();
        self
    }

    /// Override the accepted protocol versions (newest first).
    pub fn with_versions(mut self, versions: Vec<String>) -> Self {
        self.supported_versions = versions;
        self
    }

    pub fn supported_versions(&self) -> &[String] {
        &self.supported_versions
    }

    /// Parameters for the `initialize` request.
    pub fn handshake_params(&self) -> InitializeParams {
        let mut capabilities = CapabilityFlags::default();
        if self.desired.contains(&CapabilityKind::Operation) {
            capabilities.tools = Some(serde_json::json!({}));
        }
        if self.desired.contains(&CapabilityKind::Resource)
            || self.desired.contains(&CapabilityKind::Template)
        {
            capabilities.resources = Some(serde_json::json!({}));
        }
        InitializeParams {
            protocol_version: self
                .supported_versions
                .first()
                .cloned()
                .unwrap_or_default(),
            supported_versions: self.supported_versions.clone(),
            capabilities,
            client_info: self.client_info.clone(),
        }
    }

    /// Check the provider's handshake result and compute the negotiated
    /// capability set.
    ///
    /// # Errors
    ///
    /// Returns [`CapwireError::ProtocolVersionMismatch`] if the accepted
    /// version is outside the local range, or
    /// [`CapwireError::NegotiationFailed`] if the result cannot be parsed.
    /// Both are fatal for the connection.
    pub fn accept(&self, result: Value) -> Result<NegotiatedCapabilities> {
        let response: InitializeResponse = serde_json::from_value(result).map_err(|e| {
            CapwireError::NegotiationFailed(format!("malformed initialize result: {}", e))
        })?;

        if !self
            .supported_versions
            .iter()
            .any(|v| *v == response.protocol_version)
        {
            return Err(CapwireError::ProtocolVersionMismatch {
                expected: self.supported_versions.clone(),
                got: response.protocol_version,
            }
            .into());
        }

        let kinds: BTreeSet<CapabilityKind> = self
            .desired
            .iter()
            .copied()
            .filter(|kind| response.capabilities.covers(*kind))
            .collect();
        if kinds.is_empty() {
            tracing::warn!(
                server = %response.server_info.name,
                "provider shares no capability kinds with this client"
            );
        }

        Ok(NegotiatedCapabilities {
            protocol_version: response.protocol_version,
            kinds,
            server_info: response.server_info,
            instructions: response.instructions,
            flags: response.capabilities,
        })
    }
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedCapabilities {
    pub protocol_version: String,
    /// Intersection of the requested and offered capability kinds.
    pub kinds: BTreeSet<CapabilityKind>,
    pub server_info: Implementation,
    pub instructions: Option<String>,
    /// Raw flags the provider announced.
    pub flags: CapabilityFlags,
}

impl NegotiatedCapabilities {
    pub fn supports(&self, kind: CapabilityKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Fail fast for a kind outside the negotiated set.
    ///
    /// # Errors
    ///
    /// Returns [`CapwireError::UnsupportedCapability`].
    pub fn ensure(&self, kind: CapabilityKind) -> Result<()> {
        if self.supports(kind) {
            Ok(())
        } else {
            Err(CapwireError::UnsupportedCapability(format!(
                "{} capabilities were not negotiated with `{}`",
                kind, self.server_info.name
            ))
            .into())
        }
    }
}

// ---------------------------------------------------------------------------
// URI templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `{name}`: one path segment, percent-encoded on expansion.
    Simple(String),
    /// `{+name}`: reserved expansion, may span `/`.
    Reserved(String),
}

/// A parsed URI template supporting `{var}` and `{+var}` placeholders.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    pattern: String,
    segments: Vec<Segment>,
    matcher: Regex,
}

impl UriTemplate {
    /// Parse a template.
    ///
    /// # Errors
    ///
    /// Returns [`CapwireError::Decode`] on an unterminated or empty
    /// placeholder.
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = pattern;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let close = rest[open..].find('}').ok_or_else(|| {
                CapwireError::Decode(format!("unterminated placeholder in template `{pattern}`"))
            })? + open;
            let inner = &rest[open + 1..close];
            let segment = match inner.strip_prefix('+') {
                Some(name) => Segment::Reserved(name.trim().to_string()),
                None => Segment::Simple(inner.trim().to_string()),
            };
            if matches!(&segment, Segment::Simple(n) | Segment::Reserved(n) if n.is_empty()) {
                return Err(CapwireError::Decode(format!(
                    "empty placeholder in template `{pattern}`"
                ))
                .into());
            }
            segments.push(segment);
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        let mut re = String::from("^");
        for segment in &segments {
            match segment {
                Segment::Literal(text) => re.push_str(&regex::escape(text)),
                Segment::Simple(_) => re.push_str("([^/?#]+)"),
                Segment::Reserved(_) => re.push_str("(.+)"),
            }
        }
        re.push('$');
        let matcher = Regex::new(&re)
            .map_err(|e| CapwireError::Decode(format!("template `{pattern}`: {e}")))?;

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
            matcher,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Placeholder names in order of appearance.
    pub fn variables(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Simple(n) | Segment::Reserved(n) => Some(n.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Argument schema implied by the placeholders: every variable is a
    /// required scalar.
    pub fn schema(&self) -> ArgumentSchema {
        let mut properties = BTreeMap::new();
        for name in self.variables() {
            properties.insert(
                name.to_string(),
                PropertySchema {
                    schema_type: Some(TypeSpec::Many(vec![
                        SchemaType::String,
                        SchemaType::Number,
                        SchemaType::Integer,
                    ])),
                    ..Default::default()
                },
            );
        }
        ArgumentSchema {
            required: properties.keys().cloned().collect(),
            properties,
            additional_properties: Some(false),
        }
    }

    /// Match a concrete URI, returning the captured variables.
    pub fn matches(&self, uri: &str) -> Option<HashMap<String, String>> {
        let caps = self.matcher.captures(uri)?;
        let mut vars = HashMap::new();
        for (i, name) in self.variables().into_iter().enumerate() {
            let value = caps.get(i + 1)?.as_str().to_string();
            vars.insert(name.to_string(), value);
        }
        Some(vars)
    }

    /// Substitute `args` into the template.
    ///
    /// # Errors
    ///
    /// Returns [`CapwireError::Validation`] listing every placeholder with
    /// no usable argument.
    pub fn expand(&self, args: &Value) -> Result<String> {
        let mut out = String::new();
        let mut violations = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Simple(name) | Segment::Reserved(name) => {
                    let value = match args.get(name) {
                        Some(Value::String(s)) => Some(s.clone()),
                        Some(v @ (Value::Number(_) | Value::Bool(_))) => Some(v.to_string()),
                        _ => None,
                    };
                    match value {
                        Some(v) if matches!(segment, Segment::Simple(_)) => {
                            out.push_str(&percent_encode(&v))
                        }
                        Some(v) => out.push_str(&v),
                        None => violations.push(Violation::new(
                            name.as_str(),
                            ViolationKind::Missing,
                            "template variable has no scalar value",
                        )),
                    }
                }
            }
        }
        if violations.is_empty() {
            Ok(out)
        } else {
            Err(CapwireError::Validation {
                capability: self.pattern.clone(),
                violations,
            }
            .into())
        }
    }
}

/// Percent-encode everything outside the unreserved set (RFC 3986).
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Capability registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RegistryInner {
    entries: HashMap<(CapabilityKind, String), Arc<Capability>>,
    templates: Vec<(UriTemplate, Arc<Capability>)>,
    /// Content policies declared by the caller. Survive `clear`.
    declared: HashMap<(CapabilityKind, String), ContentPolicy>,
}

/// Capabilities learned through discovery, keyed by `(kind, name)`.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    inner: RwLock<RegistryInner>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a capability definition. A policy previously
    /// passed to [`declare`](Self::declare) for the same capability wins over
    /// the one on `capability`.
    pub fn upsert(&self, mut capability: Capability) -> Arc<Capability> {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(policy) = inner
            .declared
            .get(&(capability.kind, capability.name.clone()))
        {
            capability.content_policy = policy.clone();
        }
        let capability = Arc::new(capability);
        if capability.kind == CapabilityKind::Template {
            inner.templates.retain(|(t, _)| t.pattern() != capability.name);
            match UriTemplate::parse(&capability.name) {
                Ok(template) => inner.templates.push((template, Arc::clone(&capability))),
                Err(e) => tracing::warn!("ignoring unparseable template: {e}"),
            }
        }
        inner.entries.insert(
            (capability.kind, capability.name.clone()),
            Arc::clone(&capability),
        );
        capability
    }

    /// Insert a caller-declared capability and pin its content policy, so
    /// rediscovery after a list change cannot replace it.
    pub fn declare(&self, capability: Capability) -> Arc<Capability> {
        self.inner
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .declared
            .insert(
                (capability.kind, capability.name.clone()),
                capability.content_policy.clone(),
            );
        self.upsert(capability)
    }

    pub fn get(&self, kind: CapabilityKind, name: &str) -> Option<Arc<Capability>> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .entries
            .get(&(kind, name.to_string()))
            .cloned()
    }

    /// First registered template matching `uri`, with its captured
    /// variables.
    pub fn match_template(&self, uri: &str) -> Option<(Arc<Capability>, HashMap<String, String>)> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner
            .templates
            .iter()
            .find_map(|(t, cap)| t.matches(uri).map(|vars| (Arc::clone(cap), vars)))
    }

    /// The parsed template for a registered template capability.
    pub fn template(&self, pattern: &str) -> Option<UriTemplate> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner
            .templates
            .iter()
            .find(|(t, _)| t.pattern() == pattern)
            .map(|(t, _)| t.clone())
    }

    /// Forget every discovered capability of `kind`. Declared policies are
    /// kept.
    pub fn clear(&self, kind: CapabilityKind) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        inner.entries.retain(|(k, _), _| *k != kind);
        if kind == CapabilityKind::Template {
            inner.templates.clear();
        }
    }

    pub fn clear_all(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        inner.entries.clear();
        inner.templates.clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
