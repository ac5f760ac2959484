//! Capability negotiation state and tool descriptors
//!
//! Each session owns one [`CapabilityRegistry`]. It records what the local side
//! advertises, what the peer advertised, and the intersection of the two once the
//! handshake completes. Operations consult the effective set before anything is
//! sent on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    str::FromStr,
};

use crate::{error::Error, types::ToolDescriptor};

/// A top-level MCP capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Tools,
    Resources,
    Prompts,
    Sampling,
    Logging,
    Roots,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Tools,
        Capability::Resources,
        Capability::Prompts,
        Capability::Sampling,
        Capability::Logging,
        Capability::Roots,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Tools => "tools",
            Capability::Resources => "resources",
            Capability::Prompts => "prompts",
            Capability::Sampling => "sampling",
            Capability::Logging => "logging",
            Capability::Roots => "roots",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown capability '{s}'")))
    }
}

/// A set of capabilities, each with its own feature flags
///
/// On the wire this is the MCP capabilities object, e.g.
/// `{"tools": {"listChanged": true}, "logging": {}}`. Unknown capability names
/// (such as `experimental`) are ignored when parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Capabilities(BTreeMap<Capability, BTreeSet<String>>);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a capability with no feature flags
    pub fn with(mut self, capability: Capability) -> Self {
        self.0.entry(capability).or_default();
        self
    }

    /// Adds a capability along with one feature flag
    pub fn with_feature(mut self, capability: Capability, feature: impl Into<String>) -> Self {
        self.0.entry(capability).or_default().insert(feature.into());
        self
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0.entry(capability).or_default();
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains_key(&capability)
    }

    pub fn features(&self, capability: Capability) -> Option<&BTreeSet<String>> {
        self.0.get(&capability)
    }

    /// Whether the capability is present and, if given, carries the feature flag
    pub fn supports(&self, capability: Capability, feature: Option<&str>) -> bool {
        match (self.0.get(&capability), feature) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(features), Some(feature)) => features.contains(feature),
        }
    }

    /// Capabilities present on both sides, each keeping only shared features
    pub fn intersect(&self, other: &Capabilities) -> Capabilities {
        let map = self
            .0
            .iter()
            .filter_map(|(capability, ours)| {
                let theirs = other.0.get(capability)?;
                Some((*capability, ours.intersection(theirs).cloned().collect()))
            })
            .collect();
        Capabilities(map)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Capabilities> for Value {
    fn from(capabilities: Capabilities) -> Self {
        let object = capabilities
            .0
            .into_iter()
            .map(|(capability, features)| {
                let flags: Map<String, Value> = features
                    .into_iter()
                    .map(|feature| (feature, Value::Bool(true)))
                    .collect();
                (capability.as_str().to_string(), Value::Object(flags))
            })
            .collect();
        Value::Object(object)
    }
}

impl TryFrom<Value> for Capabilities {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let object = match value {
            Value::Object(object) => object,
            Value::Null => return Ok(Capabilities::default()),
            other => return Err(format!("capabilities must be an object, got {other}")),
        };
        let mut map = BTreeMap::new();
        for (name, flags) in object {
            let Ok(capability) = name.parse::<Capability>() else {
                log::debug!("ignoring unknown capability '{name}'");
                continue;
            };
            let features = match flags {
                Value::Object(flags) => flags
                    .into_iter()
                    .filter(|(_, v)| !matches!(v, Value::Bool(false) | Value::Null))
                    .map(|(k, _)| k)
                    .collect(),
                Value::Bool(false) | Value::Null => continue,
                _ => BTreeSet::new(),
            };
            map.insert(capability, features);
        }
        Ok(Capabilities(map))
    }
}

/// Per-session capability and tool bookkeeping
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    local: Capabilities,
    remote: Option<Capabilities>,
    effective: Option<Capabilities>,
    tools: Vec<ToolDescriptor>,
    remote_tools: HashMap<String, ToolDescriptor>,
}

impl CapabilityRegistry {
    pub fn new(local: Capabilities) -> Self {
        Self {
            local,
            remote: None,
            effective: None,
            tools: Vec::new(),
            remote_tools: HashMap::new(),
        }
    }

    pub fn local(&self) -> &Capabilities {
        &self.local
    }

    pub fn remote(&self) -> Option<&Capabilities> {
        self.remote.as_ref()
    }

    /// The negotiated set, once the handshake has completed
    pub fn effective(&self) -> Option<&Capabilities> {
        self.effective.as_ref()
    }

    pub fn is_negotiated(&self) -> bool {
        self.effective.is_some()
    }

    /// Adds a capability to the local advertisement; only possible before negotiation
    pub fn advertise(&mut self, capability: Capability) -> Result<(), Error> {
        if self.is_negotiated() {
            return Err(Error::InvalidState(
                "capabilities are immutable once negotiated".to_string(),
            ));
        }
        self.local.insert(capability);
        Ok(())
    }

    /// Records the peer's advertisement and fixes the effective set
    pub fn complete_negotiation(&mut self, remote: Capabilities) -> Result<&Capabilities, Error> {
        if self.is_negotiated() {
            return Err(Error::InvalidState(
                "capabilities were already negotiated".to_string(),
            ));
        }
        let effective = self.local.intersect(&remote);
        log::debug!(
            "negotiated capabilities: {:?}",
            effective.iter().map(|c| c.as_str()).collect::<Vec<_>>()
        );
        self.remote = Some(remote);
        Ok(self.effective.insert(effective))
    }

    pub fn is_supported(&self, capability: Capability, feature: Option<&str>) -> bool {
        self.effective
            .as_ref()
            .is_some_and(|c| c.supports(capability, feature))
    }

    /// Fails with [`Error::NotNegotiated`] unless the capability is in the effective set
    pub fn require(&self, capability: Capability) -> Result<(), Error> {
        if self.is_supported(capability, None) {
            Ok(())
        } else {
            Err(Error::NotNegotiated(capability))
        }
    }

    /// Registers a tool descriptor.
    ///
    /// Re-registering an identical descriptor is a no-op. A different descriptor
    /// under a known name, or any new tool after negotiation, is rejected.
    pub fn register_tool(&mut self, descriptor: ToolDescriptor) -> Result<(), Error> {
        if let Some(existing) = self.tools.iter().find(|t| t.name == descriptor.name) {
            if *existing == descriptor {
                return Ok(());
            }
            return Err(Error::DuplicateRegistration(format!(
                "tool '{}' is already registered with a different descriptor",
                descriptor.name
            )));
        }
        if self.is_negotiated() {
            return Err(Error::DuplicateRegistration(format!(
                "cannot register tool '{}' after negotiation",
                descriptor.name
            )));
        }
        log::debug!("registering tool: {}", descriptor.name);
        self.tools.push(descriptor);
        Ok(())
    }

    /// Registered descriptors, in insertion order
    pub fn list_tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Looks a tool up among local registrations, then the peer's catalog
    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools
            .iter()
            .find(|t| t.name == name)
            .or_else(|| self.remote_tools.get(name))
    }

    /// Replaces the cached catalog of the peer's tools
    pub fn cache_remote_tools(&mut self, tools: impl IntoIterator<Item = ToolDescriptor>) {
        self.remote_tools = tools.into_iter().map(|t| (t.name.clone(), t)).collect();
    }

    pub fn clear_remote_tools(&mut self) {
        self.remote_tools.clear();
    }
}
