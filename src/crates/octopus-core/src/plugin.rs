//! The plugin ABI: the three callable shapes a plugin can implement, the
//! registry that resolves a plugin id to one of them, and the config schema
//! machinery that lets the registry validate section parameters before a
//! plugin ever runs.
//!
//! A plugin is not part of this crate; it's an external collaborator that
//! registers itself under a dotted id (`"mqtt.subscribe"`, `"file.tail"`,
//! `"log.print"`) and implements exactly one of [`SourceCallable`],
//! [`FilterCallable`], or [`SinkCallable`]. The registry only knows the shape,
//! not the behavior.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{OctopusError, Result};
use crate::stream::Stream;

/// The role a node plays in the graph, derived from its position in the flow
/// grammar rather than declared explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// No parents; produces events.
    Source,
    /// At least one parent and one child; transforms events.
    Filter,
    /// No children; consumes events.
    Sink,
}

/// A source plugin: given its section's parameters, produces a stream of
/// events. Called once per scheduled (or event-driven) run.
#[async_trait]
pub trait SourceCallable: Send + Sync {
    /// Start producing events for this run.
    async fn run(&self, params: &Value) -> Result<Stream>;
}

/// A filter plugin: given an upstream stream and its section's parameters,
/// produces a transformed downstream stream.
#[async_trait]
pub trait FilterCallable: Send + Sync {
    /// Wrap `upstream` in whatever transformation this filter performs.
    async fn run(&self, upstream: Stream, params: &Value) -> Result<Stream>;
}

/// A sink plugin: given an upstream stream and its section's parameters,
/// consumes it to completion. The returned future resolves when the stream
/// ends or fails; it never yields a value of interest, only success/failure.
#[async_trait]
pub trait SinkCallable: Send + Sync {
    /// Drain `upstream`, doing whatever this sink does with each event.
    async fn run(&self, upstream: Stream, params: &Value) -> Result<()>;
}

/// One of the three plugin shapes, boxed so the registry can store them
/// uniformly regardless of role.
#[derive(Clone)]
pub enum Callable {
    /// A source implementation.
    Source(Arc<dyn SourceCallable>),
    /// A filter implementation.
    Filter(Arc<dyn FilterCallable>),
    /// A sink implementation.
    Sink(Arc<dyn SinkCallable>),
}

impl Callable {
    /// The role implied by this callable's shape.
    pub fn role(&self) -> Role {
        match self {
            Callable::Source(_) => Role::Source,
            Callable::Filter(_) => Role::Filter,
            Callable::Sink(_) => Role::Sink,
        }
    }
}

/// A simple parameter type a schema can declare. Only the two primitive kinds
/// the registry knows how to auto-derive and validate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// A UTF-8 string.
    String,
    /// A signed integer.
    Integer,
}

/// The type a plugin author declared for one of its own parameters, as fed
/// into [`ConfigSchema::derive`]; richer than [`FieldType`], since a
/// plugin's parameter list can name a type the registry has no simple schema
/// field for.
#[derive(Debug, Clone, Copy)]
pub enum DeclaredType {
    /// Maps to [`FieldType::String`].
    String,
    /// Maps to [`FieldType::Integer`].
    Integer,
    /// Anything else. Carries a human-readable type name for the resulting
    /// [`OctopusError::UnsupportedType`].
    Other(&'static str),
}

/// One parameter as a plugin itself declares it, before auto-derivation maps
/// it down to a [`ConfigField`].
#[derive(Debug, Clone)]
pub struct DeclaredParam {
    /// The parameter's name.
    pub name: &'static str,
    /// The parameter's declared type.
    pub declared_type: DeclaredType,
    /// The default used when the section omits this parameter, if any.
    pub default: Option<Value>,
}

/// One declared parameter of a plugin's configuration.
#[derive(Debug, Clone)]
pub struct ConfigField {
    /// The parameter's name, as it appears in a section.
    pub name: String,
    /// The parameter's declared type.
    pub field_type: FieldType,
    /// Whether the section must supply this parameter.
    pub required: bool,
    /// The value used when the section omits this (non-required) parameter.
    pub default: Option<Value>,
}

/// A plugin's declared configuration shape: the set of parameters it accepts,
/// beyond the universal `flow`/`schedule`/`throttle`/`batch` keys every section
/// supports.
#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    /// The plugin's declared parameters.
    pub fields: Vec<ConfigField>,
}

impl ConfigSchema {
    /// An empty schema: the plugin accepts no parameters of its own.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Derive a schema from a plugin's declared parameter list, for plugins
    /// that don't hand-write an explicit [`ConfigSchema`].
    ///
    /// Walks `params` in order, skipping the reserved name `"stream"` (a
    /// filter/sink's upstream is wired in by the runtime, never supplied as a
    /// section parameter). Each declared [`DeclaredType::String`] or
    /// [`DeclaredType::Integer`] becomes a [`ConfigField`] with
    /// `required = default.is_none()`; any other declared type fails with
    /// [`OctopusError::UnsupportedType`], naming the offending plugin.
    pub fn derive(plugin_id: &str, params: &[DeclaredParam]) -> Result<Self> {
        let mut fields = Vec::with_capacity(params.len());
        for param in params {
            if param.name == "stream" {
                continue;
            }
            let field_type = match param.declared_type {
                DeclaredType::String => FieldType::String,
                DeclaredType::Integer => FieldType::Integer,
                DeclaredType::Other(type_name) => {
                    return Err(OctopusError::UnsupportedType(type_name.to_string(), plugin_id.to_string()))
                }
            };
            fields.push(ConfigField {
                name: param.name.to_string(),
                field_type,
                required: param.default.is_none(),
                default: param.default.clone(),
            });
        }
        Ok(Self { fields })
    }

    /// Validate and coerce a raw section map against this schema, filling in
    /// defaults for omitted optional fields.
    ///
    /// Unknown keys and missing required fields are rejected with
    /// [`OctopusError::InvalidConfiguration`].
    pub fn validate(&self, plugin_id: &str, raw: &HashMap<String, Value>) -> Result<HashMap<String, Value>> {
        let known: std::collections::HashSet<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        for key in raw.keys() {
            if !known.contains(key.as_str()) {
                return Err(OctopusError::invalid_configuration(format!(
                    "plugin `{plugin_id}` does not accept parameter `{key}`"
                )));
            }
        }

        let mut resolved = HashMap::new();
        for field in &self.fields {
            match raw.get(&field.name) {
                Some(value) => {
                    check_type(plugin_id, &field.name, field.field_type, value)?;
                    resolved.insert(field.name.clone(), value.clone());
                }
                None => {
                    if field.required {
                        return Err(OctopusError::invalid_configuration(format!(
                            "plugin `{plugin_id}` is missing required parameter `{}`",
                            field.name
                        )));
                    }
                    if let Some(default) = &field.default {
                        resolved.insert(field.name.clone(), default.clone());
                    }
                }
            }
        }
        Ok(resolved)
    }
}

fn check_type(plugin_id: &str, field: &str, expected: FieldType, value: &Value) -> Result<()> {
    let matches = match expected {
        FieldType::String => value.is_string(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
    };
    if matches {
        Ok(())
    } else {
        Err(OctopusError::invalid_configuration(format!(
            "plugin `{plugin_id}` parameter `{field}` has the wrong type"
        )))
    }
}

/// A registered plugin: its callable body and declared config schema.
#[derive(Clone)]
pub struct PluginEntry {
    /// The plugin's callable body.
    pub callable: Callable,
    /// The plugin's declared config schema.
    pub schema: ConfigSchema,
}

/// Maps plugin ids to their registered entry.
///
/// A registry is built once at startup (populated by whatever in-process
/// plugins are compiled in) and is read-only for the lifetime of a run.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    entries: HashMap<String, PluginEntry>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under `id`, replacing any previous registration.
    pub fn register(&mut self, id: impl Into<String>, callable: Callable, schema: ConfigSchema) {
        self.entries.insert(id.into(), PluginEntry { callable, schema });
    }

    /// Resolve `id` to its registered entry.
    pub fn resolve(&self, id: &str) -> Result<&PluginEntry> {
        self.entries
            .get(id)
            .ok_or_else(|| OctopusError::UnknownPlugin(id.to_string()))
    }
}
