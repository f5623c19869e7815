//! Builds the graph of nodes and edges described by a configuration document.
//!
//! A node's role (source, filter, or sink) isn't declared directly; it falls
//! out of the shape of its own `flow` string (an empty left-hand side makes it
//! a source, an empty right-hand side makes it a sink, anything else is a
//! filter). Edges are derived separately, by asking every ordered pair of
//! sections whether they're [`connected`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::config::{parse_duration, Flow, PipelineConfig};
use crate::error::{OctopusError, Result};
use crate::plugin::{PluginRegistry, Role};

/// A batch accumulation policy resolved from a section's bare `batch`
/// duration string.
#[derive(Debug, Clone)]
pub struct BatchSpec {
    /// How long to wait, since the oldest buffered event, before flushing.
    pub timeout: Duration,
}

/// One node of the graph: its identity, its derived role, and its neighbors.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// The section name, unique within the document.
    pub name: String,
    /// The plugin id this node resolves to.
    pub plugin: String,
    /// The role derived from this node's flow string.
    pub role: Role,
    /// The node's raw flow grammar, kept for re-deriving connectivity.
    pub flow: Flow,
    /// A parsed cron schedule string, if this source is schedule-driven.
    pub schedule: Option<String>,
    /// How often this sink may run, if throttled.
    pub throttle: Option<Duration>,
    /// This sink's batch accumulation policy, if it has one.
    pub batch: Option<BatchSpec>,
    /// The plugin's own parameters, validated and defaulted against the
    /// resolved plugin's config schema.
    pub params: HashMap<String, serde_json::Value>,
    /// Names of nodes this node sends events to.
    pub children: Vec<String>,
    /// Names of nodes this node receives events from.
    pub parents: Vec<String>,
}

impl NodeSpec {
    /// This node's validated parameters as a single JSON object, the shape a
    /// plugin callable expects.
    pub fn params_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.params.clone().into_iter().collect())
    }
}

/// The fully built graph: every node, keyed by name, plus the subset that are
/// roots (sources, the entry points the scheduler drives).
#[derive(Debug, Clone)]
pub struct Dag {
    /// Every node in the graph, keyed by name.
    pub nodes: HashMap<String, NodeSpec>,
    /// Names of the source nodes, in configuration order.
    pub roots: Vec<String>,
}

/// Whether `source` may send events to `target`, as declared by each side's
/// own flow string.
///
/// This is asymmetric: `source`'s right-hand side must name `target` (or be a
/// wildcard), *and* `target`'s left-hand side must name `source` (or be a
/// wildcard); either side alone is not enough to form an edge.
pub fn connected(config: &PipelineConfig, source: &str, target: &str) -> Result<bool> {
    let source_section = config
        .section(source)
        .ok_or_else(|| OctopusError::invalid_configuration(format!("unknown node `{source}`")))?;
    let target_section = config
        .section(target)
        .ok_or_else(|| OctopusError::invalid_configuration(format!("unknown node `{target}`")))?;
    let source_flow = Flow::parse(&source_section.flow)?;
    let target_flow = Flow::parse(&target_section.flow)?;
    Ok(source_flow.rhs.matches(target) && target_flow.lhs.matches(source))
}

fn derive_role(flow: &Flow) -> Result<Role> {
    let lhs_empty = matches!(&flow.lhs, crate::config::FlowSide::Names(names) if names.is_empty());
    let rhs_empty = matches!(&flow.rhs, crate::config::FlowSide::Names(names) if names.is_empty());
    match (lhs_empty, rhs_empty) {
        (true, true) => Err(OctopusError::invalid_configuration(
            "a node cannot have both an empty left- and right-hand flow side",
        )),
        (true, false) => Ok(Role::Source),
        (false, true) => Ok(Role::Sink),
        (false, false) => Ok(Role::Filter),
    }
}

/// Build the full graph from a configuration document, resolving and
/// validating every section's plugin against `registry` along the way.
///
/// Every section becomes a node; its role is derived from its own flow
/// string. Edges are discovered breadth-first starting from the source
/// nodes: each node is expanded exactly once (tracked in a `seen` set), and
/// on expansion every other declared section is tested against
/// [`connected`] to find its neighbors. A section that's never reached this
/// way (no edge connects it to anything) is rejected, since an
/// unreachable filter or sink can never run.
///
/// Plugin resolution happens here, not lazily at run time: an unknown
/// plugin id, a plugin registered under the wrong role, or a section whose
/// parameters fail the plugin's config schema all abort construction
/// synchronously, before the scheduler ever starts, raising
/// `InvalidConfiguration` or `UnknownPlugin` rather than failing mid-run.
pub fn build_dag(config: &PipelineConfig, registry: &PluginRegistry) -> Result<Dag> {
    let mut nodes = HashMap::new();
    for name in config.names() {
        let section = config.section(name).expect("name came from config.names()");
        let flow = Flow::parse(&section.flow)?;
        let role = derive_role(&flow)?;
        let throttle = section.throttle.as_deref().map(parse_duration).transpose()?;
        let batch = section
            .batch
            .as_deref()
            .map(|timeout| -> Result<BatchSpec> {
                Ok(BatchSpec {
                    timeout: parse_duration(timeout)?,
                })
            })
            .transpose()?;

        if role != Role::Source && section.schedule.is_some() {
            return Err(OctopusError::invalid_configuration(format!(
                "node `{name}` declares a schedule but is not a source"
            )));
        }
        if role != Role::Sink && (throttle.is_some() || batch.is_some()) {
            return Err(OctopusError::invalid_configuration(format!(
                "node `{name}` declares throttle/batch but is not a sink"
            )));
        }

        let entry = registry.resolve(&section.plugin)?;
        if entry.callable.role() != role {
            return Err(OctopusError::invalid_configuration(format!(
                "node `{name}` is a {role:?} by its flow string, but plugin `{}` is registered as a {:?}",
                section.plugin,
                entry.callable.role()
            )));
        }
        let raw_params: HashMap<String, serde_json::Value> = section
            .params
            .iter()
            .map(|(key, value)| -> Result<(String, serde_json::Value)> {
                Ok((key.clone(), serde_json::to_value(value).map_err(|err| {
                    OctopusError::invalid_configuration(format!(
                        "node `{name}` parameter `{key}` could not be read: {err}"
                    ))
                })?))
            })
            .collect::<Result<_>>()?;
        let params = entry.schema.validate(&section.plugin, &raw_params)?;

        nodes.insert(
            name.to_string(),
            NodeSpec {
                name: name.to_string(),
                plugin: section.plugin.clone(),
                role,
                flow,
                schedule: section.schedule.clone(),
                throttle,
                batch,
                params,
                children: Vec::new(),
                parents: Vec::new(),
            },
        );
    }

    let mut roots: Vec<String> = nodes
        .values()
        .filter(|n| n.role == Role::Source)
        .map(|n| n.name.clone())
        .collect();
    roots.sort();

    let mut seen: HashSet<String> = roots.iter().cloned().collect();
    let mut queue: VecDeque<String> = roots.iter().cloned().collect();

    while let Some(name) = queue.pop_front() {
        let mut discovered = Vec::new();
        for other in nodes.keys() {
            if other == &name {
                continue;
            }
            if connected(config, &name, other)? {
                discovered.push(other.clone());
            }
        }
        discovered.sort();
        for other in discovered {
            nodes.get_mut(&name).expect("node exists").children.push(other.clone());
            nodes.get_mut(&other).expect("node exists").parents.push(name.clone());
            if seen.insert(other.clone()) {
                queue.push_back(other);
            }
        }
    }

    for node in nodes.values() {
        if !seen.contains(&node.name) {
            return Err(OctopusError::invalid_configuration(format!(
                "node `{}` is unreachable from any source",
                node.name
            )));
        }
        match node.role {
            Role::Source if node.children.is_empty() => {
                return Err(OctopusError::invalid_configuration(format!(
                    "source `{}` has no children",
                    node.name
                )))
            }
            Role::Filter if node.parents.is_empty() || node.children.is_empty() => {
                return Err(OctopusError::invalid_configuration(format!(
                    "filter `{}` must have at least one parent and one child",
                    node.name
                )))
            }
            Role::Sink if node.parents.is_empty() => {
                return Err(OctopusError::invalid_configuration(format!(
                    "sink `{}` has no parents",
                    node.name
                )))
            }
            _ => {}
        }
    }

    ensure_acyclic(&nodes)?;

    Ok(Dag { nodes, roots })
}

/// Reject a graph containing a cycle.
///
/// Source/filter/sink typing rules out most cycles (a source has no parents,
/// a sink has no children), but nothing in the flow grammar stops two
/// filters from naming each other on both sides, so this is checked
/// explicitly rather than assumed, via a Kahn's-algorithm topological sort
/// over every node, failing if any node is never reached. Run once at build
/// time so a cyclic configuration is rejected synchronously at startup
/// rather than only discovered the first time the scheduler tries to order
/// a run through it.
fn ensure_acyclic(nodes: &HashMap<String, NodeSpec>) -> Result<()> {
    let mut in_degree: HashMap<&str, usize> = nodes
        .values()
        .map(|n| (n.name.as_str(), n.parents.len()))
        .collect();

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut visited = 0;
    while let Some(name) = queue.pop_front() {
        visited += 1;
        for child in &nodes[name].children {
            let entry = in_degree.get_mut(child.as_str()).expect("child is a known node");
            *entry -= 1;
            if *entry == 0 {
                queue.push_back(child.as_str());
            }
        }
    }

    if visited != nodes.len() {
        return Err(OctopusError::invalid_configuration(
            "graph contains a cycle",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Callable, ConfigSchema, FilterCallable, SinkCallable, SourceCallable};
    use async_trait::async_trait;

    struct NoopSource;
    #[async_trait]
    impl SourceCallable for NoopSource {
        async fn run(&self, _params: &serde_json::Value) -> Result<crate::stream::Stream> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    struct NoopFilter;
    #[async_trait]
    impl FilterCallable for NoopFilter {
        async fn run(&self, upstream: crate::stream::Stream, _params: &serde_json::Value) -> Result<crate::stream::Stream> {
            Ok(upstream)
        }
    }

    struct NoopSink;
    #[async_trait]
    impl SinkCallable for NoopSink {
        async fn run(&self, _upstream: crate::stream::Stream, _params: &serde_json::Value) -> Result<()> {
            Ok(())
        }
    }

    /// A registry with one plugin of each role (`test.source`/`test.filter`/
    /// `test.sink`), none accepting parameters; enough to exercise the graph
    /// builder without pulling in any real plugin.
    fn test_registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry.register("test.source", Callable::Source(std::sync::Arc::new(NoopSource)), ConfigSchema::empty());
        registry.register("test.filter", Callable::Filter(std::sync::Arc::new(NoopFilter)), ConfigSchema::empty());
        registry.register("test.sink", Callable::Sink(std::sync::Arc::new(NoopSink)), ConfigSchema::empty());
        registry
    }

    fn config_from(yaml: &str) -> PipelineConfig {
        PipelineConfig::from_str(yaml).unwrap()
    }

    #[test]
    fn connected_is_asymmetric() {
        let config = config_from(
            r#"
a:
  plugin: test.source
  flow: "-> b"
b:
  plugin: test.sink
  flow: "a ->"
"#,
        );
        assert!(connected(&config, "a", "b").unwrap());
        assert!(!connected(&config, "b", "a").unwrap());
    }

    #[test]
    fn flow_grammar_excludes_cross_pairs() {
        // a, b -> c, d both declare c as a neighbor but only a/b that name
        // each other form an edge; c -> d and c -> e close it out.
        let config = config_from(
            r#"
a:
  plugin: test.source
  flow: "-> c"
b:
  plugin: test.source
  flow: "-> c"
c:
  plugin: test.filter
  flow: "a, b -> d, e"
d:
  plugin: test.sink
  flow: "c ->"
e:
  plugin: test.sink
  flow: "c ->"
"#,
        );
        let dag = build_dag(&config, &test_registry()).unwrap();
        let c = &dag.nodes["c"];
        let mut children = c.children.clone();
        children.sort();
        assert_eq!(children, vec!["d".to_string(), "e".to_string()]);
        let mut parents = c.parents.clone();
        parents.sort();
        assert_eq!(parents, vec!["a".to_string(), "b".to_string()]);

        assert!(!dag.nodes["a"].children.contains(&"e".to_string()));
        assert!(!dag.nodes["b"].children.contains(&"d".to_string()));
    }

    #[test]
    fn roles_derive_from_flow_shape() {
        let config = config_from(
            r#"
src:
  plugin: test.source
  flow: "-> mid"
mid:
  plugin: test.filter
  flow: "src -> snk"
snk:
  plugin: test.sink
  flow: "mid ->"
"#,
        );
        let dag = build_dag(&config, &test_registry()).unwrap();
        assert_eq!(dag.nodes["src"].role, Role::Source);
        assert_eq!(dag.nodes["mid"].role, Role::Filter);
        assert_eq!(dag.nodes["snk"].role, Role::Sink);
        assert_eq!(dag.roots, vec!["src".to_string()]);
    }

    #[test]
    fn unreachable_node_is_rejected() {
        let config = config_from(
            r#"
src:
  plugin: test.source
  flow: "-> mid"
mid:
  plugin: test.sink
  flow: "src ->"
orphan:
  plugin: test.sink
  flow: "nobody -> nowhere"
"#,
        );
        assert!(build_dag(&config, &test_registry()).is_err());
    }

    #[test]
    fn wildcard_sides_connect_every_matching_node() {
        let config = config_from(
            r#"
src:
  plugin: test.source
  flow: "-> *"
snk_a:
  plugin: test.sink
  flow: "* ->"
snk_b:
  plugin: test.sink
  flow: "* ->"
"#,
        );
        let dag = build_dag(&config, &test_registry()).unwrap();
        let mut children = dag.nodes["src"].children.clone();
        children.sort();
        assert_eq!(children, vec!["snk_a".to_string(), "snk_b".to_string()]);
    }

    #[test]
    fn unknown_plugin_is_rejected() {
        let config = config_from(
            r#"
src:
  plugin: nonexistent.plugin
  flow: "-> snk"
snk:
  plugin: test.sink
  flow: "src ->"
"#,
        );
        let err = build_dag(&config, &test_registry()).unwrap_err();
        assert!(matches!(err, OctopusError::UnknownPlugin(_)));
    }

    #[test]
    fn plugin_registered_under_the_wrong_role_is_rejected() {
        let config = config_from(
            r#"
src:
  plugin: test.sink
  flow: "-> snk"
snk:
  plugin: test.sink
  flow: "src ->"
"#,
        );
        let err = build_dag(&config, &test_registry()).unwrap_err();
        assert!(matches!(err, OctopusError::InvalidConfiguration(_)));
    }

    #[test]
    fn mutually_referencing_filters_form_a_rejected_cycle() {
        // f1 and f2 name each other on both sides, so the flow grammar alone
        // lets them form a cycle even though both are otherwise
        // well-formed filters (>=1 parent, >=1 child each).
        let config = config_from(
            r#"
a:
  plugin: test.source
  flow: "-> f1"
f1:
  plugin: test.filter
  flow: "a, f2 -> f2, snk"
f2:
  plugin: test.filter
  flow: "f1 -> f1, snk"
snk:
  plugin: test.sink
  flow: "f1, f2 ->"
"#,
        );
        let err = build_dag(&config, &test_registry()).unwrap_err();
        assert!(matches!(err, OctopusError::InvalidConfiguration(_)));
    }
}
