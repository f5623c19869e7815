//! Parsing helpers for the two little grammars a configuration document is
//! built from: human-readable durations (`"2m"`, `"30s"`) and the flow string
//! that gives each section its place in the graph (`"a, b -> c"`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use crate::error::{OctopusError, Result};

/// One side of a flow string: either a wildcard (`*`), or an explicit,
/// possibly empty, list of names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowSide {
    /// Matches any node not otherwise named on this side elsewhere.
    Wildcard,
    /// An explicit set of node names. Empty means "nothing" (a bare source or
    /// bare sink side).
    Names(Vec<String>),
}

impl FlowSide {
    fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed == "*" {
            return FlowSide::Wildcard;
        }
        if trimmed.is_empty() {
            return FlowSide::Names(Vec::new());
        }
        FlowSide::Names(trimmed.split(',').map(|s| s.trim().to_string()).collect())
    }

    /// Whether this side names `node` explicitly, or matches everything via a
    /// wildcard.
    pub fn matches(&self, node: &str) -> bool {
        match self {
            FlowSide::Wildcard => true,
            FlowSide::Names(names) => names.iter().any(|n| n == node),
        }
    }
}

/// A parsed `lhs -> rhs` flow string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    /// The left-hand side: this section's parents.
    pub lhs: FlowSide,
    /// The right-hand side: this section's children.
    pub rhs: FlowSide,
}

impl Flow {
    /// Parse a flow string. Exactly one `->` is required; either side may be
    /// empty, a wildcard, or a comma-separated name list.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(2, "->");
        let lhs = parts
            .next()
            .ok_or_else(|| OctopusError::invalid_configuration(format!("malformed flow `{raw}`")))?;
        let rhs = parts
            .next()
            .ok_or_else(|| OctopusError::invalid_configuration(format!("flow `{raw}` is missing `->`")))?;
        if parts.next().is_some() {
            return Err(OctopusError::invalid_configuration(format!(
                "flow `{raw}` has more than one `->`"
            )));
        }
        Ok(Flow {
            lhs: FlowSide::parse(lhs),
            rhs: FlowSide::parse(rhs),
        })
    }
}

fn duration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)\s*([a-zA-Z]+)$").expect("valid regex"))
}

/// Parse a human-readable duration such as `"30s"`, `"2m"`, `"1h"`.
///
/// Recognized units: `s`/`sec`/`secs`/`second`/`seconds`, `m`/`min`/`mins`/
/// `minute`/`minutes`, `h`/`hr`/`hrs`/`hour`/`hours`. Whitespace between the
/// number and the unit is allowed. Anything else is rejected with
/// [`OctopusError::InvalidConfiguration`].
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim();
    let captures = duration_pattern()
        .captures(trimmed)
        .ok_or_else(|| OctopusError::invalid_configuration(format!("malformed duration `{raw}`")))?;
    let amount: u64 = captures[1]
        .parse()
        .map_err(|_| OctopusError::invalid_configuration(format!("malformed duration `{raw}`")))?;
    let unit = &captures[2];
    let seconds = match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => amount,
        "m" | "min" | "mins" | "minute" | "minutes" => amount * 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => amount * 3600,
        other => {
            return Err(OctopusError::invalid_configuration(format!(
                "unknown duration unit `{other}` in `{raw}`"
            )))
        }
    };
    Ok(Duration::from_secs(seconds))
}

/// One section of the configuration document, exactly as YAML describes it.
/// `plugin` and `flow` are mandatory on every section; `schedule` only makes
/// sense on sources, `throttle`/`batch` only on sinks, but this type doesn't
/// enforce that (the graph builder does, since it's the one that knows each
/// section's derived role).
#[derive(Debug, Clone, Deserialize)]
pub struct RawSection {
    /// The plugin id to resolve in the registry.
    pub plugin: String,
    /// The flow string placing this section in the graph.
    pub flow: String,
    /// A five-field cron expression, for scheduled sources.
    pub schedule: Option<String>,
    /// A duration string gating how often a sink may run.
    pub throttle: Option<String>,
    /// A duration string: how long a sink waits, since the oldest buffered
    /// event arrived, before flushing whatever it has accumulated.
    pub batch: Option<String>,
    /// Whatever parameters remain belong to the plugin itself.
    #[serde(flatten)]
    pub params: HashMap<String, serde_yaml::Value>,
}

/// The full configuration document: a map from section name to its contents.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig(pub HashMap<String, RawSection>);

impl PipelineConfig {
    /// Parse a configuration document from its YAML text.
    pub fn from_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Read and parse a configuration document from a file on disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_str(&raw)
    }

    /// The section named `name`, if any.
    pub fn section(&self, name: &str) -> Option<&RawSection> {
        self.0.get(name)
    }

    /// All section names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_minutes_hours() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("5 minutes").unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration("3 fortnights").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn flow_parses_wildcard_sides() {
        let flow = Flow::parse("* -> *").unwrap();
        assert_eq!(flow.lhs, FlowSide::Wildcard);
        assert_eq!(flow.rhs, FlowSide::Wildcard);
    }

    #[test]
    fn flow_parses_explicit_lists() {
        let flow = Flow::parse("a, b -> c").unwrap();
        assert_eq!(flow.lhs, FlowSide::Names(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(flow.rhs, FlowSide::Names(vec!["c".to_string()]));
    }

    #[test]
    fn flow_parses_empty_sides() {
        let source_flow = Flow::parse("-> a").unwrap();
        assert_eq!(source_flow.lhs, FlowSide::Names(Vec::new()));

        let sink_flow = Flow::parse("a ->").unwrap();
        assert_eq!(sink_flow.rhs, FlowSide::Names(Vec::new()));
    }

    #[test]
    fn flow_rejects_missing_arrow() {
        assert!(Flow::parse("a, b").is_err());
    }

    #[test]
    fn flow_side_matching_is_asymmetric_with_wildcard() {
        let wildcard_side = FlowSide::Wildcard;
        assert!(wildcard_side.matches("anything"));

        let explicit_side = FlowSide::Names(vec!["a".to_string()]);
        assert!(explicit_side.matches("a"));
        assert!(!explicit_side.matches("b"));
    }

    #[test]
    fn pipeline_config_parses_sections() {
        let yaml = r#"
read_sensor:
  plugin: sensor.read
  flow: "-> log"
  schedule: "*/5 * * * *"
log:
  plugin: log.print
  flow: "read_sensor ->"
  throttle: "30s"
  batch: "10s"
"#;
        let config = PipelineConfig::from_str(yaml).unwrap();
        let log = config.section("log").unwrap();
        assert_eq!(log.plugin, "log.print");
        assert_eq!(log.throttle.as_deref(), Some("30s"));
        assert_eq!(log.batch.as_deref(), Some("10s"));
    }
}
