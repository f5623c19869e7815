//! Error types for graph construction and execution.
//!
//! `OctopusError` covers the taxonomy a pipeline run can hit: bad configuration at
//! startup, an unknown plugin id, a plugin schema the registry can't auto-derive, a
//! plugin that fails while running, and cooperative cancellation. Configuration
//! errors are raised synchronously and abort startup; `PluginFailure` inside a
//! supervised task is caught, logged, and never escapes the scheduler loop.
//!
//! # Examples
//!
//! ```rust
//! use octopus_core::error::OctopusError;
//!
//! let err = OctopusError::UnknownPlugin("does.not.exist".to_string());
//! assert_eq!(format!("{err}"), "unknown plugin `does.not.exist`");
//! ```

use std::sync::Arc;
use thiserror::Error;

/// Convenience alias for `Result<T, OctopusError>`.
pub type Result<T> = std::result::Result<T, OctopusError>;

/// All errors that can occur building or running a pipeline.
#[derive(Error, Debug)]
pub enum OctopusError {
    /// The configuration document is malformed: a missing `flow`/`plugin` key, an
    /// unknown plugin option, a failed schema validation, or a malformed duration or
    /// cron string.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A section named a plugin id that isn't in the registry.
    #[error("unknown plugin `{0}`")]
    UnknownPlugin(String),

    /// Schema auto-derivation hit a declared parameter type it doesn't know how to
    /// map to a config field.
    #[error("unsupported parameter type `{0}` for plugin `{1}`")]
    UnsupportedType(String, String),

    /// A plugin raised while running. Carries the node name for context.
    #[error("plugin failure in node `{node}`: {source}")]
    PluginFailure {
        /// Name of the node whose plugin failed.
        node: String,
        /// Underlying error from the plugin.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Cooperative cancellation reached this point.
    ///
    /// The scheduler itself cancels in-flight runs via `JoinSet::abort_all`,
    /// which doesn't need this variant (a plugin that polls its own
    /// cancellation signal, a `CancellationToken` it was handed say, returns
    /// this to report it cooperatively instead of being forcibly aborted).
    #[error("cancelled")]
    Cancelled,

    /// Wraps `std::io::Error` from reading a configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps `serde_yaml::Error` from parsing the configuration document.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A failure replicated to more than one consumer of a fanned-out stream.
    ///
    /// `tee` can only pull upstream once per round but has to hand the same
    /// failure to every derived stream, so the original error is wrapped in an
    /// `Arc` the first time it's observed and handed out from there.
    #[error("{0}")]
    Shared(Arc<OctopusError>),
}

impl OctopusError {
    /// Build a [`OctopusError::PluginFailure`] from a node name and any boxed error.
    pub fn plugin_failure(
        node: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::PluginFailure {
            node: node.into(),
            source: source.into(),
        }
    }

    /// Build an [`OctopusError::InvalidConfiguration`] with a formatted message.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_plugin_message() {
        let err = OctopusError::UnknownPlugin("mqtt.fancy".to_string());
        assert_eq!(format!("{err}"), "unknown plugin `mqtt.fancy`");
    }

    #[test]
    fn plugin_failure_names_the_node() {
        let err = OctopusError::plugin_failure("log_sink", "boom".to_string());
        assert!(format!("{err}").contains("log_sink"));
        assert!(format!("{err}").contains("boom"));
    }
}
