//! # octopus-core
//!
//! Runtime for Señor Octopus event pipelines: a small number of sources
//! produce events, filters transform them, and sinks consume them, all wired
//! together by a flow grammar in a YAML configuration document instead of
//! code.
//!
//! ```text
//!   +--------+      +--------+      +--------+
//!   | source | ---> | filter | ---> |  sink  |
//!   +--------+      +--------+      +--------+
//!        \                               ^
//!         \----------- tee / merge ------/
//! ```
//!
//! A configuration document ([`config::PipelineConfig`]) is built into a
//! [`dag::Dag`] of named sections; each section's role (source, filter, or
//! sink) falls out of the shape of its `flow` string rather than being
//! declared directly. A [`scheduler::Scheduler`] then drives the graph: it
//! runs event-driven sources once, runs cron-scheduled sources on their own
//! clock, and for each run, pulls the source's plugin, tees its output down
//! through however many filters and sinks are reachable, merging wherever a
//! node has more than one parent.
//!
//! Plugins are not part of this crate. A plugin registers itself in a
//! [`plugin::PluginRegistry`] under a dotted id and implements exactly one of
//! [`plugin::SourceCallable`], [`plugin::FilterCallable`], or
//! [`plugin::SinkCallable`] (the registry only needs to know the shape, not
//! the behavior). [`plugins::examples`] ships a handful of trivial in-process
//! plugins purely to exercise the registry, graph builder, and scheduler in
//! this crate's own tests; they are not a real plugin catalogue.

pub mod config;
pub mod dag;
pub mod error;
pub mod event;
pub mod plugin;
pub mod plugins;
pub mod sink;
pub mod stream;

pub mod scheduler;

pub use crate::config::PipelineConfig;
pub use crate::dag::{build_dag, Dag};
pub use crate::error::{OctopusError, Result};
pub use crate::event::Event;
pub use crate::plugin::{Callable, PluginRegistry};
pub use crate::scheduler::Scheduler;
pub use crate::stream::{merge, tee, Stream};
