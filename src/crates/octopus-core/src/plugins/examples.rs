//! A handful of trivial plugins: a source that emits a fixed burst of
//! events, a filter that uppercases string values, and a sink that logs each
//! event it sees. Useful for driving the graph builder and scheduler in
//! tests without depending on any real I/O.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tracing::info;

use crate::error::Result;
use crate::event::Event;
use crate::plugin::{Callable, ConfigSchema, DeclaredParam, DeclaredType, FilterCallable, PluginRegistry, SinkCallable, SourceCallable};
use crate::stream::Stream;

/// Emits `count` events named `"{prefix}.{n}"` with a null value, once per
/// run, then ends. `count` defaults to `1`.
pub struct ClockSource;

#[async_trait]
impl SourceCallable for ClockSource {
    async fn run(&self, params: &Value) -> Result<Stream> {
        let prefix = params
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or("tick")
            .to_string();
        let count = params.get("count").and_then(Value::as_u64).unwrap_or(1);

        let events: Vec<Result<Event>> = (0..count)
            .map(|n| Ok(Event::new(Utc::now(), format!("{prefix}.{n}"), Value::Null)))
            .collect();
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

/// Uppercases the value of every event whose `value` is a JSON string;
/// passes everything else through unchanged.
pub struct UppercaseFilter;

#[async_trait]
impl FilterCallable for UppercaseFilter {
    async fn run(&self, upstream: Stream, _params: &Value) -> Result<Stream> {
        Ok(Box::pin(upstream.map(|item| {
            item.map(|mut event| {
                if let Value::String(s) = &event.value {
                    event.value = Value::String(s.to_uppercase());
                }
                event
            })
        })))
    }
}

/// Logs every event at INFO and discards it.
pub struct LogSink;

#[async_trait]
impl SinkCallable for LogSink {
    async fn run(&self, mut upstream: Stream, _params: &Value) -> Result<()> {
        while let Some(event) = upstream.next().await {
            let event = event?;
            info!(name = %event.name, value = %event.value, "event");
        }
        Ok(())
    }
}

/// Register [`ClockSource`], [`UppercaseFilter`], and [`LogSink`] under
/// `examples.clock`, `examples.uppercase`, and `examples.log`.
///
/// `examples.clock`'s schema is auto-derived from its parameter list via
/// [`ConfigSchema::derive`] rather than hand-written, to exercise that path;
/// the registration panics on `Err` because the declared types here are known
/// good (`string`/`integer` only); a real plugin author would surface the
/// `UnsupportedType` failure instead of unwrapping it away.
pub fn register(registry: &mut PluginRegistry) {
    let clock_schema = ConfigSchema::derive(
        "examples.clock",
        &[
            DeclaredParam {
                name: "prefix",
                declared_type: DeclaredType::String,
                default: Some(Value::String("tick".to_string())),
            },
            DeclaredParam {
                name: "count",
                declared_type: DeclaredType::Integer,
                default: Some(Value::from(1)),
            },
        ],
    )
    .expect("examples.clock's declared parameter types are known-supported");
    registry.register("examples.clock", Callable::Source(std::sync::Arc::new(ClockSource)), clock_schema);
    registry.register(
        "examples.uppercase",
        Callable::Filter(std::sync::Arc::new(UppercaseFilter)),
        ConfigSchema::empty(),
    );
    registry.register(
        "examples.log",
        Callable::Sink(std::sync::Arc::new(LogSink)),
        ConfigSchema::empty(),
    );
}
