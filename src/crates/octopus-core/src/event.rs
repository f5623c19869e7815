//! The uniform event record that flows through every edge of the DAG.
//!
//! An [`Event`] is deliberately minimal: a UTC timestamp, a dotted name, and an
//! opaque value. The core never interprets `value` (that's left entirely to
//! plugins), so it's carried as a [`serde_json::Value`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One `{timestamp, name, value}` record.
///
/// `name` is expected to be a non-empty dotted path (e.g. `"sensor.kitchen.temp"`),
/// but the core does not enforce that beyond documentation (plugins own naming
/// conventions).
///
/// # Examples
///
/// ```rust
/// use octopus_core::event::Event;
/// use chrono::Utc;
/// use serde_json::json;
///
/// let event = Event::new(Utc::now(), "sensor.temp", json!(21.5));
/// assert_eq!(event.name, "sensor.temp");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Always UTC.
    pub timestamp: DateTime<Utc>,
    /// Non-empty dotted path.
    pub name: String,
    /// Opaque to the core.
    pub value: serde_json::Value,
}

impl Event {
    /// Build an event, stamping it with the given timestamp.
    pub fn new(timestamp: DateTime<Utc>, name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            timestamp,
            name: name.into(),
            value,
        }
    }

    /// Build an event stamped with the current instant.
    pub fn now(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(Utc::now(), name, value)
    }
}
