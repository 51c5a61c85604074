//! ---
//! vdev_section: "05-simulation"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Synthetic traffic streams and scheduling."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
//! Synthetic telemetry for the virtual device.
//!
//! A stream is any [`StreamGenerator`]: an endless sequence of attribute
//! updates, each paired with the delay to wait before it is emitted. The
//! [`TrafficScheduler`] runs one task per stream and funnels every update into
//! a single [`StreamQueue`].

use std::time::Duration;

use indexmap::IndexMap;
use vdev_schema::AttributeValue;

pub mod generators;
pub mod runner;
pub mod script;
pub mod spec;

pub use generators::{BoolToggle, Counter, StringPattern};
pub use runner::{SchedulerError, StreamQueue, StreamRunner, TrafficScheduler};
pub use script::ScriptedStream;
pub use spec::{build_streams, demo_streams, StreamSpec, StreamSpecError};

/// Attribute values produced by one stream step.
pub type StreamData = IndexMap<String, AttributeValue>;

/// Longest wait a single stream step can request; larger delays saturate here.
pub const MAX_STREAM_WAIT: Duration = Duration::from_secs(365 * 24 * 3600);

/// One step of a stream: the data to enqueue and the seconds to wait first.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub data: StreamData,
    pub delay: f64,
}

impl StreamEvent {
    pub fn new(data: StreamData, delay: f64) -> Self {
        Self { data, delay }
    }

    /// Single-attribute event.
    pub fn single(name: impl Into<String>, value: AttributeValue, delay: f64) -> Self {
        let mut data = StreamData::with_capacity(1);
        data.insert(name.into(), value);
        Self { data, delay }
    }

    /// Wait before enqueueing, capped at [`MAX_STREAM_WAIT`]; `None` for
    /// negative or non-finite delays.
    pub fn wait(&self) -> Option<Duration> {
        if !self.delay.is_finite() || self.delay < 0.0 {
            return None;
        }
        let wait = Duration::try_from_secs_f64(self.delay).unwrap_or(MAX_STREAM_WAIT);
        Some(wait.min(MAX_STREAM_WAIT))
    }
}

/// Lazy, endless source of [`StreamEvent`]s.
///
/// Returning `None`, or an event with empty data, ends the stream.
pub trait StreamGenerator: Send + 'static {
    /// Label used in logs.
    fn name(&self) -> &str;
    fn produce_next(&mut self) -> Option<StreamEvent>;
}

impl<G: StreamGenerator + ?Sized> StreamGenerator for Box<G> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn produce_next(&mut self) -> Option<StreamEvent> {
        (**self).produce_next()
    }
}
