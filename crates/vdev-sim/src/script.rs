//! ---
//! vdev_section: "05-simulation"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Synthetic traffic streams and scheduling."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};
use vdev_schema::AttributeSchema;

use crate::spec::StreamSpecError;
use crate::{StreamData, StreamEvent, StreamGenerator};

/// Raw step as written in a script file.
#[derive(Debug, Deserialize)]
struct ScriptStep {
    data: Map<String, Value>,
    #[serde(default)]
    delay: f64,
}

/// Replays a fixed list of events, cycling back to the first after the last.
#[derive(Debug, Clone)]
pub struct ScriptedStream {
    name: String,
    events: Vec<StreamEvent>,
    cursor: usize,
}

impl ScriptedStream {
    /// An empty list produces a stream that ends immediately.
    pub fn from_events(name: impl Into<String>, events: Vec<StreamEvent>) -> Self {
        Self {
            name: name.into(),
            events,
            cursor: 0,
        }
    }

    /// Load `[{"data": {...}, "delay": secs}, ...]` and validate every value
    /// against `schema`.
    pub fn from_path(path: &Path, schema: &AttributeSchema) -> Result<Self, StreamSpecError> {
        let script_error = |reason: String| StreamSpecError::Script {
            path: path.display().to_string(),
            reason,
        };
        let contents = fs::read_to_string(path).map_err(|err| script_error(err.to_string()))?;
        let steps: Vec<ScriptStep> =
            serde_json::from_str(&contents).map_err(|err| script_error(err.to_string()))?;

        let mut events = Vec::with_capacity(steps.len());
        for (index, step) in steps.into_iter().enumerate() {
            let mut data = StreamData::with_capacity(step.data.len());
            for (name, raw) in &step.data {
                let attribute = schema
                    .get(name)
                    .ok_or_else(|| script_error(format!("step {index}: unknown attribute {name}")))?;
                let value = attribute
                    .validate_json(raw)
                    .map_err(|mismatch| script_error(format!("step {index}: {name}: {mismatch}")))?;
                data.insert(name.clone(), value);
            }
            events.push(StreamEvent::new(data, step.delay));
        }
        Ok(Self::from_events(format!("script:{}", path.display()), events))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl StreamGenerator for ScriptedStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn produce_next(&mut self) -> Option<StreamEvent> {
        if self.events.is_empty() {
            return None;
        }
        let event = self.events[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.events.len();
        Some(event)
    }
}
