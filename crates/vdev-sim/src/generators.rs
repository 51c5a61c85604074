//! ---
//! vdev_section: "05-simulation"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Synthetic traffic streams and scheduling."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use rand::prelude::*;
use rand_distr::StandardNormal;
use vdev_schema::AttributeValue;

use crate::{StreamData, StreamEvent, StreamGenerator};

const TOGGLE_MEAN_SECS: f64 = 2.0;
const TOGGLE_STD_DEV_SECS: f64 = 1.0;

const PATTERN_WIDTH: usize = 16;
const RAMP_UP_DELAY: f64 = 0.5;
const FLASH_DELAY: f64 = 0.2;
const FLASH_STEPS: usize = 4;
const RAMP_DOWN_DELAY: f64 = 0.4;

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Alternates a Boolean attribute between `true` and `false`, with normally
/// distributed delays (mean 2 s, deviation 1 s). Negative samples mean no wait.
#[derive(Debug)]
pub struct BoolToggle {
    name: String,
    attribute: String,
    rng: StdRng,
    next: bool,
}

impl BoolToggle {
    pub fn new(attribute: impl Into<String>, seed: Option<u64>) -> Self {
        let attribute = attribute.into();
        Self {
            name: format!("toggle:{attribute}"),
            attribute,
            rng: rng_from(seed),
            next: true,
        }
    }
}

impl StreamGenerator for BoolToggle {
    fn name(&self) -> &str {
        &self.name
    }

    fn produce_next(&mut self) -> Option<StreamEvent> {
        let value = self.next;
        self.next = !value;
        let noise: f64 = self.rng.sample(StandardNormal);
        let delay = TOGGLE_MEAN_SECS + TOGGLE_STD_DEV_SECS * noise;
        Some(StreamEvent::single(&self.attribute, value.into(), delay))
    }
}

/// Counts a Number attribute up from zero at a fixed period.
#[derive(Debug)]
pub struct Counter {
    name: String,
    attribute: String,
    period: f64,
    next: u64,
}

impl Counter {
    pub const DEFAULT_PERIOD_SECS: f64 = 0.2;

    pub fn new(attribute: impl Into<String>, period_secs: f64) -> Self {
        let attribute = attribute.into();
        Self {
            name: format!("counter:{attribute}"),
            attribute,
            period: period_secs,
            next: 0,
        }
    }
}

impl StreamGenerator for Counter {
    fn name(&self) -> &str {
        &self.name
    }

    fn produce_next(&mut self) -> Option<StreamEvent> {
        let value = self.next;
        self.next += 1;
        Some(StreamEvent::single(&self.attribute, value.into(), self.period))
    }
}

/// Animates a String attribute: sixteen `>` steps growing, four flashes, then
/// sixteen `<` steps shrinking. While growing, an optional Enum attribute gets
/// a random item; while shrinking it is pinned to the last item.
#[derive(Debug)]
pub struct StringPattern {
    name: String,
    text: String,
    choice: Option<(String, Vec<String>)>,
    rng: StdRng,
    step: usize,
}

impl StringPattern {
    const CYCLE: usize = PATTERN_WIDTH + FLASH_STEPS + PATTERN_WIDTH;

    /// `choice` is the Enum attribute name with its items; an empty item list
    /// disables it.
    pub fn new(
        text: impl Into<String>,
        choice: Option<(String, Vec<String>)>,
        seed: Option<u64>,
    ) -> Self {
        let text = text.into();
        Self {
            name: format!("pattern:{text}"),
            text,
            choice: choice.filter(|(_, items)| !items.is_empty()),
            rng: rng_from(seed),
            step: 0,
        }
    }

    fn frame(&mut self, step: usize) -> (String, Option<String>, f64) {
        if step < PATTERN_WIDTH {
            let pick = self
                .choice
                .as_ref()
                .and_then(|(_, items)| items.choose(&mut self.rng).cloned());
            return (">".repeat(step), pick, RAMP_UP_DELAY);
        }
        let step = step - PATTERN_WIDTH;
        if step < FLASH_STEPS {
            let glyph = if step % 2 == 0 { "<" } else { ">" };
            return (glyph.repeat(PATTERN_WIDTH), None, FLASH_DELAY);
        }
        let width = PATTERN_WIDTH - 1 - (step - FLASH_STEPS);
        let last = self
            .choice
            .as_ref()
            .and_then(|(_, items)| items.last().cloned());
        ("<".repeat(width), last, RAMP_DOWN_DELAY)
    }
}

impl StreamGenerator for StringPattern {
    fn name(&self) -> &str {
        &self.name
    }

    fn produce_next(&mut self) -> Option<StreamEvent> {
        let (text, pick, delay) = self.frame(self.step);
        self.step = (self.step + 1) % Self::CYCLE;

        let mut data = StreamData::with_capacity(2);
        data.insert(self.text.clone(), AttributeValue::Text(text));
        if let (Some((attribute, _)), Some(item)) = (&self.choice, pick) {
            data.insert(attribute.clone(), AttributeValue::Text(item));
        }
        Some(StreamEvent::new(data, delay))
    }
}
