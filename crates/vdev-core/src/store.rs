//! ---
//! vdev_section: "01-core-functionality"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Device state store and protocol engine."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
//! Current attribute values of the device.
//!
//! One entry per schema attribute, created with defaults and only ever
//! replaced. Writes are serialized behind a single lock; a list of batches is
//! applied under one acquisition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};
use vdev_logging::{tracing_sink, LogRecord, SharedSink};
use vdev_msg::{Batch, BatchValue};
use vdev_schema::{AttributeSchema, AttributeValue, READ_MARKER, READ_MARKER_ESCAPE};

const COMPONENT: &str = "store";

/// Full or partial copy of the device state.
pub type StateSnapshot = IndexMap<String, AttributeValue>;

/// Attribute names whose current value must be echoed back.
pub type ReadRequest = IndexSet<String>;

/// Callback invoked with the full state after every applied batch.
pub type StateObserver = Arc<dyn Fn(&StateSnapshot) + Send + Sync>;

/// Handle returned by [`DeviceStateStore::register_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("attribute \"{0}\" is not declared")]
    UnknownAttribute(String),
    #[error("invalid value for \"{name}\": expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

pub struct DeviceStateStore {
    schema: Arc<AttributeSchema>,
    values: RwLock<StateSnapshot>,
    observers: Mutex<Vec<(ObserverId, StateObserver)>>,
    next_observer: AtomicU64,
    sink: SharedSink,
}

impl DeviceStateStore {
    /// Store holding the schema defaults.
    pub fn new(schema: Arc<AttributeSchema>) -> Self {
        let values = schema.defaults();
        Self {
            schema,
            values: RwLock::new(values),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(0),
            sink: tracing_sink(),
        }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn schema(&self) -> &Arc<AttributeSchema> {
        &self.schema
    }

    pub fn get_all(&self) -> StateSnapshot {
        self.values.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<AttributeValue> {
        self.values.read().get(name).cloned()
    }

    /// Values of the named attributes, in the order given.
    pub fn get_subset<'a, I>(&self, names: I) -> Result<StateSnapshot, StoreError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let values = self.values.read();
        names
            .into_iter()
            .map(|name| {
                values
                    .get(name)
                    .map(|value| (name.to_owned(), value.clone()))
                    .ok_or_else(|| StoreError::UnknownAttribute(name.to_owned()))
            })
            .collect()
    }

    /// Write one already validated value.
    pub fn apply(&self, name: &str, value: AttributeValue) -> Result<(), StoreError> {
        let mut values = self.values.write();
        self.write(&mut values, name, value)
    }

    /// Apply one batch; see [`apply_batches`](Self::apply_batches).
    pub fn apply_batch(&self, batch: &Batch) -> Result<ReadRequest, StoreError> {
        self.apply_batches(std::slice::from_ref(batch))
    }

    /// Apply decoded batches in order under one write lock.
    ///
    /// Read markers are collected without writing; every other entry is
    /// written and collected too, so the result names every attribute touched.
    /// Nothing is written when any name is undeclared. Observers run once
    /// afterwards with the full state.
    pub fn apply_batches(&self, batches: &[Batch]) -> Result<ReadRequest, StoreError> {
        let mut request = ReadRequest::new();
        {
            let mut values = self.values.write();
            if let Some(name) = batches
                .iter()
                .flat_map(|batch| batch.keys())
                .find(|name| !values.contains_key(name.as_str()))
            {
                return Err(StoreError::UnknownAttribute(name.clone()));
            }
            for (name, entry) in batches.iter().flatten() {
                match entry {
                    BatchValue::Read => {}
                    BatchValue::Write(AttributeValue::Text(text)) if text == READ_MARKER_ESCAPE => {
                        self.write(&mut values, name, AttributeValue::Text(READ_MARKER.to_owned()))?;
                    }
                    BatchValue::Write(value) => self.write(&mut values, name, value.clone())?,
                }
                request.insert(name.clone());
            }
        }
        self.notify();
        Ok(request)
    }

    /// Validate plain values against the schema, then write all of them.
    ///
    /// Used for locally originated updates; returns the names written.
    pub fn update(&self, updates: &StateSnapshot) -> Result<ReadRequest, StoreError> {
        for (name, value) in updates {
            let attribute = self
                .schema
                .get(name)
                .ok_or_else(|| StoreError::UnknownAttribute(name.clone()))?;
            attribute
                .validate(value)
                .map_err(|mismatch| StoreError::TypeMismatch {
                    name: name.clone(),
                    expected: mismatch.expected,
                    actual: mismatch.actual,
                })?;
        }
        {
            let mut values = self.values.write();
            for (name, value) in updates {
                self.write(&mut values, name, value.clone())?;
            }
        }
        self.notify();
        Ok(updates.keys().cloned().collect())
    }

    pub fn register_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&StateSnapshot) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, Arc::new(observer)));
        id
    }

    /// Returns false when `id` was not registered.
    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    fn write(
        &self,
        values: &mut StateSnapshot,
        name: &str,
        value: AttributeValue,
    ) -> Result<(), StoreError> {
        let slot = values
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownAttribute(name.to_owned()))?;
        self.sink.record(
            LogRecord::info(COMPONENT, "attribute written")
                .field("attribute", name)
                .field("value", &value),
        );
        *slot = value;
        Ok(())
    }

    fn notify(&self) {
        let observers: Vec<StateObserver> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        if observers.is_empty() {
            return;
        }
        let snapshot = self.get_all();
        for observer in observers {
            observer(&snapshot);
        }
    }
}

impl std::fmt::Debug for DeviceStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStateStore")
            .field("values", &*self.values.read())
            .field("observers", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdev_logging::memory_sink;
    use vdev_schema::AttributeType;

    fn store() -> DeviceStateStore {
        let schema = AttributeSchema::from_types([
            AttributeType::boolean("a"),
            AttributeType::number("b"),
            AttributeType::string("c"),
            AttributeType::enumeration("d", ["x", "y"]).unwrap(),
        ])
        .unwrap();
        DeviceStateStore::new(Arc::new(schema))
    }

    fn batch(entries: &[(&str, BatchValue)]) -> Batch {
        entries
            .iter()
            .map(|(name, value)| ((*name).to_owned(), value.clone()))
            .collect()
    }

    #[test]
    fn starts_with_defaults() {
        let store = store();
        let all = store.get_all();
        assert_eq!(all["a"], AttributeValue::Bool(false));
        assert_eq!(all["b"], AttributeValue::from(0i64));
        assert_eq!(all["c"], AttributeValue::from("-"));
        assert_eq!(all["d"], AttributeValue::from("x"));
    }

    #[test]
    fn read_markers_are_collected_but_not_written() {
        let store = store();
        let request = store
            .apply_batch(&batch(&[
                ("a", BatchValue::Read),
                ("b", BatchValue::Write(5i64.into())),
            ]))
            .unwrap();
        assert_eq!(request.iter().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(store.get("a"), Some(AttributeValue::Bool(false)));
        assert_eq!(store.get("b"), Some(AttributeValue::from(5i64)));
    }

    #[test]
    fn escaped_marker_writes_literal_question_mark() {
        let store = store();
        store
            .apply_batch(&batch(&[(
                "c",
                BatchValue::Write(AttributeValue::from(READ_MARKER_ESCAPE)),
            )]))
            .unwrap();
        assert_eq!(store.get("c"), Some(AttributeValue::from("?")));
    }

    #[test]
    fn unknown_names_leave_the_state_untouched() {
        let store = store();
        let batches = [
            batch(&[("b", BatchValue::Write(9i64.into()))]),
            batch(&[("zz", BatchValue::Read)]),
        ];
        assert_eq!(
            store.apply_batches(&batches),
            Err(StoreError::UnknownAttribute("zz".into()))
        );
        assert_eq!(store.get("b"), Some(AttributeValue::from(0i64)));
        assert!(store.get_subset(["a", "nope"]).is_err());
        assert_eq!(store.get_subset(["d", "a"]).unwrap().len(), 2);
    }

    #[test]
    fn observers_see_full_snapshots_until_unregistered() {
        let store = store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let id = store.register_observer(move |snapshot| captured.lock().push(snapshot.clone()));

        store
            .apply_batches(&[
                batch(&[("a", BatchValue::Write(true.into()))]),
                batch(&[("b", BatchValue::Write(2i64.into()))]),
            ])
            .unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].len(), 4);
        assert_eq!(seen.lock()[0]["a"], AttributeValue::Bool(true));

        assert!(store.unregister_observer(id));
        assert!(!store.unregister_observer(id));
        store
            .apply_batch(&batch(&[("a", BatchValue::Read)]))
            .unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn update_validates_before_writing() {
        let store = store();
        let mut updates = StateSnapshot::new();
        updates.insert("b".into(), 3i64.into());
        updates.insert("d".into(), "z".into());
        assert!(matches!(
            store.update(&updates),
            Err(StoreError::TypeMismatch { ref name, .. }) if name == "d"
        ));
        assert_eq!(store.get("b"), Some(AttributeValue::from(0i64)));

        updates.insert("d".into(), "y".into());
        let written = store.update(&updates).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(store.get("d"), Some(AttributeValue::from("y")));
    }

    #[test]
    fn writes_are_audited() {
        let (sink, memory) = memory_sink();
        let store = store().with_sink(sink);
        store.apply("c", AttributeValue::from("hello")).unwrap();
        let records = memory.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("attribute"), Some("c"));
        assert_eq!(records[0].get("value"), Some("hello"));
        assert_eq!(
            store.apply("nope", true.into()),
            Err(StoreError::UnknownAttribute("nope".into()))
        );
    }
}
