//! ---
//! vdev_section: "02-messaging-data-model"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Wire codec helpers and transport abstractions."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use indexmap::IndexMap;
use vdev_schema::AttributeValue;

/// One entry of a batch: either a read request or a value to write.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchValue {
    /// The attribute's current value must be echoed back.
    Read,
    /// New value for the attribute.
    Write(AttributeValue),
}

impl BatchValue {
    /// Value carried by a write, `None` for a read request.
    pub fn as_value(&self) -> Option<&AttributeValue> {
        match self {
            BatchValue::Read => None,
            BatchValue::Write(value) => Some(value),
        }
    }

    /// True for a read request.
    pub fn is_read(&self) -> bool {
        matches!(self, BatchValue::Read)
    }
}

impl From<AttributeValue> for BatchValue {
    fn from(value: AttributeValue) -> Self {
        BatchValue::Write(value)
    }
}

/// Ordered mapping of attribute name to entry; one element of `DATA`.
pub type Batch = IndexMap<String, BatchValue>;

/// Turn a plain value mapping into a write-only batch.
pub fn batch_from_values<'a, I>(values: I) -> Batch
where
    I: IntoIterator<Item = (&'a String, &'a AttributeValue)>,
{
    values
        .into_iter()
        .map(|(name, value)| (name.clone(), BatchValue::Write(value.clone())))
        .collect()
}
