//! ---
//! vdev_section: "02-messaging-data-model"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Attribute schema definitions and validation logic."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
//! Attribute schema for the virtual device.
//!
//! A device declares its attributes as `{"name": ..., "type": ...}` entries where
//! `type` is `"Boolean"`, `"Number"`, `"String"` or a non-empty list of strings
//! (an enumeration). [`AttributeSchema::compile`] validates those declarations and
//! produces an immutable registry plus the default value of every attribute.

use std::fmt;

use indexmap::IndexMap;
use serde_json::Value;

pub mod value;

pub use value::{AttributeValue, ValueMismatch};

/// Attribute value meaning "report the current value, do not write".
pub const READ_MARKER: &str = "?";

/// Wire representation of a literal `"?"` string value.
pub const READ_MARKER_ESCAPE: &str = "@$?@$";

/// Default value of String attributes.
pub const STRING_DEFAULT: &str = "-";

/// Shared result type for schema compilation.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Reasons a set of attribute declarations is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// The declaration list is absent.
    #[error("attributeTypes is not defined")]
    Missing,
    /// The declarations are not a list.
    #[error("attributeTypes should be a list")]
    NotASequence,
    /// An entry is not a mapping with a string `name` and a string or list `type`.
    #[error("invalid type definition at index {index}: {declaration}")]
    InvalidDeclaration { index: usize, declaration: String },
    /// A scalar type string is not one of the known kinds.
    #[error("unknown type \"{type_name}\" for attribute \"{name}\"")]
    UnknownType { name: String, type_name: String },
    /// Enumeration with no items.
    #[error("enum list is empty for attribute \"{name}\"")]
    EmptyEnum { name: String },
    /// Enumeration item that is not a string.
    #[error("invalid enum value {item} for attribute \"{name}\"")]
    InvalidEnumItem { name: String, item: String },
    /// Two declarations share a name.
    #[error("attribute \"{name}\" is declared more than once")]
    DuplicateName { name: String },
}

/// Kind of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Boolean,
    Number,
    String,
    Enum,
}

impl AttributeKind {
    fn from_type_name(type_name: &str) -> Option<Self> {
        match type_name {
            "Boolean" => Some(AttributeKind::Boolean),
            "Number" => Some(AttributeKind::Number),
            "String" => Some(AttributeKind::String),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeKind::Boolean => "Boolean",
            AttributeKind::Number => "Number",
            AttributeKind::String => "String",
            AttributeKind::Enum => "Enum",
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One compiled attribute declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeType {
    name: String,
    kind: AttributeKind,
    items: Vec<String>,
}

impl AttributeType {
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::scalar(name, AttributeKind::Boolean)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::scalar(name, AttributeKind::Number)
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::scalar(name, AttributeKind::String)
    }

    /// Enumeration type. Returns `None` for an empty item list.
    pub fn enumeration<I, S>(name: impl Into<String>, items: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let items: Vec<String> = items.into_iter().map(Into::into).collect();
        if items.is_empty() {
            return None;
        }
        Some(Self {
            name: name.into(),
            kind: AttributeKind::Enum,
            items,
        })
    }

    fn scalar(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            items: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AttributeKind {
        self.kind
    }

    /// Enumeration items; empty for scalar kinds.
    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// Value a freshly created device holds for this attribute.
    pub fn default_value(&self) -> AttributeValue {
        match self.kind {
            AttributeKind::Boolean => AttributeValue::Bool(false),
            AttributeKind::Number => AttributeValue::from(0i64),
            AttributeKind::String => AttributeValue::Text(STRING_DEFAULT.to_owned()),
            AttributeKind::Enum => AttributeValue::Text(self.items[0].clone()),
        }
    }

    /// Check a typed value against this declaration.
    pub fn validate(&self, value: &AttributeValue) -> Result<(), ValueMismatch> {
        let ok = match (self.kind, value) {
            (AttributeKind::Boolean, AttributeValue::Bool(_)) => true,
            (AttributeKind::Number, AttributeValue::Number(_)) => true,
            (AttributeKind::String, AttributeValue::Text(_)) => true,
            (AttributeKind::Enum, AttributeValue::Text(text)) => self.items.contains(text),
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(ValueMismatch::new(self.expected(), value.describe()))
        }
    }

    /// Check a raw JSON value and convert it.
    pub fn validate_json(&self, raw: &Value) -> Result<AttributeValue, ValueMismatch> {
        let typed = AttributeValue::from_json(raw)
            .ok_or_else(|| ValueMismatch::new(self.expected(), value::describe_json(raw)))?;
        self.validate(&typed)?;
        Ok(typed)
    }

    fn expected(&self) -> String {
        match self.kind {
            AttributeKind::Boolean => "boolean".to_owned(),
            AttributeKind::Number => "number".to_owned(),
            AttributeKind::String => "string".to_owned(),
            AttributeKind::Enum => format!("one of {:?}", self.items),
        }
    }
}

/// Immutable registry of attribute declarations, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSchema {
    types: IndexMap<String, AttributeType>,
}

impl AttributeSchema {
    /// Validate raw declarations (the `attributeTypes` value of a device file).
    pub fn compile(declarations: &Value) -> SchemaResult<Self> {
        let entries = match declarations {
            Value::Null => return Err(SchemaError::Missing),
            Value::Array(entries) => entries,
            _ => return Err(SchemaError::NotASequence),
        };

        let mut types = IndexMap::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let attribute = compile_declaration(index, entry)?;
            if types.contains_key(attribute.name()) {
                return Err(SchemaError::DuplicateName {
                    name: attribute.name,
                });
            }
            types.insert(attribute.name.clone(), attribute);
        }
        Ok(Self { types })
    }

    /// Build from already typed declarations, rejecting duplicates.
    pub fn from_types<I>(types: I) -> SchemaResult<Self>
    where
        I: IntoIterator<Item = AttributeType>,
    {
        let mut map = IndexMap::new();
        for attribute in types {
            if map.contains_key(attribute.name()) {
                return Err(SchemaError::DuplicateName {
                    name: attribute.name,
                });
            }
            map.insert(attribute.name.clone(), attribute);
        }
        Ok(Self { types: map })
    }

    pub fn get(&self, name: &str) -> Option<&AttributeType> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributeType> {
        self.types.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Default value of every attribute, in declaration order.
    pub fn defaults(&self) -> IndexMap<String, AttributeValue> {
        self.types
            .iter()
            .map(|(name, attribute)| (name.clone(), attribute.default_value()))
            .collect()
    }
}

fn compile_declaration(index: usize, entry: &Value) -> SchemaResult<AttributeType> {
    let invalid = || SchemaError::InvalidDeclaration {
        index,
        declaration: entry.to_string(),
    };
    let object = entry.as_object().ok_or_else(invalid)?;
    let name = object
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(invalid)?;
    match object.get("type") {
        Some(Value::String(type_name)) => AttributeKind::from_type_name(type_name)
            .map(|kind| AttributeType::scalar(name, kind))
            .ok_or_else(|| SchemaError::UnknownType {
                name: name.to_owned(),
                type_name: type_name.clone(),
            }),
        Some(Value::Array(items)) => {
            if items.is_empty() {
                return Err(SchemaError::EmptyEnum {
                    name: name.to_owned(),
                });
            }
            let items = items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| SchemaError::InvalidEnumItem {
                            name: name.to_owned(),
                            item: item.to_string(),
                        })
                })
                .collect::<SchemaResult<Vec<_>>>()?;
            Ok(AttributeType {
                name: name.to_owned(),
                kind: AttributeKind::Enum,
                items,
            })
        }
        _ => Err(invalid()),
    }
}
