//! ---
//! vdev_section: "02-messaging-data-model"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Wire codec helpers and transport abstractions."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
//! JSON wire format, validated against the attribute schema.
//!
//! A message is `{"DATA": batch}` or `{"DATA": [batch, ...]}`. Inside a batch
//! the string `"?"` asks for the attribute's current value, and `"@$?@$"`
//! stands for a literal `"?"`. Decoding is all-or-nothing: the first invalid
//! entry rejects the whole message.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use vdev_schema::{AttributeSchema, AttributeValue, READ_MARKER, READ_MARKER_ESCAPE};
use vdev_security::{CipherError, SharedCipher};

use crate::batch::{batch_from_values, Batch, BatchValue};

/// Top-level field holding the batches.
pub const DATA_FIELD: &str = "DATA";

/// Reasons an inbound payload is dropped.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Decryption or transport decoding failed.
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    /// Not JSON, not UTF-8, or not shaped like a message.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// A required top-level field is absent.
    #[error("missing \"{0}\" field")]
    MissingField(&'static str),
    /// A batch names an attribute the device does not declare.
    #[error("unknown attribute \"{name}\"")]
    UnknownAttribute {
        /// Offending attribute name.
        name: String,
    },
    /// A value does not fit the declared attribute kind.
    #[error("type mismatch for \"{name}\": expected {expected}, got {actual}")]
    TypeMismatch {
        /// Attribute name.
        name: String,
        /// Description of the accepted values.
        expected: String,
        /// Description of the received value.
        actual: String,
    },
}

impl DecodeError {
    /// Attribute the error refers to, when there is one.
    pub fn attribute(&self) -> Option<&str> {
        match self {
            DecodeError::UnknownAttribute { name } | DecodeError::TypeMismatch { name, .. } => {
                Some(name)
            }
            _ => None,
        }
    }
}

/// Reasons an outbound payload cannot be produced.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Encryption failed.
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
}

/// Serializes and validates wire messages for one device.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    schema: Arc<AttributeSchema>,
    cipher: Option<SharedCipher>,
}

impl MessageCodec {
    /// Codec for `schema`; payloads pass through `cipher` when one is given.
    pub fn new(schema: Arc<AttributeSchema>, cipher: Option<SharedCipher>) -> Self {
        Self { schema, cipher }
    }

    /// Schema used for validation.
    pub fn schema(&self) -> &Arc<AttributeSchema> {
        &self.schema
    }

    /// Whether payloads are encrypted.
    pub fn is_ciphered(&self) -> bool {
        self.cipher.is_some()
    }

    /// Decrypt, parse and validate a payload.
    pub fn decode(&self, raw: &[u8]) -> Result<Vec<Batch>, DecodeError> {
        let plaintext = match &self.cipher {
            Some(cipher) => cipher.decrypt(raw)?,
            None => raw.to_vec(),
        };
        let message: Value = serde_json::from_slice(&plaintext)
            .map_err(|err| DecodeError::Malformed(err.to_string()))?;
        let object = message
            .as_object()
            .ok_or_else(|| DecodeError::Malformed("message is not a JSON object".to_owned()))?;
        let data = object
            .get(DATA_FIELD)
            .ok_or(DecodeError::MissingField(DATA_FIELD))?;

        match data {
            Value::Object(entries) => Ok(vec![self.decode_batch(entries)?]),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::Object(entries) => self.decode_batch(entries),
                    other => Err(DecodeError::Malformed(format!(
                        "batch is not a mapping: {other}"
                    ))),
                })
                .collect(),
            other => Err(DecodeError::Malformed(format!(
                "{DATA_FIELD} must be a mapping or a list of mappings, got {other}"
            ))),
        }
    }

    fn decode_batch(&self, entries: &Map<String, Value>) -> Result<Batch, DecodeError> {
        let mut batch = Batch::with_capacity(entries.len());
        for (name, raw) in entries {
            let attribute = self
                .schema
                .get(name)
                .ok_or_else(|| DecodeError::UnknownAttribute { name: name.clone() })?;
            let entry = match raw.as_str() {
                Some(READ_MARKER) => BatchValue::Read,
                Some(READ_MARKER_ESCAPE) => {
                    let literal = AttributeValue::Text(READ_MARKER.to_owned());
                    attribute
                        .validate(&literal)
                        .map_err(|mismatch| DecodeError::TypeMismatch {
                            name: name.clone(),
                            expected: mismatch.expected,
                            actual: mismatch.actual,
                        })?;
                    BatchValue::Write(literal)
                }
                _ => {
                    let value =
                        attribute
                            .validate_json(raw)
                            .map_err(|mismatch| DecodeError::TypeMismatch {
                                name: name.clone(),
                                expected: mismatch.expected,
                                actual: mismatch.actual,
                            })?;
                    BatchValue::Write(value)
                }
            };
            batch.insert(name.clone(), entry);
        }
        Ok(batch)
    }

    /// Serialize batches as `{"DATA": [...]}` and encrypt when configured.
    ///
    /// Values are not re-validated.
    pub fn encode(&self, batches: &[Batch]) -> Result<Vec<u8>, EncodeError> {
        let data: Vec<Value> = batches
            .iter()
            .map(|batch| {
                Value::Object(
                    batch
                        .iter()
                        .map(|(name, entry)| (name.clone(), encode_entry(entry)))
                        .collect(),
                )
            })
            .collect();
        let mut message = Map::new();
        message.insert(DATA_FIELD.to_owned(), Value::Array(data));
        let plaintext = serde_json::to_vec(&Value::Object(message))?;
        match &self.cipher {
            Some(cipher) => Ok(cipher.encrypt(&plaintext)?.into_bytes()),
            None => Ok(plaintext),
        }
    }

    /// Encode a single write batch built from plain values.
    pub fn encode_values(
        &self,
        values: &IndexMap<String, AttributeValue>,
    ) -> Result<Vec<u8>, EncodeError> {
        self.encode(&[batch_from_values(values)])
    }
}

fn encode_entry(entry: &BatchValue) -> Value {
    match entry {
        BatchValue::Read => Value::String(READ_MARKER.to_owned()),
        BatchValue::Write(AttributeValue::Text(text)) if text == READ_MARKER => {
            Value::String(READ_MARKER_ESCAPE.to_owned())
        }
        BatchValue::Write(value) => value.to_json(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vdev_schema::AttributeType;
    use vdev_security::{build_cipher, CipherScheme};

    fn schema() -> Arc<AttributeSchema> {
        Arc::new(
            AttributeSchema::from_types([
                AttributeType::boolean("f_bool"),
                AttributeType::number("f_num"),
                AttributeType::string("f_str"),
                AttributeType::enumeration("f_enum", ["low", "high"]).unwrap(),
            ])
            .unwrap(),
        )
    }

    fn plain() -> MessageCodec {
        MessageCodec::new(schema(), None)
    }

    fn bytes(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn decodes_single_mapping_and_list() {
        let codec = plain();
        let single = codec
            .decode(&bytes(json!({"DATA": {"f_bool": true, "f_num": "?"}})))
            .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0]["f_bool"], BatchValue::Write(AttributeValue::Bool(true)));
        assert_eq!(single[0]["f_num"], BatchValue::Read);

        let list = codec
            .decode(&bytes(json!({"DATA": [{"f_num": 1.5}, {"f_enum": "high"}]})))
            .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1]["f_enum"], BatchValue::Write("high".into()));
    }

    #[test]
    fn round_trips_every_kind() {
        let codec = plain();
        let mut batch = Batch::new();
        batch.insert("f_bool".into(), BatchValue::Write(true.into()));
        batch.insert("f_num".into(), BatchValue::Write(AttributeValue::number(2.25).unwrap()));
        batch.insert("f_str".into(), BatchValue::Write("hello".into()));
        batch.insert("f_enum".into(), BatchValue::Read);
        let decoded = codec.decode(&codec.encode(&[batch.clone()]).unwrap()).unwrap();
        assert_eq!(decoded, vec![batch]);
    }

    #[test]
    fn literal_question_mark_is_escaped() {
        let codec = plain();
        let mut batch = Batch::new();
        batch.insert("f_str".into(), BatchValue::Write("?".into()));
        let wire = codec.encode(&[batch.clone()]).unwrap();
        let parsed: Value = serde_json::from_slice(&wire).unwrap();
        assert_eq!(parsed, json!({"DATA": [{"f_str": "@$?@$"}]}));
        assert_eq!(codec.decode(&wire).unwrap(), vec![batch]);
    }

    #[test]
    fn rejects_each_failure_cause() {
        let codec = plain();
        assert!(matches!(codec.decode(b"not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(
            codec.decode(&[0xff, 0xfe, 0x00]),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            codec.decode(&bytes(json!({"data": {}}))),
            Err(DecodeError::MissingField("DATA"))
        ));
        assert!(matches!(
            codec.decode(&bytes(json!({"DATA": 5}))),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            codec.decode(&bytes(json!({"DATA": [{"f_bool": true}, 3]}))),
            Err(DecodeError::Malformed(_))
        ));
        let err = codec
            .decode(&bytes(json!({"DATA": {"nope": 1}})))
            .unwrap_err();
        assert_eq!(err.attribute(), Some("nope"));
        assert!(matches!(err, DecodeError::UnknownAttribute { .. }));
    }

    #[test]
    fn type_mismatch_names_field_and_types() {
        let codec = plain();
        match codec.decode(&bytes(json!({"DATA": {"f_bool": "yes"}}))) {
            Err(DecodeError::TypeMismatch {
                name,
                expected,
                actual,
            }) => {
                assert_eq!(name, "f_bool");
                assert_eq!(expected, "boolean");
                assert!(actual.contains("yes"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(codec
            .decode(&bytes(json!({"DATA": {"f_enum": "medium"}})))
            .is_err());
        assert!(codec
            .decode(&bytes(json!({"DATA": {"f_enum": "@$?@$"}})))
            .is_err());
        assert!(codec.decode(&bytes(json!({"DATA": {"f_num": null}}))).is_err());
    }

    #[test]
    fn one_bad_batch_rejects_the_message() {
        let codec = plain();
        let result = codec.decode(&bytes(
            json!({"DATA": [{"f_num": 1}, {"f_num": true}]}),
        ));
        assert!(matches!(result, Err(DecodeError::TypeMismatch { .. })));
    }

    #[test]
    fn ciphered_codec_round_trips_and_rejects_plaintext() {
        for scheme in [CipherScheme::DesEcb, CipherScheme::AesCcm] {
            let codec = MessageCodec::new(schema(), Some(build_cipher(scheme, "k3y").unwrap()));
            assert!(codec.is_ciphered());
            let mut batch = Batch::new();
            batch.insert("f_num".into(), BatchValue::Write(7i64.into()));
            let wire = codec.encode(&[batch.clone()]).unwrap();
            assert!(serde_json::from_slice::<Value>(&wire).is_err());
            assert_eq!(codec.decode(&wire).unwrap(), vec![batch]);
            assert!(matches!(
                codec.decode(&bytes(json!({"DATA": {}}))),
                Err(DecodeError::Cipher(_))
            ));
        }
    }

    #[test]
    fn encode_values_writes_one_batch() {
        let codec = plain();
        let mut values = IndexMap::new();
        values.insert("f_num".to_owned(), AttributeValue::from(3i64));
        let wire = codec.encode_values(&values).unwrap();
        let parsed: Value = serde_json::from_slice(&wire).unwrap();
        assert_eq!(parsed, json!({"DATA": [{"f_num": 3}]}));
    }
}
