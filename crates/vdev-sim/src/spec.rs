//! ---
//! vdev_section: "05-simulation"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Synthetic traffic streams and scheduling."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
//! Textual stream descriptions, as given on the command line.
//!
//! | spec | stream |
//! |---|---|
//! | `toggle:ATTR[:seed]` | [`BoolToggle`] on a Boolean attribute |
//! | `counter:ATTR[:period_ms]` | [`Counter`] on a Number attribute, 200 ms default |
//! | `pattern:STR_ATTR[:ENUM_ATTR]` | [`StringPattern`] on a String attribute |
//! | `script:PATH` | [`ScriptedStream`] loaded from a JSON file |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use vdev_schema::{AttributeKind, AttributeSchema};

use crate::generators::{BoolToggle, Counter, StringPattern};
use crate::script::ScriptedStream;
use crate::StreamGenerator;

/// Reasons a stream cannot be parsed or built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamSpecError {
    #[error("unknown stream kind \"{0}\" (expected toggle, counter, pattern or script)")]
    UnknownKind(String),
    #[error("stream \"{0}\" needs an attribute or path")]
    MissingTarget(String),
    #[error("invalid parameter \"{value}\" in stream \"{spec}\"")]
    InvalidParameter { spec: String, value: String },
    #[error("attribute \"{0}\" is not declared")]
    UnknownAttribute(String),
    #[error("attribute \"{attribute}\" is {actual}, the stream needs {expected}")]
    WrongKind {
        attribute: String,
        expected: AttributeKind,
        actual: AttributeKind,
    },
    #[error("script {path}: {reason}")]
    Script { path: String, reason: String },
}

/// Parsed stream description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSpec {
    Toggle {
        attribute: String,
        seed: Option<u64>,
    },
    Counter {
        attribute: String,
        period_ms: u64,
    },
    Pattern {
        text: String,
        choice: Option<String>,
    },
    Script {
        path: PathBuf,
    },
}

impl StreamSpec {
    pub const DEFAULT_COUNTER_PERIOD_MS: u64 = 200;

    /// Build the generator, checking attribute kinds against `schema`.
    ///
    /// `seed` seeds random streams that have no seed of their own.
    pub fn build(
        &self,
        schema: &AttributeSchema,
        seed: Option<u64>,
    ) -> Result<Box<dyn StreamGenerator>, StreamSpecError> {
        match self {
            StreamSpec::Toggle {
                attribute,
                seed: own,
            } => {
                require_kind(schema, attribute, AttributeKind::Boolean)?;
                Ok(Box::new(BoolToggle::new(attribute.clone(), own.or(seed))))
            }
            StreamSpec::Counter {
                attribute,
                period_ms,
            } => {
                require_kind(schema, attribute, AttributeKind::Number)?;
                Ok(Box::new(Counter::new(
                    attribute.clone(),
                    *period_ms as f64 / 1000.0,
                )))
            }
            StreamSpec::Pattern { text, choice } => {
                require_kind(schema, text, AttributeKind::String)?;
                let choice = match choice {
                    Some(name) => {
                        require_kind(schema, name, AttributeKind::Enum)?;
                        let items = schema
                            .get(name)
                            .map(|attribute| attribute.items().to_vec())
                            .unwrap_or_default();
                        Some((name.clone(), items))
                    }
                    None => None,
                };
                Ok(Box::new(StringPattern::new(text.clone(), choice, seed)))
            }
            StreamSpec::Script { path } => Ok(Box::new(ScriptedStream::from_path(path, schema)?)),
        }
    }
}

fn require_kind(
    schema: &AttributeSchema,
    name: &str,
    expected: AttributeKind,
) -> Result<(), StreamSpecError> {
    let attribute = schema
        .get(name)
        .ok_or_else(|| StreamSpecError::UnknownAttribute(name.to_owned()))?;
    if attribute.kind() != expected {
        return Err(StreamSpecError::WrongKind {
            attribute: name.to_owned(),
            expected,
            actual: attribute.kind(),
        });
    }
    Ok(())
}

impl FromStr for StreamSpec {
    type Err = StreamSpecError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = spec.split_once(':').unwrap_or((spec, ""));
        if rest.is_empty() {
            return match kind {
                "toggle" | "counter" | "pattern" | "script" => {
                    Err(StreamSpecError::MissingTarget(spec.to_owned()))
                }
                other => Err(StreamSpecError::UnknownKind(other.to_owned())),
            };
        }
        if kind == "script" {
            return Ok(StreamSpec::Script {
                path: PathBuf::from(rest),
            });
        }

        let (target, parameter) = match rest.split_once(':') {
            Some((target, parameter)) => (target.to_owned(), Some(parameter)),
            None => (rest.to_owned(), None),
        };
        let number = |value: &str| {
            value
                .parse::<u64>()
                .map_err(|_| StreamSpecError::InvalidParameter {
                    spec: spec.to_owned(),
                    value: value.to_owned(),
                })
        };
        match kind {
            "toggle" => Ok(StreamSpec::Toggle {
                attribute: target,
                seed: parameter.map(number).transpose()?,
            }),
            "counter" => Ok(StreamSpec::Counter {
                attribute: target,
                period_ms: parameter
                    .map(number)
                    .transpose()?
                    .unwrap_or(Self::DEFAULT_COUNTER_PERIOD_MS),
            }),
            "pattern" => Ok(StreamSpec::Pattern {
                text: target,
                choice: parameter.map(str::to_owned),
            }),
            other => Err(StreamSpecError::UnknownKind(other.to_owned())),
        }
    }
}

impl fmt::Display for StreamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSpec::Toggle {
                attribute,
                seed: Some(seed),
            } => write!(f, "toggle:{attribute}:{seed}"),
            StreamSpec::Toggle { attribute, .. } => write!(f, "toggle:{attribute}"),
            StreamSpec::Counter {
                attribute,
                period_ms,
            } => write!(f, "counter:{attribute}:{period_ms}"),
            StreamSpec::Pattern {
                text,
                choice: Some(choice),
            } => write!(f, "pattern:{text}:{choice}"),
            StreamSpec::Pattern { text, .. } => write!(f, "pattern:{text}"),
            StreamSpec::Script { path } => write!(f, "script:{}", path.display()),
        }
    }
}

/// Build every spec. Random streams get `seed + index` so that two toggles
/// do not run in lock step.
pub fn build_streams(
    specs: &[StreamSpec],
    schema: &AttributeSchema,
    seed: Option<u64>,
) -> Result<Vec<Box<dyn StreamGenerator>>, StreamSpecError> {
    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| spec.build(schema, seed.map(|seed| seed.wrapping_add(index as u64))))
        .collect()
}

/// The demonstration set: toggle `f_bool`, count `f_num`, animate `f_str`
/// (with `f_enum` when it is an Enum). Attributes that are missing or of
/// another kind are skipped.
pub fn demo_streams(schema: &AttributeSchema, seed: Option<u64>) -> Vec<Box<dyn StreamGenerator>> {
    let has = |name: &str, kind: AttributeKind| {
        schema
            .get(name)
            .is_some_and(|attribute| attribute.kind() == kind)
    };
    let mut specs = Vec::new();
    if has("f_bool", AttributeKind::Boolean) {
        specs.push(StreamSpec::Toggle {
            attribute: "f_bool".into(),
            seed: None,
        });
    }
    if has("f_num", AttributeKind::Number) {
        specs.push(StreamSpec::Counter {
            attribute: "f_num".into(),
            period_ms: StreamSpec::DEFAULT_COUNTER_PERIOD_MS,
        });
    }
    if has("f_str", AttributeKind::String) {
        specs.push(StreamSpec::Pattern {
            text: "f_str".into(),
            choice: has("f_enum", AttributeKind::Enum).then(|| "f_enum".to_owned()),
        });
    }
    specs
        .iter()
        .enumerate()
        .filter_map(|(index, spec)| {
            spec.build(schema, seed.map(|seed| seed.wrapping_add(index as u64)))
                .ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdev_schema::AttributeType;

    fn schema() -> AttributeSchema {
        AttributeSchema::from_types([
            AttributeType::boolean("f_bool"),
            AttributeType::number("f_num"),
            AttributeType::string("f_str"),
            AttributeType::enumeration("f_enum", ["x", "y"]).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn parses_every_kind() {
        assert_eq!(
            "toggle:f_bool:9".parse::<StreamSpec>().unwrap(),
            StreamSpec::Toggle {
                attribute: "f_bool".into(),
                seed: Some(9)
            }
        );
        assert_eq!(
            "counter:f_num".parse::<StreamSpec>().unwrap(),
            StreamSpec::Counter {
                attribute: "f_num".into(),
                period_ms: 200
            }
        );
        assert_eq!(
            "pattern:f_str:f_enum".parse::<StreamSpec>().unwrap(),
            StreamSpec::Pattern {
                text: "f_str".into(),
                choice: Some("f_enum".into())
            }
        );
        assert_eq!(
            "script:/tmp/a:b.json".parse::<StreamSpec>().unwrap(),
            StreamSpec::Script {
                path: PathBuf::from("/tmp/a:b.json")
            }
        );
        assert_eq!(
            "counter:f_num:50".parse::<StreamSpec>().unwrap().to_string(),
            "counter:f_num:50"
        );
    }

    #[test]
    fn rejects_bad_specs() {
        assert!(matches!(
            "wave:f_num".parse::<StreamSpec>(),
            Err(StreamSpecError::UnknownKind(_))
        ));
        assert!(matches!(
            "toggle".parse::<StreamSpec>(),
            Err(StreamSpecError::MissingTarget(_))
        ));
        assert!(matches!(
            "counter:f_num:fast".parse::<StreamSpec>(),
            Err(StreamSpecError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn build_checks_attribute_kinds() {
        let schema = schema();
        let spec: StreamSpec = "toggle:f_num".parse().unwrap();
        assert!(matches!(
            spec.build(&schema, None),
            Err(StreamSpecError::WrongKind { .. })
        ));
        let spec: StreamSpec = "counter:missing".parse().unwrap();
        assert_eq!(
            spec.build(&schema, None).err(),
            Some(StreamSpecError::UnknownAttribute("missing".into()))
        );
        let spec: StreamSpec = "pattern:f_str:f_bool".parse().unwrap();
        assert!(spec.build(&schema, None).is_err());

        let mut counter = "counter:f_num:50"
            .parse::<StreamSpec>()
            .unwrap()
            .build(&schema, None)
            .unwrap();
        assert_eq!(counter.name(), "counter:f_num");
        assert_eq!(counter.produce_next().unwrap().delay, 0.05);
    }

    #[test]
    fn demo_streams_follow_the_schema() {
        let names: Vec<String> = demo_streams(&schema(), Some(1))
            .iter()
            .map(|stream| stream.name().to_owned())
            .collect();
        assert_eq!(names, ["toggle:f_bool", "counter:f_num", "pattern:f_str"]);

        let partial = AttributeSchema::from_types([AttributeType::string("f_bool")]).unwrap();
        assert!(demo_streams(&partial, None).is_empty());
    }

    #[test]
    fn build_streams_builds_all_or_fails() {
        let specs = vec![
            "toggle:f_bool".parse().unwrap(),
            "toggle:f_bool".parse().unwrap(),
        ];
        let mut streams = build_streams(&specs, &schema(), Some(4)).unwrap();
        let a: Vec<f64> = (0..4).map(|_| streams[0].produce_next().unwrap().delay).collect();
        let b: Vec<f64> = (0..4).map(|_| streams[1].produce_next().unwrap().delay).collect();
        assert_ne!(a, b);

        let bad = vec!["counter:f_bool".parse().unwrap()];
        assert!(build_streams(&bad, &schema(), None).is_err());
    }
}
