//! ---
//! vdev_section: "01-core-functionality"
//! vdev_subsection: "module"
//! vdev_type: "source"
//! vdev_scope: "code"
//! vdev_description: "Composition of publish-once messages from NAME=VALUE arguments."
//! vdev_version: "v0.1.0"
//! vdev_owner: "tbd"
//! ---
use serde_json::{Map, Value};
use vdev_logging::{LogRecord, LogSink};
use vdev_msg::DATA_FIELD;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComposeError {
    #[error("no valid NAME=VALUE parameter to send")]
    NoValidParams,
}

/// Build `{"DATA": [{NAME: VALUE}, ...]}` from `NAME=VALUE` arguments.
///
/// `VALUE` is raw JSON, so strings need their quotes: `f_str="hi"`.
/// Malformed arguments are reported through `sink` and skipped.
pub fn compose_tx_message<S: AsRef<str>>(
    params: &[S],
    sink: &dyn LogSink,
) -> Result<Vec<u8>, ComposeError> {
    let mut batches = Vec::with_capacity(params.len());
    for param in params {
        let param = param.as_ref();
        let Some((name, raw)) = param.split_once('=') else {
            sink.record(
                LogRecord::error("compose", "invalid parameter, use NAME=VALUE")
                    .field("param", param),
            );
            continue;
        };
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => {
                let mut batch = Map::new();
                batch.insert(name.to_owned(), value);
                batches.push(Value::Object(batch));
            }
            Err(err) => sink.record(
                LogRecord::error("compose", "parameter value is not JSON")
                    .field("param", param)
                    .field("error", err),
            ),
        }
    }
    if batches.is_empty() {
        return Err(ComposeError::NoValidParams);
    }
    let mut message = Map::new();
    message.insert(DATA_FIELD.to_owned(), Value::Array(batches));
    Ok(Value::Object(message).to_string().into_bytes())
}
