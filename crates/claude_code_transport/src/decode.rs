use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::DecodeError;

/// One decoded stream-json object, keys kept in the order the CLI wrote them.
pub type Record = Map<String, Value>;

#[derive(Debug)]
pub enum LineOutcome {
    Record(Record),
    Skipped,
    Failed(DecodeError),
}

/// Lines that fail to parse are only reported when they look intentionally structured
/// (start with `{` or `[`); anything else is treated as CLI noise and skipped.
pub fn decode_line(line_number: usize, line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Skipped;
    }

    match serde_json::from_str::<Record>(line) {
        Ok(record) => LineOutcome::Record(record),
        Err(source) if looks_structured(line) => {
            LineOutcome::Failed(DecodeError::malformed(line_number, line, source))
        }
        Err(_) => LineOutcome::Skipped,
    }
}

fn looks_structured(line: &str) -> bool {
    line.starts_with('{') || line.starts_with('[')
}

/// Skipped lines are omitted; records and failures keep their relative order.
pub fn decode_lines(text: &str) -> Vec<LineOutcome> {
    text.lines()
        .enumerate()
        .map(|(idx, raw)| decode_line(idx + 1, raw))
        .filter(|outcome| !matches!(outcome, LineOutcome::Skipped))
        .collect()
}

/// Mapper for [`crate::query_map`] that deserializes records into a typed message.
pub fn deserialize_record<T: DeserializeOwned>(record: Record) -> Option<T> {
    serde_json::from_value(Value::Object(record)).ok()
}
