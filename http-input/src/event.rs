use serde::Serialize;
use serde_json::{Map, Value};

use crate::api::InputError;

/// Reserved key carrying a per-record time inside batches.
pub const RECORD_TIME_KEY: &str = "time";

/// Field map of a single event, keys keep their input order.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Single(Record),
    Batch(Vec<Record>),
}

impl Payload {
    /// `null` decodes to no payload at all, which is acknowledged without emitting.
    pub fn from_value(value: Value) -> Result<Option<Payload>, InputError> {
        match value {
            Value::Null => Ok(None),
            Value::Object(record) => Ok(Some(Payload::Single(record))),
            Value::Array(values) => {
                let records = values
                    .into_iter()
                    .map(|value| match value {
                        Value::Object(record) => Ok(record),
                        other => Err(InputError::InvalidRecord(kind_of(&other))),
                    })
                    .collect::<Result<Vec<Record>, InputError>>()?;
                Ok(Some(Payload::Batch(records)))
            }
            other => Err(InputError::InvalidRecord(kind_of(&other))),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Single(_) => 1,
            Payload::Batch(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Output of a format decoder.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Decoded {
    /// Time found inside the payload itself, only text parsers provide one.
    pub time: Option<u64>,
    pub payload: Option<Payload>,
}

impl Decoded {
    pub fn from_value(value: Value) -> Result<Decoded, InputError> {
        Ok(Decoded {
            time: None,
            payload: Payload::from_value(value)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub time: u64,
    pub record: Record,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub tag: String,
    pub time: u64,
    pub record: Record,
}

/// What a request hands over to the sink, in exactly one call.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    One(Event),
    Batch { tag: String, entries: Vec<Entry> },
}

impl Emission {
    pub fn len(&self) -> usize {
        match self {
            Emission::One(_) => 1,
            Emission::Batch { entries, .. } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `/foo/bar` becomes `foo.bar`. Trailing empty segments are dropped, inner ones kept.
pub fn extract_tag(path: &str) -> String {
    let path = path.strip_prefix('/').unwrap_or(path);
    let mut segments: Vec<&str> = path.split('/').collect();
    while segments.last().is_some_and(|segment| segment.is_empty()) {
        segments.pop();
    }
    segments.join(".")
}

/// Pairs every record with its time. Batch records may carry their own time under
/// `"time"`, which is removed from the record; the others get `default_time`.
pub fn normalize(tag: String, payload: Payload, default_time: u64) -> Result<Emission, InputError> {
    match payload {
        Payload::Single(record) => Ok(Emission::One(Event {
            tag,
            time: default_time,
            record,
        })),
        Payload::Batch(records) => {
            let entries = records
                .into_iter()
                .map(|mut record| {
                    let time = take_record_time(&mut record)?.unwrap_or(default_time);
                    Ok(Entry { time, record })
                })
                .collect::<Result<Vec<Entry>, InputError>>()?;
            Ok(Emission::Batch { tag, entries })
        }
    }
}

fn take_record_time(record: &mut Record) -> Result<Option<u64>, InputError> {
    match record.shift_remove(RECORD_TIME_KEY) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| number.as_f64().and_then(whole_seconds))
            .map(Some)
            .ok_or_else(|| InputError::InvalidRecordTime(number.to_string())),
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            trimmed
                .parse::<u64>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(whole_seconds))
                .map(Some)
                .ok_or(InputError::InvalidRecordTime(text))
        }
        Some(other) => Err(InputError::InvalidRecordTime(other.to_string())),
    }
}

/// Fractional seconds are floored, negative or non-finite times are rejected.
fn whole_seconds(seconds: f64) -> Option<u64> {
    (seconds.is_finite() && seconds >= 0.0 && seconds <= u64::MAX as f64)
        .then(|| seconds.floor() as u64)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(record) => record,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn tag_from_path() {
        assert_eq!(extract_tag("/a/b"), "a.b");
        assert_eq!(extract_tag("/tag1"), "tag1");
        assert_eq!(extract_tag("/a/b/"), "a.b");
        assert_eq!(extract_tag("/a//b"), "a..b");
        assert_eq!(extract_tag("/"), "");
        assert_eq!(extract_tag(""), "");
    }

    #[test]
    fn null_is_no_payload() {
        assert_eq!(Payload::from_value(Value::Null).unwrap(), None);
    }

    #[test]
    fn scalars_are_not_records() {
        assert!(matches!(
            Payload::from_value(json!("hello")),
            Err(InputError::InvalidRecord("string"))
        ));
        assert!(matches!(
            Payload::from_value(json!([{"a": 1}, 2])),
            Err(InputError::InvalidRecord("number"))
        ));
    }

    #[test]
    fn single_record_keeps_its_time_key() {
        let payload = Payload::from_value(json!({"a": 1, "time": 5})).unwrap().unwrap();
        let emission = normalize("t".to_string(), payload, 100).unwrap();
        assert_eq!(
            emission,
            Emission::One(Event {
                tag: "t".to_string(),
                time: 100,
                record: record(json!({"a": 1, "time": 5})),
            })
        );
    }

    #[test]
    fn batch_time_overrides_per_record() {
        let payload = Payload::from_value(json!([
            {"a": 1},
            {"time": 42, "a": 2, "b": 3},
            {"a": 3, "time": "43"},
            {"a": 4, "time": null}
        ]))
        .unwrap()
        .unwrap();

        let Emission::Batch { tag, entries } = normalize("t".to_string(), payload, 100).unwrap()
        else {
            panic!("expected a batch")
        };
        assert_eq!(tag, "t");
        assert_eq!(
            entries.iter().map(|entry| entry.time).collect::<Vec<_>>(),
            vec![100, 42, 43, 100]
        );
        assert_eq!(entries[1].record, record(json!({"a": 2, "b": 3})));
        assert_eq!(
            entries[1].record.keys().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(entries.iter().all(|entry| !entry.record.contains_key("time")));
    }

    #[test]
    fn batch_rejects_unusable_record_time() {
        let payload = Payload::from_value(json!([{"time": "yesterday"}]))
            .unwrap()
            .unwrap();
        assert!(matches!(
            normalize("t".to_string(), payload, 1),
            Err(InputError::InvalidRecordTime(_))
        ));

        let payload = Payload::from_value(json!([{"time": -3}])).unwrap().unwrap();
        assert!(normalize("t".to_string(), payload, 1).is_err());
    }

    #[test]
    fn batch_fractional_time_is_floored() {
        let payload = Payload::from_value(json!([
            {"a": 1, "time": 1293973200.5},
            {"a": 2, "time": "1293973201.9"}
        ]))
        .unwrap()
        .unwrap();

        let Emission::Batch { entries, .. } = normalize("t".to_string(), payload, 1).unwrap()
        else {
            panic!("expected a batch")
        };
        assert_eq!(
            entries.iter().map(|entry| entry.time).collect::<Vec<_>>(),
            vec![1293973200, 1293973201]
        );

        let payload = Payload::from_value(json!([{"time": -0.5}])).unwrap().unwrap();
        assert!(normalize("t".to_string(), payload, 1).is_err());
    }

    #[test]
    fn empty_batch_is_still_a_batch() {
        let payload = Payload::from_value(json!([])).unwrap().unwrap();
        assert!(payload.is_empty());
        let emission = normalize("t".to_string(), payload, 1).unwrap();
        assert!(emission.is_empty());
    }
}
