use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime};
use serde_json::{Number, Value};

use crate::config::{ConfigError, ParserConfig};
use crate::event::Record;
use crate::parser::{ParsedLine, ParserError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Bool,
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "string" => Ok(FieldType::String),
            "integer" | "int" => Ok(FieldType::Integer),
            "float" => Ok(FieldType::Float),
            "bool" => Ok(FieldType::Bool),
            other => Err(other.to_string()),
        }
    }
}

impl FieldType {
    fn name(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
        }
    }

    /// Only string values are converted, values already typed by the format are kept.
    fn convert(self, field: &str, value: Value) -> Result<Value, ParserError> {
        let Value::String(text) = value else {
            return Ok(value);
        };
        let converted = match self {
            FieldType::String => Some(Value::String(text.clone())),
            FieldType::Integer => text.trim().parse::<i64>().ok().map(Value::from),
            FieldType::Float => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number),
            FieldType::Bool => match text.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
        };
        converted.ok_or_else(|| ParserError::Conversion {
            field: field.to_string(),
            kind: self.name(),
            value: text,
        })
    }
}

/// Applies field types and pulls the event time out of a freshly parsed record.
#[derive(Debug, Default, Clone)]
pub struct RecordShaper {
    types: HashMap<String, FieldType>,
    time_key: Option<String>,
    time_format: Option<String>,
}

impl RecordShaper {
    pub fn from_config(config: &ParserConfig) -> Result<Self, ConfigError> {
        let mut types = HashMap::new();
        for pair in config
            .types
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter(|pair| !pair.trim().is_empty())
        {
            let (field, kind) = pair
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidTypes(pair.to_string()))?;
            let kind = FieldType::from_str(kind).map_err(ConfigError::InvalidTypes)?;
            types.insert(field.trim().to_string(), kind);
        }

        Ok(Self {
            types,
            time_key: Some(config.time_key.clone()).filter(|key| !key.is_empty()),
            time_format: config.time_format.clone(),
        })
    }

    pub fn shape(&self, mut record: Record) -> ParsedLine {
        let time = match &self.time_key {
            Some(key) => match record.shift_remove(key) {
                Some(value) => Some(self.parse_time(value)?),
                None => None,
            },
            None => None,
        };

        for (field, kind) in &self.types {
            if let Some(value) = record.get_mut(field) {
                *value = kind.convert(field, value.take())?;
            }
        }

        Ok((time, Some(record)))
    }

    fn parse_time(&self, value: Value) -> Result<u64, ParserError> {
        let seconds = match (&value, &self.time_format) {
            (Value::String(text), Some(format)) => parse_formatted(text, format),
            (Value::String(text), None) => text
                .trim()
                .parse::<f64>()
                .map_err(|err| err.to_string())
                .map(|seconds| seconds.floor() as i64),
            (Value::Number(number), _) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|seconds| seconds.floor() as i64))
                .ok_or_else(|| "not a number".to_string()),
            _ => Err("unsupported value".to_string()),
        };

        seconds
            .and_then(|seconds| u64::try_from(seconds).map_err(|err| err.to_string()))
            .map_err(|reason| ParserError::Time {
                value: value.to_string(),
                reason,
            })
    }
}

fn parse_formatted(text: &str, format: &str) -> Result<i64, String> {
    if let Ok(time) = DateTime::parse_from_str(text, format) {
        return Ok(time.timestamp());
    }
    NaiveDateTime::parse_from_str(text, format)
        .map(|time| time.and_utc().timestamp())
        .map_err(|err| err.to_string())
}
