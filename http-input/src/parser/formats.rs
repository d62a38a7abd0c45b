use regex::Regex;
use serde_json::Value;

use crate::config::{ConfigError, Format, ParserConfig};
use crate::event::Record;
use crate::parser::ParserError;

/// Splits the body into records of raw fields.
#[derive(Debug)]
pub enum TextFormat {
    Regexp(Regex),
    Json,
    Csv { keys: Vec<String> },
    Tsv { keys: Vec<String>, delimiter: String },
    Ltsv { delimiter: String, label_delimiter: String },
    None { message_key: String },
}

impl TextFormat {
    pub fn from_config(
        format: &Format,
        config: &ParserConfig,
    ) -> Result<Option<TextFormat>, ConfigError> {
        let text_format = match format {
            Format::Default => return Ok(None),
            Format::Regexp(pattern) => {
                let regex = Regex::new(pattern)?;
                if regex.capture_names().flatten().next().is_none() {
                    return Err(ConfigError::RegexpWithoutNames);
                }
                TextFormat::Regexp(regex)
            }
            Format::Json => TextFormat::Json,
            Format::Csv => TextFormat::Csv {
                keys: required_keys(format, config)?,
            },
            Format::Tsv => TextFormat::Tsv {
                keys: required_keys(format, config)?,
                delimiter: config.delimiter.clone().unwrap_or_else(|| "\t".to_string()),
            },
            Format::Ltsv => TextFormat::Ltsv {
                delimiter: config.delimiter.clone().unwrap_or_else(|| "\t".to_string()),
                label_delimiter: config.label_delimiter.clone(),
            },
            Format::None => TextFormat::None {
                message_key: config.message_key.clone(),
            },
        };
        Ok(Some(text_format))
    }

    /// Raw records of the body, in order. `json` and `csv` read the whole text, so a
    /// pretty-printed object or a quoted newline stays in one record. The other
    /// formats work one line at a time.
    pub fn records<'a>(
        &'a self,
        text: &'a str,
    ) -> Box<dyn Iterator<Item = Result<Option<Record>, ParserError>> + 'a> {
        match self {
            TextFormat::Json => Box::new(
                serde_json::Deserializer::from_str(text)
                    .into_iter::<Value>()
                    .map(|value| match value {
                        Ok(Value::Object(record)) => Ok(Some(record)),
                        Ok(_) | Err(_) => Ok(None),
                    }),
            ),
            TextFormat::Csv { keys } => Box::new(
                csv::ReaderBuilder::new()
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(text.as_bytes())
                    .into_records()
                    .map(move |fields| Ok(Some(zip_fields(keys, fields?.iter())))),
            ),
            _ => Box::new(text.lines().map(move |line| self.parse_line(line))),
        }
    }

    fn parse_line(&self, line: &str) -> Result<Option<Record>, ParserError> {
        match self {
            TextFormat::Regexp(regex) => Ok(regex.captures(line).map(|captures| {
                regex
                    .capture_names()
                    .flatten()
                    .filter_map(|name| {
                        captures
                            .name(name)
                            .map(|m| (name.to_string(), Value::from(m.as_str())))
                    })
                    .collect()
            })),
            TextFormat::Tsv { keys, delimiter } => {
                Ok(Some(zip_fields(keys, line.split(delimiter.as_str()))))
            }
            TextFormat::Ltsv {
                delimiter,
                label_delimiter,
            } => Ok(Some(
                line.split(delimiter.as_str())
                    .filter_map(|pair| pair.split_once(label_delimiter.as_str()))
                    .map(|(label, value)| (label.to_string(), Value::from(value)))
                    .collect(),
            )),
            TextFormat::None { message_key } => {
                let mut record = Record::new();
                record.insert(message_key.clone(), Value::from(line));
                Ok(Some(record))
            }
            TextFormat::Json | TextFormat::Csv { .. } => {
                self.records(line).next().unwrap_or(Ok(None))
            }
        }
    }
}

fn required_keys(format: &Format, config: &ParserConfig) -> Result<Vec<String>, ConfigError> {
    let keys: Vec<String> = config
        .keys
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(String::from)
        .collect();
    if keys.is_empty() {
        return Err(ConfigError::MissingKeys(format.to_string()));
    }
    Ok(keys)
}

fn zip_fields<'a>(keys: &[String], fields: impl Iterator<Item = &'a str>) -> Record {
    keys.iter()
        .zip(fields)
        .map(|(key, value)| (key.clone(), Value::from(value)))
        .collect()
}
