//! Structured-text parsers, used instead of content-type decoding when a
//! `FORMAT` other than `default` is configured.
//!
//! A parser turns the raw request body into a lazy sequence of
//! `(time, record)` pairs. The input only looks at the first pair, see
//! [`crate::decode`].

use std::sync::Arc;

use thiserror::Error;

use crate::config::{ConfigError, Format, ParserConfig};
use crate::event::Record;

mod formats;
mod shaping;

pub use formats::TextFormat;
pub use shaping::{FieldType, RecordShaper};

#[derive(Error, Debug)]
pub enum ParserError {
    #[error("failed to convert field '{field}' to {kind}: {value}")]
    Conversion {
        field: String,
        kind: &'static str,
        value: String,
    },
    #[error("failed to parse time '{value}': {reason}")]
    Time { value: String, reason: String },
    #[error("failed to parse csv: {0}")]
    Csv(#[from] csv::Error),
}

/// Time found in the record, if any, and the record. Text that does not match the
/// format yields no record.
pub type ParsedLine = Result<(Option<u64>, Option<Record>), ParserError>;

pub trait TextParser {
    /// Name of the format, used in error messages.
    fn format(&self) -> String;

    fn parse<'a>(&'a self, text: &'a str) -> Box<dyn Iterator<Item = ParsedLine> + 'a>;
}

/// Parser for one of the built-in formats.
pub struct FormatParser {
    format: Format,
    text_format: TextFormat,
    shaper: RecordShaper,
}

impl FormatParser {
    pub fn new(format: Format, text_format: TextFormat, shaper: RecordShaper) -> Self {
        Self {
            format,
            text_format,
            shaper,
        }
    }
}

impl TextParser for FormatParser {
    fn format(&self) -> String {
        self.format.to_string()
    }

    fn parse<'a>(&'a self, text: &'a str) -> Box<dyn Iterator<Item = ParsedLine> + 'a> {
        Box::new(self.text_format.records(text).map(move |record| match record? {
            Some(record) => self.shaper.shape(record),
            None => Ok((None, None)),
        }))
    }
}

/// Builds the parser for the configured format, `None` for content-type decoding.
pub fn build(
    format: &Format,
    config: &ParserConfig,
) -> Result<Option<Arc<dyn TextParser + Send + Sync>>, ConfigError> {
    let Some(text_format) = TextFormat::from_config(format, config)? else {
        return Ok(None);
    };
    let shaper = RecordShaper::from_config(config)?;
    Ok(Some(Arc::new(FormatParser::new(
        format.clone(),
        text_format,
        shaper,
    ))))
}
