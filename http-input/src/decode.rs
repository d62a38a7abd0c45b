use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream;
use multer::{parse_boundary, Multipart};
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::api::InputError;
use crate::event::Decoded;
use crate::params::Params;
use crate::parser::TextParser;

/// Decoders picked by content type, in priority order. First match wins, a content
/// type matching none of them carries no payload.
pub const CONTENT_DECODERS: [ContentDecoder; 4] = [
    ContentDecoder::Json,
    ContentDecoder::MessagePack,
    ContentDecoder::Form,
    ContentDecoder::Multipart,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentDecoder {
    Json,
    MessagePack,
    Form,
    Multipart,
}

impl ContentDecoder {
    pub fn for_content_type(content_type: &str) -> Option<ContentDecoder> {
        CONTENT_DECODERS
            .into_iter()
            .find(|decoder| decoder.matches(content_type))
    }

    pub fn matches(self, content_type: &str) -> bool {
        match self {
            ContentDecoder::Json => content_type.starts_with("application/json"),
            ContentDecoder::MessagePack => content_type.starts_with("application/x-msgpack"),
            ContentDecoder::Form => {
                content_type.starts_with("application/x-www-form-urlencoded")
            }
            ContentDecoder::Multipart => content_type.starts_with("multipart/form-data"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ContentDecoder::Json => "json",
            ContentDecoder::MessagePack => "msgpack",
            ContentDecoder::Form => "form",
            ContentDecoder::Multipart => "multipart",
        }
    }

    /// Form decoders merge their fields into `params`, so a `time` field sent in the
    /// body is visible to timestamp resolution.
    pub async fn decode(
        self,
        content_type: &str,
        params: &mut Params,
        body: Bytes,
    ) -> Result<Decoded, InputError> {
        match self {
            ContentDecoder::Json => decode_json(&body),
            ContentDecoder::MessagePack => decode_msgpack(&body),
            ContentDecoder::Form => {
                params.merge(Params::parse(&body));
                decode_form_fields(params)
            }
            ContentDecoder::Multipart => {
                params.merge(parse_multipart(content_type, body).await?);
                decode_form_fields(params)
            }
        }
    }
}

/// Turns request bodies into decoded payloads, either through the configured text
/// parser or by content type.
#[derive(Clone, Default)]
pub struct Decoder {
    parser: Option<Arc<dyn TextParser + Send + Sync>>,
}

impl Decoder {
    pub fn new(parser: Option<Arc<dyn TextParser + Send + Sync>>) -> Self {
        Self { parser }
    }

    pub fn mode(&self) -> String {
        match &self.parser {
            Some(parser) => parser.format(),
            None => "default".to_string(),
        }
    }

    /// Low-cardinality label for metrics.
    pub fn metric_mode(&self) -> &'static str {
        if self.parser.is_some() {
            "text"
        } else {
            "content_type"
        }
    }

    pub async fn decode(
        &self,
        content_type: &str,
        params: &mut Params,
        body: Bytes,
    ) -> Result<Decoded, InputError> {
        if let Some(parser) = &self.parser {
            return decode_text(parser.as_ref(), &body);
        }

        match ContentDecoder::for_content_type(content_type) {
            Some(decoder) => {
                debug!(decoder = decoder.name(), len = body.len(), "decoding body");
                decoder.decode(content_type, params, body).await
            }
            None => {
                debug!(content_type, "no decoder for content type, ignoring body");
                Ok(Decoded::default())
            }
        }
    }
}

/// Only the first parsed record is used, later records of the body are ignored.
fn decode_text(parser: &(dyn TextParser + Send + Sync), body: &[u8]) -> Result<Decoded, InputError> {
    let text = std::str::from_utf8(body).map_err(|_| InputError::InvalidBodyEncoding)?;

    match parser.parse(text).next() {
        None => Ok(Decoded::default()),
        Some(parsed) => {
            let (time, record) = parsed?;
            let record = record.ok_or_else(|| InputError::UnparsedText {
                format: parser.format(),
                content: text.to_string(),
            })?;
            Ok(Decoded {
                time,
                payload: Some(crate::event::Payload::Single(record)),
            })
        }
    }
}

fn decode_json(body: &[u8]) -> Result<Decoded, InputError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Decoded::default());
    }
    Decoded::from_value(serde_json::from_slice::<Value>(body)?)
}

fn decode_msgpack(body: &[u8]) -> Result<Decoded, InputError> {
    let MsgpackValue(value) = rmp_serde::from_slice(body)?;
    Decoded::from_value(value)
}

/// MessagePack value read into JSON terms: `bin` and ext payloads become lossy UTF-8
/// strings, scalar map keys are stringified.
struct MsgpackValue(Value);

impl<'de> Deserialize<'de> for MsgpackValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MsgpackVisitor).map(MsgpackValue)
    }
}

struct MsgpackVisitor;

impl<'de> Visitor<'de> for MsgpackVisitor {
    type Value = Value;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a msgpack value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::String(String::from_utf8_lossy(v).into_owned()))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(self)
    }

    // Ext types arrive as a newtype around `(type, data)`
    fn visit_newtype_struct<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> Result<Value, D::Error> {
        deserializer.deserialize_any(self)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut values = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(MsgpackValue(value)) = seq.next_element()? {
            values.push(value);
        }
        Ok(Value::Array(values))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut record = Map::new();
        while let Some((MsgpackValue(key), MsgpackValue(value))) = map.next_entry()? {
            let key = match key {
                Value::String(key) => key,
                other => other.to_string(),
            };
            record.insert(key, value);
        }
        Ok(Value::Object(record))
    }
}

/// `msgpack` is looked at before `json` when a form carries both.
fn decode_form_fields(params: &Params) -> Result<Decoded, InputError> {
    if let Some(msgpack) = params.get("msgpack") {
        decode_msgpack(msgpack)
    } else if let Some(json) = params.get("json") {
        Decoded::from_value(serde_json::from_slice::<Value>(json)?)
    } else {
        Err(InputError::MissingFormField)
    }
}

async fn parse_multipart(content_type: &str, body: Bytes) -> Result<Params, InputError> {
    let boundary = parse_boundary(content_type).map_err(|e| {
        warn!("failed to parse multipart boundary: {}", e);
        InputError::InvalidMultipart(e.to_string())
    })?;

    let body_stream = stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
    let mut multipart = Multipart::new(body_stream, boundary);

    let mut params = Params::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| InputError::InvalidMultipart(e.to_string()))?
    {
        let Some(name) = field.name().map(String::from) else {
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|e| InputError::InvalidMultipart(e.to_string()))?;
        params.insert(name, data.to_vec());
    }
    Ok(params)
}
