use axum::extract::State;
use axum::http::{header, HeaderMap, Uri};
use axum::response::Response;
use bytes::Bytes;
use metrics::histogram;
use tracing::{debug, error, instrument, warn};

use crate::api::{self, InputError};
use crate::event::{extract_tag, normalize};
use crate::params::Params;
use crate::prometheus::report_request;
use crate::timestamp::resolve_time;
use crate::{router, sinks};

/// Accepts one request worth of records for the tag named by the path.
#[instrument(skip_all, fields(tag, content_type, mode, size))]
pub async fn event(
    state: State<router::State>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, InputError> {
    let tag = extract_tag(uri.path());
    let params = Params::parse(uri.query().unwrap_or_default().as_bytes());
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .map_or("", |v| v.to_str().unwrap_or(""));
    let mode = state.decoder.metric_mode();

    tracing::Span::current().record("tag", tag.as_str());
    tracing::Span::current().record("content_type", content_type);
    tracing::Span::current().record("mode", mode);

    match ingest(&state, tag, params, content_type, body).await {
        Ok(None) => {
            debug!("request carried no record");
            report_request("empty", mode);
            Ok(api::ok())
        }
        Ok(Some(size)) => {
            tracing::Span::current().record("size", size);
            histogram!("http_input_request_records").record(size as f64);
            report_request("ok", mode);
            Ok(api::ok())
        }
        Err(err) => {
            if err.is_client_error() {
                warn!("rejected request: {}", err);
            } else {
                error!("failed to emit events: {}", err);
            }
            report_request(err.stage(), mode);
            Err(err)
        }
    }
}

/// Decodes, timestamps and emits the body. Returns the number of records handed to
/// the sink, `None` when there was nothing to emit.
async fn ingest(
    state: &router::State,
    tag: String,
    mut params: Params,
    content_type: &str,
    body: Bytes,
) -> Result<Option<usize>, InputError> {
    let decoded = state.decoder.decode(content_type, &mut params, body).await?;
    let Some(payload) = decoded.payload else {
        return Ok(None);
    };

    let time = resolve_time(&params, decoded.time, state.timesource.as_ref())?;
    let emission = normalize(tag, payload, time)?;
    let size = emission.len();

    sinks::emit(state.sink.as_ref(), emission).await?;
    Ok(Some(size))
}
