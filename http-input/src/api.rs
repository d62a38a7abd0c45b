use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::parser::ParserError;

/// Body of every successful acknowledgement, including requests that carried no record.
pub const OK_BODY: &str = "OK";

#[derive(Error, Debug)]
pub enum InputError {
    #[error("'json' or 'msgpack' parameter is required")]
    MissingFormField,
    #[error("failed to parse json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("failed to parse msgpack: {0}")]
    InvalidMsgpack(#[from] rmp_serde::decode::Error),
    #[error("failed to parse multipart body: {0}")]
    InvalidMultipart(String),
    #[error("request body is not valid UTF-8")]
    InvalidBodyEncoding,
    #[error("received event is not {format}: {content}")]
    UnparsedText { format: String, content: String },
    #[error(transparent)]
    TextParser(#[from] ParserError),
    #[error("record must be a map, got {0}")]
    InvalidRecord(&'static str),
    #[error("invalid 'time' parameter: {0}")]
    InvalidTimeParameter(String),
    #[error("invalid 'time' field in record: {0}")]
    InvalidRecordTime(String),

    #[error("event submitted with an empty tag")]
    EmptyTag,
    #[error("transient error, please retry")]
    RetryableSinkError,
    #[error("maximum event size exceeded")]
    EventTooBig,
    #[error("invalid event could not be processed")]
    NonRetryableSinkError,
}

impl InputError {
    /// Decoding and resolution failures are the caller's fault, everything raised
    /// by a sink is ours.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            InputError::EmptyTag
                | InputError::RetryableSinkError
                | InputError::EventTooBig
                | InputError::NonRetryableSinkError
        )
    }

    pub fn stage(&self) -> &'static str {
        if self.is_client_error() {
            "parsing"
        } else {
            "emitting"
        }
    }
}

impl IntoResponse for InputError {
    fn into_response(self) -> Response {
        let (status, body) = if self.is_client_error() {
            (StatusCode::BAD_REQUEST, format!("Bad Request\n{self}\n"))
        } else {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal Server Error\n{self}\n"),
            )
        };
        (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
    }
}

pub fn ok() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        OK_BODY,
    )
        .into_response()
}
