//! Error handling for the web layer.
//! The streaming and status endpoints only ever fail in ways the affected
//! request should see, so every variant maps straight to a response.
use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use log::warn;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// The response cannot be served as an event stream.
    StreamingUnsupported,
    /// The requested path is not a well-formed channel name.
    ChannelNotFound,
}

impl StdError for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> core::result::Result<(), std::fmt::Error> {
        write!(fmt, "{self:?}")
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::StreamingUnsupported => {
                warn!(
                    "Error::StreamingUnsupported: Responding with 500 Internal Server Error."
                );
                (StatusCode::INTERNAL_SERVER_ERROR, "Streaming unsupported.").into_response()
            }
            Error::ChannelNotFound => {
                warn!("Error::ChannelNotFound: Responding with 404 Not Found.");
                StatusCode::NOT_FOUND.into_response()
            }
        }
    }
}
