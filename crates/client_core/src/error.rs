use thiserror::Error;

use shared::error::ApiException;

use crate::upload::UploadError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("push transport unavailable: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Api(#[from] ApiException),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("no message with that id in the timeline")]
    UnknownMessage,

    #[error("{0} is not supported for this conversation kind")]
    Unsupported(&'static str),

    #[error("message is not in a retryable state")]
    NotRetryable,
}
