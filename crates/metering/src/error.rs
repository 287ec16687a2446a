use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("stream ended without a usable usage record: {0}")]
    MissingFields(&'static str),

    #[error("malformed SSE payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] store::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
