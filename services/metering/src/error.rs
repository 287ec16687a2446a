//! Metering-service-specific error kinds for setup/internal paths; request
//! failures are translated directly into a response inside the handler.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind listener: {0}")]
    ListenerBind(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<common::Error> for Error {
    fn from(e: common::Error) -> Self {
        Error::Config(e.to_string())
    }
}
