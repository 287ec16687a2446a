//! Relay-specific error kinds. Most request-path failures are translated
//! directly into a response inside the handler rather than surfaced through
//! this type; this covers the setup/internal paths that do use `?`.

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
