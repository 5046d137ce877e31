//! Volume service client errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("base URL cannot have path segments: {0}")]
    InvalidBaseUrl(String),

    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

impl From<DriverError> for berth_core::Error {
    fn from(err: DriverError) -> Self {
        berth_core::Error::Driver(err.to_string())
    }
}
