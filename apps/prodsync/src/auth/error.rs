use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Toml(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway error ({status}): {message}")]
    Gateway { status: u16, message: String },
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("{0}")]
    Other(String),
}

impl From<toml::de::Error> for AuthError {
    fn from(value: toml::de::Error) -> Self {
        AuthError::Toml(value.to_string())
    }
}

impl From<toml::ser::Error> for AuthError {
    fn from(value: toml::ser::Error) -> Self {
        AuthError::Toml(value.to_string())
    }
}
