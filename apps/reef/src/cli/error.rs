use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::error::{
    ConnectivityError, MutationError, ReefError, SaveError, SessionError, ViewportError,
};
use crate::service::ServiceError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Reef(#[from] ReefError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

macro_rules! via_reef_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for CliError {
                fn from(err: $ty) -> Self {
                    CliError::Reef(err.into())
                }
            }
        )*
    };
}

via_reef_error!(
    ServiceError,
    ConnectivityError,
    SessionError,
    ViewportError,
    MutationError,
    SaveError,
);
