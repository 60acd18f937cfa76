use thiserror::Error;

use flowbus_core::CoreError;

pub use flowbus_core::{Effect, Transience};

use crate::bus::PublishError;
use crate::config::ConfigError;
use crate::dedup::DedupError;
use crate::session::SessionError;

/// Crate-level convenience error.
///
/// A thin wrapper over the capability errors; classification is delegated.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Dedup(#[from] DedupError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Session(e) => e.transience(),
            Error::Dedup(e) => e.transience(),
            Error::Config(e) => e.transience(),
            Error::Publish(e) => e.transience(),
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Core(e) => e.effect(),
            Error::Session(e) => e.effect(),
            Error::Dedup(e) => e.effect(),
            Error::Config(e) => e.effect(),
            Error::Publish(e) => e.effect(),
        }
    }
}
