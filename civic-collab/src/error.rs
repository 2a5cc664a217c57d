//! Crate-level error type.

use thiserror::Error;

use crate::config::ConfigError;
use crate::document::DocumentError;
use crate::protocol::ProtocolError;
use crate::rewrite::RewriteError;
use crate::server::ServerError;
use crate::storage::StoreError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

pub type Result<T> = std::result::Result<T, CollabError>;
