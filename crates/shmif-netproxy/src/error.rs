// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error type for the network proxy binary. A binary crate, so unlike
//! `shmif-core`'s hand-rolled enum this reaches for `thiserror`, matching
//! `hdds-router::config::ConfigError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shmif core error: {0}")]
    Shmif(#[from] shmif_core::ShmifError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("a12 handshake failed")]
    HandshakeFailed,
}

pub type Result<T> = std::result::Result<T, ProxyError>;
