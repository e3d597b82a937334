// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Network proxy bridging a local SHMIF segment to a remote peer over an
//! authenticated stream transport.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod keystore;
pub mod modes;
pub mod retry;

pub use auth::{A12Handshake, MagicPreambleHandshake, Role};
pub use config::ProxyConfig;
pub use dispatch::{DispatchMode, NoPrivilegeSeparation, PrivilegeSeparation};
pub use error::{ProxyError, Result};
pub use host::NetproxyHost;
pub use keystore::Keystore;
pub use modes::{ExecSpec, ProxyMode, RunOptions};
pub use retry::RetryPolicy;
