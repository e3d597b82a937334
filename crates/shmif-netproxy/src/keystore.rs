// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Minimal file-backed keystore.
//!
//! The on-disk layout a real deployment would use is specified
//! elsewhere; this is a stand-in sufficient to drive the `keystore tag
//! host [port]` CLI subcommand, not a reimplementation of that format.
//! One TOML file per statepath directory, a flat `tag -> (host, port)`
//! table.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const KEYSTORE_FILE: &str = "keystore.toml";
const DEFAULT_PORT: u16 = 6680;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeystoreEntry {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeystoreFile {
    #[serde(default)]
    entries: BTreeMap<String, KeystoreEntry>,
}

pub struct Keystore {
    path: PathBuf,
    file: KeystoreFile,
}

impl Keystore {
    /// Open (or initialize empty) the keystore rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(KEYSTORE_FILE);
        let file = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)
                .map_err(|e| ProxyError::Config(format!("malformed keystore at {}: {e}", path.display())))?
        } else {
            std::fs::create_dir_all(dir.as_ref())?;
            KeystoreFile::default()
        };
        Ok(Self { path, file })
    }

    pub fn lookup(&self, tag: &str) -> Option<&KeystoreEntry> {
        self.file.entries.get(tag)
    }

    /// Record or update a `tag -> host[:port]` mapping and persist it.
    /// `port` defaults to [`DEFAULT_PORT`] when not given, matching the
    /// `keystore tag host [port]` subcommand's optional third argument.
    pub fn put(&mut self, tag: &str, host: &str, port: Option<u16>) -> Result<()> {
        self.file.entries.insert(
            tag.to_string(),
            KeystoreEntry { host: host.to_string(), port: port.unwrap_or(DEFAULT_PORT) },
        );
        self.save()
    }

    fn save(&self) -> Result<()> {
        let serialized = toml::to_string_pretty(&self.file)
            .map_err(|e| ProxyError::Config(format!("failed to serialize keystore: {e}")))?;
        std::fs::write(&self.path, serialized)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_lookup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Keystore::open(dir.path()).unwrap();
        store.put("peer1", "example.org", Some(7000)).unwrap();

        let reopened = Keystore::open(dir.path()).unwrap();
        let entry = reopened.lookup("peer1").unwrap();
        assert_eq!(entry.host, "example.org");
        assert_eq!(entry.port, 7000);
    }

    #[test]
    fn missing_port_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Keystore::open(dir.path()).unwrap();
        store.put("peer2", "example.com", None).unwrap();
        assert_eq!(store.lookup("peer2").unwrap().port, DEFAULT_PORT);
    }

    #[test]
    fn unknown_tag_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = Keystore::open(dir.path()).unwrap();
        assert!(store.lookup("nope").is_none());
    }
}
