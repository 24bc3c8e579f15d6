//! # imgcat-core
//!
//! Core library for imgcat, a personal image-archive indexing and
//! similarity engine. It maintains a binary trie of perceptual hashes for
//! bounded-radius nearest-neighbor search, a relational catalog of image
//! metadata, per-image XML sidecar files as the on-disk source of truth,
//! and a synchronizer that keeps sidecars and catalog converged.
//!
//! ## Architecture
//!
//! - **hash** — fixed-width perceptual hash type
//! - **trie** — binary radix trie over hashes, bounded-radius search
//! - **record** — the metadata of one image
//! - **config** — typed configuration, no file parsing
//! - **timefmt** — shared timestamp formatting
//! - **sidecar** — XML sidecar read/write (`SidecarCodec`)
//! - **catalog** — SQLite-backed relational store (`Catalog`)
//! - **sync** — filesystem watcher + sweep + reconciliation (`Synchronizer`)
//! - **query** — search and retrieval operations (`QueryEngine`)
//! - **rpc** — newline-delimited JSON-over-TCP front end (`RpcFront`)

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod catalog;
pub mod config;
pub mod hash;
pub mod query;
pub mod record;
pub mod rpc;
pub mod sidecar;
pub mod sync;
pub mod timefmt;
pub mod trie;

pub use catalog::Catalog;
pub use config::Config;
pub use hash::Hash;
pub use query::QueryEngine;
pub use record::{Rating, Record};
pub use rpc::RpcFront;
pub use sync::Synchronizer;
pub use trie::HashTrie;

/// Standard result type for all imgcat-core operations.
pub type Result<T> = std::result::Result<T, ImgcatError>;

/// Structured error type for imgcat-core (spec §7).
///
/// A flat enum with a `message` field per variant, matching the teacher's
/// `JozinError` shape rather than pulling in `thiserror`. Each variant maps
/// to an exit code for CLI use and to the RPC front's `{error, trace}`
/// reply shape.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImgcatError {
    /// Invalid arguments, bad input, user mistake. Exit code 1.
    UserError { message: String },
    /// File system operation failed. Exit code 2.
    IoError { message: String },
    /// Schema or data integrity issue: corrupt sidecar, malformed hash. Exit code 3.
    ValidationError { message: String },
    /// Unexpected failure in imgcat-core logic. Exit code 4.
    InternalError { message: String },
    /// Insert of a hash already present in the trie (spec §3.2).
    DuplicateHash { message: String },
    /// Lookup of a hash absent from the trie.
    MissingHash { message: String },
    /// The on-disk trie snapshot failed to deserialize.
    CorruptIndex { message: String },
    /// A uid collides with an existing record.
    UidConflict { message: String },
    /// No record exists for the given uid.
    NoSuchUid { message: String },
    /// A keyword does not satisfy the configured `tag_regex`.
    InvalidKeyword { message: String },
    /// A path does not have a recognized image extension.
    NotAnImage { message: String },
    /// The retry FIFO or watcher is shedding load.
    RateLimited { message: String },
    /// An RPC request named a field the method does not accept.
    UnknownField { message: String },
}

impl fmt::Display for ImgcatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImgcatError::UserError { message } => write!(f, "user error: {message}"),
            ImgcatError::IoError { message } => write!(f, "I/O error: {message}"),
            ImgcatError::ValidationError { message } => write!(f, "validation error: {message}"),
            ImgcatError::InternalError { message } => write!(f, "internal error: {message}"),
            ImgcatError::DuplicateHash { message } => write!(f, "duplicate hash: {message}"),
            ImgcatError::MissingHash { message } => write!(f, "missing hash: {message}"),
            ImgcatError::CorruptIndex { message } => write!(f, "corrupt index: {message}"),
            ImgcatError::UidConflict { message } => write!(f, "uid conflict: {message}"),
            ImgcatError::NoSuchUid { message } => write!(f, "no such uid: {message}"),
            ImgcatError::InvalidKeyword { message } => write!(f, "invalid keyword: {message}"),
            ImgcatError::NotAnImage { message } => write!(f, "not an image: {message}"),
            ImgcatError::RateLimited { message } => write!(f, "rate limited: {message}"),
            ImgcatError::UnknownField { message } => write!(f, "unknown field: {message}"),
        }
    }
}

impl std::error::Error for ImgcatError {}

impl From<std::io::Error> for ImgcatError {
    fn from(err: std::io::Error) -> Self {
        ImgcatError::IoError {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ImgcatError {
    fn from(err: serde_json::Error) -> Self {
        ImgcatError::ValidationError {
            message: format!("JSON error: {err}"),
        }
    }
}

impl From<rusqlite::Error> for ImgcatError {
    fn from(err: rusqlite::Error) -> Self {
        ImgcatError::InternalError {
            message: format!("sqlite error: {err}"),
        }
    }
}

impl From<walkdir::Error> for ImgcatError {
    fn from(err: walkdir::Error) -> Self {
        ImgcatError::IoError {
            message: format!("directory traversal error: {err}"),
        }
    }
}

impl From<notify::Error> for ImgcatError {
    fn from(err: notify::Error) -> Self {
        ImgcatError::IoError {
            message: format!("filesystem watch error: {err}"),
        }
    }
}

impl ImgcatError {
    /// Exit code for CLI use: `UserError`→1, `IoError`→2, `ValidationError`→3,
    /// `InternalError`→4; domain-specific kinds map to the nearest bucket.
    pub fn exit_code(&self) -> i32 {
        match self {
            ImgcatError::UserError { .. } => 1,
            ImgcatError::IoError { .. } => 2,
            ImgcatError::ValidationError { .. } => 3,
            ImgcatError::InternalError { .. } => 4,
            ImgcatError::DuplicateHash { .. } => 1,
            ImgcatError::MissingHash { .. } => 3,
            ImgcatError::CorruptIndex { .. } => 3,
            ImgcatError::UidConflict { .. } => 1,
            ImgcatError::NoSuchUid { .. } => 1,
            ImgcatError::InvalidKeyword { .. } => 1,
            ImgcatError::NotAnImage { .. } => 1,
            ImgcatError::RateLimited { .. } => 4,
            ImgcatError::UnknownField { .. } => 1,
        }
    }
}

/// The process-wide singletons every operation is built on: the hash trie
/// and the catalog connection. Constructed once at startup and handed to
/// `RpcFront` (spec design note §9 — avoid passing the trie and catalog
/// separately through every call site).
pub struct Core {
    pub config: Config,
    pub trie: parking_lot::ReentrantMutex<std::cell::RefCell<HashTrie>>,
    pub catalog: Catalog,
}

impl Core {
    /// Opens (or creates) the catalog at `config.cache_folder` and loads or
    /// builds the hash trie to match.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.cache_folder)?;
        let catalog = Catalog::open(
            &config.cache_folder.join("catalog.sqlite3"),
            &config.tag_regex,
            config.hash_length,
        )?;

        let trie_path = config.cache_folder.join("trie.bin");
        let trie = if trie_path.exists() {
            let mut file = std::fs::File::open(&trie_path)?;
            HashTrie::deserialize(&mut file, config.hash_length)?
        } else {
            let mut trie = HashTrie::new(config.hash_length);
            for uid in catalog.list_all_uids()? {
                if let Some(record) = catalog.get(&uid)? {
                    let _ = trie.add(&record.hash);
                }
            }
            trie
        };

        Ok(Self {
            config,
            trie: parking_lot::ReentrantMutex::new(std::cell::RefCell::new(trie)),
            catalog,
        })
    }

    /// Persists the in-memory trie to `cache_folder/trie.bin`.
    pub fn save_trie(&self) -> Result<()> {
        let guard = self.trie.lock();
        let mut buf = Vec::new();
        guard.borrow().serialize(&mut buf)?;
        drop(guard);
        let path = self.config.cache_folder.join("trie.bin");
        std::fs::write(path, buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_spec_buckets() {
        assert_eq!(ImgcatError::UserError { message: String::new() }.exit_code(), 1);
        assert_eq!(ImgcatError::IoError { message: String::new() }.exit_code(), 2);
        assert_eq!(ImgcatError::ValidationError { message: String::new() }.exit_code(), 3);
        assert_eq!(ImgcatError::InternalError { message: String::new() }.exit_code(), 4);
    }

    #[test]
    fn core_opens_fresh_cache_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache_folder = tmp.path().join("cache");
        config.hash_length = 64;
        let core = Core::open(config).unwrap();
        assert_eq!(core.catalog.list_all_uids().unwrap().len(), 0);
    }
}
