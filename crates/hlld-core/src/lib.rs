//! # hlld-core
//!
//! Core of the hlld daemon: a large, dynamic population of named
//! HyperLogLog cardinality estimators, persisted to per-set register
//! files and managed through an MVCC directory with lock-free reads.
//!
//! ## Layers
//!
//! - [`bitmap`] — bit-addressable register store with three backing
//!   modes (anonymous, shared mmap, persistent writeback)
//! - [`hll`] — dense 6-bit-register HyperLogLog sketch atop a bitmap
//! - [`set`] — named, lazily-faulted sketch with persisted config
//! - [`manager`] — MVCC name directory, vacuum worker, delete tracking
//! - [`background`] — periodic flush and cold-unmap workers

pub mod background;
pub mod bitmap;
pub mod config;
pub mod hll;
pub mod logging;
pub mod manager;
pub mod set;
pub mod sync;

use std::io;

use thiserror::Error;

/// Errors surfaced by the core.
#[derive(Error, Debug)]
pub enum HlldError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("set not found")]
    NotFound,

    #[error("set already exists")]
    AlreadyExists,

    #[error("delete in progress")]
    DeleteInProgress,

    #[error("set is not proxied")]
    NotProxied,

    #[error("I/O error: {0}")]
    FileSystem(#[from] io::Error),

    #[error("register file size mismatch: expected {expected}, found {found}")]
    SizeMismatch { expected: u64, found: u64 },

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, HlldError>;

pub use config::{GlobalConfig, SetConfig};
pub use manager::SetManager;
pub use set::Set;
