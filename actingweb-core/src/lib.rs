//! Peer interaction engine for ActingWeb actors.
//!
//! This crate implements the pieces of the ActingWeb protocol that concern
//! one actor's relationship with its peers: establishing and tearing down
//! trust, evaluating what a peer is allowed to see, publishing and
//! receiving subscription diffs, and reconciling state when the callback
//! channel falls behind. Actor identity, property storage and HTTP routing
//! are the embedder's responsibility; this crate is reached from inside
//! those layers, not a replacement for them.
//!
//! Persistence is abstracted behind [`storage::StorageAdapter`]; an
//! in-memory reference implementation lives in [`storage::memory`], and a
//! durable SQLite-backed one ships separately as `actingweb-storage-sqlite`.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod peer_client;
pub mod permission;
pub mod property;
pub mod storage;
pub mod subscription;
pub mod sync;
pub mod trust;
pub mod types;
pub mod wire;

pub use config::EngineConfig;
pub use error::{ActingWebError, Result};
