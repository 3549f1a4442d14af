//! Versioned content-addressed block storage
//!
//! This crate stores immutable blocks under their BLAKE3 address in an
//! append-only log with an on-disk index and an associative front cache.
//! On top of the store sits a copy-on-write block tree that maps dense
//! block numbers to payloads; every update yields a new root while older
//! roots remain readable.

pub mod address;
pub mod config;
pub mod logging;
pub mod store;
pub mod tree;

pub use address::{Address, AddressError};
pub use config::{Config, ConfigError};
pub use logging::Logger;
pub use store::{create_store, open_store, Backend, Store, StoreError, StoreStats};
pub use tree::{sort_ops, BlockOp, BlockTree, TreeError, TreeNode};
