//! # treesync
//!
//! Keeps a directory tree on a client and a directory tree on a server in
//! agreement over a single persistent TCP connection.
//!
//! Each side describes its tree as a [`manifest::Manifest`] (relative path to
//! BLAKE3 digest). A sync pass exchanges manifests, diffs them against the
//! last agreed baseline, and then moves whole files in both directions with
//! a small framed command protocol. Received files are written to a
//! temporary sibling and renamed into place only once complete.
//!
//! ## Core Modules
//!
//! - [`protocol`] - Wire frames and the buffered [`protocol::Connection`]
//! - [`manifest`] - Tree scanning and path validation
//! - [`diff`] - Baseline-aware sync planning
//! - [`transfer`] - Single-file upload, download and delete exchanges
//! - [`sync`] - One full sync pass and its [`sync::SyncReport`]
//! - [`server`] - TCP listener and per-client sessions
//! - [`client`] - Long-running client with reconnect and change pushing
//! - [`watcher`] - File system events feeding the client
//!
//! ## Quick Start
//!
//! ```bash
//! # On the server
//! treesync serve --bind 0.0.0.0:5000 --root /srv/shared
//!
//! # On the client
//! treesync client --server 10.0.0.5:5000 --root ~/shared
//!
//! # Or a single pass
//! treesync sync --server 10.0.0.5:5000 --root ~/shared
//! ```

pub mod bandwidth;
pub mod cli;
pub mod client;
pub mod config;
pub mod diff;
pub mod error;
pub mod events;
pub mod hash;
pub mod manifest;
pub mod protocol;
pub mod server;
pub mod sync;
pub mod transfer;
pub mod watcher;

pub use config::Config;
pub use error::{Result, SyncError};
