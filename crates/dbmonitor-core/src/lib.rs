//! dbmonitor-core - MySQL session exporter library.
//!
//! Provides:
//! - `config`: instance definitions loaded from YAML or environment
//! - `registry`: one lazily-connecting pool per configured instance
//! - `collector`: processlist sampling, metric mapping and scrape orchestration

pub mod collector;
pub mod config;
pub mod registry;

/// Crate version with the git revision it was built from.
pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("DBMONITOR_GIT_SHA"),
    ")"
);
