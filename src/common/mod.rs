//! Common Infrastructure Module
//!
//! Shared error taxonomy for the indexer core.

pub mod error;

pub use error::{IndexerError, Result};
