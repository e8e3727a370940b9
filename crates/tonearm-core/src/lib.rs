//! # tonearm-core
//!
//! Core types and error handling shared by the Tonearm playback engine and its hosts.

pub mod error;
pub mod types;

pub use error::{Error, LoadError, Result};
pub use types::*;
