//! Storage module for Hive
//!
//! - `json`: JSON documents and JSON-lines logs on the local filesystem

mod json;

pub use json::{write_atomic, JsonStore};
