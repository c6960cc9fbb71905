//! JSON file storage

mod store;

pub use store::{write_atomic, JsonStore};
