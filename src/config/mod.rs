//! Application configuration
//!
//! The schema lives in [`schema`]; [`store`] loads it from a TOML file and
//! hands out lock-free snapshots.

mod schema;
mod store;

pub use schema::*;
pub use store::ConfigStore;
