//! Configuration: TOML file, serde defaults and a lock-free store

mod schema;
mod store;

pub use schema::*;
pub use store::{ConfigChange, ConfigStore};
