pub mod config;
pub mod operator;
pub mod path;
pub mod store;

#[cfg(test)]
mod tests;

pub use config::StorageConfig;
pub use operator::{create_operator, init_operator, test_connection};
pub use store::{Appender, BlobStore};
