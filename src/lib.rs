pub mod auth;
pub mod config;
pub mod readings;
pub mod runner;
pub mod sds;

// Re-export commonly used types
pub use config::Config;
pub use runner::{RunMode, Runner};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
