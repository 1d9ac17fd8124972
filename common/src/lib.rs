pub mod config;
pub mod err;
pub mod log;

pub use config::Config;
pub use err::{CResult, CacheError};
