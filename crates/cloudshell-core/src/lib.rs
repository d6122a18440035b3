pub mod config;
pub mod env;
pub mod error;

pub use config::Config;
pub use error::{Error, Result};
