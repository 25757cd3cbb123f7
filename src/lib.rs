pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod orchestration;

pub use error::{Error, Result};
