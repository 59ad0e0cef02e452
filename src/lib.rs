pub mod config;
pub mod core;
pub mod error;
pub mod http;
pub mod log;
pub mod orchestration;

pub use error::{Error, Result};
