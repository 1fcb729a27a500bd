pub mod compressor;
pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod job;
pub mod log_sanitize;
pub mod pipeline;
pub mod remote;
pub mod utilities;
pub mod workspace;

pub use error::{Error, Result};
