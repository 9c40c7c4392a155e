pub mod config;
pub mod error;
pub mod executor;
pub mod log_sanitize;
pub mod modules;
pub mod planner;
pub mod policy;
pub mod remote;
pub mod repair;
pub mod transfer;
pub mod workspace;

pub use error::{Error, ErrorKind, Result};
