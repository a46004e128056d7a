//! CLI command modules.

pub mod interactive;
pub mod request;
