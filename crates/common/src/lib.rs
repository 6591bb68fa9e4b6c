//! Shared types for the ClickUp MCP gateway workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
