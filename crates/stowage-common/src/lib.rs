//! Stowage Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging for the Stowage workspace.
//!
//! - **Error Handling**: [`StowageError`] and the [`Result`] alias
//! - **Logging**: structured `tracing` setup shared by the library and the CLI
//!
//! # Example
//!
//! ```no_run
//! use stowage_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, StowageError};
