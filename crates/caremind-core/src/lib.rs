//! # CareMind Core
//!
//! Shared foundation for the CareMind reminder service: the error type,
//! TOML configuration, and the `MessageDispatcher` boundary that the
//! scheduler drives and the channel crates implement.

pub mod config;
pub mod error;
pub mod traits;

pub use config::CaremindConfig;
pub use error::{CaremindError, Result};
pub use traits::{DispatchOutcome, MessageDispatcher};
