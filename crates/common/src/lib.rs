//! Common types for the pool key services

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
