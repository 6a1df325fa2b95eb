//! Types shared by the Saga authentication crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
