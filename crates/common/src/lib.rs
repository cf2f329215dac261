//! Common types for the account pool workspace

mod capability;
mod error;
mod secret;

pub use capability::{Capability, ParseCapabilityError};
pub use error::{Error, Result};
pub use secret::Secret;
