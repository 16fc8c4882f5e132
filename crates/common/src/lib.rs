//! Common types shared across the identity bridge crates

mod deadline;
mod error;
mod secret;
mod token;

pub use deadline::{Deadline, DeadlineExceeded};
pub use error::{Error, Result};
pub use secret::Secret;
pub use token::new_token;
