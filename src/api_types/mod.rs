//! Wire types shared by every HTTP-facing error and handler.

mod error;

pub use error::ErrorResponse;
