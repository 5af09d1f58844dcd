mod provider_credential;
mod usage;
mod validators;

pub use provider_credential::*;
pub use usage::*;
