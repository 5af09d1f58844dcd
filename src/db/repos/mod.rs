mod provider_credentials;
mod quotas;
mod usage;

pub use provider_credentials::*;
pub use quotas::*;
pub use usage::*;
