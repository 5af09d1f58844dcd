mod common;
mod provider_credentials;
mod quotas;
mod usage;

pub use provider_credentials::SqliteProviderCredentialRepo;
pub use quotas::SqliteQuotaRepo;
pub use usage::SqliteUsageMetricRepo;
