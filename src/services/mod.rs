mod provider_credentials;
mod usage;

use std::sync::Arc;

pub use provider_credentials::{CredentialError, ProviderCredentialService};
pub use usage::{QUOTA_EXCEEDED_MESSAGE, QuotaError, QuotaReservation, QuotaService};

use crate::{db::DbPool, models::QuotaLimits, pricing::PricingTable, secrets::CredentialCipher};

/// Container for all database-backed services
#[derive(Clone)]
pub struct Services {
    pub quotas: Arc<QuotaService>,
    pub provider_credentials: ProviderCredentialService,
}

impl Services {
    pub fn new(
        db: Arc<DbPool>,
        pricing: PricingTable,
        quota_defaults: QuotaLimits,
        cipher: CredentialCipher,
    ) -> Self {
        Self {
            quotas: Arc::new(QuotaService::new(db.clone(), pricing, quota_defaults)),
            provider_credentials: ProviderCredentialService::new(db, cipher),
        }
    }
}
