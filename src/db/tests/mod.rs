//! Shared database repository test infrastructure
//!
//! Each repository has a test module (e.g., `quotas.rs`) containing:
//! - Shared test functions that take `&dyn XxxRepo` (or a context of repos)
//! - SQLite-specific setup using in-memory databases
//!
//! New backends get coverage by adding a setup module that reuses the shared
//! functions.

mod provider_credentials;
