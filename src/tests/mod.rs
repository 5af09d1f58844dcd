//! Consolidated test modules.
//!
//! End-to-end tests that drive the fully layered router.
