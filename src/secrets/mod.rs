//! Encrypted per-source secret storage.
//!
//! Credential material (API keys, OAuth token bundles, scrape cookies) is
//! persisted per source in SQLite, encrypted at rest with AES-256-GCM. The
//! store surviving process restarts is what lets a suspended OAuth source
//! resume correctly after the host is restarted for an unrelated reason.
//!
//! Values are opaque strings with no TTL; an entry disappears only through
//! explicit invalidation or when its source is deleted.

mod encryption;
mod store;

pub use encryption::{generate_key, seal, unseal, validate_key};
pub use store::SecretsStore;
