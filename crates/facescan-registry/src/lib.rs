//! facescan-registry — Enrollment and verification over a SQLite identity store.

pub mod config;
pub mod registry;
pub mod store;

pub use config::{Config, ConfigError};
pub use registry::{Registry, RegistryError, VerifyOutcome};
pub use store::{Identity, Store, StoreError};
