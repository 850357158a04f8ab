//! Client side of the registry: registration lifecycle and discovery cache.

pub mod backoff;
pub mod config;
pub mod discovery;
pub mod error;
pub mod registration;
pub mod registry_client;
pub mod transport;

pub use backoff::Backoff;
pub use config::*;
pub use discovery::DiscoveryClient;
pub use error::*;
pub use registration::{RegistrationClient, RegistrationState};
pub use registry_client::RegistryClient;
pub use transport::RegistryTransport;
