//! Registry service module
//!
//! This module contains the service registry implementation split into logical components:
//! - `types`: Instance, lease and wire types
//! - `store`: Concurrent in-memory registry
//! - `error`: Registry error taxonomy
//! - `http`: REST surface with JSON/XML negotiation

pub mod error;
pub mod http;
pub mod store;
pub mod types;

// Re-export public types for easier access
pub use error::RegistryError;
pub use store::{IdentityPolicy, RegistryStore, StoreConfig, StoreStats};
pub use types::{
    Application, InstanceStatus, InstanceView, Lease, RegisterRequest, RegisterResponse,
    RegistrySnapshot, ServiceInstance, StatusUpdateRequest,
};
