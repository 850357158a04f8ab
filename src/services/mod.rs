pub mod bootstrap;
pub mod client;
pub mod lease;
pub mod registry;

pub use lease::{LeaseManager, SelfPreservationConfig};
pub use registry::{RegistryError, RegistryStore, StoreConfig};
