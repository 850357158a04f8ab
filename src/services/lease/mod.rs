//! Lease expiry
//!
//! - `policy`: self-preservation decision and renewal accounting
//! - `manager`: periodic eviction sweep

pub mod manager;
pub mod policy;

pub use manager::{LeaseManager, SelfPreservationConfig, SweepReport};
pub use policy::{EvictionDecision, RenewalMeter, RenewalRates};
