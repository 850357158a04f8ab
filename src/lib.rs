//! Lease-based service registry.
//!
//! - `services::registry`: instance store and REST surface
//! - `services::lease`: expiry sweep with self-preservation
//! - `services::client`: registration lifecycle and discovery cache
//! - `services::bootstrap`: remote configuration before registration

pub mod config;
pub mod logging;
pub mod server;
pub mod services;
