//! Registers one service instance, keeps it alive, and watches the registry.

use std::sync::Arc;

use lease_registry::logging;
use lease_registry::services::bootstrap::{ConfigBootstrap, HttpConfigBootstrap, StaticConfigBootstrap};
use lease_registry::services::client::{
    ClientSettings, DiscoveryClient, RegistrationClient, RegistryClient, RegistryTransport,
};
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let settings = ClientSettings::from_env()?;
    logging::init(&settings.log_level);

    let registry: Arc<dyn RegistryTransport> =
        Arc::new(RegistryClient::new(settings.registry_client_config())?);

    let bootstrap: Box<dyn ConfigBootstrap> = match settings.config_server_url.as_deref() {
        Some(url) => Box::new(HttpConfigBootstrap::new(url, settings.call_timeout())?),
        None => Box::new(StaticConfigBootstrap::default()),
    };

    let registration = RegistrationClient::new(registry.clone(), settings.registration_config());
    let properties = registration
        .start_with_bootstrap(bootstrap.as_ref(), &settings.bootstrap_request())
        .await?;
    tracing::info!(
        service_name = %settings.service_name,
        properties = properties.len(),
        state = ?registration.state(),
        "Agent started"
    );

    let discovery = DiscoveryClient::new(registry, settings.discovery_config());
    discovery.start();

    let mut changes = Box::pin(discovery.changes());
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                }
                break;
            }
            Some(snapshot) = changes.next() => {
                tracing::info!(
                    version = snapshot.version,
                    applications = snapshot.applications.len(),
                    instances = snapshot.instance_count(),
                    "Registry view changed"
                );
            }
        }
    }

    tracing::info!("Shutting down agent...");
    discovery.shutdown().await;
    registration.shutdown().await;
    Ok(())
}
