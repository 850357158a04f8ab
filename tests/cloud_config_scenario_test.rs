use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::routing::get;
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use lease_registry::config::Config;
use lease_registry::server::RegistryServer;
use lease_registry::services::bootstrap::{
    BootstrapError, BootstrapPolicy, BootstrapRequest, ConfigBootstrap, HttpConfigBootstrap,
};
use lease_registry::services::client::{
    ClientError, DiscoveryClient, DiscoveryConfig, RegistrationClient, RegistrationConfig,
    RegistrationState, RegistryClient, RegistryTransport,
};

async fn start_registry() -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<()>) {
    let mut config = Config::default();
    config.server.bind_address = "127.0.0.1:0".to_string();
    config.lease_manager.sweep_interval_ms = Some(200);

    let server = RegistryServer::bind(&config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        server.run(token).await.unwrap();
    });
    (addr, shutdown, handle)
}

// 模拟配置中心：GET /{application}/{profile}
async fn start_config_server() -> SocketAddr {
    async fn properties(Path((application, profile)): Path<(String, String)>) -> Json<Value> {
        Json(json!({
            "name": application,
            "profiles": [profile],
            "propertySources": [
                { "name": format!("{application}-{profile}.yml"), "source": { "server.port": 8888 } },
                { "name": "application.yml", "source": { "server.port": 8080, "registry.lease": 5 } }
            ]
        }))
    }

    let app = Router::new().route("/{application}/{profile}", get(properties));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn application_over_http(addr: SocketAddr, service_name: &str) -> Value {
    reqwest::get(format!("http://{addr}/registry/apps/{service_name}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn cloud_config_is_discoverable_within_fifteen_seconds() {
    let (registry_addr, registry_shutdown, registry_handle) = start_registry().await;
    let config_addr = start_config_server().await;

    let transport: Arc<dyn RegistryTransport> =
        Arc::new(RegistryClient::connect(&format!("http://{registry_addr}")).unwrap());

    let mut registration = RegistrationConfig::new("cloud-config", "127.0.0.1", 8888);
    registration.lease_duration = Duration::from_secs(5);
    let client = RegistrationClient::new(transport.clone(), registration);

    let bootstrap =
        HttpConfigBootstrap::new(&format!("http://{config_addr}"), Duration::from_secs(2)).unwrap();
    let properties = client
        .start_with_bootstrap(&bootstrap, &BootstrapRequest::new("cloud-config", "default"))
        .await
        .unwrap();
    assert_eq!(properties["server.port"], "8888");
    assert_eq!(properties["registry.lease"], "5");

    let instance_id = timeout(Duration::from_secs(15), async {
        loop {
            let application = application_over_http(registry_addr, "CLOUD-CONFIG").await;
            if let Some(instance) = application["instances"].as_array().and_then(|list| list.first()) {
                assert_eq!(instance["status"], "UP");
                assert_eq!(instance["leaseDurationSeconds"], 5);
                break instance["instanceId"].as_str().unwrap().to_string();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("CLOUD-CONFIG not visible within 15s");
    assert_eq!(client.instance_id().as_deref(), Some(instance_id.as_str()));

    // 发现缓存经 HTTP 拉取同一视图
    let discovery = DiscoveryClient::new(
        transport.clone(),
        DiscoveryConfig {
            services: vec!["cloud-config".into()],
            ..DiscoveryConfig::default()
        },
    );
    discovery.refresh_now().await.unwrap();
    let picked = discovery.next_instance("cloud-config").unwrap().unwrap();
    assert_eq!(picked.address(), "127.0.0.1:8888");

    client.shutdown().await;
    assert_eq!(client.state(), RegistrationState::Deregistered);
    let application = application_over_http(registry_addr, "cloud-config").await;
    assert_eq!(application["instances"].as_array().unwrap().len(), 0);

    discovery.shutdown().await;
    registry_shutdown.cancel();
    registry_handle.await.unwrap();
}

#[tokio::test]
async fn http_transport_maps_registry_errors() {
    let (registry_addr, registry_shutdown, registry_handle) = start_registry().await;
    let client = RegistryClient::connect(&format!("http://{registry_addr}")).unwrap();

    assert!(matches!(
        client.renew("does-not-exist").await,
        Err(ClientError::NotFound(_))
    ));

    let invalid = RegistrationConfig::new("svc", "127.0.0.1", 0).register_request();
    assert!(matches!(
        client.register(&invalid).await,
        Err(ClientError::InvalidRequest(_))
    ));

    // 注销未知实例同样成功
    client.deregister("does-not-exist").await.unwrap();

    registry_shutdown.cancel();
    registry_handle.await.unwrap();
}

#[tokio::test]
async fn unreachable_registry_is_transient() {
    // 绑定后立即释放，得到一个无人监听的端口
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = RegistryClient::connect(&format!("http://{addr}")).unwrap();
    let error = client.query_all().await.unwrap_err();
    assert!(error.is_transient(), "{error}");
}

#[tokio::test]
async fn missing_config_profile_honours_policy() {
    let config_addr = start_config_server().await;
    let bootstrap =
        HttpConfigBootstrap::new(&format!("http://{config_addr}"), Duration::from_secs(2)).unwrap();

    // 路由只匹配两段路径，三段即 404
    let error = bootstrap.fetch("cloud-config", "default/extra").await.unwrap_err();
    assert!(matches!(error, BootstrapError::NotFound { .. }), "{error}");

    let request = BootstrapRequest::new("cloud-config", "default/extra")
        .with_policy(BootstrapPolicy::FallbackToDefaults)
        .with_defaults([("server.port".to_string(), "9999".to_string())].into());
    let properties = lease_registry::services::bootstrap::load(&bootstrap, &request)
        .await
        .unwrap();
    assert_eq!(properties["server.port"], "9999");
}
