use std::collections::BTreeMap;

use axum::Router;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::RegistryError;
use super::store::{RegistryStore, StoreStats};
use super::types::{
    Application, ErrorBody, InstanceView, RegisterRequest, RegisterResponse, RegistrySnapshot,
    StatusUpdateRequest,
};
use crate::services::lease::LeaseManager;

#[derive(Debug, Clone)]
struct ApiState {
    store: RegistryStore,
    lease_manager: LeaseManager,
}

/// Builds the registry HTTP surface.
///
/// - `POST   /registry/instances`
/// - `GET    /registry/instances/{id}`
/// - `DELETE /registry/instances/{id}`
/// - `PUT    /registry/instances/{id}/renew`
/// - `PUT    /registry/instances/{id}/status`
/// - `GET    /registry/apps`
/// - `GET    /registry/apps/{service_name}`
/// - `GET    /registry/stats`
pub fn router(store: RegistryStore, lease_manager: LeaseManager) -> Router {
    Router::new()
        .route("/registry/instances", post(register_instance))
        .route(
            "/registry/instances/{instance_id}",
            get(get_instance).delete(deregister_instance),
        )
        .route("/registry/instances/{instance_id}/renew", put(renew_instance))
        .route("/registry/instances/{instance_id}/status", put(update_status))
        .route("/registry/apps", get(list_applications))
        .route("/registry/apps/{service_name}", get(get_application))
        .route("/registry/stats", get(registry_stats))
        .with_state(ApiState {
            store,
            lease_manager,
        })
}

// 内容协商格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Xml,
}

impl Format {
    fn from_header(value: Option<&HeaderValue>) -> Self {
        let Some(value) = value.and_then(|v| v.to_str().ok()) else {
            return Format::Json;
        };

        // 按出现顺序取第一个可识别的类型
        for media in value.split(',') {
            let media = media.split(';').next().unwrap_or_default().trim();
            match media {
                "application/xml" | "text/xml" => return Format::Xml,
                "application/json" | "*/*" => return Format::Json,
                _ => {}
            }
        }
        Format::Json
    }

    fn accepted(headers: &HeaderMap) -> Self {
        Self::from_header(headers.get(ACCEPT))
    }

    fn of_body(headers: &HeaderMap) -> Self {
        Self::from_header(headers.get(CONTENT_TYPE))
    }
}

fn decode_body<T: DeserializeOwned>(headers: &HeaderMap, body: &Bytes) -> Result<T, RegistryError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| RegistryError::InvalidRequest(format!("body is not UTF-8: {e}")))?;

    match Format::of_body(headers) {
        Format::Json => serde_json::from_str(text)
            .map_err(|e| RegistryError::InvalidRequest(format!("malformed JSON body: {e}"))),
        Format::Xml => quick_xml::de::from_str(text)
            .map_err(|e| RegistryError::InvalidRequest(format!("malformed XML body: {e}"))),
    }
}

fn render_json<T: Serialize>(status: StatusCode, value: &T) -> Result<Response, RegistryError> {
    let body = serde_json::to_vec(value).map_err(|e| RegistryError::Encoding(e.to_string()))?;
    Ok((status, [(CONTENT_TYPE, "application/json")], body).into_response())
}

fn render_xml<T: Serialize>(status: StatusCode, root: &str, value: &T) -> Result<Response, RegistryError> {
    let body = quick_xml::se::to_string_with_root(root, value)
        .map_err(|e| RegistryError::Encoding(e.to_string()))?;
    Ok((status, [(CONTENT_TYPE, "application/xml")], body).into_response())
}

fn render<T: Serialize>(
    headers: &HeaderMap,
    status: StatusCode,
    root: &str,
    value: &T,
) -> Result<Response, RegistryError> {
    match Format::accepted(headers) {
        Format::Json => render_json(status, value),
        Format::Xml => render_xml(status, root, value),
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
        };
        match render_json(status, &body) {
            Ok(response) => response,
            Err(_) => status.into_response(),
        }
    }
}

async fn register_instance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RegistryError> {
    let request: RegisterRequest = decode_body(&headers, &body)?;
    let instance_id = state.store.register(request)?;
    render(
        &headers,
        StatusCode::CREATED,
        "registration",
        &RegisterResponse { instance_id },
    )
}

async fn renew_instance(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> Result<StatusCode, RegistryError> {
    state.store.renew(&instance_id)?;
    Ok(StatusCode::OK)
}

async fn update_status(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, RegistryError> {
    let request: StatusUpdateRequest = decode_body(&headers, &body)?;
    state.store.update_status(&instance_id, request.status)?;
    Ok(StatusCode::OK)
}

// 注销是幂等的，未知实例同样返回 200
async fn deregister_instance(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
) -> StatusCode {
    if let Err(e) = state.store.deregister(&instance_id) {
        tracing::debug!(instance_id = %instance_id, error = %e, "Deregister of absent instance");
    }
    StatusCode::OK
}

async fn get_instance(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, RegistryError> {
    let instance = state
        .store
        .instance(&instance_id)
        .ok_or_else(|| RegistryError::NotFound(instance_id.clone()))?;

    match Format::accepted(&headers) {
        Format::Json => render_json(StatusCode::OK, &instance),
        Format::Xml => render_xml(StatusCode::OK, "instance", &XmlInstance::from(&instance)),
    }
}

async fn get_application(
    State(state): State<ApiState>,
    Path(service_name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, RegistryError> {
    let application = state.store.query(&service_name);

    match Format::accepted(&headers) {
        Format::Json => render_json(StatusCode::OK, &application),
        Format::Xml => render_xml(StatusCode::OK, "application", &XmlApplication::from(&application)),
    }
}

async fn list_applications(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, RegistryError> {
    let snapshot = state.store.query_all();

    match Format::accepted(&headers) {
        Format::Json => render_json(StatusCode::OK, &snapshot),
        Format::Xml => render_xml(StatusCode::OK, "applications", &XmlApplications::from(&snapshot)),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SelfPreservationStats {
    enabled: bool,
    active: bool,
    threshold: f64,
    expected_renewals_per_min: f64,
    observed_renewals_per_min: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistryStats {
    #[serde(flatten)]
    store: StoreStats,
    self_preservation: SelfPreservationStats,
}

async fn registry_stats(State(state): State<ApiState>) -> Result<Response, RegistryError> {
    let manager = &state.lease_manager;
    let rates = manager.renewal_rates(tokio::time::Instant::now());
    let stats = RegistryStats {
        store: state.store.stats(),
        self_preservation: SelfPreservationStats {
            enabled: manager.preservation().enabled,
            active: manager.is_self_preserving(),
            threshold: manager.preservation().threshold,
            expected_renewals_per_min: rates.expected_per_min,
            observed_renewals_per_min: rates.observed_per_min,
        },
    };
    render_json(StatusCode::OK, &stats)
}

// XML 视图：元数据以 entry 列表表示，避免非法元素名
#[derive(Debug, Serialize)]
struct XmlEntry {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct XmlInstance {
    instance_id: String,
    app: String,
    host: String,
    port: u16,
    status: String,
    lease_duration_seconds: u64,
    eviction_timeout_seconds: u64,
    registered_at: u64,
    last_renewed_at: u64,
    #[serde(rename = "entry")]
    metadata: Vec<XmlEntry>,
}

impl From<&InstanceView> for XmlInstance {
    fn from(view: &InstanceView) -> Self {
        let metadata: BTreeMap<&String, &String> = view.metadata.iter().collect();
        Self {
            instance_id: view.instance_id.clone(),
            app: view.service_name.clone(),
            host: view.host.clone(),
            port: view.port,
            status: view.status.as_str().to_string(),
            lease_duration_seconds: view.lease_duration_seconds,
            eviction_timeout_seconds: view.eviction_timeout_seconds,
            registered_at: view.registered_at,
            last_renewed_at: view.last_renewed_at,
            metadata: metadata
                .into_iter()
                .map(|(key, value)| XmlEntry {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct XmlApplication {
    name: String,
    #[serde(rename = "instance")]
    instances: Vec<XmlInstance>,
}

impl From<&Application> for XmlApplication {
    fn from(app: &Application) -> Self {
        Self {
            name: app.service_name.clone(),
            instances: app.instances.iter().map(XmlInstance::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct XmlApplications {
    version: u64,
    #[serde(rename = "application")]
    applications: Vec<XmlApplication>,
}

impl From<&RegistrySnapshot> for XmlApplications {
    fn from(snapshot: &RegistrySnapshot) -> Self {
        Self {
            version: snapshot.version,
            applications: snapshot.applications.values().map(XmlApplication::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_header_picks_first_known_type() {
        let header = |v: &'static str| HeaderValue::from_static(v);

        assert_eq!(Format::from_header(None), Format::Json);
        assert_eq!(Format::from_header(Some(&header("application/xml"))), Format::Xml);
        assert_eq!(
            Format::from_header(Some(&header("text/html, text/xml;q=0.9, */*;q=0.8"))),
            Format::Xml
        );
        assert_eq!(
            Format::from_header(Some(&header("application/json, application/xml"))),
            Format::Json
        );
    }

    #[test]
    fn error_maps_to_status_code() {
        let response = RegistryError::NotFound("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = RegistryError::Conflict("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = RegistryError::InvalidRequest("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn xml_application_uses_name_element() {
        let app = Application {
            service_name: "CLOUD-CONFIG".into(),
            instances: Vec::new(),
        };
        let xml = quick_xml::se::to_string_with_root("application", &XmlApplication::from(&app)).unwrap();
        assert!(xml.contains("<name>CLOUD-CONFIG</name>"), "{xml}");
    }
}
