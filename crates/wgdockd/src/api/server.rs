//! libnetwork remote-driver endpoints.
//!
//! Thin JSON-over-HTTP adapter: each handler decodes the request record,
//! dispatches to the core driver under its lock, and wraps the outcome in
//! libnetwork's response envelope (`{"Err": ...}` on failure).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use wgdock_common::{WgdockError, WgdockResult};
use wgdock_net::driver::{
    not_supported, CreateEndpointRequest, CreateNetworkRequest, DeleteEndpointRequest,
    DeleteNetworkRequest, InfoRequest, JoinRequest, LeaveRequest,
};
use wgdock_net::Driver;

/// Content type libnetwork expects on plugin responses.
const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.2+json";

/// The driver, shared across requests and locked for every call.
pub type SharedDriver = Arc<Mutex<Driver>>;

/// Build the plugin router.
pub fn app(driver: SharedDriver) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/NetworkDriver.GetCapabilities", post(get_capabilities))
        .route("/NetworkDriver.CreateNetwork", post(create_network))
        .route("/NetworkDriver.DeleteNetwork", post(delete_network))
        .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
        .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
        .route("/NetworkDriver.EndpointOperInfo", post(endpoint_info))
        .route("/NetworkDriver.Join", post(join))
        .route("/NetworkDriver.Leave", post(leave))
        .route("/NetworkDriver.AllocateNetwork", post(allocate_network))
        .route("/NetworkDriver.FreeNetwork", post(free_network))
        .route("/NetworkDriver.DiscoverNew", post(discover_new))
        .route("/NetworkDriver.DiscoverDelete", post(discover_delete))
        .route(
            "/NetworkDriver.ProgramExternalConnectivity",
            post(program_external_connectivity),
        )
        .route(
            "/NetworkDriver.RevokeExternalConnectivity",
            post(revoke_external_connectivity),
        )
        .with_state(driver)
}

async fn activate() -> Response {
    tracing::debug!("[Plugin.Activate] request");
    respond(Ok(json!({ "Implements": ["NetworkDriver"] })))
}

async fn get_capabilities(State(driver): State<SharedDriver>) -> Response {
    let driver = driver.lock().await;
    respond(Ok(driver.capabilities()))
}

async fn create_network(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    match decode::<CreateNetworkRequest>(&body) {
        Ok(req) => {
            let mut driver = driver.lock().await;
            respond(driver.create_network(req).await.map(|()| json!({})))
        }
        Err(e) => respond::<serde_json::Value>(Err(e)),
    }
}

async fn delete_network(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    match decode::<DeleteNetworkRequest>(&body) {
        Ok(req) => {
            let mut driver = driver.lock().await;
            respond(driver.delete_network(req).await.map(|()| json!({})))
        }
        Err(e) => respond::<serde_json::Value>(Err(e)),
    }
}

async fn create_endpoint(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    match decode::<CreateEndpointRequest>(&body) {
        Ok(req) => {
            let mut driver = driver.lock().await;
            respond(driver.create_endpoint(req).await)
        }
        Err(e) => respond::<serde_json::Value>(Err(e)),
    }
}

async fn delete_endpoint(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    match decode::<DeleteEndpointRequest>(&body) {
        Ok(req) => {
            let mut driver = driver.lock().await;
            respond(driver.delete_endpoint(req).await.map(|()| json!({})))
        }
        Err(e) => respond::<serde_json::Value>(Err(e)),
    }
}

async fn endpoint_info(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    match decode::<InfoRequest>(&body) {
        Ok(req) => {
            let driver = driver.lock().await;
            respond(Ok(driver.endpoint_info(req)))
        }
        Err(e) => respond::<serde_json::Value>(Err(e)),
    }
}

async fn join(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    match decode::<JoinRequest>(&body) {
        Ok(req) => {
            let mut driver = driver.lock().await;
            respond(driver.join(req).await)
        }
        Err(e) => respond::<serde_json::Value>(Err(e)),
    }
}

async fn leave(State(driver): State<SharedDriver>, body: Bytes) -> Response {
    match decode::<LeaveRequest>(&body) {
        Ok(req) => {
            let mut driver = driver.lock().await;
            respond(driver.leave(req).await.map(|()| json!({})))
        }
        Err(e) => respond::<serde_json::Value>(Err(e)),
    }
}

async fn allocate_network() -> Response {
    unsupported("AllocateNetwork")
}

async fn free_network() -> Response {
    unsupported("FreeNetwork")
}

async fn discover_new() -> Response {
    unsupported("DiscoverNew")
}

async fn discover_delete() -> Response {
    unsupported("DiscoverDelete")
}

async fn program_external_connectivity() -> Response {
    unsupported("ProgramExternalConnectivity")
}

async fn revoke_external_connectivity() -> Response {
    unsupported("RevokeExternalConnectivity")
}

fn unsupported(method: &str) -> Response {
    tracing::debug!(method, "Unsupported operation called");
    respond::<serde_json::Value>(Err(not_supported(method)))
}

/// Decode a request body; an empty body decodes to the default record.
///
/// The content type is deliberately not checked: the daemon sends the
/// plugin mimetype, not `application/json`.
fn decode<T: DeserializeOwned + Default>(body: &Bytes) -> WgdockResult<T> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| WgdockError::Internal {
        message: format!("invalid request body: {e}"),
    })
}

fn respond<T: Serialize>(result: WgdockResult<T>) -> Response {
    let (status, body) = match result {
        Ok(value) => (
            StatusCode::OK,
            serde_json::to_value(value).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "Err": e.to_string() }),
            )
        }
    };
    (
        status,
        [(header::CONTENT_TYPE, PLUGIN_CONTENT_TYPE)],
        body.to_string(),
    )
        .into_response()
}
