//! HTTP+JSON server for the network-driver RPC, served over a Unix
//! domain socket. Uses the same low-level `hyper` + `hyper-util` serving
//! idiom the core library's HTTP client code mirrors for its TCP peers,
//! adapted to a `UnixListener` instead of a `TcpListener`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use hyper_util::rt::TokioIo;
use ovn_net_core::driver::{
    CreateEndpointRequest, CreateNetworkRequest, DeleteEndpointRequest, DeleteNetworkRequest,
    EndpointInfoRequest, JoinRequest, LeaveRequest,
};
use ovn_net_core::{Driver, Error};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    driver: Arc<Driver>,
    version: &'static str,
}

pub async fn serve(driver: Arc<Driver>, sock_path: &Path) -> anyhow::Result<()> {
    if sock_path.exists() {
        std::fs::remove_file(sock_path)?;
    }
    if let Some(parent) = sock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let state = AppState { driver, version: env!("CARGO_PKG_VERSION") };
    let app = router(state);

    let listener = UnixListener::bind(sock_path)?;
    info!("listening on unix socket {}", sock_path.display());

    loop {
        let (stream, _addr) = listener.accept().await?;
        let app = app.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = hyper::service::service_fn(move |req| {
                tower::Service::call(&mut app.clone(), req)
            });
            if let Err(e) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                error!("connection error: {}", e);
            }
        });
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/NetworkDriver.GetCapabilities", post(get_capabilities))
        .route("/NetworkDriver.CreateNetwork", post(create_network))
        .route("/NetworkDriver.DeleteNetwork", post(delete_network))
        .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
        .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
        .route("/NetworkDriver.Join", post(join))
        .route("/NetworkDriver.Leave", post(leave))
        .route("/NetworkDriver.EndpointOperInfo", post(endpoint_oper_info))
        .route("/status", axum::routing::get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn activate() -> Json<Value> {
    Json(json!({ "Implements": ["NetworkDriver"] }))
}

async fn get_capabilities(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.driver.capabilities()).unwrap_or_default())
}

async fn create_network(State(state): State<AppState>, Json(req): Json<CreateNetworkRequest>) -> Response {
    into_response(state.driver.create_network(req).await.map(|_| json!({})))
}

async fn delete_network(State(state): State<AppState>, Json(req): Json<DeleteNetworkRequest>) -> Response {
    into_response(state.driver.delete_network(req).await.map(|_| json!({})))
}

async fn create_endpoint(State(state): State<AppState>, Json(req): Json<CreateEndpointRequest>) -> Response {
    into_response(
        state
            .driver
            .create_endpoint(req)
            .await
            .and_then(|r| serde_json::to_value(r).map_err(Into::into)),
    )
}

async fn delete_endpoint(State(state): State<AppState>, Json(req): Json<DeleteEndpointRequest>) -> Response {
    into_response(state.driver.delete_endpoint(req).await.map(|_| json!({})))
}

async fn join(State(state): State<AppState>, Json(req): Json<JoinRequest>) -> Response {
    into_response(
        state
            .driver
            .join(req)
            .await
            .and_then(|r| serde_json::to_value(r).map_err(Into::into)),
    )
}

async fn leave(State(state): State<AppState>, Json(req): Json<LeaveRequest>) -> Response {
    into_response(state.driver.leave(req).await.map(|_| json!({})))
}

async fn endpoint_oper_info(State(state): State<AppState>, Json(req): Json<EndpointInfoRequest>) -> Response {
    into_response(
        state
            .driver
            .endpoint_info(req)
            .await
            .and_then(|r| serde_json::to_value(r).map_err(Into::into)),
    )
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "version": state.version, "alive": true }))
}

/// The network-driver protocol reports failures as HTTP 200 with an
/// `Err` field, not as HTTP error codes (spec §7) — the container engine
/// never inspects the status line.
fn into_response(result: ovn_net_core::Result<Value>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => (StatusCode::OK, Json(json!({ "Err": rpc_message(&e) }))).into_response(),
    }
}

fn rpc_message(e: &Error) -> String {
    e.to_rpc_message()
}
