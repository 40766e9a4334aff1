//! HTTP front end for the cluster metadata server
//!
//! Every application-level outcome is reported as a `{code, message}` JSON
//! body with HTTP 200; only transport failures produce other statuses.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Method, Request},
    response::Json,
    routing::{any, get},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use prost::Message;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::error::{ErrorCode, MetaError, Result};
use crate::model::{RawAddress, RawInstance};
use crate::worker::ClusterMetaWorker;

pub const INSTANCE_NAME_HEADER: &str = "Instance-Name";

/// Body of every `/cluster/*` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub code: u32,
    pub message: String,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self::new(ErrorCode::Ok, ErrorCode::Ok.description())
    }

    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_u32(),
            message: message.into(),
        }
    }

    fn from_error(err: &MetaError) -> Self {
        Self::new(err.error_code(), err.to_string())
    }
}

/// Protobuf form of an add-instance request.
#[derive(Clone, PartialEq, Message)]
pub struct RawInstanceMessage {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub addr: Option<AddressMessage>,
    #[prost(uint64, tag = "3")]
    pub epoch: u64,
    #[prost(uint64, tag = "4")]
    pub sdowntime: u64,
    #[prost(uint64, tag = "5")]
    pub failover_timeout: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct AddressMessage {
    #[prost(string, tag = "1")]
    pub ip: String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
}

impl From<RawInstanceMessage> for RawInstance {
    fn from(msg: RawInstanceMessage) -> Self {
        let addr = msg.addr.unwrap_or_default();
        RawInstance {
            name: msg.name,
            addr: RawAddress {
                ip: addr.ip,
                port: addr.port,
            },
            epoch: msg.epoch,
            subjective_down_timeout_ms: msg.sdowntime,
            failover_timeout_ms: msg.failover_timeout,
        }
    }
}

impl From<&RawInstance> for RawInstanceMessage {
    fn from(raw: &RawInstance) -> Self {
        RawInstanceMessage {
            name: raw.name.clone(),
            addr: Some(AddressMessage {
                ip: raw.addr.ip.clone(),
                port: raw.addr.port,
            }),
            epoch: raw.epoch,
            sdowntime: raw.subjective_down_timeout_ms,
            failover_timeout: raw.failover_timeout_ms,
        }
    }
}

/// Decode an add-instance body. JSON when the content type says so,
/// protobuf otherwise.
pub fn decode_raw_instance(headers: &HeaderMap, body: &[u8]) -> Result<RawInstance> {
    if body.is_empty() {
        return Err(MetaError::Validation("request body is empty".to_string()));
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.contains("json") {
        serde_json::from_slice(body).map_err(|e| MetaError::Validation(format!("invalid JSON instance: {}", e)))
    } else {
        RawInstanceMessage::decode(body)
            .map(RawInstance::from)
            .map_err(|e| MetaError::Validation(format!("invalid protobuf instance: {}", e)))
    }
}

/// HTTP server for the cluster metadata worker
pub struct HttpServer {
    config: ServerConfig,
    worker: Arc<ClusterMetaWorker>,
    metrics: Option<PrometheusHandle>,
}

#[derive(Clone)]
struct ServerState {
    worker: Arc<ClusterMetaWorker>,
    metrics: Option<PrometheusHandle>,
}

impl HttpServer {
    pub fn new(config: ServerConfig, worker: Arc<ClusterMetaWorker>, metrics: Option<PrometheusHandle>) -> Self {
        Self { config, worker, metrics }
    }

    /// Serve until `shutdown` is cancelled, then stop accepting and let
    /// in-flight requests finish.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| MetaError::Config(format!("invalid HTTP bind address: {}", e)))?;
        let server = axum::Server::try_bind(&addr).map_err(|e| MetaError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

        info!("HTTP server listening on {}", addr);
        server
            .serve(self.create_router().into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| MetaError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        info!("HTTP server stopped");
        Ok(())
    }

    pub fn create_router(&self) -> Router {
        let state = Arc::new(ServerState {
            worker: self.worker.clone(),
            metrics: self.metrics.clone(),
        });

        Router::new()
            .route("/cluster/meta", any(get_meta_handler))
            .route("/cluster/addInstance", any(add_instance_handler))
            .route("/cluster/removeInstance", any(remove_instance_handler))
            .route("/stack", get(stack_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let remote = request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.to_string())
                    .unwrap_or_else(|| "-".to_string());
                tracing::info_span!("http", method = %request.method(), uri = %request.uri(), remote = %remote)
            }))
            .with_state(state)
    }
}

async fn get_meta_handler(State(state): State<Arc<ServerState>>, method: Method) -> Json<ApiResponse> {
    if method != Method::GET {
        error!("illegal get meta request method {}", method);
        return Json(ApiResponse::new(ErrorCode::IllegalHttpMethod, method.as_str()));
    }
    match state.worker.snapshot_json().await {
        Ok(meta) => Json(ApiResponse::new(ErrorCode::Ok, meta)),
        Err(e) => Json(ApiResponse::new(ErrorCode::SysError, e.to_string())),
    }
}

async fn add_instance_handler(
    State(state): State<Arc<ServerState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Json<ApiResponse> {
    if method != Method::POST {
        error!("illegal add instance request method {}", method);
        return Json(ApiResponse::new(ErrorCode::IllegalHttpMethod, method.as_str()));
    }

    let raw = match decode_raw_instance(&headers, &body) {
        Ok(raw) => raw,
        Err(e) => return Json(ApiResponse::from_error(&e)),
    };
    debug!("add instance request {:?}", raw);

    match state.worker.add_instance(&raw).await {
        Ok(()) => Json(ApiResponse::ok()),
        Err(e) => {
            error!("add instance {} failed: {}", raw.name, e);
            Json(ApiResponse::from_error(&e))
        }
    }
}

async fn remove_instance_handler(
    State(state): State<Arc<ServerState>>,
    method: Method,
    headers: HeaderMap,
) -> Json<ApiResponse> {
    if method != Method::POST {
        error!("illegal remove instance request method {}", method);
        return Json(ApiResponse::new(ErrorCode::IllegalHttpMethod, method.as_str()));
    }

    let name = headers
        .get(INSTANCE_NAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_string();

    match state.worker.remove_instance(&name).await {
        Ok(()) => Json(ApiResponse::ok()),
        Err(e) => {
            error!("remove instance {:?} failed: {}", name, e);
            Json(ApiResponse::from_error(&e))
        }
    }
}

async fn stack_handler(State(state): State<Arc<ServerState>>) -> String {
    let backtrace = std::backtrace::Backtrace::force_capture();
    let meta = state.worker.snapshot().await;
    let mut dump = format!("version: {}\ninstances: {}\n", meta.version, meta.instances.len());
    for watcher in state.worker.watcher_status().await {
        dump.push_str(&format!(
            "watcher {}: {}\n",
            watcher.name,
            if watcher.running { "running" } else { "stopped" }
        ));
    }
    dump.push_str(&format!("\n{}", backtrace));
    dump
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    let meta = state.worker.snapshot().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": meta.version,
        "instances": meta.instances.len(),
        "watchers": state.worker.watcher_status().await,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> String {
    state.metrics.as_ref().map(PrometheusHandle::render).unwrap_or_default()
}
