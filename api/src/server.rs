use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use coordinator::{ClusterError, ClusterManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::{self, AppState};
use crate::{ApiError, ApiResult};

pub struct Server {
    config: crate::Config,
    app_state: Arc<AppState>,
}

impl Server {
    pub fn new(config: crate::Config, manager: Arc<ClusterManager>) -> Self {
        Self {
            config,
            app_state: Arc::new(AppState { manager }),
        }
    }

    pub async fn start(&self) -> ApiResult<()> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ApiError::InternalError(format!("Failed to bind to {}: {}", addr, e)))?;

        self.serve(listener).await
    }

    /// Serves on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> ApiResult<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| ApiError::InternalError(e.to_string()))?;
        tracing::info!("Starting API server on {}", addr);

        let app = self.create_router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(|e| ApiError::InternalError(format!("Server error: {}", e)))?;

        Ok(())
    }

    pub fn create_router(&self) -> Router {
        Router::new()
            .route("/status", get(handlers::status))
            .route("/upload_chunk", post(handlers::upload_chunk))
            .route("/download_chunk", get(handlers::download_chunk))
            .route("/delete_file", delete(handlers::delete_file))
            .route("/file_info", get(handlers::file_info))
            .route("/add_space", post(handlers::add_space))
            .route("/register_node", post(handlers::register_node))
            .route("/health", get(handlers::health_check))
            .fallback(not_found)
            .layer(DefaultBodyLimit::max(self.config.max_upload_bytes))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(self.app_state.clone())
    }
}

async fn not_found() -> ApiResult<()> {
    Err(ClusterError::NotFound("no such endpoint".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use coordinator::Config as ClusterConfig;
    use network::{Command, NodeLink};
    use tempfile::TempDir;
    use tokio::io::{duplex, BufReader};
    use tower::ServiceExt;

    async fn test_server(dir: &TempDir) -> Server {
        let config = ClusterConfig {
            snapshot_path: dir.path().join("system_data.json"),
            ..ClusterConfig::default()
        };
        let manager = ClusterManager::new(config).await.unwrap();
        Server::new(crate::Config::default(), Arc::new(manager))
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn multipart_upload(boundary: &str, fields: &[(&str, &str)]) -> Body {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            if *name == "chunk" {
                body.extend_from_slice(
                    b"Content-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n\
                      Content-Type: application/octet-stream\r\n\r\n",
                );
            } else {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                );
            }
            body.extend_from_slice(value.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        Body::from(body)
    }

    #[tokio::test]
    async fn test_status_of_empty_cluster() {
        let dir = TempDir::new().unwrap();
        let app = test_server(&dir).await.create_router();

        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["nodes_online"], 0);
        assert_eq!(body["used"], 0);
        assert_eq!(body["files"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_missing_file_is_json_404() {
        let dir = TempDir::new().unwrap();
        let app = test_server(&dir).await.create_router();

        let response = app
            .oneshot(
                Request::get("/download_chunk?filename=nope&index=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "not_found");
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let dir = TempDir::new().unwrap();
        let app = test_server(&dir).await.create_router();

        let response = app
            .oneshot(Request::get("/no_such_thing").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "not_found");
    }

    #[tokio::test]
    async fn test_bad_query_is_400() {
        let dir = TempDir::new().unwrap();
        let app = test_server(&dir).await.create_router();

        let response = app
            .oneshot(
                Request::get("/download_chunk?filename=a&index=minus-one")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_upload_without_nodes_is_503() {
        let dir = TempDir::new().unwrap();
        let app = test_server(&dir).await.create_router();
        let boundary = "chunkboundary";
        let body = multipart_upload(
            boundary,
            &[
                ("filename", "report.pdf"),
                ("index", "0"),
                ("total_chunks", "1"),
                ("total_size", "5"),
                ("chunk", "hello"),
            ],
        );

        let response = app
            .oneshot(
                Request::post("/upload_chunk")
                    .header("content-type", format!("multipart/form-data; boundary={}", boundary))
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["error"], "unavailable");
    }

    #[tokio::test]
    async fn test_upload_reaches_node_and_reports_receipt() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir).await;
        let manager = server.app_state.manager.clone();

        let (coordinator_side, node_side) = duplex(64 * 1024);
        let link = NodeLink::spawn("n1", BufReader::new(coordinator_side), &network::Config::default());
        manager
            .register_node(coordinator::NodeId::new("n1"), "n1:6000".to_string(), 1 << 20, link)
            .await;

        let fake_node = tokio::spawn(async move {
            let mut node = BufReader::new(node_side);
            let command: Command = network::protocol::read_message(&mut node).await.unwrap();
            let size = match command {
                Command::Store { size, .. } => size,
                other => panic!("expected store, got {:?}", other),
            };
            network::protocol::read_body(&mut node, size).await.unwrap()
        });

        let boundary = "chunkboundary";
        let body = multipart_upload(
            boundary,
            &[
                ("filename", "notes.txt"),
                ("owner", "alice"),
                ("index", "0"),
                ("total_chunks", "1"),
                ("total_size", "5"),
                ("chunk", "hello"),
            ],
        );
        let response = server
            .create_router()
            .oneshot(
                Request::post("/upload_chunk")
                    .header("content-type", format!("multipart/form-data; boundary={}", boundary))
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let receipt = json_body(response).await;
        assert_eq!(receipt["replicas_written"], 1);
        assert_eq!(receipt["nodes"], serde_json::json!(["n1"]));
        assert_eq!(fake_node.await.unwrap().as_ref(), b"hello");

        let info = manager.file_info(Some("alice"), "notes.txt").await.unwrap();
        assert_eq!(info.size, 5);
    }

    #[tokio::test]
    async fn test_add_space_raises_quota() {
        let dir = TempDir::new().unwrap();
        let app = test_server(&dir).await.create_router();

        let response = app
            .oneshot(Request::post("/add_space?owner=bob").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["owner"], "bob");
        assert_eq!(body["quota"], 10u64 * 1024 * 1024 * 1024);
    }
}
