use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, ConnectInfo, Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use coordinator::{ClusterManager, FileInfo, StatusReport, UploadReceipt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::{ApiError, ApiResult, DeleteResponse, QuotaResponse, RegisterNodeRequest, RegisterNodeResponse};

pub struct AppState {
    pub manager: Arc<ClusterManager>,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    owner: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    filename: String,
    owner: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    filename: String,
    index: u32,
    owner: Option<String>,
}

/// An empty owner parameter means the shared scope.
fn owner_scope(owner: &Option<String>) -> Option<&str> {
    owner.as_deref().filter(|owner| !owner.is_empty())
}

fn query<T>(query: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    query
        .map(|Query(inner)| inner)
        .map_err(|e| ApiError::InvalidRequest(e.body_text()))
}

pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    params: Result<Query<OwnerQuery>, QueryRejection>,
) -> ApiResult<Json<StatusReport>> {
    let params = query(params)?;
    let report = state.manager.status(owner_scope(&params.owner)).await?;
    Ok(Json(report))
}

struct ChunkUpload {
    filename: Option<String>,
    owner: Option<String>,
    index: Option<u32>,
    total_chunks: Option<u32>,
    total_size: Option<u64>,
    chunk: Option<Bytes>,
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> ApiResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::InvalidRequest(format!("field {} is not a valid number: {:?}", name, value)))
}

fn required<T>(name: &str, value: Option<T>) -> ApiResult<T> {
    value.ok_or_else(|| ApiError::InvalidRequest(format!("missing field {}", name)))
}

pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadReceipt>> {
    let mut upload = ChunkUpload {
        filename: None,
        owner: None,
        index: None,
        total_chunks: None,
        total_size: None,
        chunk: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "chunk" {
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
            upload.chunk = Some(data);
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
        match name.as_str() {
            "filename" => upload.filename = Some(value),
            "owner" => upload.owner = Some(value),
            "index" => upload.index = Some(parse_field(&name, &value)?),
            "total_chunks" => upload.total_chunks = Some(parse_field(&name, &value)?),
            "total_size" => upload.total_size = Some(parse_field(&name, &value)?),
            other => tracing::debug!("Ignoring unknown upload field {:?}", other),
        }
    }

    let filename = required("filename", upload.filename)?;
    let index = required("index", upload.index)?;
    let total_chunks = required("total_chunks", upload.total_chunks)?;
    let total_size = required("total_size", upload.total_size)?;
    let chunk = required("chunk", upload.chunk)?;

    let receipt = state
        .manager
        .upload(owner_scope(&upload.owner), &filename, index, total_chunks, total_size, chunk)
        .await?;
    Ok(Json(receipt))
}

pub async fn download_chunk(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ChunkQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let params = query(params)?;
    let data = state
        .manager
        .download(owner_scope(&params.owner), &params.filename, params.index)
        .await?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    params: Result<Query<FileQuery>, QueryRejection>,
) -> ApiResult<Json<DeleteResponse>> {
    let params = query(params)?;
    state
        .manager
        .delete(owner_scope(&params.owner), &params.filename)
        .await?;

    Ok(Json(DeleteResponse {
        filename: params.filename,
        deleted: true,
    }))
}

pub async fn file_info(
    State(state): State<Arc<AppState>>,
    params: Result<Query<FileQuery>, QueryRejection>,
) -> ApiResult<Json<FileInfo>> {
    let params = query(params)?;
    let info = state
        .manager
        .file_info(owner_scope(&params.owner), &params.filename)
        .await?;
    Ok(Json(info))
}

pub async fn add_space(
    State(state): State<Arc<AppState>>,
    params: Result<Query<OwnerQuery>, QueryRejection>,
) -> ApiResult<Json<QuotaResponse>> {
    let params = query(params)?;
    let owner = owner_scope(&params.owner);
    let quota = state.manager.add_space(owner).await?;

    Ok(Json(QuotaResponse {
        owner: owner.map(str::to_string),
        quota,
    }))
}

/// Dials a node that is listening for the coordinator and runs the usual
/// handshake on the new connection.
pub async fn register_node(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    request: Result<Json<RegisterNodeRequest>, JsonRejection>,
) -> ApiResult<Json<RegisterNodeResponse>> {
    let Json(request) = request.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;

    let host = match (request.host, peer) {
        (Some(host), _) if !host.is_empty() => host,
        (_, Some(ConnectInfo(peer))) => peer.ip().to_string(),
        _ => return Err(ApiError::InvalidRequest("host is required".to_string())),
    };
    let address = format!("{}:{}", host, request.port);

    let connect_timeout = Duration::from_millis(state.manager.config().handshake_timeout_ms);
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(coordinator::ClusterError::Unavailable(format!("cannot reach node at {}: {}", address, e)).into())
        }
        Err(_) => {
            return Err(coordinator::ClusterError::Unavailable(format!("timed out connecting to {}", address)).into())
        }
    };

    tracing::info!("Dialed node at {}", address);
    let node_id = state.manager.admit(stream, &address).await?;

    Ok(Json(RegisterNodeResponse {
        node_id: node_id.to_string(),
        address,
    }))
}
