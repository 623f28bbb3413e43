//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了分发器之上的 HTTP/JSON 传输层。
//!
//! 键和值是任意字节串，在 JSON 中以字节数组传输，例如 `"key": [107, 49]`。

use super::dispatcher::{Request, RequestDispatcher, Response};
use crate::error::Result;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// 处理函数共享的状态
#[derive(Clone, Debug)]
pub struct AppState {
    pub dispatcher: RequestDispatcher,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PutBody {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub ew: f64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct KeyBody {
    pub key: Vec<u8>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StartRecordBody {
    pub target: String,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SuccessReply {
    pub success: bool,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct GetReply {
    pub value: Vec<u8>,
    pub found: bool,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoadReply {
    pub load: u64,
    pub success: bool,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReadCountReply {
    pub read_count: u64,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct WriteCountReply {
    pub write_count: u64,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HealthReply {
    pub status: String,
    pub version: String,
}

type Reply<T> = std::result::Result<Json<T>, StatusCode>;

fn unexpected(kind: &str, response: Response) -> StatusCode {
    match response {
        Response::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        other => {
            error!("unexpected response to {}: {:?}", kind, other);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub async fn put(State(state): State<AppState>, Json(body): Json<PutBody>) -> Reply<SuccessReply> {
    let request = Request::Put {
        key: body.key,
        value: body.value,
        ew: body.ew,
    };
    match state.dispatcher.call(request).await {
        Response::Put { success } => Ok(Json(SuccessReply { success })),
        other => Err(unexpected("put", other)),
    }
}

pub async fn get_value(State(state): State<AppState>, Json(body): Json<KeyBody>) -> Reply<GetReply> {
    let request = Request::Get {
        key: body.key,
    };
    match state.dispatcher.call(request).await {
        Response::Get { value, found } => Ok(Json(GetReply { value, found })),
        other => Err(unexpected("get", other)),
    }
}

pub async fn delete(State(state): State<AppState>, Json(body): Json<KeyBody>) -> Reply<SuccessReply> {
    let request = Request::Delete {
        key: body.key,
    };
    match state.dispatcher.call(request).await {
        Response::Delete { success } => Ok(Json(SuccessReply { success })),
        other => Err(unexpected("delete", other)),
    }
}

pub async fn load(State(state): State<AppState>) -> Reply<LoadReply> {
    match state.dispatcher.call(Request::GetLoad).await {
        Response::GetLoad { load, success } => Ok(Json(LoadReply { load, success })),
        other => Err(unexpected("get_load", other)),
    }
}

pub async fn read_count(State(state): State<AppState>) -> Reply<ReadCountReply> {
    match state.dispatcher.call(Request::GetReadCount).await {
        Response::ReadCount { read_count } => Ok(Json(ReadCountReply { read_count })),
        other => Err(unexpected("get_read_count", other)),
    }
}

pub async fn write_count(State(state): State<AppState>) -> Reply<WriteCountReply> {
    match state.dispatcher.call(Request::GetWriteCount).await {
        Response::WriteCount { write_count } => Ok(Json(WriteCountReply { write_count })),
        other => Err(unexpected("get_write_count", other)),
    }
}

pub async fn start_record(
    State(state): State<AppState>,
    Json(body): Json<StartRecordBody>,
) -> Reply<SuccessReply> {
    let request = Request::StartRecord {
        target: PathBuf::from(body.target),
    };
    match state.dispatcher.call(request).await {
        Response::StartRecord { success } => Ok(Json(SuccessReply { success })),
        other => Err(unexpected("start_record", other)),
    }
}

/// 文本格式的计量
pub async fn metrics(State(state): State<AppState>) -> String {
    let dispatcher = &state.dispatcher;
    let client = dispatcher.pipeline().client().stats();
    let mut output = dispatcher.accounting().render();
    output.push_str(&format!(
        "freshcache_requests_accepted {}\nfreshcache_requests_executing {}\nfreshcache_cache_calls_in_flight {}\nfreshcache_cache_calls_total {}\nfreshcache_cache_calls_failed_total {}\n",
        dispatcher.accepted(),
        dispatcher.executing(),
        client.in_flight,
        client.issued,
        client.failed,
    ));
    output
}

pub async fn health() -> Json<HealthReply> {
    Json(HealthReply {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
    })
}

/// 创建路由
pub fn create_router(dispatcher: RequestDispatcher) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/put", post(put))
        .route("/get", post(get_value))
        .route("/delete", post(delete))
        .route("/load", get(load))
        .route("/read_count", get(read_count))
        .route("/write_count", get(write_count))
        .route("/start_record", post(start_record))
        .route("/metrics", get(metrics))
        .with_state(AppState { dispatcher })
        .layer(TraceLayer::new_for_http())
}

/// 在已绑定的监听器上提供服务，直到 `shutdown` 完成
pub async fn serve<F>(listener: TcpListener, dispatcher: RequestDispatcher, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("listening on http://{}", addr);
    axum::serve(listener, create_router(dispatcher))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
