use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::error::ToolError;
use crate::handler::{HandlerChain, ToolContent, ToolDefinition};

/// `POST /tools/call` 请求体
#[derive(Debug, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Serialize)]
pub struct ToolCallResponse {
    pub content: Vec<ToolContent>,
}

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn list_tools(State(chain): State<HandlerChain>) -> ResponseJson<Vec<ToolDefinition>> {
    ResponseJson(chain.tools())
}

pub async fn call_tool(
    State(chain): State<HandlerChain>,
    Json(request): Json<ToolCallRequest>,
) -> Result<ResponseJson<ToolCallResponse>, (StatusCode, String)> {
    info!("🛠️ [HTTP] 调用工具: {}", request.name);

    let outcome =
        tokio::task::spawn_blocking(move || chain.dispatch(&request.name, &request.arguments))
            .await
            .map_err(|e| {
                error!("❌ [HTTP] 工具执行异常: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Tool execution failed: {}", e))
            })?;

    match outcome {
        Ok(content) => Ok(ResponseJson(ToolCallResponse { content })),
        Err(e) => {
            let status = match &e {
                ToolError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
                ToolError::UnknownTool(_) => StatusCode::NOT_FOUND,
                ToolError::NoHandlers => StatusCode::SERVICE_UNAVAILABLE,
            };
            Err((status, e.to_string()))
        }
    }
}

pub fn router(chain: HandlerChain) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/tools", get(list_tools))
        .route("/tools/call", post(call_tool))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(chain)
}

pub async fn start_web_server(chain: HandlerChain, bind: &str) -> Result<()> {
    let app = router(chain);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    info!("Web 服务器启动在: http://{}", bind);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("可用端点:");
    info!("  • 健康检查: GET  http://{}/health", bind);
    info!("  • 工具列表: GET  http://{}/tools", bind);
    info!("  • 工具调用: POST http://{}/tools/call", bind);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app)
        .await
        .context("启动服务器失败")?;

    Ok(())
}
