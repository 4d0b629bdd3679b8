//! 基于标准输入输出的 MCP 服务：每行一个 JSON-RPC 2.0 消息

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::error::ToolError;
use crate::handler::HandlerChain;

pub const SERVER_NAME: &str = "semantic-video-analysis";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn success(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn failure(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message.into()}})
}

fn tool_error_code(error: &ToolError) -> i64 {
    match error {
        ToolError::InvalidArguments(_) => INVALID_PARAMS,
        ToolError::UnknownTool(_) => METHOD_NOT_FOUND,
        ToolError::NoHandlers => INTERNAL_ERROR,
    }
}

async fn call_tool(chain: &HandlerChain, id: Value, params: Value) -> Value {
    let params: CallParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => return failure(id, INVALID_PARAMS, format!("Invalid params: {}", e)),
    };

    info!("🛠️ [MCP] 调用工具: {}", params.name);
    let chain = chain.clone();
    let name = params.name;
    let arguments = params.arguments;
    let outcome = tokio::task::spawn_blocking(move || chain.dispatch(&name, &arguments)).await;

    match outcome {
        Ok(Ok(content)) => success(id, json!({"content": content, "isError": false})),
        Ok(Err(e)) => {
            warn!("⚠️  [MCP] 工具调用被拒绝: {}", e);
            failure(id, tool_error_code(&e), e.to_string())
        }
        Err(e) => {
            error!("❌ [MCP] 工具执行异常: {}", e);
            failure(id, INTERNAL_ERROR, format!("Tool execution failed: {}", e))
        }
    }
}

/// 处理一行输入，通知类消息返回 None
pub async fn handle_message(chain: &HandlerChain, line: &str) -> Option<Value> {
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return Some(failure(Value::Null, PARSE_ERROR, format!("Parse error: {}", e))),
    };

    let Some(id) = request.id else {
        debug!("收到通知: {}", request.method);
        return None;
    };

    let response = match request.method.as_str() {
        "initialize" => success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": false}},
                "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")}
            }),
        ),
        "ping" => success(id, json!({})),
        "tools/list" => success(id, json!({"tools": chain.tools()})),
        "tools/call" => call_tool(chain, id, request.params).await,
        other => failure(id, METHOD_NOT_FOUND, format!("Method not found: {}", other)),
    };
    Some(response)
}

/// 在任意读写流上运行服务循环，读到 EOF 时返回
pub async fn serve<R, W>(chain: HandlerChain, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("读取标准输入失败")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(response) = handle_message(&chain, line).await {
            let mut payload = serde_json::to_string(&response).context("序列化响应失败")?;
            payload.push('\n');
            writer
                .write_all(payload.as_bytes())
                .await
                .context("写入标准输出失败")?;
            writer.flush().await.context("写入标准输出失败")?;
        }
    }
    Ok(())
}

pub async fn run_stdio(chain: HandlerChain) -> Result<()> {
    info!("🚀 [MCP] {} 已启动，工具数: {}", SERVER_NAME, chain.len());
    serve(chain, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;
    info!("👋 [MCP] 标准输入已关闭，服务退出");
    Ok(())
}
