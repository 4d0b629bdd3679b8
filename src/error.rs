use std::path::PathBuf;
use thiserror::Error;

/// 分析流程错误
///
/// 输入校验错误在任何流水线工作开始之前返回；
/// 单帧的解码或分析失败不会出现在这里，它们在帧级别被降级处理。
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("采样周期必须大于 0，当前值: {0}")]
    InvalidPeriod(f64),

    #[error("采样帧数必须大于 0")]
    InvalidFrameCount,

    #[error("视频文件不存在: {}", .0.display())]
    VideoNotFound(PathBuf),

    #[error("无法读取视频元数据: {0}")]
    VideoMetadata(String),

    #[error("无法准备工作目录 {}: {reason}", .path.display())]
    Workspace { path: PathBuf, reason: String },

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

/// 工具分发错误
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("No handlers registered in the chain")]
    NoHandlers,

    #[error("No handler found for tool: {0}")]
    UnknownTool(String),

    #[error("{0}")]
    InvalidArguments(String),
}

pub type AnalysisResult<T> = std::result::Result<T, AnalysisError>;

/// 取出 panic 携带的消息
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
