use anyhow::{Context, Result};
use base64::Engine as _;
use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::CaptionConfig;

/// 帧语义分析函数：输入帧图片路径，输出描述文本
pub type FrameAnalysisFn = Arc<dyn Fn(&Path) -> Result<String> + Send + Sync>;

/// 图像字幕模型
pub trait Captioner: Send + Sync {
    fn name(&self) -> &str;

    fn caption(&self, image_path: &Path) -> Result<String>;
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// 未配置字幕模型时使用的占位描述
pub fn placeholder_description(image_path: &Path) -> String {
    format!("Frame analysis for {}", file_name(image_path))
}

/// 单帧分析失败时写入 Action 的描述
pub fn failure_description(image_path: &Path, reason: &str) -> String {
    format!(
        "Frame analysis failed for {} (Error: {})",
        file_name(image_path),
        reason
    )
}

/// 把字幕模型包装成帧分析函数
pub fn caption_frame_fn(captioner: Arc<dyn Captioner>) -> FrameAnalysisFn {
    Arc::new(move |path: &Path| captioner.caption(path))
}

pub fn placeholder_frame_fn() -> FrameAnalysisFn {
    Arc::new(|path: &Path| Ok(placeholder_description(path)))
}

/// 通过 HTTP 调用字幕服务（例如部署好的 BLIP 服务）
///
/// 请求体: `{"image": <base64 jpeg>, "model": <name>}`，响应体: `{"caption": "..."}`。
pub struct HttpCaptioner {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct CaptionResponse {
    caption: String,
}

impl HttpCaptioner {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
        })
    }

    fn request_body(&self, image_bytes: &[u8]) -> serde_json::Value {
        serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image_bytes),
            "model": self.model,
        })
    }
}

impl Captioner for HttpCaptioner {
    fn name(&self) -> &str {
        &self.model
    }

    fn caption(&self, image_path: &Path) -> Result<String> {
        let bytes = std::fs::read(image_path)
            .with_context(|| format!("读取帧图片失败: {}", image_path.display()))?;

        let response: CaptionResponse = self
            .client
            .post(&self.endpoint)
            .json(&self.request_body(&bytes))
            .send()
            .context("字幕服务请求失败")?
            .error_for_status()
            .context("字幕服务返回错误状态")?
            .json()
            .context("解析字幕服务响应失败")?;

        let caption = response.caption.trim().to_string();
        if caption.is_empty() {
            anyhow::bail!("字幕服务返回空描述");
        }
        Ok(caption)
    }
}

/// 调用本地命令生成描述：`<program> [args..] <image_path>`，标准输出即描述
#[derive(Debug, Clone)]
pub struct CommandCaptioner {
    program: String,
    args: Vec<String>,
}

impl CommandCaptioner {
    pub fn from_command_line(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().context("字幕命令为空")?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl Captioner for CommandCaptioner {
    fn name(&self) -> &str {
        &self.program
    }

    fn caption(&self, image_path: &Path) -> Result<String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(image_path)
            .output()
            .with_context(|| format!("执行字幕命令失败: {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("字幕命令退出码 {:?}: {}", output.status.code(), stderr.trim());
        }

        let caption = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if caption.is_empty() {
            anyhow::bail!("字幕命令没有输出");
        }
        Ok(caption)
    }
}

/// 字幕模型句柄
///
/// 进程启动时加载一次，通过 `Arc` 共享给各个处理器，退出时调用 `release` 释放。
pub struct CaptionModel {
    backend: Option<Arc<dyn Captioner>>,
    released: bool,
}

impl CaptionModel {
    pub fn load(config: &CaptionConfig) -> Result<Self> {
        let backend: Option<Arc<dyn Captioner>> = if let Some(endpoint) = &config.endpoint {
            info!("🧠 [字幕模型] 使用 HTTP 服务: {} (模型: {})", endpoint, config.model);
            Some(Arc::new(HttpCaptioner::new(endpoint.clone(), config.model.clone())?))
        } else if let Some(command) = &config.command {
            info!("🧠 [字幕模型] 使用本地命令: {}", command);
            Some(Arc::new(CommandCaptioner::from_command_line(command)?))
        } else {
            warn!("⚠️  [字幕模型] 未配置字幕模型，帧描述将使用占位文本");
            None
        };

        Ok(Self {
            backend,
            released: false,
        })
    }

    pub fn from_captioner(captioner: Arc<dyn Captioner>) -> Self {
        Self {
            backend: Some(captioner),
            released: false,
        }
    }

    pub fn placeholder() -> Self {
        Self {
            backend: None,
            released: false,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.backend.is_none()
    }

    pub fn name(&self) -> &str {
        self.backend
            .as_ref()
            .map(|b| b.name())
            .unwrap_or("placeholder")
    }

    pub fn caption(&self, image_path: &Path) -> Result<String> {
        match &self.backend {
            Some(backend) => backend.caption(image_path),
            None => Ok(placeholder_description(image_path)),
        }
    }

    pub fn frame_analysis_fn(&self) -> FrameAnalysisFn {
        match &self.backend {
            Some(backend) => caption_frame_fn(backend.clone()),
            None => placeholder_frame_fn(),
        }
    }

    /// 显式释放模型
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(backend) = self.backend.take() {
            info!("🧹 [字幕模型] 释放模型: {}", backend.name());
        }
    }
}

impl Drop for CaptionModel {
    fn drop(&mut self) {
        self.release_inner();
    }
}
