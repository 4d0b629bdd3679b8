//! 实例分割子模型后端：HTTP 服务或本地命令，输出每个物体掩码占画面的比例

use anyhow::{Context, Result};
use base64::Engine as _;
use image::{ImageFormat, RgbImage};
use serde::Deserialize;
use std::io::Cursor;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use tracing::info;

use crate::config::ModelConfig;
use crate::technical_analyzer::ObjectSegmenter;
use crate::workspace::ScratchDir;

fn encode_png(frame: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    frame
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("编码帧图片失败")?;
    Ok(bytes)
}

fn valid_fractions(fractions: Vec<f64>) -> Vec<f64> {
    fractions
        .into_iter()
        .filter(|f| f.is_finite())
        .map(|f| f.clamp(0.0, 1.0))
        .collect()
}

/// 通过 HTTP 调用分割服务（例如部署好的 YOLO-seg 服务）
///
/// 请求体: `{"image": <base64 png>}`，响应体: `{"mask_fractions": [0.42, 0.1, ...]}`。
pub struct HttpObjectSegmenter {
    client: reqwest::blocking::Client,
    endpoint: reqwest::Url,
}

#[derive(Debug, Deserialize)]
struct SegmentResponse {
    mask_fractions: Vec<f64>,
}

impl HttpObjectSegmenter {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = reqwest::Url::parse(endpoint)
            .with_context(|| format!("分割服务地址无效: {}", endpoint))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self { client, endpoint })
    }
}

impl ObjectSegmenter for HttpObjectSegmenter {
    fn mask_fractions(&self, frame: &RgbImage) -> Result<Vec<f64>> {
        let body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(encode_png(frame)?),
        });
        let response: SegmentResponse = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .context("分割服务请求失败")?
            .error_for_status()
            .context("分割服务返回错误状态")?
            .json()
            .context("解析分割服务响应失败")?;
        Ok(valid_fractions(response.mask_fractions))
    }
}

/// 调用本地分割命令：`<program> [args..] <image_path>`，标准输出为掩码比例的 JSON 数组
#[derive(Debug, Clone)]
pub struct CommandObjectSegmenter {
    program: String,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl CommandObjectSegmenter {
    pub fn from_command_line(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().context("分割命令为空")?;
        Ok(Self {
            program,
            args: parts.collect(),
            work_dir: std::env::temp_dir(),
        })
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }
}

impl ObjectSegmenter for CommandObjectSegmenter {
    fn mask_fractions(&self, frame: &RgbImage) -> Result<Vec<f64>> {
        let scratch = ScratchDir::create(&self.work_dir, "segment")?;
        let image_path = scratch.join("frame.png");
        frame
            .save(&image_path)
            .with_context(|| format!("保存帧图片失败: {}", image_path.display()))?;

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&image_path)
            .output()
            .with_context(|| format!("执行分割命令失败: {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("分割命令退出码 {:?}: {}", output.status.code(), stderr.trim());
        }

        let fractions: Vec<f64> =
            serde_json::from_slice(&output.stdout).context("解析分割命令输出失败")?;
        Ok(valid_fractions(fractions))
    }
}

/// 按配置创建分割后端，endpoint 优先于 command，都未配置时返回 None
pub fn load_object_segmenter(config: &ModelConfig) -> Result<Option<Box<dyn ObjectSegmenter>>> {
    if let Some(endpoint) = &config.object_model_endpoint {
        info!("🔍 [技术分析] 使用分割服务: {}", endpoint);
        return Ok(Some(Box::new(HttpObjectSegmenter::new(endpoint)?)));
    }
    if let Some(command) = &config.object_model_command {
        info!("🔍 [技术分析] 使用分割命令: {}", command);
        return Ok(Some(Box::new(CommandObjectSegmenter::from_command_line(command)?)));
    }
    Ok(None)
}
