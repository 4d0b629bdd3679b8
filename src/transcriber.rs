use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// 单个语音识别片段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// 语音识别结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    pub language: String,
}

/// 语音识别模型：输入音频文件，输出文本和带时间戳的片段
pub trait Transcriber: Send + Sync {
    fn model_name(&self) -> &str;

    fn transcribe(&self, audio_path: &Path) -> Result<Transcription>;
}

/// 调用 openai-whisper 命令行工具的识别器
#[derive(Debug, Clone)]
pub struct WhisperCliTranscriber {
    command: String,
    model: String,
}

impl WhisperCliTranscriber {
    pub fn new(command: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            model: model.into(),
        }
    }

    fn output_file(output_dir: &Path, audio_path: &Path) -> PathBuf {
        let stem = audio_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio".to_string());
        output_dir.join(format!("{}.json", stem))
    }
}

impl Transcriber for WhisperCliTranscriber {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn transcribe(&self, audio_path: &Path) -> Result<Transcription> {
        let output_dir = audio_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);

        info!("🎙️ [语音识别] 使用模型 {} 识别: {}", self.model, audio_path.display());

        let output = Command::new(&self.command)
            .arg(audio_path)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_format")
            .arg("json")
            .arg("--output_dir")
            .arg(&output_dir)
            .arg("--verbose")
            .arg("False")
            .output()
            .with_context(|| format!("执行 {} 命令失败", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("语音识别失败: {}", stderr.trim());
        }

        let json_path = Self::output_file(&output_dir, audio_path);
        let raw = std::fs::read_to_string(&json_path)
            .with_context(|| format!("读取识别结果失败: {}", json_path.display()))?;
        let transcription = parse_whisper_json(&raw)?;

        // 识别结果是中间文件，删除失败不影响结果
        if let Err(e) = std::fs::remove_file(&json_path) {
            debug!("删除识别结果文件失败: {} - {}", json_path.display(), e);
        }

        Ok(transcription)
    }
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    #[serde(default)]
    text: String,
}

/// 解析 whisper 输出的 JSON，片段文本去掉首尾空白
pub fn parse_whisper_json(raw: &str) -> Result<Transcription> {
    let parsed: WhisperOutput = serde_json::from_str(raw).context("解析识别结果 JSON 失败")?;

    let segments = parsed
        .segments
        .into_iter()
        .map(|s| TranscriptSegment {
            start: s.start,
            end: s.end,
            text: s.text.trim().to_string(),
        })
        .collect();

    Ok(Transcription {
        text: parsed.text.trim().to_string(),
        segments,
        language: parsed.language.unwrap_or_else(|| "unknown".to_string()),
    })
}
