use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::audio_extractor::AudioTrackSource;
use crate::media_context::{Action, ActionContent, MediaAnalysis, MediaContext};
use crate::transcriber::{TranscriptSegment, Transcriber, Transcription};
use crate::workspace::ScratchDir;

/// 音频分析工具的返回结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioAnalysisSummary {
    pub video_path: String,
    pub model_name: String,
    pub language: String,
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    pub total_segments: usize,
    pub audio_extracted_successfully: bool,
}

/// 每个识别片段对应一个 Action
pub fn transcription_to_context(transcription: &Transcription) -> MediaContext {
    MediaContext::new(
        transcription
            .segments
            .iter()
            .map(|segment| Action {
                start: segment.start,
                end: segment.end,
                content: ActionContent::Speech {
                    text: segment.text.clone(),
                },
                technical_analysis: None,
            })
            .collect(),
    )
}

/// 纯音频分析：提取音轨后做语音识别
pub struct AudioTranscriptionAnalysis {
    video_path: PathBuf,
    audio_source: Arc<dyn AudioTrackSource>,
    transcriber: Arc<dyn Transcriber>,
    work_dir: PathBuf,
}

impl AudioTranscriptionAnalysis {
    pub fn new(
        video_path: impl Into<PathBuf>,
        audio_source: Arc<dyn AudioTrackSource>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        Self {
            video_path: video_path.into(),
            audio_source,
            transcriber,
            work_dir: std::env::temp_dir(),
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn video_path(&self) -> &Path {
        &self.video_path
    }

    /// 提取音轨并识别，临时音频文件在返回前删除
    pub fn transcribe(&self) -> Result<Transcription> {
        let total_start = Instant::now();
        info!("🎙️ [语音识别] 开始处理: {}", self.video_path.display());

        let scratch = ScratchDir::create(&self.work_dir, "audio")?;
        let stem = self
            .video_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio".to_string());

        let extract_start = Instant::now();
        let audio_path = self
            .audio_source
            .extract(&self.video_path, &scratch.join(format!("{}_audio.wav", stem)))
            .context("提取音频失败")?;
        info!(
            "✅ [语音识别] 音频提取完成，耗时: {:.2}秒",
            extract_start.elapsed().as_secs_f64()
        );

        let transcription = self
            .transcriber
            .transcribe(&audio_path)
            .context("语音识别失败")?;
        info!(
            "✅ [语音识别] 识别完成，语言: {}, 片段数: {}，总耗时: {:.2}秒",
            transcription.language,
            transcription.segments.len(),
            total_start.elapsed().as_secs_f64()
        );

        Ok(transcription)
    }

    pub fn summarize(&self, transcription: Transcription) -> AudioAnalysisSummary {
        AudioAnalysisSummary {
            video_path: self.video_path.display().to_string(),
            model_name: self.transcriber.model_name().to_string(),
            language: transcription.language,
            text: transcription.text,
            total_segments: transcription.segments.len(),
            segments: transcription.segments,
            audio_extracted_successfully: true,
        }
    }
}

impl MediaAnalysis for AudioTranscriptionAnalysis {
    fn analyse(&self) -> Result<MediaContext> {
        Ok(transcription_to_context(&self.transcribe()?))
    }
}
