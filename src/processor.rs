use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::audio_analysis::AudioTranscriptionAnalysis;
use crate::audio_extractor::AudioTrackSource;
use crate::captioner::FrameAnalysisFn;
use crate::error::AnalysisError;
use crate::frame_selection::{
    EvenlySpacedSelectionStrategy, FrameSelectionStrategy, PeriodicSelectionStrategy,
};
use crate::frame_selection_analysis::FrameSelectionAnalysis;
use crate::media_context::{ActionSummary, MediaContext};
use crate::technical_analyzer::TechnicalFrameAnalyzer;
use crate::transcriber::{Transcriber, Transcription};
use crate::video_processor::{VideoInfo, VideoSource};

/// 帧采样方式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SelectionMode {
    /// 每隔固定秒数采样一帧
    Period(f64),
    /// 在整个视频上均匀采样固定帧数
    FrameCount(u32),
}

/// 批处理配置
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub selection: SelectionMode,
    pub enable_technical_analysis: bool,
    pub enable_audio: bool,
    pub work_dir: PathBuf,
}

/// 批处理用到的外部协作者
#[derive(Clone)]
pub struct PipelineServices {
    pub video_source: Arc<dyn VideoSource>,
    pub analysis_fn: FrameAnalysisFn,
    pub technical_analyzer: Arc<TechnicalFrameAnalyzer>,
    pub audio_source: Arc<dyn AudioTrackSource>,
    pub transcriber: Arc<dyn Transcriber>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileMetadata {
    pub file_name: String,
    pub file_path: String,
    pub file_size: u64,
    pub created_at: String,
    pub description: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentAnalysis {
    pub content_overview: String,
    pub action_introduction: String,
    pub actions: Vec<ActionSummary>,
    pub detected_scenes: Vec<String>,
    pub audio_transcript: Option<Transcription>,
}

/// 单个视频的描述文件内容
#[derive(Debug, Clone, Serialize)]
pub struct VideoDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub metadata: FileMetadata,
    pub duration: f64,
    pub resolution: Resolution,
    pub frame_rate: f64,
    pub has_audio: bool,
    pub video_format: String,
    pub content_analysis: ContentAnalysis,
}

fn unique_in_order<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = Vec::new();
    for item in items {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

/// 从描述中提取最多 5 个标签：纯字母、长度大于 3 的小写单词
pub fn extract_tags(captions: &[&str]) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for word in captions.iter().flat_map(|c| c.split_whitespace()) {
        let word = word.to_lowercase();
        if word.chars().count() > 3
            && word.chars().all(char::is_alphabetic)
            && !tags.contains(&word)
        {
            tags.push(word);
            if tags.len() == 5 {
                break;
            }
        }
    }
    tags
}

/// 根据描述中的关键词判断室内/室外
pub fn detect_scenes(captions: &[&str]) -> Vec<String> {
    const INDOOR_WORDS: [&str; 4] = ["room", "bed", "table", "chair"];
    let labels = captions.iter().map(|caption| {
        let lower = caption.to_lowercase();
        if INDOOR_WORDS.iter().any(|w| lower.contains(w)) {
            "indoor"
        } else {
            "outdoor"
        }
    });
    unique_in_order(labels).into_iter().map(str::to_string).collect()
}

fn file_metadata(video_path: &Path, description: String, tags: Vec<String>) -> Result<FileMetadata> {
    let stat = std::fs::metadata(video_path)
        .with_context(|| format!("读取文件信息失败: {}", video_path.display()))?;
    let modified: DateTime<Utc> = stat
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let file_path = std::fs::canonicalize(video_path).unwrap_or_else(|_| video_path.to_path_buf());

    Ok(FileMetadata {
        file_name: video_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        file_path: file_path.display().to_string(),
        file_size: stat.len(),
        created_at: modified.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        description,
        tags,
    })
}

/// 由分析结果组装描述文件
pub fn build_description(
    video_path: &Path,
    info: &VideoInfo,
    context: &MediaContext,
    audio_transcript: Option<Transcription>,
) -> Result<VideoDescription> {
    let captions: Vec<&str> = context.actions.iter().map(|a| a.content.text()).collect();
    let overview = unique_in_order(captions.iter().copied()).join(" ");
    let tags = extract_tags(&captions);

    Ok(VideoDescription {
        kind: "video".to_string(),
        metadata: file_metadata(video_path, overview.clone(), tags)?,
        duration: info.duration,
        resolution: Resolution {
            width: info.width,
            height: info.height,
        },
        frame_rate: info.fps,
        has_audio: info.has_audio,
        video_format: video_path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default(),
        content_analysis: ContentAnalysis {
            content_overview: overview,
            action_introduction: captions.first().map(|c| c.to_string()).unwrap_or_default(),
            actions: context.actions.iter().map(ActionSummary::from).collect(),
            detected_scenes: detect_scenes(&captions),
            audio_transcript,
        },
    })
}

fn build_strategy(
    selection: SelectionMode,
    info: &VideoInfo,
) -> Result<Box<dyn FrameSelectionStrategy>, AnalysisError> {
    Ok(match selection {
        SelectionMode::Period(period) => {
            Box::new(PeriodicSelectionStrategy::new(period, info.duration, info.fps)?)
        }
        SelectionMode::FrameCount(count) => {
            Box::new(EvenlySpacedSelectionStrategy::new(count, info.duration, info.fps)?)
        }
    })
}

fn validate_selection(selection: SelectionMode) -> Result<(), AnalysisError> {
    match selection {
        SelectionMode::Period(period) if !(period > 0.0) => Err(AnalysisError::InvalidPeriod(period)),
        SelectionMode::FrameCount(0) => Err(AnalysisError::InvalidFrameCount),
        _ => Ok(()),
    }
}

/// 分析单个视频
pub fn describe_video(
    video_path: &Path,
    options: &BatchOptions,
    services: &PipelineServices,
) -> Result<VideoDescription> {
    let info = services
        .video_source
        .video_info(video_path)
        .map_err(|e| AnalysisError::VideoMetadata(format!("{:#}", e)))?;
    info!(
        "  • 分辨率: {}x{}, 时长: {:.2}秒, 帧率: {:.2} fps",
        info.width, info.height, info.duration, info.fps
    );

    let strategy = build_strategy(options.selection, &info)?;
    let context = FrameSelectionAnalysis::new(
        video_path,
        services.analysis_fn.clone(),
        strategy,
        services.video_source.clone(),
    )
    .with_technical_analysis(options.enable_technical_analysis)
    .with_technical_analyzer(services.technical_analyzer.clone())
    .with_work_dir(&options.work_dir)
    .run()?;

    let audio_transcript = if options.enable_audio && info.has_audio {
        let analysis = AudioTranscriptionAnalysis::new(
            video_path,
            services.audio_source.clone(),
            services.transcriber.clone(),
        )
        .with_work_dir(&options.work_dir);
        match analysis.transcribe() {
            Ok(transcription) => Some(transcription),
            Err(e) => {
                warn!("⚠️  [批处理] 语音识别失败，跳过音频: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    build_description(video_path, &info, &context, audio_transcript)
}

/// 依次分析多个视频，每个视频写出 `<stem>_description.json`，返回写出的文件
pub fn analyze_videos(
    video_paths: &[PathBuf],
    output_dir: &Path,
    options: &BatchOptions,
    services: &PipelineServices,
) -> Result<Vec<PathBuf>> {
    validate_selection(options.selection)?;
    for path in video_paths {
        if !path.exists() {
            return Err(AnalysisError::VideoNotFound(path.clone()).into());
        }
    }

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("创建输出目录失败: {}", output_dir.display()))?;

    let total_start = Instant::now();
    let mut written = Vec::with_capacity(video_paths.len());
    for (i, path) in video_paths.iter().enumerate() {
        let video_start = Instant::now();
        info!("🎬 [批处理] ({}/{}) 开始处理: {}", i + 1, video_paths.len(), path.display());

        let description = describe_video(path, options, services).map_err(|e| {
            error!("❌ [批处理] 处理失败: {} - {:#}", path.display(), e);
            e
        })?;

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        let output_file = output_dir.join(format!("{}_description.json", stem));
        let json = serde_json::to_string_pretty(&description).context("序列化描述失败")?;
        std::fs::write(&output_file, json)
            .with_context(|| format!("写入描述文件失败: {}", output_file.display()))?;

        info!(
            "✅ [批处理] 完成: {}，耗时: {:.2}秒",
            output_file.display(),
            video_start.elapsed().as_secs_f64()
        );
        written.push(output_file);
    }

    info!(
        "🎉 [批处理] 全部完成！共 {} 个视频，总耗时: {:.2}秒",
        written.len(),
        total_start.elapsed().as_secs_f64()
    );
    Ok(written)
}
