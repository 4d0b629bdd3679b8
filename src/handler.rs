use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{error, info};

use crate::audio_analysis::AudioTranscriptionAnalysis;
use crate::audio_extractor::AudioTrackSource;
use crate::captioner::FrameAnalysisFn;
use crate::config::{DEFAULT_PERIOD, DEFAULT_WHISPER_MODEL};
use crate::error::ToolError;
use crate::frame_selection::PeriodicSelectionStrategy;
use crate::frame_selection_analysis::FrameSelectionAnalysis;
use crate::technical_analyzer::TechnicalFrameAnalyzer;
use crate::transcriber::Transcriber;
use crate::video_processor::VideoSource;

pub const ANALYZE_VIDEO_TOOL: &str = "analyze_video_with_technical";
pub const ANALYZE_AUDIO_TOOL: &str = "analyze_audio";

/// 工具描述，`tools/list` 的返回项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// 工具返回内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        ToolContent::Text { text: text.into() }
    }

    pub fn as_text(&self) -> &str {
        match self {
            ToolContent::Text { text } => text,
        }
    }
}

/// 工具处理器
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn tool_definition(&self) -> ToolDefinition;

    fn can_handle(&self, tool_name: &str) -> bool {
        tool_name == self.name()
    }

    fn handle(&self, arguments: &Value) -> Result<Vec<ToolContent>, ToolError>;
}

pub type ToolPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
struct Route {
    predicate: ToolPredicate,
    handler: Arc<dyn ToolHandler>,
}

/// 按顺序匹配的处理器列表，第一个谓词命中的处理器负责处理
///
/// 构造后不可变，`with_handler` 返回新的链。
#[derive(Clone, Default)]
pub struct HandlerChain {
    routes: Vec<Route>,
}

impl HandlerChain {
    pub fn of(handlers: Vec<Arc<dyn ToolHandler>>) -> Self {
        handlers
            .into_iter()
            .fold(Self::default(), |chain, handler| chain.with_handler(handler))
    }

    pub fn with_handler(&self, handler: Arc<dyn ToolHandler>) -> Self {
        let matcher = handler.clone();
        self.with_route(Arc::new(move |name: &str| matcher.can_handle(name)), handler)
    }

    pub fn with_route(&self, predicate: ToolPredicate, handler: Arc<dyn ToolHandler>) -> Self {
        let mut routes = self.routes.clone();
        routes.push(Route { predicate, handler });
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn tools(&self) -> Vec<ToolDefinition> {
        self.routes.iter().map(|r| r.handler.tool_definition()).collect()
    }

    pub fn dispatch(&self, tool_name: &str, arguments: &Value) -> Result<Vec<ToolContent>, ToolError> {
        if self.routes.is_empty() {
            return Err(ToolError::NoHandlers);
        }
        let route = self
            .routes
            .iter()
            .find(|r| (r.predicate)(tool_name))
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;
        route.handler.handle(arguments)
    }
}

/// 按视频路径串行化分析任务
#[derive(Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn with_lock<R>(&self, path: &Path, f: impl FnOnce() -> R) -> R {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key).or_default().clone()
        };
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

fn parse_arguments<T: for<'de> Deserialize<'de>>(arguments: &Value) -> Result<T, ToolError> {
    if arguments.is_null() {
        return Err(ToolError::InvalidArguments("Missing arguments".to_string()));
    }
    serde_json::from_value(arguments.clone())
        .map_err(|e| ToolError::InvalidArguments(format!("Invalid arguments: {}", e)))
}

fn existing_video(video_path: Option<String>) -> Result<PathBuf, ToolError> {
    let video_path = video_path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArguments("video_path is required".to_string()))?;
    let path = PathBuf::from(&video_path);
    if !path.is_file() {
        return Err(ToolError::InvalidArguments(format!(
            "Video file not found: {}",
            video_path
        )));
    }
    Ok(path)
}

#[derive(Debug, Deserialize)]
struct AnalyzeVideoArgs {
    video_path: Option<String>,
    period: Option<f64>,
    enable_technical_analysis: Option<bool>,
}

/// 帧采样 + 技术分析工具
pub struct AnalyzeVideoHandler {
    video_source: Arc<dyn VideoSource>,
    analysis_fn: FrameAnalysisFn,
    technical_analyzer: Arc<TechnicalFrameAnalyzer>,
    default_period: f64,
    default_technical_analysis: bool,
    work_dir: PathBuf,
    locks: PathLocks,
}

impl AnalyzeVideoHandler {
    pub fn new(
        video_source: Arc<dyn VideoSource>,
        analysis_fn: FrameAnalysisFn,
        technical_analyzer: Arc<TechnicalFrameAnalyzer>,
    ) -> Self {
        Self {
            video_source,
            analysis_fn,
            technical_analyzer,
            default_period: DEFAULT_PERIOD,
            default_technical_analysis: true,
            work_dir: std::env::temp_dir(),
            locks: PathLocks::default(),
        }
    }

    pub fn with_default_period(mut self, period: f64) -> Self {
        self.default_period = period;
        self
    }

    pub fn with_default_technical_analysis(mut self, enabled: bool) -> Self {
        self.default_technical_analysis = enabled;
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    fn analyze(&self, video_path: &Path, period: f64, enable_technical: bool) -> anyhow::Result<String> {
        let strategy =
            PeriodicSelectionStrategy::from_video_file(video_path, period, self.video_source.as_ref())?;
        let context = FrameSelectionAnalysis::new(
            video_path,
            self.analysis_fn.clone(),
            Box::new(strategy),
            self.video_source.clone(),
        )
        .with_technical_analysis(enable_technical)
        .with_technical_analyzer(self.technical_analyzer.clone())
        .with_work_dir(&self.work_dir)
        .run()?;

        let summary = context.summarize(video_path.display().to_string(), period);
        Ok(serde_json::to_string_pretty(&summary)?)
    }
}

impl ToolHandler for AnalyzeVideoHandler {
    fn name(&self) -> &str {
        ANALYZE_VIDEO_TOOL
    }

    fn tool_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: ANALYZE_VIDEO_TOOL.to_string(),
            description: "Analyze a video by sampling one frame per period, captioning each frame \
                          and computing technical quality metrics. Returns time-bounded actions \
                          covering the whole video."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "video_path": {
                        "type": "string",
                        "description": "Path to the video file"
                    },
                    "period": {
                        "type": "number",
                        "description": "Seconds between sampled frames",
                        "default": self.default_period
                    },
                    "enable_technical_analysis": {
                        "type": "boolean",
                        "description": "Compute clarity, contrast, brightness and other frame metrics",
                        "default": self.default_technical_analysis
                    }
                },
                "required": ["video_path"]
            }),
        }
    }

    fn handle(&self, arguments: &Value) -> Result<Vec<ToolContent>, ToolError> {
        let args: AnalyzeVideoArgs = parse_arguments(arguments)?;
        let video_path = existing_video(args.video_path)?;
        let period = args.period.unwrap_or(self.default_period);
        if !(period > 0.0) {
            return Err(ToolError::InvalidArguments(format!(
                "period must be greater than 0, got {}",
                period
            )));
        }
        let enable_technical = args
            .enable_technical_analysis
            .unwrap_or(self.default_technical_analysis);

        let start = Instant::now();
        info!(
            "🛠️ [工具调用] {}: {} (period={}, technical={})",
            ANALYZE_VIDEO_TOOL,
            video_path.display(),
            period,
            enable_technical
        );

        let result = self
            .locks
            .with_lock(&video_path, || self.analyze(&video_path, period, enable_technical));

        let text = match result {
            Ok(json) => {
                info!("✅ [工具调用] 视频分析完成，耗时: {:.2}秒", start.elapsed().as_secs_f64());
                json
            }
            Err(e) => {
                error!("❌ [工具调用] 视频分析失败: {:#}", e);
                format!("Error analyzing video: {:#}", e)
            }
        };
        Ok(vec![ToolContent::text(text)])
    }
}

/// 根据模型名创建识别器
pub type TranscriberFactory = Arc<dyn Fn(&str) -> Arc<dyn Transcriber> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct AnalyzeAudioArgs {
    video_path: Option<String>,
    model_name: Option<String>,
}

/// 语音识别工具
pub struct AnalyzeAudioHandler {
    audio_source: Arc<dyn AudioTrackSource>,
    transcriber_factory: TranscriberFactory,
    default_model: String,
    work_dir: PathBuf,
    locks: PathLocks,
}

impl AnalyzeAudioHandler {
    pub fn new(audio_source: Arc<dyn AudioTrackSource>, transcriber_factory: TranscriberFactory) -> Self {
        Self {
            audio_source,
            transcriber_factory,
            default_model: DEFAULT_WHISPER_MODEL.to_string(),
            work_dir: std::env::temp_dir(),
            locks: PathLocks::default(),
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }
}

impl ToolHandler for AnalyzeAudioHandler {
    fn name(&self) -> &str {
        ANALYZE_AUDIO_TOOL
    }

    fn tool_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: ANALYZE_AUDIO_TOOL.to_string(),
            description: "Extract the audio track of a video and transcribe it with Whisper. \
                          Returns the full text and timestamped segments."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "video_path": {
                        "type": "string",
                        "description": "Path to the video file"
                    },
                    "model_name": {
                        "type": "string",
                        "description": "Whisper model name",
                        "default": self.default_model
                    }
                },
                "required": ["video_path"]
            }),
        }
    }

    fn handle(&self, arguments: &Value) -> Result<Vec<ToolContent>, ToolError> {
        let args: AnalyzeAudioArgs = parse_arguments(arguments)?;
        let video_path = existing_video(args.video_path)?;
        let model_name = args
            .model_name
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.default_model.clone());

        info!("🛠️ [工具调用] {}: {} (model={})", ANALYZE_AUDIO_TOOL, video_path.display(), model_name);

        let analysis = AudioTranscriptionAnalysis::new(
            &video_path,
            self.audio_source.clone(),
            (self.transcriber_factory)(&model_name),
        )
        .with_work_dir(&self.work_dir);

        let result = self.locks.with_lock(&video_path, || {
            let transcription = analysis.transcribe()?;
            Ok::<_, anyhow::Error>(serde_json::to_string_pretty(&analysis.summarize(transcription))?)
        });

        let text = match result {
            Ok(json) => json,
            Err(e) => {
                error!("❌ [工具调用] 音频分析失败: {:#}", e);
                format!("Error analyzing audio: {:#}", e)
            }
        };
        Ok(vec![ToolContent::text(text)])
    }
}
