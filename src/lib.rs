pub mod error;
pub mod frame_selection;
pub mod video_processor;
pub mod audio_extractor;
pub mod transcriber;
pub mod captioner;
pub mod technical_analyzer;
pub mod segmenter;
pub mod media_context;
pub mod workspace;
pub mod frame_selection_analysis;
pub mod audio_analysis;
pub mod processor;
pub mod handler;
pub mod mcp_server;
pub mod server;
pub mod config;

pub use error::{AnalysisError, AnalysisResult, ToolError};
pub use frame_selection::{
    EvenlySpacedSelectionStrategy, FrameInfo, FrameSelectionStrategy, PeriodicSelectionStrategy,
};
pub use video_processor::{FfmpegVideoSource, VideoInfo, VideoSource};
pub use audio_extractor::{AudioExtractor, AudioTrackSource, FfmpegAudioSource};
pub use transcriber::{Transcriber, Transcription, TranscriptSegment, WhisperCliTranscriber};
pub use captioner::{CaptionModel, Captioner, FrameAnalysisFn};
pub use technical_analyzer::{SubModel, TechnicalFrameAnalyzer, TechnicalMetrics};
pub use segmenter::{CommandObjectSegmenter, HttpObjectSegmenter};
pub use media_context::{Action, ActionContent, MediaAnalysis, MediaContext, VideoAnalysisSummary};
pub use frame_selection_analysis::{build_actions, FrameSelectionAnalysis};
pub use audio_analysis::AudioTranscriptionAnalysis;
pub use processor::{analyze_videos, BatchOptions, PipelineServices, SelectionMode};
pub use handler::{AnalyzeAudioHandler, AnalyzeVideoHandler, HandlerChain, ToolHandler};
pub use config::{AnalysisConfig, ConfigLoader};
