//! 帧采样分析：采样、解码、语义描述、技术分析，再把离散的帧观测转换成
//! 覆盖整个视频时长的连续区间。

use image::RgbImage;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::captioner::{failure_description, FrameAnalysisFn};
use crate::error::{panic_message, AnalysisError, AnalysisResult};
use crate::frame_selection::{FrameInfo, FrameSelectionStrategy};
use crate::media_context::{Action, ActionContent, MediaAnalysis, MediaContext};
use crate::technical_analyzer::{TechnicalFrameAnalyzer, TechnicalMetrics};
use crate::video_processor::VideoSource;
use crate::workspace::ScratchDir;

/// 单个成功解码的采样帧的分析结果
#[derive(Debug, Clone, PartialEq)]
pub struct FrameObservation {
    pub frame: FrameInfo,
    pub description: String,
    pub technical_analysis: Option<TechnicalMetrics>,
}

/// 把按时间排序的帧观测转换成 Action 列表
///
/// 第 i 个区间从前一帧与本帧时间戳的中点开始，到本帧与后一帧的中点结束；
/// 第一个区间从 0 开始，最后一个区间到 `duration` 结束。
pub fn build_actions(observations: Vec<FrameObservation>, duration: f64) -> Vec<Action> {
    let timestamps: Vec<f64> = observations.iter().map(|o| o.frame.timestamp).collect();
    let last = timestamps.len().saturating_sub(1);

    observations
        .into_iter()
        .enumerate()
        .map(|(i, observation)| {
            let start = if i == 0 {
                0.0
            } else {
                (timestamps[i - 1] + timestamps[i]) / 2.0
            };
            let end = if i == last {
                duration
            } else {
                (timestamps[i] + timestamps[i + 1]) / 2.0
            };
            Action {
                start,
                end,
                content: ActionContent::Frame {
                    description: observation.description,
                    frame_index: observation.frame.index,
                    frame_timestamp: observation.frame.timestamp,
                },
                technical_analysis: observation.technical_analysis,
            }
        })
        .collect()
}

/// 帧采样分析器
pub struct FrameSelectionAnalysis {
    video_path: PathBuf,
    analysis_fn: FrameAnalysisFn,
    strategy: Box<dyn FrameSelectionStrategy>,
    source: Arc<dyn VideoSource>,
    enable_technical_analysis: bool,
    technical_analyzer: Option<Arc<TechnicalFrameAnalyzer>>,
    work_dir: PathBuf,
}

impl FrameSelectionAnalysis {
    /// 默认开启技术分析（仅基础指标），临时文件放在系统临时目录
    pub fn new(
        video_path: impl Into<PathBuf>,
        analysis_fn: FrameAnalysisFn,
        strategy: Box<dyn FrameSelectionStrategy>,
        source: Arc<dyn VideoSource>,
    ) -> Self {
        Self {
            video_path: video_path.into(),
            analysis_fn,
            strategy,
            source,
            enable_technical_analysis: true,
            technical_analyzer: None,
            work_dir: std::env::temp_dir(),
        }
    }

    pub fn with_technical_analysis(mut self, enabled: bool) -> Self {
        self.enable_technical_analysis = enabled;
        self
    }

    pub fn with_technical_analyzer(mut self, analyzer: Arc<TechnicalFrameAnalyzer>) -> Self {
        self.technical_analyzer = Some(analyzer);
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn video_path(&self) -> &Path {
        &self.video_path
    }

    pub fn run(&self) -> AnalysisResult<MediaContext> {
        let total_start = Instant::now();
        info!("🎞️ [帧分析] 开始分析视频: {}", self.video_path.display());

        let video_info = self
            .source
            .video_info(&self.video_path)
            .map_err(|e| AnalysisError::VideoMetadata(format!("{:#}", e)))?;
        let frames = self.strategy.select_frames();
        info!(
            "  • 时长: {:.2}秒, 帧率: {:.2} fps, 采样帧数: {}",
            video_info.duration,
            video_info.fps,
            frames.len()
        );

        if frames.is_empty() {
            warn!("⚠️  [帧分析] 没有需要分析的帧: {}", self.video_path.display());
            return Ok(MediaContext::default());
        }

        let technical_analyzer = if self.enable_technical_analysis {
            Some(
                self.technical_analyzer
                    .clone()
                    .unwrap_or_else(|| Arc::new(TechnicalFrameAnalyzer::new())),
            )
        } else {
            None
        };

        let workspace = ScratchDir::create(&self.work_dir, "frames")?;
        let video_stem = self
            .video_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());

        let mut observations = Vec::with_capacity(frames.len());
        for (ordinal, frame) in frames.iter().enumerate() {
            let frame_start = Instant::now();
            let image = match self.source.decode_frame(&self.video_path, frame.index) {
                Ok(image) => image,
                Err(e) => {
                    warn!(
                        "⚠️  [帧分析] 解码帧 {}（{:.2}秒）失败，跳过: {:#}",
                        frame.index, frame.timestamp, e
                    );
                    continue;
                }
            };

            let frame_path = workspace.join(format!("{}_frame{}.jpg", video_stem, ordinal));
            let description = self.describe_frame(&image, &frame_path);
            let technical_analysis = technical_analyzer
                .as_ref()
                .and_then(|analyzer| analyzer.analyze_frame(&image));

            debug!(
                "帧 {} 分析完成，耗时: {:.2}ms",
                frame.index,
                frame_start.elapsed().as_secs_f64() * 1000.0
            );
            observations.push(FrameObservation {
                frame: *frame,
                description,
                technical_analysis,
            });
        }

        let analysed = observations.len();
        let actions = build_actions(observations, video_info.duration);
        info!(
            "✅ [帧分析] 分析完成，成功 {}/{} 帧，耗时: {:.2}秒",
            analysed,
            frames.len(),
            total_start.elapsed().as_secs_f64()
        );

        Ok(MediaContext::new(actions))
    }

    /// 保存帧图片并调用语义分析函数，任何失败都转成描述文本
    fn describe_frame(&self, image: &RgbImage, frame_path: &Path) -> String {
        if let Err(e) = image.save(frame_path) {
            warn!("⚠️  [帧分析] 保存帧图片失败: {} - {}", frame_path.display(), e);
            return failure_description(frame_path, &e.to_string());
        }

        let analysis_fn = &self.analysis_fn;
        match panic::catch_unwind(AssertUnwindSafe(|| analysis_fn(frame_path))) {
            Ok(Ok(description)) => description,
            Ok(Err(e)) => {
                warn!("⚠️  [帧分析] 语义分析失败: {} - {:#}", frame_path.display(), e);
                failure_description(frame_path, &format!("{:#}", e))
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!("⚠️  [帧分析] 语义分析异常退出: {} - {}", frame_path.display(), reason);
                failure_description(frame_path, &reason)
            }
        }
    }
}

impl MediaAnalysis for FrameSelectionAnalysis {
    fn analyse(&self) -> anyhow::Result<MediaContext> {
        Ok(self.run()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captioner::placeholder_frame_fn;
    use crate::frame_selection::PeriodicSelectionStrategy;
    use crate::video_processor::VideoInfo;
    use image::{ImageBuffer, Rgb};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockSource {
        info: VideoInfo,
        failing: HashSet<u64>,
        decoded: Mutex<Vec<u64>>,
    }

    impl MockSource {
        fn new(duration: f64, fps: f64) -> Self {
            Self {
                info: VideoInfo {
                    duration,
                    fps,
                    width: 16,
                    height: 16,
                    has_audio: false,
                },
                failing: HashSet::new(),
                decoded: Mutex::new(Vec::new()),
            }
        }

        fn failing_on(mut self, index: u64) -> Self {
            self.failing.insert(index);
            self
        }
    }

    impl VideoSource for MockSource {
        fn video_info(&self, _path: &Path) -> anyhow::Result<VideoInfo> {
            Ok(self.info.clone())
        }

        fn decode_frame(&self, _path: &Path, index: u64) -> anyhow::Result<RgbImage> {
            self.decoded.lock().unwrap().push(index);
            if self.failing.contains(&index) {
                anyhow::bail!("corrupt packet at frame {}", index);
            }
            let shade = (index % 256) as u8;
            Ok(ImageBuffer::from_fn(16, 16, |x, _| Rgb([shade, (x * 10) as u8, 40])))
        }
    }

    struct BrokenSource;

    impl VideoSource for BrokenSource {
        fn video_info(&self, _path: &Path) -> anyhow::Result<VideoInfo> {
            anyhow::bail!("moov atom not found")
        }

        fn decode_frame(&self, _path: &Path, _index: u64) -> anyhow::Result<RgbImage> {
            anyhow::bail!("unreachable")
        }
    }

    fn analysis(
        source: Arc<MockSource>,
        period: f64,
        analysis_fn: FrameAnalysisFn,
        work_dir: &Path,
    ) -> FrameSelectionAnalysis {
        let strategy =
            PeriodicSelectionStrategy::new(period, source.info.duration, source.info.fps).unwrap();
        FrameSelectionAnalysis::new("clip.mp4", analysis_fn, Box::new(strategy), source)
            .with_work_dir(work_dir)
    }

    fn starts_and_ends(context: &MediaContext) -> (Vec<f64>, Vec<f64>) {
        (
            context.actions.iter().map(|a| a.start).collect(),
            context.actions.iter().map(|a| a.end).collect(),
        )
    }

    fn frame(index: u64, timestamp: f64) -> FrameObservation {
        FrameObservation {
            frame: FrameInfo { index, timestamp },
            description: format!("frame {}", index),
            technical_analysis: None,
        }
    }

    #[test]
    fn test_build_actions_midpoints() {
        let observations = vec![frame(0, 0.0), frame(60, 2.0), frame(120, 4.0), frame(180, 6.0), frame(240, 8.0)];
        let actions = build_actions(observations, 10.0);
        let starts: Vec<f64> = actions.iter().map(|a| a.start).collect();
        let ends: Vec<f64> = actions.iter().map(|a| a.end).collect();
        assert_eq!(starts, vec![0.0, 1.0, 3.0, 5.0, 7.0]);
        assert_eq!(ends, vec![1.0, 3.0, 5.0, 7.0, 10.0]);
    }

    #[test]
    fn test_build_actions_irregular_sampling_is_contiguous() {
        let observations = vec![frame(0, 0.0), frame(7, 0.3), frame(100, 4.1), frame(101, 4.2)];
        let context = MediaContext::new(build_actions(observations, 5.0));
        assert!(context.covers(5.0));
        assert!(context.actions.iter().all(|a| a.end > a.start));
    }

    #[test]
    fn test_build_actions_single_and_empty() {
        let actions = build_actions(vec![frame(0, 0.0)], 0.4);
        assert_eq!(actions.len(), 1);
        assert_eq!((actions[0].start, actions[0].end), (0.0, 0.4));
        assert!(build_actions(Vec::new(), 10.0).is_empty());
    }

    #[test]
    fn test_ten_second_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockSource::new(10.0, 30.0));
        let context = analysis(source.clone(), 2.0, placeholder_frame_fn(), dir.path())
            .run()
            .unwrap();

        let (starts, ends) = starts_and_ends(&context);
        assert_eq!(starts, vec![0.0, 1.0, 3.0, 5.0, 7.0]);
        assert_eq!(ends, vec![1.0, 3.0, 5.0, 7.0, 10.0]);
        assert_eq!(*source.decoded.lock().unwrap(), vec![0, 60, 120, 180, 240]);

        match &context.actions[2].content {
            ActionContent::Frame {
                description,
                frame_index,
                frame_timestamp,
            } => {
                assert_eq!(description, "Frame analysis for clip_frame2.jpg");
                assert_eq!(*frame_index, 120);
                assert_eq!(*frame_timestamp, 4.0);
            }
            other => panic!("unexpected content: {:?}", other),
        }
        assert!(context.actions.iter().all(|a| a.technical_analysis.is_some()));
    }

    #[test]
    fn test_decode_failure_skips_frame() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockSource::new(10.0, 30.0).failing_on(120));
        let context = analysis(source, 2.0, placeholder_frame_fn(), dir.path())
            .run()
            .unwrap();

        let (starts, ends) = starts_and_ends(&context);
        assert_eq!(starts, vec![0.0, 1.0, 4.0, 7.0]);
        assert_eq!(ends, vec![1.0, 4.0, 7.0, 10.0]);
    }

    #[test]
    fn test_failing_analysis_keeps_action() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let analysis_fn: FrameAnalysisFn = Arc::new(move |path: &Path| -> anyhow::Result<String> {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                anyhow::bail!("CUDA out of memory")
            }
            Ok(format!("ok {}", path.display()))
        });

        let source = Arc::new(MockSource::new(10.0, 30.0));
        let context = analysis(source, 2.0, analysis_fn, dir.path()).run().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(context.len(), 5);
        assert_eq!(
            context.actions[1].content.text(),
            "Frame analysis failed for clip_frame1.jpg (Error: CUDA out of memory)"
        );
        assert!(context.actions[0].content.text().starts_with("ok "));
        let (starts, ends) = starts_and_ends(&context);
        assert_eq!(starts, vec![0.0, 1.0, 3.0, 5.0, 7.0]);
        assert_eq!(ends, vec![1.0, 3.0, 5.0, 7.0, 10.0]);
        assert!(context.actions[1].technical_analysis.is_some());
    }

    #[test]
    fn test_panicking_analysis_keeps_action() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let analysis_fn: FrameAnalysisFn = Arc::new(move |_path: &Path| -> anyhow::Result<String> {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                panic!("model crashed");
            }
            Ok("fine".to_string())
        });

        let source = Arc::new(MockSource::new(4.0, 30.0));
        let context = analysis(source, 1.0, analysis_fn, dir.path()).run().unwrap();

        assert_eq!(context.len(), 4);
        assert_eq!(
            context.actions[1].content.text(),
            "Frame analysis failed for clip_frame1.jpg (Error: model crashed)"
        );
        assert_eq!(context.actions[2].content.text(), "fine");
    }

    #[test]
    fn test_technical_analysis_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockSource::new(10.0, 30.0));
        let enabled = analysis(source.clone(), 2.0, placeholder_frame_fn(), dir.path())
            .run()
            .unwrap();
        let disabled = analysis(source, 2.0, placeholder_frame_fn(), dir.path())
            .with_technical_analysis(false)
            .run()
            .unwrap();

        assert!(disabled.actions.iter().all(|a| a.technical_analysis.is_none()));
        assert_eq!(starts_and_ends(&enabled), starts_and_ends(&disabled));
        for (a, b) in enabled.actions.iter().zip(&disabled.actions) {
            assert_eq!(a.content, b.content);
        }
    }

    #[test]
    fn test_injected_technical_analyzer_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockSource::new(2.0, 30.0));
        let context = analysis(source, 1.0, placeholder_frame_fn(), dir.path())
            .with_technical_analyzer(Arc::new(TechnicalFrameAnalyzer::new()))
            .run()
            .unwrap();
        let metrics = context.actions[0].technical_analysis.as_ref().unwrap();
        assert!(metrics.brightness > 0.0);
    }

    struct PanickingLens;

    impl crate::technical_analyzer::LensClassifier for PanickingLens {
        fn predict(&self, _frame: &RgbImage) -> anyhow::Result<i64> {
            panic!("lens model crashed")
        }
    }

    #[test]
    fn test_panicking_sub_model_keeps_run_alive() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockSource::new(3.0, 30.0));
        let analyzer = TechnicalFrameAnalyzer::new().with_lens_classifier(Box::new(PanickingLens));
        let context = analysis(source, 1.0, placeholder_frame_fn(), dir.path())
            .with_technical_analyzer(Arc::new(analyzer))
            .run()
            .unwrap();

        assert_eq!(context.len(), 3);
        for action in &context.actions {
            let metrics = action.technical_analysis.as_ref().unwrap();
            assert!(metrics.lens_type.is_none());
        }
    }

    #[test]
    fn test_evenly_spaced_short_clip_has_no_empty_actions() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockSource::new(0.2, 30.0));
        let strategy = crate::frame_selection::EvenlySpacedSelectionStrategy::new(10, 0.2, 30.0).unwrap();
        let context = FrameSelectionAnalysis::new(
            "short.mp4",
            placeholder_frame_fn(),
            Box::new(strategy),
            source.clone(),
        )
        .with_technical_analysis(false)
        .with_work_dir(dir.path())
        .run()
        .unwrap();

        assert_eq!(context.len(), 6);
        assert!(context.actions.iter().all(|a| a.end > a.start));
        assert!(context.covers(0.2));
        assert_eq!(*source.decoded.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_all_frames_fail_gives_empty_context() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockSource::new(2.0, 10.0).failing_on(0).failing_on(10));
        let context = analysis(source, 1.0, placeholder_frame_fn(), dir.path())
            .run()
            .unwrap();
        assert!(context.is_empty());
    }

    #[test]
    fn test_zero_duration_gives_empty_context() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockSource::new(0.0, 30.0));
        let context = analysis(source.clone(), 1.0, placeholder_frame_fn(), dir.path())
            .run()
            .unwrap();
        assert!(context.is_empty());
        assert!(source.decoded.lock().unwrap().is_empty());
    }

    #[test]
    fn test_single_frame_spans_whole_video() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockSource::new(0.5, 30.0));
        let context = analysis(source, 1.0, placeholder_frame_fn(), dir.path())
            .run()
            .unwrap();
        assert_eq!(context.len(), 1);
        assert_eq!(starts_and_ends(&context), (vec![0.0], vec![0.5]));
    }

    #[test]
    fn test_workspace_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockSource::new(3.0, 30.0));
        analysis(source, 1.0, placeholder_frame_fn(), dir.path())
            .run()
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_metadata_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = PeriodicSelectionStrategy::new(1.0, 5.0, 30.0).unwrap();
        let analysis = FrameSelectionAnalysis::new(
            "broken.mp4",
            placeholder_frame_fn(),
            Box::new(strategy),
            Arc::new(BrokenSource),
        )
        .with_work_dir(dir.path());

        let err = analysis.run().unwrap_err();
        assert!(matches!(err, AnalysisError::VideoMetadata(_)));
        assert!(analysis.analyse().is_err());
    }
}
