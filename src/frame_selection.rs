use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AnalysisError, AnalysisResult};
use crate::video_processor::VideoSource;

/// 被选中的采样帧：帧序号 + 时间戳（秒）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub index: u64,
    pub timestamp: f64,
}

/// 帧选择策略
///
/// 返回按时间戳递增排列的采样帧。编排器只依赖这个接口，
/// 因此可以替换为场景切换检测等其他策略。
pub trait FrameSelectionStrategy: Send + Sync {
    fn select_frames(&self) -> Vec<FrameInfo>;
}

/// 周期采样策略：从 0 秒开始，每隔 `period` 秒取一帧
#[derive(Debug, Clone)]
pub struct PeriodicSelectionStrategy {
    period: f64,
    duration: f64,
    fps: f64,
}

impl PeriodicSelectionStrategy {
    pub fn new(period: f64, duration: f64, fps: f64) -> AnalysisResult<Self> {
        // NaN 也会在这里被拒绝
        if !(period > 0.0) {
            return Err(AnalysisError::InvalidPeriod(period));
        }
        Ok(Self {
            period,
            duration,
            fps,
        })
    }

    /// 从视频文件读取时长和帧率来构建策略
    pub fn from_video_file(
        video_path: impl AsRef<Path>,
        period: f64,
        source: &dyn VideoSource,
    ) -> AnalysisResult<Self> {
        if !(period > 0.0) {
            return Err(AnalysisError::InvalidPeriod(period));
        }
        let info = source
            .video_info(video_path.as_ref())
            .map_err(|e| AnalysisError::VideoMetadata(format!("{:#}", e)))?;
        Self::new(period, info.duration, info.fps)
    }

    pub fn period(&self) -> f64 {
        self.period
    }
}

impl FrameSelectionStrategy for PeriodicSelectionStrategy {
    fn select_frames(&self) -> Vec<FrameInfo> {
        let mut frames = Vec::new();
        let mut k: u64 = 0;

        loop {
            // 时间戳取 k * period，不做累加
            let timestamp = k as f64 * self.period;
            if timestamp >= self.duration {
                break;
            }
            frames.push(FrameInfo {
                index: (timestamp * self.fps).floor() as u64,
                timestamp,
            });
            k += 1;
        }

        frames
    }
}

/// 均匀采样策略：在整段视频上均匀取固定数量的帧
#[derive(Debug, Clone)]
pub struct EvenlySpacedSelectionStrategy {
    frame_count: u32,
    duration: f64,
    fps: f64,
}

impl EvenlySpacedSelectionStrategy {
    pub fn new(frame_count: u32, duration: f64, fps: f64) -> AnalysisResult<Self> {
        if frame_count == 0 {
            return Err(AnalysisError::InvalidFrameCount);
        }
        Ok(Self {
            frame_count,
            duration,
            fps,
        })
    }

    pub fn from_video_file(
        video_path: impl AsRef<Path>,
        frame_count: u32,
        source: &dyn VideoSource,
    ) -> AnalysisResult<Self> {
        if frame_count == 0 {
            return Err(AnalysisError::InvalidFrameCount);
        }
        let info = source
            .video_info(video_path.as_ref())
            .map_err(|e| AnalysisError::VideoMetadata(format!("{:#}", e)))?;
        Self::new(frame_count, info.duration, info.fps)
    }

    fn total_frames(&self) -> u64 {
        if self.duration <= 0.0 || self.fps <= 0.0 {
            return 0;
        }
        (self.duration * self.fps).floor() as u64
    }
}

impl FrameSelectionStrategy for EvenlySpacedSelectionStrategy {
    fn select_frames(&self) -> Vec<FrameInfo> {
        let total_frames = self.total_frames();
        if total_frames == 0 {
            return Vec::new();
        }

        let count = self.frame_count as u64;
        let mut frames: Vec<FrameInfo> = Vec::with_capacity(count.min(total_frames) as usize);
        for i in 0..count {
            let index = i * total_frames / count;
            // 帧数多于视频总帧数时索引会重复，同一帧只取一次
            if frames.last().is_some_and(|f| f.index == index) {
                continue;
            }
            frames.push(FrameInfo {
                index,
                timestamp: index as f64 / self.fps,
            });
        }
        frames
    }
}
