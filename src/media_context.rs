use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::technical_analyzer::TechnicalMetrics;

/// Action 的语义内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionContent {
    /// 采样帧的描述
    Frame {
        description: String,
        frame_index: u64,
        frame_timestamp: f64,
    },
    /// 语音识别片段
    Speech { text: String },
}

impl ActionContent {
    pub fn text(&self) -> &str {
        match self {
            ActionContent::Frame { description, .. } => description,
            ActionContent::Speech { text } => text,
        }
    }
}

/// 视频中一段时间区间的语义和技术标注
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub start: f64,
    pub end: f64,
    pub content: ActionContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_analysis: Option<TechnicalMetrics>,
}

impl Action {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// 按开始时间排序的 Action 列表
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaContext {
    pub actions: Vec<Action>,
}

impl MediaContext {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// 是否无间隙、无重叠地覆盖 `[0, duration]`
    pub fn covers(&self, duration: f64) -> bool {
        let (Some(first), Some(last)) = (self.actions.first(), self.actions.last()) else {
            return false;
        };
        first.start == 0.0
            && last.end == duration
            && self.actions.windows(2).all(|w| w[0].end == w[1].start)
    }

    pub fn summarize(&self, video_path: impl Into<String>, analysis_period: f64) -> VideoAnalysisSummary {
        let actions: Vec<ActionSummary> = self.actions.iter().map(ActionSummary::from).collect();
        VideoAnalysisSummary {
            video_path: video_path.into(),
            analysis_period,
            total_actions: actions.len(),
            actions,
        }
    }
}

/// 可插拔的分析来源：帧采样分析、纯音频分析等
pub trait MediaAnalysis {
    fn analyse(&self) -> Result<MediaContext>;
}

/// 工具返回结果中的单个 Action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub start: f64,
    pub end: f64,
    pub duration: f64,
    pub content: ActionContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technical_analysis: Option<TechnicalMetrics>,
}

impl From<&Action> for ActionSummary {
    fn from(action: &Action) -> Self {
        Self {
            start: action.start,
            end: action.end,
            duration: action.duration(),
            content: action.content.clone(),
            technical_analysis: action.technical_analysis.clone(),
        }
    }
}

/// 视频分析工具的返回结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoAnalysisSummary {
    pub video_path: String,
    pub analysis_period: f64,
    pub total_actions: usize,
    pub actions: Vec<ActionSummary>,
}
