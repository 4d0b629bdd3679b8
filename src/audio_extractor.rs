use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// 音频提取器，从视频中提取音轨供语音识别使用
pub struct AudioExtractor {
    input_path: PathBuf,
    ffmpeg_bin: String,
}

impl AudioExtractor {
    pub fn new(input_path: impl AsRef<Path>) -> Result<Self> {
        let input_path = input_path.as_ref();
        if !input_path.exists() {
            anyhow::bail!("视频文件不存在: {}", input_path.display());
        }
        Ok(Self {
            input_path: input_path.to_path_buf(),
            ffmpeg_bin: "ffmpeg".to_string(),
        })
    }

    /// 指定 ffmpeg 可执行文件路径
    pub fn with_ffmpeg(mut self, ffmpeg_bin: impl Into<String>) -> Self {
        self.ffmpeg_bin = ffmpeg_bin.into();
        self
    }

    /// 提取音频到 WAV 文件（16kHz 单声道 16 位 PCM，Whisper 的输入格式）
    pub fn extract_to_file(&self, output_path: impl AsRef<Path>) -> Result<PathBuf> {
        let output_path = output_path.as_ref();

        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                anyhow::bail!("输出目录不存在: {}", parent.display());
            }
        }

        let args = self.build_args(output_path);
        debug!("执行: {} {:?}", self.ffmpeg_bin, args);

        let output = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .output()
            .context("执行 ffmpeg 命令失败")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("音频提取失败: {}", stderr.trim());
        }

        Ok(output_path.to_path_buf())
    }

    fn build_args(&self, output_path: &Path) -> Vec<String> {
        vec![
            "-loglevel".to_string(),
            "error".to_string(), // 只显示错误信息
            "-i".to_string(),
            self.input_path.to_string_lossy().to_string(),
            "-vn".to_string(), // 不包含视频
            "-ar".to_string(),
            "16000".to_string(),
            "-ac".to_string(),
            "1".to_string(),
            "-c:a".to_string(),
            "pcm_s16le".to_string(),
            "-y".to_string(), // 覆盖输出文件
            output_path.to_string_lossy().to_string(),
        ]
    }
}

/// 音轨提取：把视频的音轨写成 WAV 文件，返回写入的路径
pub trait AudioTrackSource: Send + Sync {
    fn extract(&self, video_path: &Path, output_path: &Path) -> Result<PathBuf>;
}

/// 基于 ffmpeg 命令行的音轨提取
#[derive(Debug, Clone)]
pub struct FfmpegAudioSource {
    ffmpeg_bin: String,
}

impl Default for FfmpegAudioSource {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
        }
    }
}

impl FfmpegAudioSource {
    pub fn new(ffmpeg_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
        }
    }
}

impl AudioTrackSource for FfmpegAudioSource {
    fn extract(&self, video_path: &Path, output_path: &Path) -> Result<PathBuf> {
        AudioExtractor::new(video_path)?
            .with_ffmpeg(self.ffmpeg_bin.clone())
            .extract_to_file(output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_input_is_rejected() {
        assert!(AudioExtractor::new("/nonexistent/video.mp4").is_err());
    }

    #[test]
    fn test_args_request_whisper_format() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"").unwrap();

        let extractor = AudioExtractor::new(&video).unwrap();
        let args = extractor.build_args(&dir.path().join("audio.wav"));
        let joined = args.join(" ");
        assert!(joined.contains("-vn"));
        assert!(joined.contains("-ar 16000"));
        assert!(joined.contains("-ac 1"));
        assert!(joined.contains("-c:a pcm_s16le"));
        assert!(joined.ends_with("audio.wav"));
    }

    #[test]
    fn test_ffmpeg_source_rejects_missing_video() {
        let dir = tempfile::tempdir().unwrap();
        let source = FfmpegAudioSource::default();
        let result = source.extract(Path::new("/nonexistent/video.mp4"), &dir.path().join("audio.wav"));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_output_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"").unwrap();

        let extractor = AudioExtractor::new(&video).unwrap();
        let result = extractor.extract_to_file(dir.path().join("missing").join("audio.wav"));
        assert!(result.is_err());
    }
}
