use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use serde::Serialize;
use std::path::Path;
use std::sync::Once;
use tracing::debug;

/// 视频基本信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoInfo {
    /// 时长（秒）
    pub duration: f64,
    /// 平均帧率
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
}

/// 视频源：读取元数据并按帧序号解码单帧
///
/// 解码得到的像素为 RGB 顺序。
pub trait VideoSource: Send + Sync {
    fn video_info(&self, path: &Path) -> Result<VideoInfo>;

    fn decode_frame(&self, path: &Path, index: u64) -> Result<RgbImage>;
}

static FFMPEG_INIT: Once = Once::new();

/// 初始化 FFmpeg，并把日志级别设为 ERROR，抑制警告和信息消息
fn init_ffmpeg() -> Result<()> {
    ffmpeg::init().context("初始化 FFmpeg 失败")?;
    FFMPEG_INIT.call_once(|| {
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
    });
    Ok(())
}

/// 基于 FFmpeg 的视频源
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegVideoSource;

impl FfmpegVideoSource {
    pub fn new() -> Result<Self> {
        init_ffmpeg()?;
        Ok(Self)
    }
}

impl VideoSource for FfmpegVideoSource {
    fn video_info(&self, path: &Path) -> Result<VideoInfo> {
        let ictx = ffmpeg::format::input(&path)
            .with_context(|| format!("无法打开视频文件: {}", path.display()))?;

        let video_stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("未找到视频流")?;

        let decoder_context =
            ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
                .context("无法创建解码器上下文")?;
        let decoder = decoder_context
            .decoder()
            .video()
            .context("无法创建视频解码器")?;

        let rate = video_stream.avg_frame_rate();
        let fps = if rate.denominator() > 0 && rate.numerator() > 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            30.0 // 默认值
        };

        let duration = if ictx.duration() > 0 {
            ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
        } else {
            0.0
        };

        let has_audio = ictx.streams().best(ffmpeg::media::Type::Audio).is_some();

        Ok(VideoInfo {
            duration,
            fps,
            width: decoder.width(),
            height: decoder.height(),
            has_audio,
        })
    }

    fn decode_frame(&self, path: &Path, index: u64) -> Result<RgbImage> {
        let mut ictx = ffmpeg::format::input(&path)
            .with_context(|| format!("无法打开视频文件: {}", path.display()))?;

        let (video_stream_index, time_base, fps, parameters) = {
            let stream = ictx
                .streams()
                .best(ffmpeg::media::Type::Video)
                .context("未找到视频流")?;
            let rate = stream.avg_frame_rate();
            let fps = if rate.denominator() > 0 && rate.numerator() > 0 {
                rate.numerator() as f64 / rate.denominator() as f64
            } else {
                30.0
            };
            (stream.index(), stream.time_base(), fps, stream.parameters())
        };

        let mut decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
            .context("无法创建解码器上下文")?
            .decoder()
            .video()
            .context("无法创建视频解码器")?;

        let mut scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .context("无法创建缩放器")?;

        let target_time = index as f64 / fps;
        // 半帧容差，吸收时间戳取整误差
        let tolerance = 0.5 / fps;

        // 向后跳到目标时间之前最近的关键帧
        let seek_ts = (target_time * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;
        if seek_ts > 0 {
            ictx.seek(seek_ts, ..seek_ts)
                .with_context(|| format!("跳转到帧 {} 失败", index))?;
        }

        let frame_seconds = |frame: &ffmpeg::frame::Video| -> Option<f64> {
            frame.timestamp().map(|ts| {
                ts as f64 * time_base.numerator() as f64 / time_base.denominator() as f64
            })
        };

        let mut decoded = ffmpeg::frame::Video::empty();
        for (stream, packet) in ictx.packets() {
            if stream.index() != video_stream_index {
                continue;
            }
            if decoder.send_packet(&packet).is_err() {
                continue;
            }
            while decoder.receive_frame(&mut decoded).is_ok() {
                let reached = frame_seconds(&decoded)
                    .map(|t| t + tolerance >= target_time)
                    .unwrap_or(true);
                if reached {
                    debug!("解码帧 {} 完成", index);
                    return convert_frame(&mut scaler, &decoded);
                }
            }
        }

        // 清空解码器中剩余的帧
        decoder.send_eof().ok();
        while decoder.receive_frame(&mut decoded).is_ok() {
            let reached = frame_seconds(&decoded)
                .map(|t| t + tolerance >= target_time)
                .unwrap_or(true);
            if reached {
                return convert_frame(&mut scaler, &decoded);
            }
        }

        anyhow::bail!("未能解码帧 {}（目标时间 {:.3}秒）", index, target_time)
    }
}

fn convert_frame(
    scaler: &mut ffmpeg::software::scaling::Context,
    decoded: &ffmpeg::frame::Video,
) -> Result<RgbImage> {
    let mut rgb_frame = ffmpeg::frame::Video::empty();
    scaler
        .run(decoded, &mut rgb_frame)
        .context("像素格式转换失败")?;
    frame_to_image(&rgb_frame)
}

/// 将 RGB24 的 FFmpeg 帧转换为 RgbImage
fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage> {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_bytes = width as usize * 3;

    let mut buffer = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let row = data
            .get(start..start + row_bytes)
            .context("帧数据长度不足")?;
        buffer.extend_from_slice(row);
    }

    RgbImage::from_raw(width, height, buffer).context("无法构建 RGB 图像")
}
