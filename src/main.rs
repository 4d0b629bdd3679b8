use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::RgbImage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use semantic_video_parse::{
    analyze_videos,
    audio_analysis::AudioTranscriptionAnalysis,
    config::{AnalysisConfig, CliOverrides, ConfigLoader},
    handler::TranscriberFactory,
    mcp_server, server,
    workspace::ScratchDir,
    AnalyzeAudioHandler, AnalyzeVideoHandler, BatchOptions, CaptionModel, FfmpegAudioSource,
    FfmpegVideoSource, HandlerChain, PipelineServices, SelectionMode, TechnicalFrameAnalyzer,
    ToolHandler, Transcriber, VideoSource, WhisperCliTranscriber,
};

/// 语义视频分析工具 - 帧描述、语音识别和画面技术指标
#[derive(Parser, Debug)]
#[command(name = "semantic-video-parse")]
#[command(about = "语义视频分析：采样帧描述、语音识别、画面技术质量分析", long_about = None)]
struct Args {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 加载字幕模型并用一张测试图片验证
    Init {
        /// 同时写出一份默认配置文件
        #[arg(long)]
        write_config: Option<PathBuf>,
    },
    /// CLI 模式：分析本地视频文件，每个视频输出一份描述 JSON
    Analyze {
        /// 输入视频文件路径
        #[arg(required = true)]
        videos: Vec<PathBuf>,

        /// 采样周期（秒），可通过环境变量 SVP_PERIOD 或配置文件设置
        #[arg(long, conflicts_with = "frames")]
        period: Option<f64>,

        /// 在整个视频上均匀采样的帧数
        #[arg(long)]
        frames: Option<u32>,

        /// 输出目录
        #[arg(short, long, default_value = "./output")]
        output_dir: PathBuf,

        /// 关闭技术分析
        #[arg(long)]
        no_technical: bool,

        /// 关闭语音识别
        #[arg(long)]
        no_audio: bool,
    },
    /// 只做语音识别，输出 JSON
    Transcribe {
        /// 输入视频文件路径
        video: PathBuf,

        /// Whisper 模型名称
        #[arg(long)]
        model: Option<String>,
    },
    /// MCP 模式：通过标准输入输出提供工具
    Mcp,
    /// Web 服务模式：通过 HTTP 提供工具
    Serve {
        /// 监听地址（默认从环境变量 FC_SERVER_PORT 读取，如果不存在则使用 0.0.0.0:9000）
        #[arg(short, long)]
        bind: Option<String>,
    },
}

impl Commands {
    fn overrides(&self) -> CliOverrides {
        match self {
            Commands::Analyze {
                period,
                no_technical,
                ..
            } => CliOverrides {
                period: *period,
                enable_technical_analysis: no_technical.then_some(false),
                ..Default::default()
            },
            Commands::Transcribe { model, .. } => CliOverrides {
                whisper_model: model.clone(),
                ..Default::default()
            },
            _ => CliOverrides::default(),
        }
    }
}

fn init_logging(config: &AnalysisConfig, to_stderr: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // MCP 模式下标准输出只能用于协议消息
    if to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

fn transcriber_factory(config: &AnalysisConfig) -> TranscriberFactory {
    let command = config.transcription.whisper_command.clone();
    Arc::new(move |model: &str| -> Arc<dyn Transcriber> {
        Arc::new(WhisperCliTranscriber::new(command.clone(), model))
    })
}

fn build_chain(config: &AnalysisConfig, model: &CaptionModel) -> Result<HandlerChain> {
    let video_source: Arc<dyn VideoSource> = Arc::new(FfmpegVideoSource::new()?);
    let technical_analyzer = Arc::new(TechnicalFrameAnalyzer::from_config(&config.models));

    let handlers: Vec<Arc<dyn ToolHandler>> = vec![
        Arc::new(
            AnalyzeVideoHandler::new(video_source, model.frame_analysis_fn(), technical_analyzer)
                .with_default_period(config.period)
                .with_default_technical_analysis(config.enable_technical_analysis)
                .with_work_dir(&config.work_dir),
        ),
        Arc::new(
            AnalyzeAudioHandler::new(Arc::new(FfmpegAudioSource::default()), transcriber_factory(config))
                .with_default_model(config.transcription.model.clone())
                .with_work_dir(&config.work_dir),
        ),
    ];
    Ok(HandlerChain::of(handlers))
}

fn run_init(config: &AnalysisConfig, model: &CaptionModel, write_config: Option<PathBuf>) -> Result<()> {
    if let Some(path) = write_config {
        ConfigLoader::create_default_config(&path).context("写入默认配置失败")?;
        println!("已写出默认配置: {}", path.display());
    }

    let scratch = ScratchDir::create(&config.work_dir, "init")?;
    let test_image = scratch.join("test.jpg");
    RgbImage::new(224, 224).save(&test_image).context("写入测试图片失败")?;

    let caption = model.caption(&test_image).context("字幕模型测试失败")?;
    println!("字幕模型: {}", model.name());
    println!("测试描述: {}", caption);
    if model.is_placeholder() {
        println!("提示: 未配置字幕模型（caption.endpoint / caption.command），将使用占位描述");
    }
    Ok(())
}

fn run_command(command: Commands, config: &AnalysisConfig, model: &CaptionModel) -> Result<()> {
    match command {
        Commands::Init { write_config } => run_init(config, model, write_config),
        Commands::Analyze {
            videos,
            frames,
            output_dir,
            no_audio,
            ..
        } => {
            let selection = match frames {
                Some(count) => SelectionMode::FrameCount(count),
                None => SelectionMode::Period(config.period),
            };
            println!(
                "使用配置: selection={:?}, technical={}, audio={}",
                selection, config.enable_technical_analysis, !no_audio
            );

            let options = BatchOptions {
                selection,
                enable_technical_analysis: config.enable_technical_analysis,
                enable_audio: !no_audio,
                work_dir: config.work_dir.clone(),
            };
            let services = PipelineServices {
                video_source: Arc::new(FfmpegVideoSource::new()?),
                analysis_fn: model.frame_analysis_fn(),
                technical_analyzer: Arc::new(TechnicalFrameAnalyzer::from_config(&config.models)),
                audio_source: Arc::new(FfmpegAudioSource::default()),
                transcriber: Arc::new(WhisperCliTranscriber::new(
                    config.transcription.whisper_command.clone(),
                    config.transcription.model.clone(),
                )),
            };

            let written =
                analyze_videos(&videos, &output_dir, &options, &services).context("分析视频失败")?;
            for path in written {
                println!("已生成: {}", path.display());
            }
            Ok(())
        }
        Commands::Transcribe { video, .. } => {
            let analysis = AudioTranscriptionAnalysis::new(
                &video,
                Arc::new(FfmpegAudioSource::default()),
                Arc::new(WhisperCliTranscriber::new(
                    config.transcription.whisper_command.clone(),
                    config.transcription.model.clone(),
                )),
            )
            .with_work_dir(&config.work_dir);
            let transcription = analysis.transcribe().context("语音识别失败")?;
            println!("{}", serde_json::to_string_pretty(&analysis.summarize(transcription))?);
            Ok(())
        }
        Commands::Mcp => {
            let chain = build_chain(config, model)?;
            let runtime = tokio::runtime::Runtime::new().context("创建 tokio 运行时失败")?;
            runtime.block_on(mcp_server::run_stdio(chain))
        }
        Commands::Serve { bind } => {
            // 优先使用命令行参数，其次使用环境变量 FC_SERVER_PORT，最后使用默认值 9000
            let bind_addr = bind.unwrap_or_else(|| {
                std::env::var("FC_SERVER_PORT")
                    .map(|port| format!("0.0.0.0:{}", port))
                    .unwrap_or_else(|_| "0.0.0.0:9000".to_string())
            });
            let chain = build_chain(config, model)?;
            let runtime = tokio::runtime::Runtime::new().context("创建 tokio 运行时失败")?;
            runtime.block_on(server::start_web_server(chain, &bind_addr))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = ConfigLoader::load_config(args.config.as_deref(), &args.command.overrides())
        .context("加载配置失败")?;
    init_logging(&config, matches!(args.command, Commands::Mcp));

    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("创建工作目录失败: {}", config.work_dir.display()))?;

    // 字幕模型在整个命令期间只加载一次，命令结束后无论成功与否都释放
    let model = CaptionModel::load(&config.caption).context("加载字幕模型失败")?;
    let result = run_command(args.command, &config, &model);
    model.release();

    if let Err(e) = &result {
        tracing::error!("❌ 执行失败: {:#}", e);
    }
    result
}
