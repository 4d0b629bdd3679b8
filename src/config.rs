use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_PERIOD: f64 = 1.0;
pub const DEFAULT_CAPTION_MODEL: &str = "Salesforce/blip-image-captioning-base";
pub const DEFAULT_WHISPER_COMMAND: &str = "whisper";
pub const DEFAULT_WHISPER_MODEL: &str = "large-v3";

/// 字幕模型配置，endpoint 优先于 command
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionConfig {
    pub endpoint: Option<String>,
    pub command: Option<String>,
    pub model: String,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            command: None,
            model: DEFAULT_CAPTION_MODEL.to_string(),
        }
    }
}

/// 语音识别配置
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionConfig {
    pub whisper_command: String,
    pub model: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            whisper_command: DEFAULT_WHISPER_COMMAND.to_string(),
            model: DEFAULT_WHISPER_MODEL.to_string(),
        }
    }
}

/// 技术分析子模型配置
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelConfig {
    /// 镜头分类 SVM 模型（JSON）
    pub lens_model_path: Option<PathBuf>,
    /// 实例分割服务地址，优先于 object_model_command
    pub object_model_endpoint: Option<String>,
    /// 实例分割本地命令
    pub object_model_command: Option<String>,
}

/// 完整配置
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    /// 采样周期（秒）
    pub period: f64,
    pub enable_technical_analysis: bool,
    /// 临时帧文件、音频文件的工作目录
    pub work_dir: PathBuf,
    pub caption: CaptionConfig,
    pub transcription: TranscriptionConfig,
    pub models: ModelConfig,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            enable_technical_analysis: true,
            work_dir: default_work_dir(),
            caption: CaptionConfig::default(),
            transcription: TranscriptionConfig::default(),
            models: ModelConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

fn default_work_dir() -> PathBuf {
    env::temp_dir().join("semantic-video-parse")
}

/// 命令行可以覆盖的配置项
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub period: Option<f64>,
    pub enable_technical_analysis: Option<bool>,
    pub work_dir: Option<PathBuf>,
    pub whisper_model: Option<String>,
}

/// 单一来源（环境变量或配置文件）读到的配置，未设置的项为 None
#[derive(Debug, Clone, Default, PartialEq)]
struct PartialConfig {
    period: Option<f64>,
    enable_technical_analysis: Option<bool>,
    work_dir: Option<PathBuf>,
    caption_endpoint: Option<String>,
    caption_command: Option<String>,
    caption_model: Option<String>,
    whisper_command: Option<String>,
    whisper_model: Option<String>,
    lens_model_path: Option<PathBuf>,
    object_model_endpoint: Option<String>,
    object_model_command: Option<String>,
    log_level: Option<String>,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, cli: &CliOverrides) -> Result<AnalysisConfig> {
        // 1. 先加载配置文件（如果存在）
        let file_config = match config_file {
            Some(path) => Some(Self::load_from_file(path)?),
            // 默认位置找不到配置文件不是错误
            None => Self::load_from_default_locations().ok(),
        };

        // 2. 加载环境变量
        let env_config = Self::load_from_env(|key| env::var(key).ok());

        Ok(Self::merge(cli, &env_config, file_config.as_ref()))
    }

    fn merge(cli: &CliOverrides, env: &PartialConfig, file: Option<&PartialConfig>) -> AnalysisConfig {
        let defaults = AnalysisConfig::default();
        let file = file.cloned().unwrap_or_default();
        let env = env.clone();

        AnalysisConfig {
            period: cli
                .period
                .or(env.period)
                .or(file.period)
                .unwrap_or(defaults.period),
            enable_technical_analysis: cli
                .enable_technical_analysis
                .or(env.enable_technical_analysis)
                .or(file.enable_technical_analysis)
                .unwrap_or(defaults.enable_technical_analysis),
            work_dir: cli
                .work_dir
                .clone()
                .or(env.work_dir)
                .or(file.work_dir)
                .unwrap_or(defaults.work_dir),
            caption: CaptionConfig {
                endpoint: env.caption_endpoint.or(file.caption_endpoint),
                command: env.caption_command.or(file.caption_command),
                model: env
                    .caption_model
                    .or(file.caption_model)
                    .unwrap_or(defaults.caption.model),
            },
            transcription: TranscriptionConfig {
                whisper_command: env
                    .whisper_command
                    .or(file.whisper_command)
                    .unwrap_or(defaults.transcription.whisper_command),
                model: cli
                    .whisper_model
                    .clone()
                    .or(env.whisper_model)
                    .or(file.whisper_model)
                    .unwrap_or(defaults.transcription.model),
            },
            models: ModelConfig {
                lens_model_path: env.lens_model_path.or(file.lens_model_path),
                object_model_endpoint: env.object_model_endpoint.or(file.object_model_endpoint),
                object_model_command: env.object_model_command.or(file.object_model_command),
            },
            log_level: env
                .log_level
                .or(file.log_level)
                .unwrap_or(defaults.log_level),
        }
    }

    /// 从环境变量加载配置
    fn load_from_env(lookup: impl Fn(&str) -> Option<String>) -> PartialConfig {
        PartialConfig {
            period: lookup("SVP_PERIOD").and_then(|v| v.trim().parse().ok()),
            enable_technical_analysis: lookup("SVP_ENABLE_TECHNICAL").and_then(|v| parse_bool(&v)),
            work_dir: lookup("SVP_WORK_DIR").and_then(non_empty).map(PathBuf::from),
            caption_endpoint: lookup("SVP_CAPTION_ENDPOINT").and_then(non_empty),
            caption_command: lookup("SVP_CAPTION_COMMAND").and_then(non_empty),
            caption_model: lookup("SVP_CAPTION_MODEL").and_then(non_empty),
            whisper_command: lookup("SVP_WHISPER_COMMAND").and_then(non_empty),
            whisper_model: lookup("SVP_WHISPER_MODEL").and_then(non_empty),
            lens_model_path: lookup("SVP_LENS_MODEL").and_then(non_empty).map(PathBuf::from),
            object_model_endpoint: lookup("SVP_OBJECT_MODEL_ENDPOINT").and_then(non_empty),
            object_model_command: lookup("SVP_OBJECT_MODEL_COMMAND").and_then(non_empty),
            log_level: lookup("LOG_LEVEL").and_then(non_empty),
        }
    }

    /// 从INI配置文件加载配置
    fn load_from_file(config_path: &Path) -> Result<PartialConfig> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut config_parser = configparser::ini::Ini::new();
        config_parser
            .load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        // [analysis] 节没有的项从 [DEFAULT] 节读取
        let analysis = |key: &str| {
            config_parser
                .get("analysis", key)
                .or_else(|| config_parser.get("DEFAULT", key))
                .and_then(non_empty)
        };
        let section = |section: &str, key: &str| config_parser.get(section, key).and_then(non_empty);

        Ok(PartialConfig {
            period: analysis("period").and_then(|v| v.parse().ok()),
            enable_technical_analysis: analysis("enable_technical_analysis").and_then(|v| parse_bool(&v)),
            work_dir: analysis("work_dir").map(PathBuf::from),
            caption_endpoint: section("caption", "endpoint"),
            caption_command: section("caption", "command"),
            caption_model: section("caption", "model"),
            whisper_command: section("transcription", "whisper_command"),
            whisper_model: section("transcription", "model"),
            lens_model_path: section("models", "lens_model_path").map(PathBuf::from),
            object_model_endpoint: section("models", "object_model_endpoint"),
            object_model_command: section("models", "object_model_command"),
            log_level: section("logging", "level").or_else(|| section("DEFAULT", "log_level")),
        })
    }

    /// 从默认位置加载配置文件
    fn load_from_default_locations() -> Result<PartialConfig> {
        for candidate in Self::default_locations() {
            if candidate.exists() {
                return Self::load_from_file(&candidate);
            }
        }
        Err(anyhow::anyhow!("未找到配置文件"))
    }

    fn default_locations() -> Vec<PathBuf> {
        let mut locations = vec![
            // 1. 当前目录的 semantic-video-parse.ini
            PathBuf::from("semantic-video-parse.ini"),
            // 2. 当前目录的 .semantic-video-parse.ini
            PathBuf::from(".semantic-video-parse.ini"),
        ];
        // 3. 用户主目录的 .semantic-video-parse.ini
        if let Some(home) = env::var_os("HOME") {
            locations.push(PathBuf::from(home).join(".semantic-video-parse.ini"));
        }
        // 4. /etc/semantic-video-parse.ini (Linux/macOS)
        locations.push(PathBuf::from("/etc/semantic-video-parse.ini"));
        locations
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let mut config_parser = configparser::ini::Ini::new();
        config_parser.set("analysis", "period", Some(DEFAULT_PERIOD.to_string()));
        config_parser.set("analysis", "enable_technical_analysis", Some("true".to_string()));
        config_parser.set("analysis", "work_dir", Some("".to_string()));
        config_parser.set("caption", "endpoint", Some("".to_string()));
        config_parser.set("caption", "command", Some("".to_string()));
        config_parser.set("caption", "model", Some(DEFAULT_CAPTION_MODEL.to_string()));
        config_parser.set("transcription", "whisper_command", Some(DEFAULT_WHISPER_COMMAND.to_string()));
        config_parser.set("transcription", "model", Some(DEFAULT_WHISPER_MODEL.to_string()));
        config_parser.set("models", "lens_model_path", Some("".to_string()));
        config_parser.set("models", "object_model_endpoint", Some("".to_string()));
        config_parser.set("models", "object_model_command", Some("".to_string()));
        config_parser.set("logging", "level", Some("info".to_string()));

        let content = format!(
            "; semantic-video-parse 配置文件\n\
             ; 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值\n\
             ; 留空的项使用默认值\n\n{}",
            config_parser.writes()
        );
        std::fs::write(config_path, content)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}
