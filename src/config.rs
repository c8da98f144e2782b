//! 配置 - 命令行参数 + 可选JSON配置文件
//!
//! 优先级: 命令行 > 配置文件 > 默认值

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::detection::{default_vehicle_labels, DEFAULT_MIN_CONFIDENCE, VEHICLE_CLASSES};
use crate::error::ConfigError;
use crate::input::SourceKind;

/// 单路视频源配置 (构造后不可变)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    /// 1..=N
    pub index: usize,
    pub source: String,
}

impl FeedConfig {
    pub fn new(index: usize, source: impl Into<String>) -> Self {
        Self {
            index,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        SourceKind::parse(&self.source)
    }

    /// 按顺序编号 1..=N
    pub fn from_sources<S: AsRef<str>>(sources: &[S]) -> Vec<FeedConfig> {
        sources
            .iter()
            .enumerate()
            .map(|(i, s)| FeedConfig::new(i + 1, s.as_ref()))
            .collect()
    }
}

/// 多路车流计数参数
#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "多路视频车流计数服务", long_about = None)]
pub struct Args {
    /// JSON配置文件
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 视频源 (文件路径 / rtsp地址 / 摄像头索引),可重复
    #[arg(short, long = "source")]
    pub sources: Vec<String>,

    /// ONNX检测模型
    #[arg(short, long)]
    pub model: Option<String>,

    /// 检测置信度阈值
    #[arg(long)]
    pub conf: Option<f32>,

    /// 计数的车辆类别,逗号分隔
    #[arg(long, value_delimiter = ',')]
    pub labels: Option<Vec<String>>,

    /// 统一帧宽度
    #[arg(long)]
    pub width: Option<u32>,

    /// 统一帧高度
    #[arg(long)]
    pub height: Option<u32>,

    /// 控制接口监听地址
    #[arg(short, long)]
    pub bind: Option<String>,

    /// 使用CUDA推理
    #[arg(long)]
    pub cuda: bool,

    /// 启动后立即开始检测
    #[arg(long)]
    pub autostart: bool,

    /// Stop 等待循环退出的最长时间(秒)
    #[arg(long)]
    pub stop_timeout_secs: Option<u64>,
}

/// 完整配置
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub sources: Vec<String>,
    pub model: String,
    pub inf_size: u32,
    pub min_confidence: f32,
    pub labels: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub bind: String,
    pub cuda: bool,
    pub autostart: bool,
    pub read_timeout_ms: u64,
    pub stop_timeout_secs: u64,
    /// 两个周期之间的最短间隔(毫秒),0 表示不限速
    pub cycle_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            model: "models/yolov8n.onnx".to_string(),
            inf_size: 640,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            labels: default_vehicle_labels(),
            width: 640,
            height: 360,
            bind: "0.0.0.0:5000".to_string(),
            cuda: false,
            autostart: false,
            read_timeout_ms: 2000,
            stop_timeout_secs: 5,
            cycle_interval_ms: 0,
        }
    }
}

impl MonitorConfig {
    /// 从JSON文件加载配置
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config = serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        tracing::info!(path, "✅ 配置已加载");
        Ok(config)
    }

    /// 合并命令行参数并校验
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load(&path.to_string_lossy())?,
            None => Self::default(),
        };

        if !args.sources.is_empty() {
            config.sources = args.sources.clone();
        }
        if let Some(model) = &args.model {
            config.model = model.clone();
        }
        if let Some(conf) = args.conf {
            config.min_confidence = conf;
        }
        if let Some(labels) = &args.labels {
            config.labels = labels.iter().map(|l| l.trim().to_lowercase()).collect();
        }
        if let Some(width) = args.width {
            config.width = width;
        }
        if let Some(height) = args.height {
            config.height = height;
        }
        if let Some(bind) = &args.bind {
            config.bind = bind.clone();
        }
        if let Some(secs) = args.stop_timeout_secs {
            config.stop_timeout_secs = secs;
        }
        config.cuda |= args.cuda;
        config.autostart |= args.autostart;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid("at least one source is required".into()));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::Invalid(format!(
                "min_confidence {} not in [0, 1]",
                self.min_confidence
            )));
        }
        if self.width == 0 || self.height == 0 || self.inf_size == 0 {
            return Err(ConfigError::Invalid("resolution must be non-zero".into()));
        }
        if self.labels.is_empty() {
            return Err(ConfigError::Invalid("labels must not be empty".into()));
        }
        if let Some(unknown) = self
            .labels
            .iter()
            .find(|l| !VEHICLE_CLASSES.contains_key(l.as_str()))
        {
            return Err(ConfigError::Invalid(format!(
                "unknown vehicle label '{}'",
                unknown
            )));
        }
        Ok(())
    }

    pub fn feeds(&self) -> Vec<FeedConfig> {
        FeedConfig::from_sources(&self.sources)
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn cycle_interval(&self) -> Option<Duration> {
        (self.cycle_interval_ms > 0).then(|| Duration::from_millis(self.cycle_interval_ms))
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        tracing::info!(
            feeds = self.sources.len(),
            model = %self.model,
            conf = self.min_confidence,
            labels = ?self.labels,
            resolution = %format!("{}x{}", self.width, self.height),
            bind = %self.bind,
            "🎛️ 当前配置"
        );
        for feed in self.feeds() {
            tracing::info!(feed = feed.index, source = %feed.kind(), "📹 视频源");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(sources: &[&str]) -> Args {
        Args {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::from_args(&args(&["a.mp4", "1"])).unwrap();
        assert_eq!(config.min_confidence, 0.25);
        assert_eq!(config.labels, vec!["car", "motorcycle", "bus", "truck"]);
        assert_eq!(config.stop_timeout(), Duration::from_secs(5));
        assert!(config.cycle_interval().is_none());

        let feeds = config.feeds();
        assert_eq!(feeds[0], FeedConfig::new(1, "a.mp4"));
        assert_eq!(feeds[1].kind(), SourceKind::Camera(1));
    }

    #[test]
    fn test_requires_sources() {
        assert!(matches!(
            MonitorConfig::from_args(&args(&[])),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut a = args(&["a.mp4"]);
        a.conf = Some(1.5);
        assert!(MonitorConfig::from_args(&a).is_err());

        let mut a = args(&["a.mp4"]);
        a.labels = Some(vec!["car".into(), "person".into()]);
        assert!(MonitorConfig::from_args(&a).is_err());

        let mut a = args(&["a.mp4"]);
        a.width = Some(0);
        assert!(MonitorConfig::from_args(&a).is_err());
    }

    #[test]
    fn test_file_then_cli_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"sources": ["v1.mp4", "v2.mp4"], "min_confidence": 0.4, "bind": "127.0.0.1:9000"}}"#
        )
        .unwrap();

        let mut a = args(&[]);
        a.config = Some(file.path().to_path_buf());
        a.conf = Some(0.3);
        let config = MonitorConfig::from_args(&a).unwrap();

        assert_eq!(config.sources, vec!["v1.mp4", "v2.mp4"]);
        assert_eq!(config.min_confidence, 0.3);
        assert_eq!(config.bind, "127.0.0.1:9000");
        // 未写的字段取默认值
        assert_eq!(config.inf_size, 640);
    }

    #[test]
    fn test_missing_file() {
        let mut a = args(&["a.mp4"]);
        a.config = Some(PathBuf::from("/no/such/config.json"));
        assert!(matches!(
            MonitorConfig::from_args(&a),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_cli_parse() {
        let a = Args::parse_from([
            "traffic-sentinel",
            "-s",
            "a.mp4",
            "--source",
            "0",
            "--labels",
            "car,truck",
            "--autostart",
        ]);
        assert_eq!(a.sources, vec!["a.mp4", "0"]);
        assert_eq!(a.labels, Some(vec!["car".to_string(), "truck".to_string()]));
        assert!(a.autostart);
    }
}
