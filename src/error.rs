//! 错误类型 (Error taxonomy)
//!
//! - 单路失败 (SourceUnavailable / DetectionFailure) 只降级该路,不外抛
//! - 整轮失败 (InitializationFailed / RunAborted) 交给下一次控制调用
//! - 状态冲突 (AlreadyRunning / NotRunning) 不是需要重试的错误

/// 视频源错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    /// 无法打开或读取 (文件不存在、摄像头被占用等)
    #[error("source unavailable: {source_name}: {reason}")]
    Unavailable { source_name: String, reason: String },

    /// 采集层不可恢复的错误 (例如帧缓冲分配失败)
    #[error("acquisition failure: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn unavailable(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        SourceError::Unavailable {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Fatal(_))
    }
}

/// 单路打开失败记录
#[derive(Debug, Clone, PartialEq)]
pub struct FeedFailure {
    pub feed_index: usize,
    pub error: SourceError,
}

impl std::fmt::Display for FeedFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "feed {}: {}", self.feed_index, self.error)
    }
}

/// 调度器错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SupervisorError {
    #[error("initialization failed: {}", join_failures(.failures))]
    InitializationFailed { failures: Vec<FeedFailure> },

    #[error("already running")]
    AlreadyRunning,

    #[error("not running")]
    NotRunning,

    /// 上一轮运行因采集层故障中止
    #[error("previous run aborted: {0}")]
    RunAborted(String),
}

impl SupervisorError {
    /// 冲突 = 已处于目标状态,重试无意义
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SupervisorError::AlreadyRunning | SupervisorError::NotRunning
        )
    }
}

fn join_failures(failures: &[FeedFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// 计数表错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("feed index {0} not found")]
    NotFound(usize),
}

/// 控制接口错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("invalid id")]
    InvalidFeedId(String),
}

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
