// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 命令行与配置文件
pub mod control; // 控制接口 (HTTP)
pub mod detection; // 车辆检测
pub mod error; // 错误类型
pub mod input; // 视频输入
pub mod store; // 计数表
pub mod supervisor; // 调度器

pub use crate::config::{Args, FeedConfig, MonitorConfig};
pub use crate::control::{ControlReply, ControlSurface};
pub use crate::detection::{Detection, VehicleDetector, YOLOv8Detector, YOLOv8Options};
pub use crate::input::{FfmpegSource, Frame, FrameSource, SourceKind};
pub use crate::store::{CountStore, VehicleCount};
pub use crate::supervisor::{
    DetectionSettings, SourceFactory, StreamSupervisor, SupervisorState, SupervisorStats,
};

/// 基于配置创建 ffmpeg 视频源工厂
pub fn ffmpeg_source_factory(config: &MonitorConfig) -> SourceFactory {
    let resolution = config.resolution();
    let read_timeout = config.read_timeout();
    std::sync::Arc::new(move |feed: &FeedConfig| {
        Box::new(FfmpegSource::new(feed.index, feed.kind(), resolution, read_timeout))
            as Box<dyn FrameSource>
    })
}
