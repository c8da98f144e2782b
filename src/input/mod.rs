/// 视频输入系统 (Video Input System)
///
/// 每一路视频源一个 FrameSource,由调度线程按周期拉取:
/// - Decoder:      ffmpeg 解码 (文件 / RTSP / 本地摄像头)
/// - DecodeFilter: 帧缩放到统一分辨率并转换为 RGB24
pub mod decode_filter;
pub mod decoder;

pub use decode_filter::DecodeFilter;
pub use decoder::{get_video_devices, FfmpegSource, VideoDevice};

use crate::error::SourceError;

/// 已解码帧 (采集 → 检测)
///
/// packed RGB24, `data.len() == width * height * 3`。
/// 只属于产生它的那个周期,检测完即丢弃。
#[derive(Clone, Debug)]
pub struct Frame {
    pub feed_index: usize,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(feed_index: usize, sequence: u64, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            feed_index,
            sequence,
            width,
            height,
            data,
        }
    }

    /// 纯色帧 (测试与占位)
    pub fn filled(feed_index: usize, sequence: u64, width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take((width * height * 3) as usize)
            .collect();
        Self::new(feed_index, sequence, width, height, data)
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == (self.width as usize) * (self.height as usize) * 3
    }
}

/// 视频源接口
///
/// ```text
/// open ──► read_next ──► Ok(Some(frame))
///              │
///              ├──► Ok(None)          流结束 / 读超时,由调用方决定 rewind
///              └──► Err(Fatal)        采集层故障,整轮中止
/// ```
///
/// `close` 幂等,对从未打开的源调用也安全。
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<(), SourceError>;

    fn read_next(&mut self) -> Result<Option<Frame>, SourceError>;

    /// 回到起点 (文件源循环播放)
    fn rewind(&mut self) -> Result<(), SourceError>;

    fn close(&mut self);

    /// 日志中使用的名称
    fn describe(&self) -> String;
}

/// 视频源类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// 文件路径或流地址 (rtsp:// 等)
    File(String),
    /// 本地摄像头索引
    Camera(usize),
}

impl SourceKind {
    /// 纯数字 → 摄像头索引,其余视为路径/URL
    pub fn parse(source: &str) -> Self {
        let trimmed = source.trim();
        match trimmed.parse::<usize>() {
            Ok(index) if !trimmed.is_empty() => SourceKind::Camera(index),
            _ => SourceKind::File(trimmed.to_string()),
        }
    }

    pub fn is_stream_url(&self) -> bool {
        match self {
            SourceKind::File(path) => path.contains("://"),
            SourceKind::Camera(_) => false,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::File(path) => write!(f, "{}", path),
            SourceKind::Camera(index) => write!(f, "camera {}", index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_camera_index() {
        assert_eq!(SourceKind::parse("0"), SourceKind::Camera(0));
        assert_eq!(SourceKind::parse(" 2 "), SourceKind::Camera(2));
    }

    #[test]
    fn test_parse_paths() {
        assert_eq!(
            SourceKind::parse("video/traffic.mp4"),
            SourceKind::File("video/traffic.mp4".into())
        );
        assert_eq!(SourceKind::parse("-1"), SourceKind::File("-1".into()));
        let rtsp = SourceKind::parse("rtsp://10.0.0.2/stream1");
        assert!(rtsp.is_stream_url());
        assert!(!SourceKind::parse("clip.mp4").is_stream_url());
    }

    #[test]
    fn test_filled_frame() {
        let frame = Frame::filled(1, 7, 4, 2, [10, 20, 30]);
        assert!(frame.is_valid());
        assert_eq!(&frame.data[..6], &[10, 20, 30, 10, 20, 30]);
        assert_eq!(frame.sequence, 7);
    }
}
