//! ffmpeg 视频源 - 文件 / RTSP / 本地摄像头
//!
//! 解码在独立线程中进行,通过容量为1的通道逐帧交给调度循环。
//! 摄像头支持 DirectShow(Windows) / AVFoundation(macOS) / V4L2(Linux)

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};

use super::decode_filter::{DecodeFilter, SinkEvent};
use super::{Frame, FrameSource, SourceKind};
use crate::error::SourceError;

/// 打开超时: 等待解码线程报告 ffmpeg 上下文是否构建成功
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// ffmpeg 网络读写超时 (微秒),让卡住的 build 在 OPEN_TIMEOUT 之前自行返回
const IO_TIMEOUT_US: &str = "5000000";

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// 连续打开失败后的退避,避免对同一路反复拉起解码线程
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    retry_at: Option<Instant>,
}

impl Backoff {
    fn ready(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }

    fn fail(&mut self, now: Instant) -> Duration {
        let delay = BACKOFF_MIN
            .saturating_mul(1 << self.failures.min(5))
            .min(BACKOFF_MAX);
        self.failures += 1;
        self.retry_at = Some(now + delay);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }
}

/// 视频设备信息
#[derive(Debug, Clone)]
pub struct VideoDevice {
    pub name: String,
    pub index: usize,
}

/// 获取可用的视频设备列表
pub fn get_video_devices() -> Vec<VideoDevice> {
    match ez_ffmpeg::device::get_input_video_devices() {
        Ok(devices) => devices
            .into_iter()
            .enumerate()
            .map(|(index, name)| VideoDevice { name, index })
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "⚠️ 获取视频设备列表失败");
            vec![]
        }
    }
}

/// 正在运行的一次解码 (open 或 rewind 产生)
struct Session {
    rx: Receiver<SinkEvent>,
    closed: Arc<AtomicBool>,
}

impl Session {
    fn shutdown(self) {
        // 设置标志后丢弃接收端,解码线程在下一帧退出
        self.closed.store(true, Ordering::Relaxed);
        drop(self.rx);
    }
}

/// ffmpeg 视频源
pub struct FfmpegSource {
    feed_index: usize,
    kind: SourceKind,
    width: u32,
    height: u32,
    read_timeout: Duration,
    session: Option<Session>,
    sequence: u64,
    ended: bool,
    backoff: Backoff,
}

impl FfmpegSource {
    pub fn new(
        feed_index: usize,
        kind: SourceKind,
        (width, height): (u32, u32),
        read_timeout: Duration,
    ) -> Self {
        Self {
            feed_index,
            kind,
            width,
            height,
            read_timeout,
            session: None,
            sequence: 0,
            ended: false,
            backoff: Backoff::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn unavailable(&self, reason: impl Into<String>) -> SourceError {
        SourceError::unavailable(self.describe(), reason)
    }

    /// 退避期内直接拒绝,否则尝试拉起新会话并记录成败
    fn try_spawn(&mut self) -> Result<Session, SourceError> {
        let now = Instant::now();
        if !self.backoff.ready(now) {
            return Err(self.unavailable("backing off after failed open"));
        }
        match self.spawn_session() {
            Ok(session) => {
                self.backoff.reset();
                Ok(session)
            }
            Err(e) => {
                let delay = self.backoff.fail(now);
                tracing::warn!(
                    feed = self.feed_index,
                    error = %e,
                    retry_in_secs = delay.as_secs(),
                    "⚠️ 打开视频源失败,稍后重试"
                );
                Err(e)
            }
        }
    }

    /// 启动解码线程并等待 ffmpeg 上下文构建结果
    fn spawn_session(&self) -> Result<Session, SourceError> {
        if let SourceKind::File(path) = &self.kind {
            if !self.kind.is_stream_url() && !Path::new(path).exists() {
                return Err(self.unavailable("file not found"));
            }
        }

        let (tx, rx) = bounded::<SinkEvent>(1);
        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);
        let closed = Arc::new(AtomicBool::new(false));

        let filter = DecodeFilter::new(tx, closed.clone(), self.describe());
        let input = camera_or_file_input(&self.kind);
        let scale = format!("scale={}:{},format=yuv420p", self.width, self.height);
        let name = self.describe();

        std::thread::Builder::new()
            .name(format!("decode-{}", self.feed_index))
            .spawn(move || {
                let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
                let pipe = pipe.filter("decode", Box::new(filter));
                let out = create_null_output().add_frame_pipeline(pipe);

                let ctx = match FfmpegContext::builder()
                    .input(input)
                    .filter_descs(vec![scale.as_str()])
                    .output(out)
                    .build()
                {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("构建失败: {}", e)));
                        return;
                    }
                };

                let sch = match ctx.start() {
                    Ok(sch) => sch,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("启动失败: {}", e)));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let _ = sch.wait();
                tracing::debug!(source = %name, "📹 解码循环结束");
            })
            .map_err(|e| SourceError::Fatal(format!("cannot spawn decode thread: {}", e)))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => Ok(Session { rx, closed }),
            Ok(Err(reason)) => Err(self.unavailable(reason)),
            Err(_) => {
                closed.store(true, Ordering::Relaxed);
                Err(self.unavailable("timed out opening source"))
            }
        }
    }
}

/// 根据源类型构建 ffmpeg 输入
fn camera_or_file_input(kind: &SourceKind) -> Input {
    match kind {
        SourceKind::File(path) if path.starts_with("rtsp") => Input::new(path.as_str())
            .set_input_opts(
                [
                    ("rtsp_transport", "tcp"),
                    ("rtsp_flags", "prefer_tcp"),
                    ("timeout", IO_TIMEOUT_US),
                ]
                .into(),
            ),
        SourceKind::File(path) if kind.is_stream_url() => {
            Input::new(path.as_str()).set_input_opts([("rw_timeout", IO_TIMEOUT_US)].into())
        }
        SourceKind::File(path) => Input::new(path.as_str()),
        SourceKind::Camera(index) => {
            Input::new(format_camera_url(*index)).set_format(camera_format())
        }
    }
}

/// 格式化摄像头URL - 根据平台选择
fn format_camera_url(index: usize) -> String {
    #[cfg(target_os = "windows")]
    {
        // dshow 需要设备名称
        let name = get_video_devices()
            .into_iter()
            .find(|d| d.index == index)
            .map(|d| d.name)
            .unwrap_or_default();
        format!("video={}", name)
    }
    #[cfg(target_os = "linux")]
    {
        format!("/dev/video{}", index)
    }
    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        format!("{}", index)
    }
}

fn camera_format() -> &'static str {
    #[cfg(target_os = "windows")]
    let format = "dshow";

    #[cfg(target_os = "macos")]
    let format = "avfoundation";

    #[cfg(target_os = "linux")]
    let format = "v4l2";

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    let format = "video4linux2";

    format
}

impl FrameSource for FfmpegSource {
    fn open(&mut self) -> Result<(), SourceError> {
        if self.session.is_some() {
            return Ok(());
        }
        let session = self.try_spawn()?;
        self.session = Some(session);
        self.ended = false;
        tracing::info!(feed = self.feed_index, source = %self.kind, "✅ 视频源已打开");
        Ok(())
    }

    fn read_next(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.ended {
            return Ok(None);
        }
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| self.unavailable("source not open"))?;

        match session.rx.recv_timeout(self.read_timeout) {
            Ok(SinkEvent::Frame(width, height, data)) => {
                self.sequence += 1;
                Ok(Some(Frame::new(
                    self.feed_index,
                    self.sequence,
                    width,
                    height,
                    data,
                )))
            }
            Ok(SinkEvent::End) | Err(RecvTimeoutError::Disconnected) => {
                self.ended = true;
                Ok(None)
            }
            Ok(SinkEvent::Fatal(msg)) => Err(SourceError::Fatal(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
        }
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        if let Some(session) = self.session.take() {
            session.shutdown();
        }
        let session = self.try_spawn()?;
        self.session = Some(session);
        self.ended = false;
        tracing::debug!(feed = self.feed_index, source = %self.kind, "🔄 视频源回到起点");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown();
            tracing::info!(feed = self.feed_index, source = %self.kind, "视频源已关闭");
        }
    }

    fn describe(&self) -> String {
        format!("feed {} ({})", self.feed_index, self.kind)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}
