/// FFmpeg解码过滤器模块
/// FFmpeg decode filter module
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{SendTimeoutError, Sender};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame};

/// 解码线程 → 采集端 的消息
pub enum SinkEvent {
    /// RGB24 像素 (width, height, data)
    Frame(u32, u32, Vec<u8>),
    /// 输入已读完
    End,
    /// 不可恢复的采集错误
    Fatal(String),
}

/// FFmpeg解码过滤器: 已缩放的 YUV420P 帧 → RGB24
///
/// 通道容量为 1,发送阻塞使解码速度跟随调度循环的拉取速度。
#[derive(Clone)]
pub struct DecodeFilter {
    tx: Sender<SinkEvent>,
    closed: Arc<AtomicBool>,
    source_name: String,
    pub total_frames: usize,
    pub dropped_frames: usize,
}

impl DecodeFilter {
    pub fn new(tx: Sender<SinkEvent>, closed: Arc<AtomicBool>, source_name: String) -> Self {
        Self {
            tx,
            closed,
            source_name,
            total_frames: 0,
            dropped_frames: 0,
        }
    }

    fn drop_frame(&mut self, reason: &str) -> Result<Option<Frame>, String> {
        self.dropped_frames += 1;
        if self.total_frames <= 10 {
            tracing::warn!(
                source = %self.source_name,
                frame = self.total_frames,
                "⚠️ 丢弃帧: {}",
                reason
            );
        }
        Ok(None)
    }

    /// 阻塞发送,期间周期性检查关闭标志
    fn deliver(&self, mut event: SinkEvent) -> Result<(), String> {
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return Err("source closed".to_string());
            }
            match self
                .tx
                .send_timeout(event, std::time::Duration::from_millis(200))
            {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(e)) => event = e,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err("receiver dropped".to_string())
                }
            }
        }
    }
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        tracing::debug!(source = %self.source_name, "✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        // 源已关闭: 返回错误让 ffmpeg 结束整条管线
        if self.closed.load(Ordering::Relaxed) {
            return Err("source closed".to_string());
        }

        unsafe {
            self.total_frames += 1;

            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                return self.drop_frame("空帧/损坏帧");
            }

            let w = (*frame.as_ptr()).width as u32;
            let h = (*frame.as_ptr()).height as u32;
            if w == 0 || h == 0 || w > 4096 || h > 4096 {
                return self.drop_frame("非法分辨率");
            }

            let y_plane = (*frame.as_ptr()).data[0];
            let u_plane = (*frame.as_ptr()).data[1];
            let v_plane = (*frame.as_ptr()).data[2];
            let y_stride = (*frame.as_ptr()).linesize[0] as usize;
            let uv_stride = (*frame.as_ptr()).linesize[1] as usize;

            if y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
                return self.drop_frame("YUV指针为空");
            }
            if y_stride < w as usize || uv_stride < (w as usize).div_ceil(2) {
                return self.drop_frame("步长异常");
            }

            let required = (w as usize) * (h as usize) * 3;
            let mut buffer: Vec<u8> = Vec::new();
            if buffer.try_reserve_exact(required).is_err() {
                let msg = format!("cannot allocate {} byte frame buffer", required);
                let _ = self.deliver(SinkEvent::Fatal(msg.clone()));
                return Err(msg);
            }
            buffer.resize(required, 0);

            yuv420p_to_rgb(
                y_plane,
                u_plane,
                v_plane,
                y_stride,
                uv_stride,
                &mut buffer,
                w as usize,
                h as usize,
            );

            self.deliver(SinkEvent::Frame(w, h, buffer))?;
        }

        Ok(None)
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        // 通道满时放弃: 接收端随后会看到断开
        let _ = self.tx.try_send(SinkEvent::End);
        tracing::debug!(
            source = %self.source_name,
            total = self.total_frames,
            dropped = self.dropped_frames,
            "✅ 解码线程退出"
        );
    }
}

/// YUV420P → RGB24 (BT.601, 定点系数 ×128)
#[inline]
#[allow(clippy::too_many_arguments)]
unsafe fn yuv420p_to_rgb(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    buffer: &mut [u8],
    width: usize,
    height: usize,
) {
    let mut out_idx = 0;
    for y in 0..height {
        let y_row = y * y_stride;
        let uv_row = (y >> 1) * uv_stride;

        for x in 0..width {
            let y_val = *y_plane.add(y_row + x) as i32;
            let u_val = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let v_val = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;

            let (r, g, b) = yuv_to_rgb(y_val, u_val, v_val);
            buffer[out_idx] = r;
            buffer[out_idx + 1] = g;
            buffer[out_idx + 2] = b;
            out_idx += 3;
        }
    }
}

#[inline]
fn yuv_to_rgb(y: i32, u: i32, v: i32) -> (u8, u8, u8) {
    let r = (y + ((v * 179) >> 7)).clamp(0, 255) as u8;
    let g = (y - ((u * 44) >> 7) - ((v * 91) >> 7)).clamp(0, 255) as u8;
    let b = (y + ((u * 227) >> 7)).clamp(0, 255) as u8;
    (r, g, b)
}
