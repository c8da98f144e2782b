//! 调度器 (StreamSupervisor)
//!
//! 状态机: Idle → Running → Stopping → Idle
//!
//! 每次运行一个专用调度线程,单线程内依次处理所有视频源:
//! 读帧 → 检测 → 按路发布计数 → 检查停止信号。
//! 控制接口只接触状态标志与计数表,不会阻塞在调度线程上。

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::FeedConfig;
use crate::detection::{
    count_by_label, default_vehicle_labels, VehicleDetector, DEFAULT_MIN_CONFIDENCE,
};
use crate::error::{FeedFailure, SourceError, SupervisorError};
use crate::input::{Frame, FrameSource};
use crate::store::CountStore;

/// 轮询间隔 (wait_idle / 限速睡眠)
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// 为每次运行创建全新的视频源
pub type SourceFactory = Arc<dyn Fn(&FeedConfig) -> Box<dyn FrameSource> + Send + Sync>;

/// 检测过滤参数
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    pub min_confidence: f32,
    pub allowed_labels: Vec<String>,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            allowed_labels: default_vehicle_labels(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SupervisorState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
}

impl SupervisorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SupervisorState::Running,
            2 => SupervisorState::Stopping,
            _ => SupervisorState::Idle,
        }
    }
}

/// 运行统计 (状态接口使用)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisorStats {
    pub state: SupervisorState,
    /// 进程启动以来完成的周期数
    pub cycles: u64,
    /// 最近一个周期中降级的视频源
    pub degraded_feeds: Vec<usize>,
    pub last_error: Option<String>,
}

/// 调度线程与控制端共享的状态
struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
    cycles: AtomicU64,
    degraded: Mutex<Vec<usize>>,
    last_error: Mutex<Option<String>>,
    /// 上一轮中止原因,交给下一次 start/stop 调用
    aborted: Mutex<Option<String>>,
}

impl Shared {
    fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.state() != SupervisorState::Running
    }
}

/// 锁中毒时继续使用内部数据
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct StreamSupervisor {
    feeds: Vec<FeedConfig>,
    factory: SourceFactory,
    detector: Arc<Mutex<Box<dyn VehicleDetector>>>,
    settings: Arc<DetectionSettings>,
    cycle_interval: Option<Duration>,
    store: Arc<CountStore>,
    shared: Arc<Shared>,
    /// 串行化 start 与上一轮线程的回收
    lifecycle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSupervisor {
    pub fn new(
        feeds: Vec<FeedConfig>,
        factory: SourceFactory,
        detector: Box<dyn VehicleDetector>,
        settings: DetectionSettings,
        cycle_interval: Option<Duration>,
    ) -> Self {
        let store = Arc::new(CountStore::new(feeds.len()));
        Self {
            feeds,
            factory,
            detector: Arc::new(Mutex::new(detector)),
            settings: Arc::new(settings),
            cycle_interval,
            store,
            shared: Arc::new(Shared {
                state: AtomicU8::new(SupervisorState::Idle as u8),
                stop: AtomicBool::new(false),
                cycles: AtomicU64::new(0),
                degraded: Mutex::new(Vec::new()),
                last_error: Mutex::new(None),
                aborted: Mutex::new(None),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn count_store(&self) -> Arc<CountStore> {
        self.store.clone()
    }

    pub fn feeds(&self) -> &[FeedConfig] {
        &self.feeds
    }

    pub fn state(&self) -> SupervisorState {
        self.shared.state()
    }

    /// Running 或 Stopping 都算运行中
    pub fn is_running(&self) -> bool {
        self.state() != SupervisorState::Idle
    }

    /// 取出上一轮的中止原因 (只报告一次)
    fn take_aborted(&self) -> Option<SupervisorError> {
        lock(&self.shared.aborted)
            .take()
            .map(SupervisorError::RunAborted)
    }

    /// 打开所有视频源并启动调度线程
    ///
    /// 另一个 start 正在打开视频源时立即返回冲突,不排队等待。
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut lifecycle = match self.lifecycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(SupervisorError::AlreadyRunning),
        };

        if self.is_running() {
            return Err(SupervisorError::AlreadyRunning);
        }
        if let Some(previous) = lifecycle.take() {
            // 线程已把状态置为 Idle,只剩退出
            let _ = previous.join();
        }
        if let Some(err) = self.take_aborted() {
            tracing::warn!(error = %err, "⚠️ 报告上一轮中止");
            return Err(err);
        }

        let mut sources: Vec<(usize, Box<dyn FrameSource>)> =
            Vec::with_capacity(self.feeds.len());
        let mut failures = Vec::new();
        for feed in &self.feeds {
            let mut source = (self.factory)(feed);
            match source.open() {
                Ok(()) => sources.push((feed.index, source)),
                Err(error) => {
                    tracing::warn!(feed = feed.index, error = %error, "❌ 视频源打开失败");
                    failures.push(FeedFailure {
                        feed_index: feed.index,
                        error,
                    });
                }
            }
        }
        if !failures.is_empty() {
            close_all(&mut sources);
            let err = SupervisorError::InitializationFailed { failures };
            *lock(&self.shared.last_error) = Some(err.to_string());
            return Err(err);
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        lock(&self.shared.degraded).clear();
        self.shared.set_state(SupervisorState::Running);

        let run = RunLoop {
            sources,
            detector: self.detector.clone(),
            settings: self.settings.clone(),
            store: self.store.clone(),
            shared: self.shared.clone(),
            cycle_interval: self.cycle_interval,
        };
        let handle = std::thread::Builder::new()
            .name("supervisor".into())
            .spawn(move || run.run())
            .map_err(|e| {
                self.shared.set_state(SupervisorState::Idle);
                SupervisorError::RunAborted(format!("cannot spawn supervisor thread: {}", e))
            })?;
        *lifecycle = Some(handle);

        tracing::info!(feeds = self.feeds.len(), "🚀 车流计数已启动");
        Ok(())
    }

    /// 请求停止,立即返回
    pub fn stop(&self) -> Result<(), SupervisorError> {
        if let Some(err) = self.take_aborted() {
            return Err(err);
        }

        // 先切换状态再置位,避免与并发 start 的复位交错
        match self.shared.state.compare_exchange(
            SupervisorState::Running as u8,
            SupervisorState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.shared.stop.store(true, Ordering::SeqCst);
                tracing::info!("🛑 收到停止请求");
                Ok(())
            }
            Err(current) if current == SupervisorState::Stopping as u8 => {
                self.shared.stop.store(true, Ordering::SeqCst);
                tracing::debug!("停止中,重复请求");
                Ok(())
            }
            Err(_) => Err(SupervisorError::NotRunning),
        }
    }

    /// 等待回到 Idle,超时返回 false
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            state: self.state(),
            cycles: self.shared.cycles.load(Ordering::SeqCst),
            degraded_feeds: lock(&self.shared.degraded).clone(),
            last_error: lock(&self.shared.last_error).clone(),
        }
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        let _ = self.stop();
        if let Some(handle) = lock(&self.lifecycle).take() {
            let _ = handle.join();
        }
    }
}

fn close_all(sources: &mut [(usize, Box<dyn FrameSource>)]) {
    for (_, source) in sources.iter_mut() {
        source.close();
    }
}

/// 单轮运行的上下文,由调度线程独占
struct RunLoop {
    sources: Vec<(usize, Box<dyn FrameSource>)>,
    detector: Arc<Mutex<Box<dyn VehicleDetector>>>,
    settings: Arc<DetectionSettings>,
    store: Arc<CountStore>,
    shared: Arc<Shared>,
    cycle_interval: Option<Duration>,
}

/// 调度线程退出 (正常结束或 panic 展开) 时: 关闭视频源并回到 Idle
impl Drop for RunLoop {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let msg = "supervisor loop panicked".to_string();
            tracing::error!("❌ 调度线程异常退出");
            *lock(&self.shared.last_error) = Some(msg.clone());
            *lock(&self.shared.aborted) = Some(msg);
        }
        close_all(&mut self.sources);
        self.shared.set_state(SupervisorState::Idle);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl RunLoop {
    fn run(mut self) {
        let detector = self.detector.clone();
        let mut detector = lock(&detector);

        let outcome = loop {
            if self.shared.should_stop() {
                break Ok(());
            }
            let started = Instant::now();
            if let Err(e) = self.cycle(&mut **detector) {
                break Err(e);
            }
            self.shared.cycles.fetch_add(1, Ordering::SeqCst);

            if self.shared.should_stop() {
                break Ok(());
            }
            if let Some(interval) = self.cycle_interval {
                self.throttle(started, interval);
            }
        };

        match outcome {
            Ok(()) => tracing::info!("✅ 车流计数已停止"),
            Err(e) => {
                tracing::error!(error = %e, "❌ 采集层故障,本轮运行中止");
                let msg = e.to_string();
                *lock(&self.shared.last_error) = Some(msg.clone());
                *lock(&self.shared.aborted) = Some(msg);
            }
        }
        // 视频源关闭与状态复位在 Drop 中完成
    }

    /// 一个周期: 每路读一帧、检测、发布。只有采集层致命错误会返回 Err
    fn cycle(&mut self, detector: &mut dyn VehicleDetector) -> Result<(), SourceError> {
        let mut degraded = Vec::new();
        let settings = &self.settings;

        for (feed_index, source) in self.sources.iter_mut() {
            let feed_index = *feed_index;
            let Some(frame) = read_with_rewind(source.as_mut())? else {
                tracing::warn!(feed = feed_index, "⚠️ 视频源本周期无帧,保留上次计数");
                degraded.push(feed_index);
                continue;
            };

            // 检测器 panic 与返回错误同样只降级该路
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                detector.detect(&frame, settings.min_confidence, &settings.allowed_labels)
            }))
            .unwrap_or_else(|payload| {
                Err(anyhow::anyhow!(
                    "detector panicked: {}",
                    panic_message(&*payload)
                ))
            });

            match result {
                Ok(detections) => {
                    let by_label = count_by_label(&detections);
                    match self.store.set(feed_index, detections.len(), by_label) {
                        Ok(published) => tracing::debug!(
                            feed = feed_index,
                            count = published.count,
                            cycle = published.cycle,
                            by_label = ?published.by_label,
                            "🚗 计数已更新"
                        ),
                        Err(e) => {
                            tracing::warn!(feed = feed_index, error = %e, "⚠️ 计数发布失败");
                            degraded.push(feed_index);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        feed = feed_index,
                        detector = detector.name(),
                        error = %e,
                        "⚠️ 检测失败,保留上次计数"
                    );
                    degraded.push(feed_index);
                }
            }
        }

        *lock(&self.shared.degraded) = degraded;
        Ok(())
    }

    /// 限速: 分段睡眠,期间仍响应停止信号
    fn throttle(&self, started: Instant, interval: Duration) {
        while started.elapsed() < interval && !self.shared.should_stop() {
            let remaining = interval.saturating_sub(started.elapsed());
            std::thread::sleep(remaining.min(POLL_INTERVAL));
        }
    }
}

/// 读一帧;失败则回到起点重试一次。致命错误向上返回,其余返回 None
fn read_with_rewind(source: &mut dyn FrameSource) -> Result<Option<Frame>, SourceError> {
    match source.read_next() {
        Ok(Some(frame)) => return Ok(Some(frame)),
        Ok(None) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => tracing::debug!(source = %source.describe(), error = %e, "读帧失败,尝试回到起点"),
    }

    if let Err(e) = source.rewind() {
        if e.is_fatal() {
            return Err(e);
        }
        tracing::warn!(source = %source.describe(), error = %e, "⚠️ 回到起点失败");
        return Ok(None);
    }

    match source.read_next() {
        Ok(frame) => Ok(frame),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!(source = %source.describe(), error = %e, "⚠️ 重试读帧失败");
            Ok(None)
        }
    }
}
