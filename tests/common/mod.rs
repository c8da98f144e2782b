#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use traffic_sentinel::detection::{BBox, Detection, VehicleDetector};
use traffic_sentinel::error::SourceError;
use traffic_sentinel::{
    DetectionSettings, FeedConfig, Frame, FrameSource, SourceFactory, StreamSupervisor,
};

/// 测试控制面板: 注入故障、统计打开/关闭次数
#[derive(Default)]
pub struct Script {
    /// 打开失败的路
    pub fail_open: Mutex<HashSet<usize>>,
    /// 读帧失败 (含重试) 的路
    pub fail_read: Mutex<HashSet<usize>>,
    /// 读帧返回致命错误的路
    pub fatal_read: Mutex<HashSet<usize>>,
    /// 读帧时 panic 的路
    pub panic_read: Mutex<HashSet<usize>>,
    /// 每次打开的耗时
    pub open_delay: Mutex<Duration>,
    /// 每次读帧的耗时 (默认 2ms)
    pub read_delay: Mutex<Option<Duration>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub reads: Mutex<HashMap<usize, usize>>,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_reads(&self, feed: usize, on: bool) {
        let mut set = self.fail_read.lock().unwrap();
        if on {
            set.insert(feed);
        } else {
            set.remove(&feed);
        }
    }

    pub fn reads_of(&self, feed: usize) -> usize {
        self.reads.lock().unwrap().get(&feed).copied().unwrap_or(0)
    }
}

/// 内存视频源: 产生纯色帧,模拟循环播放的短片
pub struct ScriptedSource {
    feed: usize,
    script: Arc<Script>,
    open: bool,
    sequence: u64,
}

impl FrameSource for ScriptedSource {
    fn open(&mut self) -> Result<(), SourceError> {
        std::thread::sleep(*self.script.open_delay.lock().unwrap());
        if self.script.fail_open.lock().unwrap().contains(&self.feed) {
            return Err(SourceError::unavailable(self.describe(), "file not found"));
        }
        self.open = true;
        self.script.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_next(&mut self) -> Result<Option<Frame>, SourceError> {
        if !self.open {
            return Err(SourceError::unavailable(self.describe(), "not open"));
        }
        if self.script.fatal_read.lock().unwrap().contains(&self.feed) {
            return Err(SourceError::Fatal("cannot allocate frame buffer".into()));
        }
        if self.script.panic_read.lock().unwrap().contains(&self.feed) {
            panic!("scripted read panic on feed {}", self.feed);
        }
        if self.script.fail_read.lock().unwrap().contains(&self.feed) {
            return Err(SourceError::unavailable(self.describe(), "read error"));
        }
        *self.script.reads.lock().unwrap().entry(self.feed).or_insert(0) += 1;
        self.sequence += 1;
        // 稍作停顿,模拟解码耗时
        let delay = self
            .script
            .read_delay
            .lock()
            .unwrap()
            .unwrap_or(Duration::from_millis(2));
        std::thread::sleep(delay);
        Ok(Some(Frame::filled(self.feed, self.sequence, 8, 8, [90, 90, 90])))
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.sequence = 0;
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.script.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn describe(&self) -> String {
        format!("scripted feed {}", self.feed)
    }
}

pub fn scripted_factory(script: Arc<Script>) -> SourceFactory {
    Arc::new(move |feed: &FeedConfig| {
        Box::new(ScriptedSource {
            feed: feed.index,
            script: script.clone(),
            open: false,
            sequence: 0,
        }) as Box<dyn FrameSource>
    })
}

/// 固定输出的检测器: feed 1 → car×2 + truck×1 (+ 一个行人与一个低置信度框,应被过滤)
/// 其余路 → car×1
pub struct FixedDetector {
    pub fail_feeds: Arc<Mutex<HashSet<usize>>>,
    /// 在这些路上 panic (模拟推理库内部崩溃)
    pub panic_feeds: Arc<Mutex<HashSet<usize>>>,
}

impl FixedDetector {
    pub fn new() -> Self {
        Self {
            fail_feeds: Arc::new(Mutex::new(HashSet::new())),
            panic_feeds: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

fn det(label: &str, class_id: usize, confidence: f32, x: f32) -> Detection {
    Detection::new(label, class_id, confidence, BBox::new(x, 0., x + 2., 2.))
}

impl VehicleDetector for FixedDetector {
    fn detect(
        &mut self,
        frame: &Frame,
        min_confidence: f32,
        allowed_labels: &[String],
    ) -> anyhow::Result<Vec<Detection>> {
        if self.fail_feeds.lock().unwrap().contains(&frame.feed_index) {
            anyhow::bail!("synthetic detection failure");
        }
        if self.panic_feeds.lock().unwrap().contains(&frame.feed_index) {
            panic!("synthetic detector panic");
        }
        let raw = if frame.feed_index == 1 {
            vec![
                det("car", 2, 0.9, 0.),
                det("car", 2, 0.8, 3.),
                det("truck", 7, 0.7, 6.),
                det("person", 0, 0.95, 1.),
                det("bus", 5, 0.1, 4.),
            ]
        } else {
            vec![det("car", 2, 0.6, 0.)]
        };
        Ok(traffic_sentinel::detection::filter_detections(
            raw,
            min_confidence,
            allowed_labels,
        ))
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

pub fn sources(n: usize) -> Vec<FeedConfig> {
    let names: Vec<String> = (1..=n).map(|i| format!("clip{}.mp4", i)).collect();
    FeedConfig::from_sources(&names)
}

pub fn supervisor(n: usize, script: Arc<Script>, detector: FixedDetector) -> StreamSupervisor {
    StreamSupervisor::new(
        sources(n),
        scripted_factory(script),
        Box::new(detector),
        DetectionSettings::default(),
        None,
    )
}

/// 轮询直到条件成立
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
