//! 控制接口 (ControlSurface)
//!
//! 与传输层无关: Start / Stop / GetCount / Status 返回 `ControlReply`,
//! 由 `server` 映射为 HTTP 状态码。
//! 冲突 (已处于目标状态) 与错误 (需要处理的失败) 明确区分。

pub mod server;

pub use server::router;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::{ControlError, SupervisorError};
use crate::store::CountStore;
use crate::supervisor::StreamSupervisor;

/// 控制调用结果
#[derive(Debug, Clone, PartialEq)]
pub enum ControlReply {
    Ok(Value),
    /// 请求已受理但尚未完成 (停止等待超时)
    Accepted(Value),
    /// 已处于目标状态,重试无意义
    Conflict(Value),
    /// 调用方参数错误
    Invalid(Value),
    Error(Value),
}

impl ControlReply {
    pub fn error(msg: impl std::fmt::Display) -> Self {
        ControlReply::Error(json!({ "error": msg.to_string() }))
    }

    pub fn body(&self) -> &Value {
        match self {
            ControlReply::Ok(v)
            | ControlReply::Accepted(v)
            | ControlReply::Conflict(v)
            | ControlReply::Invalid(v)
            | ControlReply::Error(v) => v,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ControlReply::Ok(_))
    }
}

/// 解析并校验 feed id (1..=N)
pub fn parse_feed_id(raw: &str, feeds: usize) -> Result<usize, ControlError> {
    match raw.trim().parse::<usize>() {
        Ok(id) if (1..=feeds).contains(&id) => Ok(id),
        _ => Err(ControlError::InvalidFeedId(raw.to_string())),
    }
}

pub struct ControlSurface {
    supervisor: Arc<StreamSupervisor>,
    store: Arc<CountStore>,
    stop_timeout: Duration,
}

impl ControlSurface {
    pub fn new(supervisor: Arc<StreamSupervisor>, stop_timeout: Duration) -> Self {
        let store = supervisor.count_store();
        Self {
            supervisor,
            store,
            stop_timeout,
        }
    }

    pub fn supervisor(&self) -> &Arc<StreamSupervisor> {
        &self.supervisor
    }

    pub fn start(&self) -> ControlReply {
        match self.supervisor.start() {
            Ok(()) => ControlReply::Ok(json!({ "message": "started" })),
            Err(SupervisorError::AlreadyRunning) => {
                ControlReply::Conflict(json!({ "message": "already running" }))
            }
            Err(e) => ControlReply::error(e),
        }
    }

    /// 请求停止并在超时内等待回到 Idle (阻塞调用)
    pub fn stop(&self) -> ControlReply {
        match self.supervisor.stop() {
            // 已经停止就是期望状态
            Ok(()) | Err(SupervisorError::NotRunning) => {}
            Err(e) => return ControlReply::error(e),
        }

        if self.supervisor.wait_idle(self.stop_timeout) {
            ControlReply::Ok(json!({ "status": "stopped" }))
        } else {
            tracing::warn!(
                timeout_secs = self.stop_timeout.as_secs_f32(),
                "⚠️ 等待调度线程退出超时"
            );
            ControlReply::Accepted(json!({ "status": "stopping, timed out" }))
        }
    }

    pub fn get_count(&self, raw_id: &str) -> ControlReply {
        let id = match parse_feed_id(raw_id, self.store.feeds()) {
            Ok(id) => id,
            Err(e) => return ControlReply::Invalid(json!({ "error": e.to_string() })),
        };
        match self.store.get(id) {
            Ok(count) => ControlReply::Ok(json!({ "vehicle_count": count.count })),
            Err(e) => ControlReply::Invalid(json!({ "error": e.to_string() })),
        }
    }

    pub fn status(&self) -> ControlReply {
        ControlReply::Ok(json!({
            "running": self.supervisor.is_running(),
            "stats": self.supervisor.stats(),
            "counts": self.store.snapshot(),
        }))
    }
}
