//! 计数表 (CountStore)
//!
//! feed 索引 → 最新车辆计数。单写者 (调度线程) / 多读者 (控制接口)。
//!
//! 键为 `(feed, cycle)`:先插入新版本再删除旧版本,
//! 任何时刻每一路至少有一个完整版本可读,读者拿到的要么是旧值要么是新值。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use crossbeam_skiplist::SkipMap;
use serde::Serialize;

use crate::error::StoreError;

/// 单路计数
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VehicleCount {
    pub feed_index: usize,
    pub count: usize,
    pub by_label: BTreeMap<String, usize>,
    /// 该路已发布次数,严格递增
    pub cycle: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl VehicleCount {
    fn empty(feed_index: usize) -> Self {
        Self {
            feed_index,
            count: 0,
            by_label: BTreeMap::new(),
            cycle: 0,
            last_updated: None,
        }
    }
}

/// 计数表,索引范围 1..=N
pub struct CountStore {
    entries: SkipMap<(usize, u64), VehicleCount>,
    feeds: usize,
}

impl CountStore {
    pub fn new(feeds: usize) -> Self {
        let entries = SkipMap::new();
        for i in 1..=feeds {
            entries.insert((i, 0), VehicleCount::empty(i));
        }
        Self { entries, feeds }
    }

    pub fn feeds(&self) -> usize {
        self.feeds
    }

    pub fn contains(&self, feed_index: usize) -> bool {
        (1..=self.feeds).contains(&feed_index)
    }

    pub fn get(&self, feed_index: usize) -> Result<VehicleCount, StoreError> {
        if !self.contains(feed_index) {
            return Err(StoreError::NotFound(feed_index));
        }
        self.entries
            .range((feed_index, 0)..=(feed_index, u64::MAX))
            .next_back()
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(feed_index))
    }

    /// 发布一次完整检测的结果 (只由调度线程调用)
    pub fn set(
        &self,
        feed_index: usize,
        count: usize,
        by_label: BTreeMap<String, usize>,
    ) -> Result<VehicleCount, StoreError> {
        let previous = self.get(feed_index)?;
        let next = VehicleCount {
            feed_index,
            count,
            by_label,
            cycle: previous.cycle + 1,
            last_updated: Some(Utc::now()),
        };
        self.entries.insert((feed_index, next.cycle), next.clone());
        self.entries.remove(&(feed_index, previous.cycle));
        Ok(next)
    }

    /// 全部条目 (每路最新版本),按索引排序
    pub fn snapshot(&self) -> Vec<VehicleCount> {
        let mut latest: BTreeMap<usize, VehicleCount> = BTreeMap::new();
        for entry in self.entries.iter() {
            // 同一路升序遍历,后出现的版本更新
            latest.insert(entry.key().0, entry.value().clone());
        }
        latest.into_values().collect()
    }
}
