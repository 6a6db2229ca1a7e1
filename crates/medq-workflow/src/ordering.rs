//! 排队顺序引擎
//!
//! 门诊队列与检查队列共用同一套排序规则：优先级高者在前，同优先级按排队序号先到先得。
//! 两种队列只在"序号"的取法上不同，由 [`Queued::Rank`] 表达。

use chrono::{DateTime, NaiveDate, Utc};
use medq_core::{
    DiagnosticEntry, EntryStatus, MedqError, OpdEntry, Priority, QueueKey, Result, Versioned,
};
use std::cmp::Ordering;
use uuid::Uuid;

/// 可排队的条目
pub trait Queued: Clone {
    /// 同优先级内的先后次序，越小越靠前
    type Rank: Ord;

    fn entry_id(&self) -> Uuid;
    fn status(&self) -> EntryStatus;
    fn priority(&self) -> Priority;
    fn rank(&self) -> Self::Rank;
}

impl Queued for OpdEntry {
    type Rank = (NaiveDate, i32);

    fn entry_id(&self) -> Uuid {
        self.id
    }

    fn status(&self) -> EntryStatus {
        self.status
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn rank(&self) -> Self::Rank {
        (self.service_date, self.token)
    }
}

impl Queued for DiagnosticEntry {
    type Rank = (DateTime<Utc>, Uuid);

    fn entry_id(&self) -> Uuid {
        self.id
    }

    fn status(&self) -> EntryStatus {
        self.status
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn rank(&self) -> Self::Rank {
        (self.created_at, self.id)
    }
}

/// 叫号比较器：优先级降序，再按序号升序
pub fn queue_order<T: Queued>(a: &T, b: &T) -> Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| a.rank().cmp(&b.rank()))
}

/// 某一队列在某个版本下的快照
#[derive(Debug, Clone)]
pub struct QueueView<T: Queued> {
    key: QueueKey,
    version: u64,
    entries: Vec<T>,
}

impl<T: Queued> QueueView<T> {
    pub fn new(key: QueueKey, snapshot: Versioned<Vec<T>>) -> Self {
        Self {
            key,
            version: snapshot.version,
            entries: snapshot.value,
        }
    }

    pub fn key(&self) -> QueueKey {
        self.key
    }

    /// 读取快照时的队列版本，提交时作为乐观锁
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn find(&self, entry_id: Uuid) -> Option<&T> {
        self.entries.iter().find(|e| e.entry_id() == entry_id)
    }

    /// 下一位应当接受服务的候诊条目
    pub fn next(&self) -> Option<&T> {
        self.entries
            .iter()
            .filter(|e| e.status() == EntryStatus::Waiting)
            .min_by(|a, b| queue_order(*a, *b))
    }

    /// 正在服务中的条目
    pub fn in_progress(&self) -> Option<&T> {
        self.entries
            .iter()
            .find(|e| e.status() == EntryStatus::InProgress)
    }

    pub fn waiting_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status() == EntryStatus::Waiting)
            .count()
    }

    /// 串行叫号校验
    ///
    /// 已在服务中的条目直接放行；候诊条目必须是 [`next`](Self::next) 的结果，
    /// 否则返回携带正确下一位的 [`MedqError::OutOfOrder`]。
    pub fn enforce_serial(&self, entry_id: Uuid) -> Result<()> {
        if let Some(entry) = self.find(entry_id) {
            if entry.status() == EntryStatus::InProgress {
                return Ok(());
            }
        }

        match self.next() {
            Some(next) if next.entry_id() == entry_id => Ok(()),
            Some(next) => {
                tracing::warn!(
                    queue = %self.key,
                    requested = %entry_id,
                    next = %next.entry_id(),
                    "Out-of-order service attempt rejected"
                );
                Err(MedqError::OutOfOrder {
                    requested: entry_id,
                    next: next.entry_id(),
                })
            }
            None => Err(MedqError::NotFound(format!(
                "entry {} is not waiting in queue {}",
                entry_id, self.key
            ))),
        }
    }

    /// 展示顺序：服务中、候诊（按叫号顺序）、暂不在场（按序号）
    pub fn ordered(&self) -> Vec<T> {
        let mut in_progress = Vec::new();
        let mut waiting = Vec::new();
        let mut parked = Vec::new();

        for entry in &self.entries {
            match entry.status() {
                EntryStatus::InProgress => in_progress.push(entry.clone()),
                EntryStatus::Waiting => waiting.push(entry.clone()),
                EntryStatus::NotAvailable => parked.push(entry.clone()),
                EntryStatus::Completed => {}
            }
        }

        waiting.sort_by(queue_order);
        parked.sort_by(|a, b| a.rank().cmp(&b.rank()));

        in_progress.extend(waiting);
        in_progress.extend(parked);
        in_progress
    }
}
