//! 观察队列：有界 FIFO，多方并发提交，调度器按提交顺序批量取出
//!
//! 满载时丢弃最旧的观察并计数（drop-oldest），提交方从不阻塞等待空位。
//! 循环停止后队列关闭，后续提交返回 LoopStopped。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::Mutex;

use crate::core::CycleError;
use crate::cycle::types::Observation;

/// 提交结果
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// 已入队；queued 为入队后的长度
    Accepted { queued: usize },
    /// 队列已满，最旧的一条被丢弃
    DroppedOldest { dropped: Box<Observation>, queued: usize },
}

impl SubmitOutcome {
    pub fn queued(&self) -> usize {
        match self {
            SubmitOutcome::Accepted { queued } | SubmitOutcome::DroppedOldest { queued, .. } => *queued,
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<Observation>,
    closed: bool,
}

/// 有界观察队列
#[derive(Debug)]
pub struct ObservationQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    dropped: AtomicU64,
    /// 长度镜像，供 status 无锁读取
    len: AtomicUsize,
}

impl ObservationQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            capacity,
            dropped: AtomicU64::new(0),
            len: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn submit(&self, observation: Observation) -> Result<SubmitOutcome, CycleError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(CycleError::LoopStopped);
        }

        let dropped = if inner.items.len() >= self.capacity {
            inner.items.pop_front()
        } else {
            None
        };
        inner.items.push_back(observation);
        let queued = inner.items.len();
        self.len.store(queued, Ordering::Release);

        Ok(match dropped {
            Some(old) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(dropped_id = %old.id, capacity = self.capacity, "observation queue full, dropped oldest");
                SubmitOutcome::DroppedOldest {
                    dropped: Box::new(old),
                    queued,
                }
            }
            None => SubmitOutcome::Accepted { queued },
        })
    }

    /// 按提交顺序取出至多 max_count 条（仅由所属调度器调用）
    pub async fn drain(&self, max_count: usize) -> Vec<Observation> {
        let mut inner = self.inner.lock().await;
        let n = max_count.min(inner.items.len());
        let batch: Vec<Observation> = inner.items.drain(..n).collect();
        self.len.store(inner.items.len(), Ordering::Release);
        batch
    }

    /// 关闭队列并清空残留观察
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.items.clear();
        self.len.store(0, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
