//! Coordinator：持有每个 worker 的 PauseGate 与待审批事件，提供统一控制面
//!
//! 所有内部表只由 Coordinator 自己的方法修改，并由一把粗粒度 Mutex 保护（worker 数量为个位数到几十）。
//! 每次变更后重新计算 AggregateState 并通过 watch 通道推送；全局/逐 worker 通知通过 broadcast 推送。
//!
//! 针对未注册 worker 的操作一律记录 warn 后忽略：worker 可能已注销而 UI 的控制命令或迟到的事件仍在路上。

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};

use crate::core::error::CompareError;
use crate::core::gate::PauseGate;
use crate::core::state::{
    AggregateState, CoordinatorEvent, EventView, PendingEvent, WorkerId, WorkerPending, WorkerStatus,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct Worker {
    gate: PauseGate,
    pending_events: Vec<PendingEvent>,
    status: WorkerStatus,
}

type WorkerMap = BTreeMap<WorkerId, Worker>;

/// 多 worker 暂停/恢复/取消协调器
pub struct Coordinator {
    workers: Mutex<WorkerMap>,
    state_tx: watch::Sender<AggregateState>,
    events_tx: broadcast::Sender<CoordinatorEvent>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(AggregateState::default());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            workers: Mutex::new(BTreeMap::new()),
            state_tx,
            events_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkerMap> {
        // 持锁期间不会 panic 出半更新状态；中毒时继续使用内部数据
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn derive_state(workers: &WorkerMap) -> AggregateState {
        let is_all_paused = !workers.is_empty() && workers.values().all(|w| w.gate.is_paused());
        let pending = workers
            .iter()
            .filter(|(_, w)| !w.pending_events.is_empty())
            .map(|(id, w)| WorkerPending {
                worker_id: id.clone(),
                events: w.pending_events.iter().map(EventView::from).collect(),
            })
            .collect();
        AggregateState::derive(is_all_paused, pending)
    }

    /// 持锁时调用，保证推送顺序与变更顺序一致
    fn publish(&self, workers: &WorkerMap) {
        self.state_tx.send_replace(Self::derive_state(workers));
    }

    fn notify(&self, event: CoordinatorEvent) {
        let _ = self.events_tx.send(event);
    }

    /// 订阅聚合状态（每次变更后推送最新快照）
    pub fn subscribe_state(&self) -> watch::Receiver<AggregateState> {
        self.state_tx.subscribe()
    }

    /// 订阅逐 worker / 全局通知
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events_tx.subscribe()
    }

    /// 注册 worker；id 已存在时返回 DuplicateWorker
    pub fn register_worker(&self, id: impl Into<WorkerId>, gate: PauseGate) -> Result<(), CompareError> {
        let id = id.into();
        let mut workers = self.lock();
        if workers.contains_key(&id) {
            return Err(CompareError::DuplicateWorker(id));
        }
        let status = if gate.is_paused() { WorkerStatus::Paused } else { WorkerStatus::Running };
        workers.insert(
            id.clone(),
            Worker {
                gate,
                pending_events: Vec::new(),
                status,
            },
        );
        self.publish(&workers);
        tracing::debug!(worker = %id, "Worker registered");
        self.notify(CoordinatorEvent::WorkerRegistered { worker_id: id });
        Ok(())
    }

    /// 注销 worker：取消其闸门（放行等待者）、丢弃待审批事件并重算状态
    pub fn unregister_worker(&self, id: &str) -> bool {
        let mut workers = self.lock();
        let Some(worker) = workers.remove(id) else {
            tracing::warn!(worker = %id, "Unregister for unknown worker ignored");
            return false;
        };
        worker.gate.cancel();
        self.publish(&workers);
        tracing::debug!(worker = %id, "Worker unregistered");
        self.notify(CoordinatorEvent::WorkerUnregistered { worker_id: id.to_string() });
        true
    }

    /// 整体替换 worker 的待审批事件
    pub fn update_pending_events(&self, id: &str, events: Vec<PendingEvent>) -> bool {
        self.modify_pending(id, |pending| *pending = events)
    }

    /// 在 worker 现有待审批事件后追加（单次加锁内完成读-改-写）
    pub fn append_pending_events(&self, id: &str, events: Vec<PendingEvent>) -> bool {
        self.modify_pending(id, |pending| pending.extend(events))
    }

    fn modify_pending(&self, id: &str, f: impl FnOnce(&mut Vec<PendingEvent>)) -> bool {
        let mut workers = self.lock();
        let Some(worker) = workers.get_mut(id) else {
            tracing::warn!(worker = %id, "Pending events for unknown worker dropped");
            return false;
        };
        f(&mut worker.pending_events);
        let count = worker.pending_events.len();
        self.publish(&workers);
        self.notify(CoordinatorEvent::EventsUpdated {
            worker_id: id.to_string(),
            count,
        });
        true
    }

    /// worker 当前的待审批事件
    pub fn pending_events(&self, id: &str) -> Vec<PendingEvent> {
        self.lock()
            .get(id)
            .map(|w| w.pending_events.clone())
            .unwrap_or_default()
    }

    pub fn pause_worker(&self, id: &str) -> bool {
        let mut workers = self.lock();
        let Some(worker) = workers.get_mut(id) else {
            tracing::warn!(worker = %id, "Pause for unknown worker ignored");
            return false;
        };
        let changed = pause_one(worker);
        self.publish(&workers);
        if changed {
            tracing::info!(worker = %id, "Worker paused");
            self.notify(CoordinatorEvent::WorkerPaused { worker_id: id.to_string() });
        }
        true
    }

    /// 恢复 worker：先清空待审批事件并推送状态，再打开闸门
    pub fn resume_worker(&self, id: &str) -> bool {
        let mut workers = self.lock();
        let Some(worker) = workers.get_mut(id) else {
            tracing::warn!(worker = %id, "Resume for unknown worker ignored");
            return false;
        };
        worker.pending_events.clear();
        self.publish(&workers);

        let changed = workers.get_mut(id).map(resume_one).unwrap_or(false);
        self.publish(&workers);
        if changed {
            tracing::info!(worker = %id, "Worker resumed");
            self.notify(CoordinatorEvent::WorkerResumed { worker_id: id.to_string() });
        }
        true
    }

    pub fn pause_all(&self) {
        let mut workers = self.lock();
        let changed: Vec<WorkerId> = workers
            .iter_mut()
            .filter_map(|(id, w)| pause_one(w).then(|| id.clone()))
            .collect();
        self.publish(&workers);
        tracing::info!("Paused {} of {} workers", changed.len(), workers.len());
        for worker_id in changed {
            self.notify(CoordinatorEvent::WorkerPaused { worker_id });
        }
        self.notify(CoordinatorEvent::AllPaused);
    }

    pub fn resume_all(&self) {
        let changed = self.release_all();
        tracing::info!("Resumed {} workers", changed.len());
        for worker_id in changed {
            self.notify(CoordinatorEvent::WorkerResumed { worker_id });
        }
        self.notify(CoordinatorEvent::AllResumed);
    }

    /// 放弃 worker 当前检查点：清空事件并恢复（不取消闸门，任务通过自己的取消令牌退出）。幂等。
    pub fn cancel_worker(&self, id: &str) -> bool {
        let mut workers = self.lock();
        let Some(worker) = workers.get_mut(id) else {
            tracing::warn!(worker = %id, "Cancel for unknown worker ignored");
            return false;
        };
        let had_events = !worker.pending_events.is_empty();
        worker.pending_events.clear();
        self.publish(&workers);

        let resumed = workers.get_mut(id).map(resume_one).unwrap_or(false);
        self.publish(&workers);
        if had_events || resumed {
            tracing::info!(worker = %id, "Worker checkpoint cancelled");
            self.notify(CoordinatorEvent::WorkerCancelled { worker_id: id.to_string() });
        }
        true
    }

    pub fn cancel_all(&self) {
        let changed = self.release_all();
        tracing::info!("Cancelled checkpoints of {} workers", changed.len());
        for worker_id in changed {
            self.notify(CoordinatorEvent::WorkerCancelled { worker_id });
        }
        self.notify(CoordinatorEvent::AllCancelled);
    }

    /// 清空所有待审批事件并打开所有闸门；返回实际被恢复的 worker
    fn release_all(&self) -> Vec<WorkerId> {
        let mut workers = self.lock();
        for w in workers.values_mut() {
            w.pending_events.clear();
        }
        self.publish(&workers);

        let changed = workers
            .iter_mut()
            .filter_map(|(id, w)| resume_one(w).then(|| id.clone()))
            .collect();
        self.publish(&workers);
        changed
    }

    /// 当前聚合状态（纯派生快照）
    pub fn get_aggregate_state(&self) -> AggregateState {
        Self::derive_state(&self.lock())
    }

    /// 是否有任一已注册 worker 存在待审批事件
    pub fn has_pending_events(&self) -> bool {
        self.lock().values().any(|w| !w.pending_events.is_empty())
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.lock().keys().cloned().collect()
    }

    pub fn worker_status(&self, id: &str) -> Option<WorkerStatus> {
        self.lock().get(id).map(|w| w.status)
    }

    pub fn set_worker_status(&self, id: &str, status: WorkerStatus) -> bool {
        match self.lock().get_mut(id) {
            Some(w) => {
                w.status = status;
                true
            }
            None => {
                tracing::warn!(worker = %id, ?status, "Status update for unknown worker ignored");
                false
            }
        }
    }

    /// worker 的闸门句柄（供测试或调用方直接检查）
    pub fn gate(&self, id: &str) -> Option<PauseGate> {
        self.lock().get(id).map(|w| w.gate.clone())
    }
}

fn pause_one(worker: &mut Worker) -> bool {
    let changed = worker.gate.pause();
    if changed && !worker.status.is_finished() {
        worker.status = WorkerStatus::Paused;
    }
    changed
}

fn resume_one(worker: &mut Worker) -> bool {
    let changed = worker.gate.resume();
    if changed && worker.status == WorkerStatus::Paused {
        worker.status = WorkerStatus::Running;
    }
    changed
}
