//! 状态定义：待审批事件、worker 状态与协调器聚合视图
//!
//! AggregateState 是派生值：每次变更后由 Coordinator 重新计算并推送，从不作为权威状态存储。

use serde::{Deserialize, Serialize};

/// Worker 标识
pub type WorkerId = String;

/// 检测到的检查点事件（等待调用方放行或取消）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub id: String,
    pub worker_id: WorkerId,
    pub name: String,
    /// 解析成功为 JSON；解析失败则退化为原始字符串
    pub arguments: serde_json::Value,
    /// 检测时间（毫秒时间戳）
    pub detected_at: i64,
}

impl PendingEvent {
    pub fn new(worker_id: impl Into<WorkerId>, id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            worker_id: worker_id.into(),
            name: name.into(),
            arguments,
            detected_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Worker 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkerStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, WorkerStatus::Completed | WorkerStatus::Failed | WorkerStatus::Cancelled)
    }
}

/// 单个 worker 的待审批事件（UI 投影用，只含 id / name / arguments）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPending {
    pub worker_id: WorkerId,
    pub events: Vec<EventView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventView {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl From<&PendingEvent> for EventView {
    fn from(e: &PendingEvent) -> Self {
        Self {
            id: e.id.clone(),
            name: e.name.clone(),
            arguments: e.arguments.clone(),
        }
    }
}

/// 协调器的聚合视图
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateState {
    pub is_all_paused: bool,
    pub pending: Vec<WorkerPending>,
    pub can_resume: bool,
    pub can_cancel: bool,
}

impl AggregateState {
    /// 由「是否全部暂停」与各 worker 的待审批事件推导；canResume / canCancel 仅在全部暂停且有待审批时为真
    pub fn derive(is_all_paused: bool, pending: Vec<WorkerPending>) -> Self {
        let actionable = is_all_paused && !pending.is_empty();
        Self {
            is_all_paused,
            pending,
            can_resume: actionable,
            can_cancel: actionable,
        }
    }

    /// 某个 worker 的待审批事件（无则为空）
    pub fn pending_for(&self, worker_id: &str) -> &[EventView] {
        self.pending
            .iter()
            .find(|p| p.worker_id == worker_id)
            .map(|p| p.events.as_slice())
            .unwrap_or(&[])
    }
}

/// 协调器通知：逐 worker 与全局两个粒度
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    WorkerRegistered { worker_id: WorkerId },
    WorkerUnregistered { worker_id: WorkerId },
    WorkerPaused { worker_id: WorkerId },
    WorkerResumed { worker_id: WorkerId },
    WorkerCancelled { worker_id: WorkerId },
    EventsUpdated { worker_id: WorkerId, count: usize },
    /// pause_all 完成
    AllPaused,
    /// resume_all 完成
    AllResumed,
    /// cancel_all 完成
    AllCancelled,
}
