//! 批次结果汇总
//!
//! 追踪一批任务的 pending / completed 集合，结果到达时重算统计；
//! 批次完成并 finalize 后从活跃表移除，避免内存无限增长。

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::core::state::WorkerId;

/// 单个 worker 的最终结果（生成后不再修改）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub worker_id: WorkerId,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 完成时间（毫秒时间戳）
    pub completed_at: i64,
}

impl TaskResult {
    pub fn success(worker_id: impl Into<WorkerId>, output: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            output: output.into(),
            error: None,
            completed_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn failure(worker_id: impl Into<WorkerId>, error: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            output: String::new(),
            error: Some(error.into()),
            completed_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// 批次统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub success_count: usize,
    pub error_count: usize,
    pub pending_count: usize,
    /// 成功结果的平均输出长度（字符数）
    pub average_output_length: f64,
    /// 相对批次开始的最快完成耗时
    pub fastest_completion_ms: Option<i64>,
    pub slowest_completion_ms: Option<i64>,
}

/// 一批同时提交的任务
#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_id: String,
    pub task_ids: HashSet<WorkerId>,
    pub pending_ids: HashSet<WorkerId>,
    pub completed_ids: HashSet<WorkerId>,
    pub results: HashMap<WorkerId, TaskResult>,
    /// 开始时间（毫秒时间戳）
    pub started_at: i64,
    pub stats: BatchStats,
}

impl Batch {
    fn new(batch_id: String, task_ids: HashSet<WorkerId>) -> Self {
        let stats = BatchStats {
            pending_count: task_ids.len(),
            ..BatchStats::default()
        };
        Self {
            batch_id,
            pending_ids: task_ids.clone(),
            task_ids,
            completed_ids: HashSet::new(),
            results: HashMap::new(),
            started_at: chrono::Utc::now().timestamp_millis(),
            stats,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pending_ids.is_empty()
    }

    fn recompute_stats(&mut self) {
        let successes: Vec<&TaskResult> = self.results.values().filter(|r| r.is_success()).collect();
        let latencies: Vec<i64> = self
            .results
            .values()
            .map(|r| (r.completed_at - self.started_at).max(0))
            .collect();

        let average_output_length = if successes.is_empty() {
            0.0
        } else {
            let total: usize = successes.iter().map(|r| r.output.chars().count()).sum();
            total as f64 / successes.len() as f64
        };

        self.stats = BatchStats {
            success_count: successes.len(),
            error_count: self.results.len() - successes.len(),
            pending_count: self.pending_ids.len(),
            average_output_length,
            fastest_completion_ms: latencies.iter().copied().min(),
            slowest_completion_ms: latencies.iter().copied().max(),
        };
    }
}

/// 活跃批次表
#[derive(Default)]
pub struct ResultAggregator {
    batches: RwLock<HashMap<String, Batch>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始一个批次；同名批次会被覆盖
    pub async fn start_batch(&self, batch_id: &str, task_ids: impl IntoIterator<Item = WorkerId>) {
        let batch = Batch::new(batch_id.to_string(), task_ids.into_iter().collect());
        tracing::info!(batch = %batch_id, tasks = batch.task_ids.len(), "Batch started");
        if self.batches.write().await.insert(batch_id.to_string(), batch).is_some() {
            tracing::warn!(batch = %batch_id, "Batch restarted, previous results discarded");
        }
    }

    /// 记录结果：把任务从 pending 移到 completed 并重算统计。未知批次或非 pending 任务返回 false。
    pub async fn record_result(&self, batch_id: &str, result: TaskResult) -> bool {
        let mut batches = self.batches.write().await;
        let Some(batch) = batches.get_mut(batch_id) else {
            tracing::warn!(batch = %batch_id, "Result for unknown batch ignored");
            return false;
        };
        if !batch.pending_ids.remove(&result.worker_id) {
            tracing::warn!(
                batch = %batch_id,
                worker = %result.worker_id,
                "Result for task that is not pending ignored"
            );
            return false;
        }
        batch.completed_ids.insert(result.worker_id.clone());
        batch.results.insert(result.worker_id.clone(), result);
        batch.recompute_stats();
        true
    }

    /// 批次是否全部完成（未知批次视为未完成）
    pub async fn is_complete(&self, batch_id: &str) -> bool {
        self.batches
            .read()
            .await
            .get(batch_id)
            .map(Batch::is_complete)
            .unwrap_or(false)
    }

    pub async fn stats(&self, batch_id: &str) -> Option<BatchStats> {
        self.batches.read().await.get(batch_id).map(|b| b.stats.clone())
    }

    pub async fn batch(&self, batch_id: &str) -> Option<Batch> {
        self.batches.read().await.get(batch_id).cloned()
    }

    pub async fn active_batches(&self) -> Vec<String> {
        self.batches.read().await.keys().cloned().collect()
    }

    /// 批次完成时将其从活跃表移除并返回；未完成或未知返回 None
    pub async fn finalize_batch(&self, batch_id: &str) -> Option<Batch> {
        let mut batches = self.batches.write().await;
        if !batches.get(batch_id).map(Batch::is_complete).unwrap_or(false) {
            return None;
        }
        let batch = batches.remove(batch_id)?;
        tracing::info!(
            batch = %batch_id,
            success = batch.stats.success_count,
            errors = batch.stats.error_count,
            "Batch finalized"
        );
        Some(batch)
    }
}
