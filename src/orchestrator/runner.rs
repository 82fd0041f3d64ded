//! Orchestrator：把一批等价任务并发分发给执行引擎，逐 worker 隔离失败并收集结果
//!
//! 每个任务：子取消令牌 -> 绑定到令牌的 PauseGate -> 注册到 Coordinator ->
//! 引擎输出经 WorkerPipeline 进入检测器与协调器 -> 结束后注销并清理检测缓冲。
//! 任一任务的失败 / panic 都只体现在它自己的 TaskResult 中。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::{
    BatchStats, CompareError, Coordinator, PauseGate, ResultAggregator, TaskResult, WorkerId, WorkerStatus,
};
use crate::detect::EventDetector;
use crate::engine::{ExecutionEngine, PromptTransform, TaskContext};
use crate::orchestrator::pipeline::WorkerPipeline;

/// 一个待执行任务
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub worker_id: WorkerId,
    pub input: String,
    pub prompt_transform: Option<PromptTransform>,
    /// 覆盖配置中的默认超时
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn new(worker_id: impl Into<WorkerId>, input: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            input: input.into(),
            prompt_transform: None,
            timeout: None,
        }
    }

    pub fn with_prompt_transform(mut self, transform: PromptTransform) -> Self {
        self.prompt_transform = Some(transform);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// 检测到检查点事件后自动暂停该 worker
    pub auto_pause_on_event: bool,
    /// 单任务默认超时；None 表示不限
    pub task_timeout: Option<Duration>,
}

/// run_batch 的结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: String,
    pub results: Vec<TaskResult>,
    pub stats: BatchStats,
}

pub struct Orchestrator {
    engine: Arc<dyn ExecutionEngine>,
    coordinator: Arc<Coordinator>,
    detector: Arc<dyn EventDetector>,
    aggregator: Arc<ResultAggregator>,
    config: OrchestratorConfig,
    /// 所有 worker 令牌的根；shutdown 后本编排器不再可用
    root: CancellationToken,
}

/// 单个 worker 运行所需的全部句柄（move 进 spawn 的任务）
struct WorkerRun {
    engine: Arc<dyn ExecutionEngine>,
    coordinator: Arc<Coordinator>,
    detector: Arc<dyn EventDetector>,
    aggregator: Arc<ResultAggregator>,
    batch_id: Option<String>,
    task: TaskSpec,
    token: CancellationToken,
    gate: PauseGate,
    auto_pause: bool,
    timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        coordinator: Arc<Coordinator>,
        detector: Arc<dyn EventDetector>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            engine,
            coordinator,
            detector,
            aggregator: Arc::new(ResultAggregator::new()),
            config,
            root: CancellationToken::new(),
        }
    }

    /// 共享一个外部的 ResultAggregator（供 UI 轮询批次统计）
    pub fn with_aggregator(mut self, aggregator: Arc<ResultAggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn aggregator(&self) -> &Arc<ResultAggregator> {
        &self.aggregator
    }

    /// 根取消令牌（可交给信号处理器）
    pub fn cancel_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// 拆除：取消所有 worker、放行所有检查点并清空检测缓冲
    pub fn shutdown(&self) {
        tracing::info!("Orchestrator shutting down");
        self.root.cancel();
        self.coordinator.cancel_all();
        self.detector.clear_all();
    }

    /// 并发执行所有任务，全部结束后按输入顺序返回结果。
    /// 只有 worker id 重复（编程误用）会返回错误，此时没有任何任务被启动。
    /// 返回的 future 被提前丢弃时，本批所有 worker 会被取消并从协调器注销。
    pub async fn run(&self, tasks: Vec<TaskSpec>) -> Result<Vec<TaskResult>, CompareError> {
        self.run_inner(None, tasks).await
    }

    /// 与 run 相同，并把结果实时记录到 ResultAggregator，结束后 finalize 并返回统计
    pub async fn run_batch(&self, batch_id: &str, tasks: Vec<TaskSpec>) -> Result<BatchReport, CompareError> {
        let results = self.run_inner(Some(batch_id), tasks).await?;
        let stats = match self.aggregator.finalize_batch(batch_id).await {
            Some(batch) => batch.stats,
            None => self.aggregator.stats(batch_id).await.unwrap_or_default(),
        };
        Ok(BatchReport {
            batch_id: batch_id.to_string(),
            results,
            stats,
        })
    }

    async fn run_inner(&self, batch_id: Option<&str>, tasks: Vec<TaskSpec>) -> Result<Vec<TaskResult>, CompareError> {
        // 调用方丢弃本 future 时取消整批 worker，让它们自行注销而不是停在检查点上
        let batch_token = self.root.child_token();
        let _batch_guard = batch_token.clone().drop_guard();
        let handles = self.register_all(&batch_token, &tasks)?;
        if let Some(id) = batch_id {
            self.aggregator
                .start_batch(id, tasks.iter().map(|t| t.worker_id.clone()))
                .await;
        }
        tracing::info!(workers = tasks.len(), "Starting workers");

        let spawned: Vec<_> = tasks
            .into_iter()
            .zip(handles)
            .map(|(task, (token, gate))| {
                let worker_id = task.worker_id.clone();
                let run = WorkerRun {
                    engine: Arc::clone(&self.engine),
                    coordinator: Arc::clone(&self.coordinator),
                    detector: Arc::clone(&self.detector),
                    aggregator: Arc::clone(&self.aggregator),
                    batch_id: batch_id.map(str::to_string),
                    timeout: task.timeout.or(self.config.task_timeout),
                    task,
                    token,
                    gate,
                    auto_pause: self.config.auto_pause_on_event,
                };
                (worker_id, tokio::spawn(run.execute()))
            })
            .collect();

        let (worker_ids, handles): (Vec<_>, Vec<_>) = spawned.into_iter().unzip();
        let joined = join_all(handles).await;

        let mut results = Vec::with_capacity(joined.len());
        for (worker_id, joined) in worker_ids.into_iter().zip(joined) {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    // panic 的任务没机会自行清理
                    tracing::error!(worker = %worker_id, "Worker task panicked: {}", e);
                    self.coordinator.unregister_worker(&worker_id);
                    self.detector.clear_worker_buffers(&worker_id);
                    let result = TaskResult::failure(&worker_id, CompareError::TaskPanicked(e.to_string()).to_string());
                    if let Some(id) = batch_id {
                        self.aggregator.record_result(id, result.clone()).await;
                    }
                    result
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    /// 为每个任务建令牌与闸门并注册；任一注册失败则回滚本批已注册的 worker
    fn register_all(
        &self,
        batch_token: &CancellationToken,
        tasks: &[TaskSpec],
    ) -> Result<Vec<(CancellationToken, PauseGate)>, CompareError> {
        let mut registered: Vec<(CancellationToken, PauseGate)> = Vec::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            let token = batch_token.child_token();
            let gate = PauseGate::bound_to(&token);
            if let Err(e) = self.coordinator.register_worker(task.worker_id.clone(), gate.clone()) {
                tracing::error!("Worker registration failed: {}", e);
                token.cancel();
                for (prev, (prev_token, _)) in tasks.iter().zip(&registered).take(i) {
                    prev_token.cancel();
                    self.coordinator.unregister_worker(&prev.worker_id);
                }
                return Err(e);
            }
            registered.push((token, gate));
        }
        Ok(registered)
    }
}

impl WorkerRun {
    async fn execute(self) -> TaskResult {
        let WorkerRun {
            engine,
            coordinator,
            detector,
            aggregator,
            batch_id,
            task,
            token,
            gate,
            auto_pause,
            timeout,
        } = self;
        let worker_id = task.worker_id.clone();
        let started = Instant::now();

        let sink = Arc::new(WorkerPipeline::new(
            worker_id.clone(),
            Arc::clone(&detector),
            Arc::clone(&coordinator),
            auto_pause,
        ));
        let ctx = TaskContext {
            worker_id: worker_id.clone(),
            input: task.input,
            cancel: token.clone(),
            gate,
            sink,
            prompt_transform: task.prompt_transform,
        };

        let outcome = match timeout {
            Some(limit) => tokio::select! {
                r = engine.execute(ctx) => r,
                _ = tokio::time::sleep(limit) => {
                    token.cancel();
                    Err(CompareError::TimedOut(limit.as_millis() as u64))
                }
            },
            None => engine.execute(ctx).await,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (result, status) = match outcome {
            Ok(output) => {
                tracing::info!(worker = %worker_id, elapsed_ms, chars = output.len(), "Worker completed");
                (TaskResult::success(&worker_id, output), WorkerStatus::Completed)
            }
            Err(e) => {
                tracing::warn!(worker = %worker_id, elapsed_ms, "Worker failed: {}", e);
                let status = match e {
                    CompareError::Cancelled | CompareError::TimedOut(_) => WorkerStatus::Cancelled,
                    _ => WorkerStatus::Failed,
                };
                (TaskResult::failure(&worker_id, e.to_string()), status)
            }
        };

        coordinator.set_worker_status(&worker_id, status);
        coordinator.unregister_worker(&worker_id);
        detector.clear_worker_buffers(&worker_id);
        token.cancel();

        if let Some(id) = batch_id {
            aggregator.record_result(&id, result.clone()).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StreamEventDetector;
    use crate::engine::{ScriptStep, ScriptedEngine};

    fn orchestrator(engine: ScriptedEngine, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(
            Arc::new(engine),
            Arc::new(Coordinator::new()),
            Arc::new(StreamEventDetector::default()),
            config,
        )
    }

    #[tokio::test]
    async fn test_run_isolates_failure() {
        let engine = ScriptedEngine::new()
            .with_default_script(vec![ScriptStep::Text("ok".into())])
            .with_script("w2", vec![ScriptStep::Fail("model exploded".into())]);
        let orch = orchestrator(engine, OrchestratorConfig::default());

        let tasks = vec![TaskSpec::new("w1", "q"), TaskSpec::new("w2", "q"), TaskSpec::new("w3", "q")];
        let results = orch.run(tasks).await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.error.is_none()).count(), 2);
        assert!(results[1].error.as_deref().unwrap().contains("model exploded"));
        assert!(orch.coordinator().worker_ids().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_worker_ids_rejected_before_start() {
        let engine = ScriptedEngine::new().with_default_script(vec![ScriptStep::Text("ok".into())]);
        let orch = orchestrator(engine, OrchestratorConfig::default());

        let err = orch
            .run(vec![TaskSpec::new("a", "q"), TaskSpec::new("b", "q"), TaskSpec::new("a", "q")])
            .await
            .unwrap_err();
        assert_eq!(err, CompareError::DuplicateWorker("a".into()));
        assert!(orch.coordinator().worker_ids().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_cancels_worker() {
        let engine = ScriptedEngine::new().with_default_script(vec![ScriptStep::Sleep(Duration::from_secs(30))]);
        let orch = orchestrator(
            engine,
            OrchestratorConfig {
                task_timeout: Some(Duration::from_millis(50)),
                ..OrchestratorConfig::default()
            },
        );
        let results = orch.run(vec![TaskSpec::new("slow", "q")]).await.unwrap();
        assert_eq!(results[0].error.as_deref(), Some("Task timed out after 50 ms"));
    }

    #[tokio::test]
    async fn test_dropped_run_cancels_and_unregisters_workers() {
        let engine = ScriptedEngine::new().with_default_script(vec![
            ScriptStep::Text(r#"lookup({"q": 1})"#.into()),
            ScriptStep::Checkpoint,
        ]);
        let orch = Arc::new(orchestrator(
            engine,
            OrchestratorConfig {
                auto_pause_on_event: true,
                ..OrchestratorConfig::default()
            },
        ));
        let coordinator = Arc::clone(orch.coordinator());
        let mut state_rx = coordinator.subscribe_state();

        let run = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.run(vec![TaskSpec::new("a", "q"), TaskSpec::new("b", "q")]).await })
        };
        tokio::time::timeout(Duration::from_secs(5), state_rx.wait_for(|s| s.is_all_paused))
            .await
            .unwrap()
            .unwrap();

        run.abort();
        tokio::time::timeout(Duration::from_secs(5), state_rx.wait_for(|s| s.pending.is_empty() && !s.is_all_paused))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !coordinator.worker_ids().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_run_batch_reports_stats() {
        let engine = ScriptedEngine::new()
            .with_default_script(vec![ScriptStep::Text("four".into())])
            .with_script("bad", vec![ScriptStep::Fail("nope".into())]);
        let orch = orchestrator(engine, OrchestratorConfig::default());

        let report = orch
            .run_batch("batch-1", vec![TaskSpec::new("a", "q"), TaskSpec::new("bad", "q")])
            .await
            .unwrap();
        assert_eq!(report.stats.success_count, 1);
        assert_eq!(report.stats.error_count, 1);
        assert_eq!(report.stats.pending_count, 0);
        assert!((report.stats.average_output_length - 4.0).abs() < f64::EPSILON);
        assert!(orch.aggregator().active_batches().await.is_empty());
    }
}
