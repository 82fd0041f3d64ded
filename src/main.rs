//! Bee Compare - 多 worker 并行对比演示
//!
//! 入口：初始化日志、加载配置，用脚本化引擎并发运行三个 worker，
//! 自身充当控制方：所有 worker 都停在检查点且有待审批事件时统一放行；Ctrl+C 取消整批。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bee_compare::config::{load_config, AppConfig};
use bee_compare::core::Coordinator;
use bee_compare::detect::{DetectorConfig, StreamEventDetector};
use bee_compare::engine::{CandidateDelta, PromptTransform, ScriptStep, ScriptedEngine};
use bee_compare::observability;
use bee_compare::orchestrator::{Orchestrator, OrchestratorConfig, TaskSpec};

fn demo_engine() -> ScriptedEngine {
    ScriptedEngine::new()
        .with_script(
            "structured",
            vec![
                ScriptStep::Text("Looking it up. ".into()),
                ScriptStep::Delta(vec![CandidateDelta::new("call_1").with_name("lookup")]),
                ScriptStep::Delta(vec![CandidateDelta::new("call_1").with_arguments(r#"{"q": "rust"}"#)]),
                ScriptStep::Checkpoint,
                ScriptStep::Text("Rust is a systems language.".into()),
            ],
        )
        .with_script(
            "freetext",
            vec![
                ScriptStep::Text(r#"<tool_call>{"name": "search", "arguments": {"query": "rust"}}</tool_call>"#.into()),
                ScriptStep::Sleep(Duration::from_millis(100)),
                ScriptStep::Checkpoint,
                ScriptStep::EchoPrompt,
            ],
        )
        .with_script(
            "failing",
            vec![
                ScriptStep::Text("Trying...".into()),
                ScriptStep::Fail("upstream model unavailable".into()),
            ],
        )
}

/// 所有 worker 都已暂停且有待审批事件时，统一放行
async fn auto_approve(coordinator: Arc<Coordinator>) {
    let mut state_rx = coordinator.subscribe_state();
    while state_rx.changed().await.is_ok() {
        let state = state_rx.borrow_and_update().clone();
        if state.can_resume {
            tracing::info!(
                workers = state.pending.len(),
                "All workers paused at checkpoint, approving"
            );
            coordinator.resume_all();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        eprintln!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    observability::init(&cfg.app.log_level);

    let coordinator = Arc::new(Coordinator::new());
    let detector = Arc::new(StreamEventDetector::new(DetectorConfig::from(&cfg.detector)));
    let orchestrator = Orchestrator::new(
        Arc::new(demo_engine()),
        Arc::clone(&coordinator),
        detector,
        OrchestratorConfig::from(&cfg.orchestrator),
    );

    let approver = tokio::spawn(auto_approve(Arc::clone(&coordinator)));

    let tasks = vec![
        TaskSpec::new("structured", "What is Rust?"),
        TaskSpec::new("freetext", "What is Rust?")
            .with_prompt_transform(PromptTransform::new(|p| format!("Answer briefly: {}", p))),
        TaskSpec::new("failing", "What is Rust?"),
    ];
    let batch_id = format!("batch_{}", uuid::Uuid::new_v4());

    let report = tokio::select! {
        r = orchestrator.run_batch(&batch_id, tasks) => r.context("Batch run failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, cancelling batch...");
            orchestrator.shutdown();
            approver.abort();
            return Ok(());
        }
    };
    approver.abort();

    for result in &report.results {
        match &result.error {
            None => tracing::info!(worker = %result.worker_id, "Output: {}", result.output),
            Some(e) => tracing::warn!(worker = %result.worker_id, "Error: {}", e),
        }
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&report.stats).context("Failed to serialize stats")?
    );
    Ok(())
}
