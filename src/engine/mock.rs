//! 脚本化执行引擎（用于测试与本地演示，无需真实模型）
//!
//! 每个 worker 按脚本依次输出文本 / 结构化增量，并在 Checkpoint 处等待闸门。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{CompareError, GateSignal};
use crate::engine::{CandidateDelta, ExecutionEngine, Fragment, TaskContext};

/// 脚本中的一步
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// 输出文本片段（同时计入最终输出）
    Text(String),
    /// 输出结构化候选事件增量
    Delta(Vec<CandidateDelta>),
    /// 检查点：等待闸门打开
    Checkpoint,
    Sleep(Duration),
    /// 以错误结束
    Fail(String),
    /// 把变换后的 prompt 追加到输出
    EchoPrompt,
}

/// 按 worker id 选择脚本；未配置的 worker 使用默认脚本
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    scripts: HashMap<String, Vec<ScriptStep>>,
    default_script: Vec<ScriptStep>,
    checkpoints_passed: Mutex<HashMap<String, usize>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, worker_id: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        self.scripts.insert(worker_id.into(), steps);
        self
    }

    pub fn with_default_script(mut self, steps: Vec<ScriptStep>) -> Self {
        self.default_script = steps;
        self
    }

    /// worker 已越过的检查点数
    pub fn checkpoints_passed(&self, worker_id: &str) -> usize {
        self.checkpoints_passed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker_id)
            .copied()
            .unwrap_or(0)
    }

    fn mark_checkpoint(&self, worker_id: &str) {
        *self
            .checkpoints_passed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(worker_id.to_string())
            .or_default() += 1;
    }
}

#[async_trait]
impl ExecutionEngine for ScriptedEngine {
    async fn execute(&self, ctx: TaskContext) -> Result<String, CompareError> {
        let steps = self.scripts.get(&ctx.worker_id).unwrap_or(&self.default_script);
        let mut output = String::new();

        for step in steps {
            if ctx.cancel.is_cancelled() {
                return Err(CompareError::Cancelled);
            }
            match step {
                ScriptStep::Text(text) => {
                    output.push_str(text);
                    ctx.sink.send(Fragment::text(text.clone()));
                }
                ScriptStep::Delta(deltas) => {
                    ctx.sink.send(Fragment::deltas(deltas.clone()));
                }
                ScriptStep::Checkpoint => {
                    let signal = tokio::select! {
                        s = ctx.gate.wait_for_open() => s,
                        _ = ctx.cancel.cancelled() => GateSignal::Cancelled,
                    };
                    if signal.is_cancelled() {
                        return Err(CompareError::Cancelled);
                    }
                    self.mark_checkpoint(&ctx.worker_id);
                }
                ScriptStep::Sleep(d) => {
                    tokio::select! {
                        _ = tokio::time::sleep(*d) => {}
                        _ = ctx.cancel.cancelled() => return Err(CompareError::Cancelled),
                    }
                }
                ScriptStep::Fail(msg) => return Err(CompareError::Engine(msg.clone())),
                ScriptStep::EchoPrompt => output.push_str(&ctx.rendered_prompt()),
            }
        }
        Ok(output)
    }
}
