//! 执行引擎接口
//!
//! 引擎本身（真正产生流式输出与模型/工具调用的部分）是外部协作者；
//! 这里只约定它接收什么：任务输入、取消令牌、检查点闸门、流式片段接收端、可选的 prompt 变换。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::{CompareError, PauseGate, WorkerId};

/// 结构化的候选事件增量，字段都可能缺失或只有一部分（arguments 仍在流式到达）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateDelta {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

impl CandidateDelta {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }
}

/// 一段流式输出：文本 + 可选的结构化候选事件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    pub deltas: Option<Vec<CandidateDelta>>,
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            deltas: None,
        }
    }

    pub fn deltas(deltas: Vec<CandidateDelta>) -> Self {
        Self {
            text: String::new(),
            deltas: Some(deltas),
        }
    }
}

/// 引擎把流式片段推给它；实现需是同步且廉价的（检测结果在返回前已生效）
pub trait FragmentSink: Send + Sync {
    fn send(&self, fragment: Fragment);
}

/// 单个 worker 的 prompt 变换（随任务显式传入，不存在共享的可变钩子）
#[derive(Clone)]
pub struct PromptTransform(Arc<dyn Fn(&str) -> String + Send + Sync>);

impl PromptTransform {
    pub fn new(f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn apply(&self, prompt: &str) -> String {
        (self.0)(prompt)
    }
}

impl fmt::Debug for PromptTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PromptTransform(..)")
    }
}

/// 提交给引擎的一次任务执行
#[derive(Clone)]
pub struct TaskContext {
    pub worker_id: WorkerId,
    pub input: String,
    pub cancel: CancellationToken,
    /// 每个检查点前必须 `gate.wait_for_open().await`
    pub gate: PauseGate,
    pub sink: Arc<dyn FragmentSink>,
    pub prompt_transform: Option<PromptTransform>,
}

impl TaskContext {
    /// 经 prompt 变换后的输入
    pub fn rendered_prompt(&self) -> String {
        match &self.prompt_transform {
            Some(t) => t.apply(&self.input),
            None => self.input.clone(),
        }
    }
}

/// 执行引擎：返回最终输出，或错误（会被记录到该 worker 的 TaskResult）
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(&self, ctx: TaskContext) -> Result<String, CompareError>;
}
