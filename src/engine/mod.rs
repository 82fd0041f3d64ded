//! 执行引擎边界：引擎 trait、任务上下文、流式片段，以及脚本化 Mock 引擎

pub mod mock;
pub mod traits;

pub use mock::{ScriptStep, ScriptedEngine};
pub use traits::{CandidateDelta, ExecutionEngine, Fragment, FragmentSink, PromptTransform, TaskContext};
