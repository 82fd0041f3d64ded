//! 编排层：并发分发任务、片段管线、结果收集

pub mod pipeline;
pub mod runner;

pub use pipeline::WorkerPipeline;
pub use runner::{BatchReport, Orchestrator, OrchestratorConfig, TaskSpec};
