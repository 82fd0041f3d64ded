//! Bee Compare - 多 worker 并行对比执行协调器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 暂停闸门、协调器（聚合状态与控制面）、批次结果汇总
//! - **detect**: 流式片段中的检查点事件检测（结构化增量 + 启发式文本）
//! - **engine**: 执行引擎边界与脚本化 Mock 引擎
//! - **observability**: 日志初始化
//! - **orchestrator**: 并发分发任务、片段管线、隔离失败与结果收集

pub mod config;
pub mod core;
pub mod detect;
pub mod engine;
pub mod observability;
pub mod orchestrator;

pub use crate::core::{AggregateState, Coordinator, PauseGate, ResultAggregator, TaskResult};
pub use detect::{EventDetector, StreamEventDetector};
pub use engine::ExecutionEngine;
pub use orchestrator::{Orchestrator, TaskSpec};
