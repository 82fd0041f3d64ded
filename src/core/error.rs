//! 对比运行中的错误类型
//!
//! 只有编程误用（重复注册 worker）会作为硬错误抛给调用方；
//! 任务失败、超时、取消都会落到该 worker 的 TaskResult.error 中。

use thiserror::Error;

/// 协调器 / 编排器 / 执行引擎共用的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompareError {
    /// 同一 worker id 重复注册（调用方 bug，不可本地恢复）
    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Task timed out after {0} ms")]
    TimedOut(u64),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl CompareError {
    /// 是否属于编程误用（应立即上抛而不是记录到结果里）
    pub fn is_misuse(&self) -> bool {
        matches!(self, CompareError::DuplicateWorker(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misuse_classification() {
        assert!(CompareError::DuplicateWorker("a".into()).is_misuse());
        assert!(!CompareError::Engine("boom".into()).is_misuse());
        assert!(!CompareError::Cancelled.is_misuse());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            CompareError::DuplicateWorker("w1".into()).to_string(),
            "Worker already registered: w1"
        );
        assert_eq!(CompareError::TimedOut(1500).to_string(), "Task timed out after 1500 ms");
    }
}
