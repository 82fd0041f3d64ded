//! 检查点事件检测：结构化增量缓冲 + 自由文本启发式匹配

pub mod detector;
pub mod patterns;

pub use detector::{DetectionListener, DetectorConfig, EventDetector, StreamEventDetector};
