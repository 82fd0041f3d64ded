//! 核心层：暂停闸门、协调器、批次汇总、状态与错误

pub mod aggregator;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod state;

pub use aggregator::{Batch, BatchStats, ResultAggregator, TaskResult};
pub use coordinator::Coordinator;
pub use error::CompareError;
pub use gate::{GateSignal, PauseGate};
pub use state::{AggregateState, CoordinatorEvent, EventView, PendingEvent, WorkerId, WorkerPending, WorkerStatus};
