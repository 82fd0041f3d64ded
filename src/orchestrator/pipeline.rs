//! 单个 worker 的片段管线：引擎输出 -> 事件检测 -> 协调器
//!
//! 同步执行：`send` 返回时检测到的事件已写入协调器（需要时 worker 也已暂停），
//! 因此引擎在下一个检查点一定能看到这次暂停。

use std::sync::Arc;

use crate::core::{Coordinator, WorkerId};
use crate::detect::EventDetector;
use crate::engine::{Fragment, FragmentSink};

pub struct WorkerPipeline {
    worker_id: WorkerId,
    detector: Arc<dyn EventDetector>,
    coordinator: Arc<Coordinator>,
    /// 检测到事件后暂停该 worker，等待调用方放行
    auto_pause: bool,
}

impl WorkerPipeline {
    pub fn new(
        worker_id: impl Into<WorkerId>,
        detector: Arc<dyn EventDetector>,
        coordinator: Arc<Coordinator>,
        auto_pause: bool,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            detector,
            coordinator,
            auto_pause,
        }
    }
}

impl FragmentSink for WorkerPipeline {
    fn send(&self, fragment: Fragment) {
        let events = self.detector.process_fragment(&self.worker_id, &fragment);
        if events.is_empty() {
            return;
        }
        tracing::info!(
            worker = %self.worker_id,
            events = ?events.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            "Checkpoint events pending"
        );
        if !self.coordinator.append_pending_events(&self.worker_id, events) {
            return;
        }
        if self.auto_pause {
            self.coordinator.pause_worker(&self.worker_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PauseGate;
    use crate::detect::StreamEventDetector;
    use crate::engine::CandidateDelta;

    fn setup(auto_pause: bool) -> (Arc<Coordinator>, WorkerPipeline) {
        let coordinator = Arc::new(Coordinator::new());
        coordinator.register_worker("w", PauseGate::new()).unwrap();
        let detector: Arc<dyn EventDetector> = Arc::new(StreamEventDetector::default());
        let pipeline = WorkerPipeline::new("w", detector, Arc::clone(&coordinator), auto_pause);
        (coordinator, pipeline)
    }

    #[test]
    fn test_detected_events_reach_coordinator() {
        let (coordinator, pipeline) = setup(false);
        pipeline.send(Fragment::text("thinking..."));
        assert!(!coordinator.has_pending_events());

        pipeline.send(Fragment::deltas(vec![CandidateDelta::new("1")
            .with_name("lookup")
            .with_arguments(r#"{"q":"x"}"#)]));
        let pending = coordinator.pending_events("w");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "lookup");
        assert!(!coordinator.gate("w").unwrap().is_paused());
    }

    #[test]
    fn test_events_accumulate_across_fragments() {
        let (coordinator, pipeline) = setup(false);
        pipeline.send(Fragment::text(r#"a({"n": 1})"#));
        pipeline.send(Fragment::text(r#"b({"n": 2})"#));
        assert_eq!(coordinator.pending_events("w").len(), 2);
    }

    #[test]
    fn test_auto_pause_on_event() {
        let (coordinator, pipeline) = setup(true);
        pipeline.send(Fragment::text(r#"lookup({"q": "x"})"#));
        assert!(coordinator.gate("w").unwrap().is_paused());
        assert!(coordinator.get_aggregate_state().can_resume);
    }
}
