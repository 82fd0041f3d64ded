//! 流式事件检测：把 worker 的流式片段转换为离散的检查点事件
//!
//! - 结构化增量：按 (worker, 事件 id) 缓冲，拼接 arguments 直到可解析为 JSON 后发出并移除缓冲。
//! - 无结构化增量：把文本追加到该 worker 的滚动缓冲中，用启发式模式扫描。
//!
//! 检测器从不因畸形输入失败：无法解析的参数退化为原始字符串。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::core::{PendingEvent, WorkerId};
use crate::detect::patterns::{self, Limits};
use crate::engine::{CandidateDelta, Fragment};

/// 检测器接口；Coordinator / Orchestrator 只依赖它，可替换为纯结构化策略
pub trait EventDetector: Send + Sync {
    /// 处理一个片段，返回本片段产生的已完成事件（可能为空）
    fn process_fragment(&self, worker_id: &str, fragment: &Fragment) -> Vec<PendingEvent>;

    /// worker 结束时清理其缓冲
    fn clear_worker_buffers(&self, worker_id: &str);

    /// 批次结束时清理全部缓冲
    fn clear_all(&self);
}

/// 事件检测回调（worker id 与本片段检测到的事件）
pub type DetectionListener = Arc<dyn Fn(&str, &[PendingEvent]) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// 关闭后仅使用结构化增量
    pub heuristics_enabled: bool,
    pub max_name_len: usize,
    pub max_args_len: usize,
    /// 每个 worker 自由文本滚动缓冲上限（字节）
    pub max_text_buffer: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            heuristics_enabled: true,
            max_name_len: 64,
            max_args_len: 8 * 1024,
            max_text_buffer: 16 * 1024,
        }
    }
}

impl DetectorConfig {
    fn limits(&self) -> Limits {
        Limits {
            max_name_len: self.max_name_len,
            max_args_len: self.max_args_len,
        }
    }
}

#[derive(Debug, Default)]
struct PartialEvent {
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct WorkerBuffers {
    /// 按打开顺序保存，最后一个即「当前」事件（无 id 的增量归到它）
    partial: Vec<(String, PartialEvent)>,
    text: String,
    /// 一旦收到过结构化增量，不再对该 worker 的文本做启发式扫描
    structured_seen: bool,
    /// 已发出的结构化事件 id（迟到的空收尾增量据此忽略）
    emitted: HashSet<String>,
}

impl WorkerBuffers {
    fn partial_mut(&mut self, id: &str) -> Option<&mut PartialEvent> {
        self.partial.iter_mut().find(|(k, _)| k == id).map(|(_, p)| p)
    }

    fn remove_partial(&mut self, id: &str) {
        self.partial.retain(|(k, _)| k != id);
    }
}

fn new_event_id() -> String {
    format!("evt_{}", uuid::Uuid::new_v4())
}

fn complete_arguments(raw: &str) -> Option<Value> {
    serde_json::from_str(raw.trim()).ok()
}

/// 默认检测器：结构化增量优先，启发式文本扫描兜底
pub struct StreamEventDetector {
    config: DetectorConfig,
    buffers: Mutex<HashMap<WorkerId, WorkerBuffers>>,
    listener: Option<DetectionListener>,
}

impl Default for StreamEventDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl StreamEventDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            buffers: Mutex::new(HashMap::new()),
            listener: None,
        }
    }

    /// 每个产生事件的片段都会回调一次
    pub fn with_listener(mut self, listener: DetectionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkerId, WorkerBuffers>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前未完成的结构化事件数（用于观测缓冲是否被及时清理）
    pub fn buffered_event_count(&self, worker_id: &str) -> usize {
        self.lock().get(worker_id).map(|b| b.partial.len()).unwrap_or(0)
    }

    pub fn buffered_text_len(&self, worker_id: &str) -> usize {
        self.lock().get(worker_id).map(|b| b.text.len()).unwrap_or(0)
    }

    fn process_deltas(&self, worker_id: &str, buffers: &mut WorkerBuffers, deltas: &[CandidateDelta]) -> Vec<PendingEvent> {
        let mut events = Vec::new();
        for delta in deltas {
            let explicit_id = delta.id.as_deref().filter(|id| !id.is_empty());
            let name = delta.name.as_deref().filter(|n| !n.is_empty());
            let arguments = delta.arguments.as_deref().unwrap_or("");
            if explicit_id.is_none() && name.is_none() && arguments.is_empty() {
                continue;
            }

            if let Some(id) = explicit_id {
                if name.is_none() && arguments.is_empty() && buffers.emitted.contains(id) {
                    continue;
                }
            }

            let id = match explicit_id {
                Some(id) => id.to_string(),
                None => match buffers.partial.last() {
                    Some((open, _)) => open.clone(),
                    None => new_event_id(),
                },
            };

            // 无缓冲且已完整：立即发出
            if buffers.partial_mut(&id).is_none() {
                if let (Some(name), Some(args)) = (name, complete_arguments(arguments)) {
                    buffers.emitted.insert(id.clone());
                    events.push(PendingEvent::new(worker_id, id, name, args));
                    continue;
                }
                buffers.partial.push((id.clone(), PartialEvent::default()));
            }

            let Some(entry) = buffers.partial_mut(&id) else {
                continue;
            };
            if let Some(name) = name {
                entry.name = name.to_string();
            }
            entry.arguments.push_str(arguments);

            if entry.name.is_empty() {
                // 没有名称就无法发出；超限后直接丢弃
                if entry.arguments.len() > self.config.max_args_len {
                    tracing::warn!(worker = %worker_id, event = %id, "Oversized nameless event arguments dropped");
                    buffers.remove_partial(&id);
                }
                continue;
            }
            if let Some(args) = complete_arguments(&entry.arguments) {
                events.push(PendingEvent::new(worker_id, id.clone(), entry.name.clone(), args));
                buffers.remove_partial(&id);
                buffers.emitted.insert(id.clone());
            } else if entry.arguments.len() > self.config.max_args_len {
                // 永远不会再变成合法 JSON，按原始字符串发出以释放缓冲
                tracing::warn!(worker = %worker_id, event = %id, "Oversized event arguments degraded to raw text");
                let raw = Value::String(std::mem::take(&mut entry.arguments));
                events.push(PendingEvent::new(worker_id, id.clone(), entry.name.clone(), raw));
                buffers.remove_partial(&id);
                buffers.emitted.insert(id.clone());
            }
        }
        events
    }

    fn process_text(&self, worker_id: &str, buffers: &mut WorkerBuffers, text: &str) -> Vec<PendingEvent> {
        buffers.text.push_str(text);
        let candidates = patterns::scan(&buffers.text, self.config.limits());

        if let Some(end) = candidates.iter().map(|c| c.end).max() {
            buffers.text.drain(..end);
        }
        trim_front(&mut buffers.text, self.config.max_text_buffer);

        candidates
            .into_iter()
            .map(|c| PendingEvent::new(worker_id, new_event_id(), c.name, c.arguments))
            .collect()
    }
}

/// 保留文本末尾不超过 max 字节（按字符边界）
fn trim_front(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = text.len() - max;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}

impl EventDetector for StreamEventDetector {
    fn process_fragment(&self, worker_id: &str, fragment: &Fragment) -> Vec<PendingEvent> {
        let events = {
            let mut all = self.lock();
            let buffers = all.entry(worker_id.to_string()).or_default();
            match fragment.deltas.as_deref() {
                Some(deltas) if !deltas.is_empty() => {
                    buffers.structured_seen = true;
                    buffers.text.clear();
                    self.process_deltas(worker_id, buffers, deltas)
                }
                _ if self.config.heuristics_enabled && !buffers.structured_seen && !fragment.text.is_empty() => {
                    self.process_text(worker_id, buffers, &fragment.text)
                }
                _ => Vec::new(),
            }
        };

        if !events.is_empty() {
            tracing::debug!(worker = %worker_id, count = events.len(), "Checkpoint events detected");
            if let Some(listener) = &self.listener {
                listener(worker_id, &events);
            }
        }
        events
    }

    fn clear_worker_buffers(&self, worker_id: &str) {
        self.lock().remove(worker_id);
    }

    fn clear_all(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delta(id: &str) -> CandidateDelta {
        CandidateDelta::new(id)
    }

    #[test]
    fn test_complete_delta_emits_once() {
        let d = StreamEventDetector::default();
        let f = Fragment::deltas(vec![delta("1").with_name("lookup").with_arguments(r#"{"q":"x"}"#)]);
        let events = d.process_fragment("w", &f);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "1");
        assert_eq!(events[0].name, "lookup");
        assert_eq!(events[0].worker_id, "w");
        assert_eq!(events[0].arguments, json!({"q": "x"}));
        assert_eq!(d.buffered_event_count("w"), 0);
    }

    #[test]
    fn test_split_delta_name_then_arguments() {
        let d = StreamEventDetector::default();
        let first = d.process_fragment("w", &Fragment::deltas(vec![delta("1").with_name("lookup")]));
        assert!(first.is_empty());
        assert_eq!(d.buffered_event_count("w"), 1);

        let second = d.process_fragment("w", &Fragment::deltas(vec![delta("1").with_arguments(r#"{"q":"x"}"#)]));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].name, "lookup");
        assert_eq!(second[0].arguments, json!({"q": "x"}));
        assert_eq!(d.buffered_event_count("w"), 0);
    }

    #[test]
    fn test_streamed_argument_chunks_without_ids() {
        let d = StreamEventDetector::default();
        assert!(d
            .process_fragment("w", &Fragment::deltas(vec![delta("call_7").with_name("search").with_arguments("{\"qu")]))
            .is_empty());
        let mid = CandidateDelta {
            arguments: Some("ery\": \"ru".into()),
            ..CandidateDelta::default()
        };
        assert!(d.process_fragment("w", &Fragment::deltas(vec![mid])).is_empty());
        let last = CandidateDelta {
            arguments: Some("st\"}".into()),
            ..CandidateDelta::default()
        };
        let events = d.process_fragment("w", &Fragment::deltas(vec![last]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "call_7");
        assert_eq!(events[0].arguments, json!({"query": "rust"}));
    }

    #[test]
    fn test_buffers_are_per_worker() {
        let d = StreamEventDetector::default();
        d.process_fragment("a", &Fragment::deltas(vec![delta("1").with_name("lookup")]));
        let other = d.process_fragment("b", &Fragment::deltas(vec![delta("1").with_arguments("{}")]));
        assert!(other.is_empty());
        assert_eq!(d.buffered_event_count("a"), 1);
        assert_eq!(d.buffered_event_count("b"), 1);

        d.clear_worker_buffers("a");
        assert_eq!(d.buffered_event_count("a"), 0);
        assert_eq!(d.buffered_event_count("b"), 1);
        d.clear_all();
        assert_eq!(d.buffered_event_count("b"), 0);
    }

    #[test]
    fn test_oversized_arguments_degrade_to_raw() {
        let d = StreamEventDetector::new(DetectorConfig {
            max_args_len: 10,
            ..DetectorConfig::default()
        });
        let f = Fragment::deltas(vec![delta("1").with_name("w").with_arguments("{not json at all")]);
        let events = d.process_fragment("w", &f);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].arguments, json!("{not json at all"));
        assert_eq!(d.buffered_event_count("w"), 0);
    }

    #[test]
    fn test_oversized_nameless_arguments_are_dropped() {
        let d = StreamEventDetector::new(DetectorConfig {
            max_args_len: 16,
            ..DetectorConfig::default()
        });
        for _ in 0..1000 {
            let f = Fragment::deltas(vec![delta("x").with_arguments(r#"{"aaaaaaaaaa":"#)]);
            assert!(d.process_fragment("w", &f).is_empty());
        }
        assert!(d.buffered_event_count("w") <= 1);

        // 无 id 的增量同样受限
        for _ in 0..1000 {
            let f = Fragment::deltas(vec![CandidateDelta::default().with_arguments("0123456789")]);
            assert!(d.process_fragment("w", &f).is_empty());
        }
        assert!(d.buffered_event_count("w") <= 1);
    }

    #[test]
    fn test_empty_trailing_delta_after_emit_is_ignored() {
        let d = StreamEventDetector::default();
        let done = Fragment::deltas(vec![delta("1").with_name("lookup").with_arguments(r#"{"q":"x"}"#)]);
        assert_eq!(d.process_fragment("w", &done).len(), 1);

        assert!(d.process_fragment("w", &Fragment::deltas(vec![delta("1")])).is_empty());
        assert_eq!(d.buffered_event_count("w"), 0);

        // 后续无 id 的增量开启新事件，而不是挂到已完成的 id 上
        let next = Fragment::deltas(vec![CandidateDelta::default()
            .with_name("fetch")
            .with_arguments(r#"{"url":"u"}"#)]);
        let events = d.process_fragment("w", &next);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "fetch");
        assert_ne!(events[0].id, "1");
    }

    #[test]
    fn test_mixed_heuristic_forms_in_one_fragment() {
        let d = StreamEventDetector::default();
        let text = r#"first search({"q": 1}) then <tool_call>{"name": "lookup", "arguments": {"id": 2}}</tool_call>"#;
        let events = d.process_fragment("w", &Fragment::text(text));
        let names: Vec<_> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["search", "lookup"]);
        assert_eq!(d.buffered_text_len("w"), 0);
    }

    #[test]
    fn test_heuristic_detection_across_fragments() {
        let d = StreamEventDetector::default();
        assert!(d.process_fragment("w", &Fragment::text("Checking <tool_call>{\"name\": \"lookup\", ")).is_empty());
        let events = d.process_fragment("w", &Fragment::text("\"arguments\": {\"q\": \"x\"}}</tool_call> ok"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "lookup");
        assert!(events[0].id.starts_with("evt_"));
        // 已匹配部分被消费，不会重复发出
        assert!(d.process_fragment("w", &Fragment::text(" more")).is_empty());
        assert_eq!(d.buffered_text_len("w"), " ok more".len());
    }

    #[test]
    fn test_heuristics_disabled() {
        let d = StreamEventDetector::new(DetectorConfig {
            heuristics_enabled: false,
            ..DetectorConfig::default()
        });
        assert!(d.process_fragment("w", &Fragment::text(r#"search({"q": 1})"#)).is_empty());
    }

    #[test]
    fn test_structured_worker_skips_text_heuristics() {
        let d = StreamEventDetector::default();
        d.process_fragment("w", &Fragment::deltas(vec![delta("1").with_name("a").with_arguments("{}")]));
        assert!(d.process_fragment("w", &Fragment::text(r#"search({"q": 1})"#)).is_empty());
    }

    #[test]
    fn test_text_buffer_is_bounded() {
        let d = StreamEventDetector::new(DetectorConfig {
            max_text_buffer: 32,
            ..DetectorConfig::default()
        });
        for _ in 0..10 {
            d.process_fragment("w", &Fragment::text("plain text without any call ü "));
        }
        assert!(d.buffered_text_len("w") <= 32);
    }

    #[test]
    fn test_listener_invoked_only_when_events_found() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let d = StreamEventDetector::default().with_listener(Arc::new(move |worker: &str, events: &[PendingEvent]| {
            assert_eq!(worker, "w");
            counter.fetch_add(events.len(), Ordering::SeqCst);
        }));
        d.process_fragment("w", &Fragment::text("nothing here"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        d.process_fragment("w", &Fragment::text(r#"run({"x": 1})"#));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_input_never_panics() {
        let d = StreamEventDetector::default();
        let weird = [
            Fragment::text("<tool_call>{]]]</tool_call>"),
            Fragment::text("<function=>x</function>"),
            Fragment::deltas(vec![CandidateDelta::default()]),
            Fragment::deltas(vec![delta("").with_arguments("}}}")]),
        ];
        for f in &weird {
            let _ = d.process_fragment("w", f);
        }
    }
}
