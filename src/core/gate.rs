//! PauseGate：单个 worker 的协作式检查点闸门
//!
//! 状态：Open -> Paused -> Open（可反复），Cancelled 为终态。
//! 执行引擎在每个检查点调用 `wait_for_open().await`，暂停期间阻塞，恢复或取消时放行。
//!
//! 语义约定：
//! - `wait_for_open()` 在**调用时**捕获当前闸门；调用时是 Open，则之后即便暂停也会立即放行
//!   （暂停只影响之后到达的检查点）。
//! - 每次暂停都是一道新的屏障（generation + 1）；恢复即完成这道屏障。
//!   在第 N 次暂停期间捕获的等待，只要第 N 次暂停被恢复就放行，即便随后又开始了第 N+1 次暂停。
//! - `cancel()` 先完成当前屏障再进入 Cancelled，保证不会有等待者被永久挂起。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct GateState {
    paused: bool,
    /// 每次进入暂停 +1，用于区分不同的屏障
    generation: u64,
    cancelled: bool,
}

/// `wait_for_open` 的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateSignal {
    /// 闸门打开，可以越过检查点
    Open,
    /// 闸门已取消，调用方应尽快退出
    Cancelled,
}

impl GateSignal {
    pub fn is_cancelled(self) -> bool {
        matches!(self, GateSignal::Cancelled)
    }
}

/// 协作式暂停闸门（可 Clone，所有克隆共享同一状态）
#[derive(Clone, Debug)]
pub struct PauseGate {
    state: Arc<watch::Sender<GateState>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    /// 新建闸门，初始为 Open
    pub fn new() -> Self {
        let (tx, _) = watch::channel(GateState::default());
        Self { state: Arc::new(tx) }
    }

    /// 新建闸门并绑定上游取消信号：token 触发时闸门自动 cancel。
    ///
    /// 需要在 tokio runtime 内调用；监听任务在闸门取消后退出。
    pub fn bound_to(token: &CancellationToken) -> Self {
        let gate = Self::new();
        let watcher = gate.clone();
        let token = token.clone();
        let mut rx = gate.state.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    if watcher.cancel() {
                        tracing::debug!("Pause gate cancelled by upstream token");
                    }
                }
                _ = async {
                    let _ = rx.wait_for(|s| s.cancelled).await;
                } => {}
            }
        });
        gate
    }

    /// 返回一个在闸门打开（或取消）时完成的 future。可并发、重复调用。
    pub fn wait_for_open(&self) -> impl Future<Output = GateSignal> + Send + 'static {
        let mut rx = self.state.subscribe();
        let captured = *rx.borrow_and_update();
        async move {
            if captured.cancelled {
                return GateSignal::Cancelled;
            }
            if !captured.paused {
                return GateSignal::Open;
            }
            let released = rx
                .wait_for(|s| s.cancelled || !s.paused || s.generation != captured.generation)
                .await
                .map(|s| *s);
            match released {
                Ok(s) if s.cancelled => GateSignal::Cancelled,
                Ok(_) => GateSignal::Open,
                // 所有闸门句柄都已释放，视同取消
                Err(_) => GateSignal::Cancelled,
            }
        }
    }

    /// 设置暂停状态；返回状态是否真的发生了变化（重复暂停 / 重复恢复为 no-op）
    pub fn set_paused(&self, paused: bool) -> bool {
        self.state.send_if_modified(|s| {
            if s.cancelled || s.paused == paused {
                return false;
            }
            s.paused = paused;
            if paused {
                s.generation += 1;
            }
            true
        })
    }

    pub fn pause(&self) -> bool {
        self.set_paused(true)
    }

    pub fn resume(&self) -> bool {
        self.set_paused(false)
    }

    /// 终止闸门：先放行当前屏障，再进入 Cancelled。返回是否为首次取消。
    pub fn cancel(&self) -> bool {
        self.state.send_if_modified(|s| {
            if s.cancelled {
                return false;
            }
            s.paused = false;
            s.cancelled = true;
            true
        })
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().cancelled
    }
}
