//! 可重置的一次性定时器
//!
//! 重连排程和输入状态过期都需要"重新武装即取消上一次"的语义：
//! 同一个定时器再次 arm 时，上一个尚未触发的任务被中止，只有最新的
//! 窗口会真正执行回调。手动 cancel 或整体 drop 也会中止挂起的任务。

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// 一次性定时器，重复 arm 会取代（中止）上一次排程
///
/// 回调运行在 tokio 任务里，因此 arm 必须在运行时上下文中调用。
pub struct ResettableTimer {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResettableTimer {
    pub fn new() -> Self {
        Self {
            handle: Mutex::new(None),
        }
    }

    /// 在 `delay` 之后执行 `callback`，取代任何尚未触发的排程
    pub fn arm<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut handle = self.handle.lock();
        if let Some(prev) = handle.take() {
            prev.abort();
        }
        *handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        }));
    }

    /// 取消挂起的排程（若有）；对已触发或未武装的定时器是无操作
    pub fn cancel(&self) {
        if let Some(prev) = self.handle.lock().take() {
            prev.abort();
        }
    }

    /// 是否有尚未触发的排程
    pub fn is_armed(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Default for ResettableTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResettableTimer {
    fn drop(&mut self) {
        if let Some(prev) = self.handle.lock().take() {
            prev.abort();
        }
    }
}
