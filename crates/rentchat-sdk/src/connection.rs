//! 连接管理模块
//!
//! 功能包括：
//! - 单例消息通道的生命周期：建立、URL 令牌认证、关闭
//! - 连接超时与断线后的指数退避重连
//! - 入站帧解析并交给事件路由器分发
//!
//! 全局只有一条逻辑连接：Open / Connecting 期间重复 open 是无操作。
//! 所有传输层失败都在本模块边界被转成事件或布尔值，绝不向调用方抛出。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::commands::ClientCommand;
use crate::events::{EventRouter, ServerEvent};
use crate::session::SessionStore;
use crate::timer::ResettableTimer;
use crate::transport::{
    websocket_endpoint, Connector, Frame, FrameSink, FrameStream, CLOSE_ABNORMAL, CLOSE_NORMAL,
    CLOSE_POLICY_VIOLATION,
};

/// 通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
    Closing,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Closed => write!(f, "Closed"),
            ChannelState::Connecting => write!(f, "Connecting"),
            ChannelState::Open => write!(f, "Open"),
            ChannelState::Closing => write!(f, "Closing"),
        }
    }
}

/// 重连退避配置
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReconnectConfig {
    /// 退避基数（毫秒），第 n 次重连等待 base × 2^n
    pub base_delay_ms: u64,
    /// 退避上限（毫秒）
    pub max_delay_ms: u64,
    /// 连续失败多少次后放弃；之后只能由上层手动重新 open
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

/// 连接配置
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// REST base URL；通道地址由它推导（scheme 跟随安全性）
    pub base_url: String,
    /// 建连超时（秒），超时按异常断开处理
    pub connect_timeout_secs: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            connect_timeout_secs: 10,
            reconnect: ReconnectConfig::default(),
        }
    }
}

enum Outbound {
    Text(String),
    Close(u16),
}

struct Shared {
    state: ChannelState,
    /// 连续失败的重连尝试数，成功 Open 时清零
    attempts: u32,
    /// 连接代次：旧连接的回调一律按代次丢弃，防止覆盖新连接的状态
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    /// 显式 close 之后不再自动重连，下次 open 时复位
    manual_close: bool,
}

struct ConnectionInner {
    config: ConnectionConfig,
    session: Arc<dyn SessionStore>,
    router: Arc<EventRouter>,
    connector: Arc<dyn Connector>,
    shared: Mutex<Shared>,
    reconnect_timer: ResettableTimer,
}

/// 连接管理器
///
/// 克隆共享同一条逻辑连接。
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        session: Arc<dyn SessionStore>,
        router: Arc<EventRouter>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                session,
                router,
                connector,
                shared: Mutex::new(Shared {
                    state: ChannelState::Closed,
                    attempts: 0,
                    epoch: 0,
                    outbound: None,
                    manual_close: false,
                }),
                reconnect_timer: ResettableTimer::new(),
            }),
        }
    }

    /// 打开通道
    ///
    /// 已是 Open / Connecting 时是无操作（沿用现有连接，返回 true）。
    /// 没有登录令牌时记日志并返回 false，不抛错。
    pub fn open(&self) -> bool {
        let (epoch, token) = {
            let mut shared = self.inner.shared.lock();
            if matches!(shared.state, ChannelState::Open | ChannelState::Connecting) {
                debug!("已有活跃连接，忽略重复 open");
                return true;
            }
            let Some(token) = self.inner.session.token() else {
                warn!("缺少登录令牌，消息通道不会建立");
                return false;
            };
            shared.state = ChannelState::Connecting;
            shared.manual_close = false;
            shared.epoch += 1;
            (shared.epoch, token)
        };

        let url = websocket_endpoint(&self.inner.config.base_url, &token);
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_connect(epoch, url).await;
        });
        true
    }

    async fn run_connect(self, epoch: u64, url: String) {
        let timeout = Duration::from_secs(self.inner.config.connect_timeout_secs);
        let outcome = tokio::time::timeout(timeout, self.inner.connector.connect(&url)).await;
        match outcome {
            Err(_) => {
                warn!("建连超时（{}s），按异常断开处理", timeout.as_secs());
                self.handle_close(epoch, CLOSE_ABNORMAL, "connect timeout");
            }
            Ok(Err(e)) => {
                warn!("建连失败: {}", e);
                self.inner.router.dispatch(&ServerEvent::ConnectionError {
                    message: e.to_string(),
                });
                self.handle_close(epoch, CLOSE_ABNORMAL, "connect failed");
            }
            Ok(Ok((sink, stream))) => {
                self.run_channel(epoch, sink, stream).await;
            }
        }
    }

    async fn run_channel(
        self,
        epoch: u64,
        sink: Box<dyn FrameSink>,
        mut stream: Box<dyn FrameStream>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        {
            let mut shared = self.inner.shared.lock();
            if shared.epoch != epoch {
                // 握手期间被 close() 取代，丢弃这条连接
                return;
            }
            shared.state = ChannelState::Open;
            shared.attempts = 0;
            shared.outbound = Some(tx);
        }
        info!("✅ 消息通道已建立");
        self.inner.router.dispatch(&ServerEvent::ConnectionOpen {});

        let writer = tokio::spawn(async move {
            let mut sink = sink;
            while let Some(outbound) = rx.recv().await {
                match outbound {
                    Outbound::Text(text) => {
                        if let Err(e) = sink.send(text).await {
                            warn!("出站帧发送失败: {}", e);
                            break;
                        }
                    }
                    Outbound::Close(code) => {
                        let _ = sink.close(code).await;
                        break;
                    }
                }
            }
        });

        let mut close = (CLOSE_ABNORMAL, String::new());
        while let Some(frame) = stream.next().await {
            match frame {
                Frame::Text(text) => self.handle_frame(&text),
                Frame::Error(message) => {
                    // 错误本身不决定重连，等配套的关闭事件
                    error!("传输层错误: {}", message);
                    self.inner
                        .router
                        .dispatch(&ServerEvent::ConnectionError { message });
                }
                Frame::Close { code, reason } => {
                    close = (code, reason);
                    break;
                }
            }
        }

        writer.abort();
        self.handle_close(epoch, close.0, &close.1);
    }

    fn handle_frame(&self, text: &str) {
        match ServerEvent::parse(text) {
            Ok(event) => {
                debug!("收到事件: {}", event.event_type());
                self.inner.router.dispatch(&event);
            }
            Err(e) => {
                // 单帧丢弃，通道保持打开
                warn!("丢弃无法解析的入站帧: {}", e);
            }
        }
    }

    fn handle_close(&self, epoch: u64, code: u16, reason: &str) {
        let should_reconnect = {
            let mut shared = self.inner.shared.lock();
            if shared.epoch != epoch {
                return;
            }
            shared.outbound = None;
            shared.state = ChannelState::Closed;
            !shared.manual_close && code != CLOSE_NORMAL && code != CLOSE_POLICY_VIOLATION
        };

        info!("连接已关闭: code={} reason={:?}", code, reason);
        self.inner.router.dispatch(&ServerEvent::ConnectionClose {
            code,
            reason: reason.to_string(),
        });

        if should_reconnect {
            self.schedule_reconnection();
        }
    }

    fn schedule_reconnection(&self) {
        let delay = {
            let mut shared = self.inner.shared.lock();
            shared.attempts += 1;
            if shared.attempts > self.inner.config.reconnect.max_attempts {
                warn!(
                    "重连已达上限（{} 次），放弃自动重连",
                    self.inner.config.reconnect.max_attempts
                );
                return;
            }
            let reconnect = &self.inner.config.reconnect;
            let exp = reconnect
                .base_delay_ms
                .saturating_mul(1u64 << shared.attempts.min(20));
            let delay = Duration::from_millis(exp.min(reconnect.max_delay_ms));
            info!("第 {} 次重连将在 {:?} 后发起", shared.attempts, delay);
            delay
        };

        let manager = self.clone();
        self.inner.reconnect_timer.arm(delay, move || {
            manager.open();
        });
    }

    /// 发送一条出站指令
    ///
    /// 只有 Open 状态才会发送；返回 false 表示通道不可用，调用方可以
    /// 回退到 REST 提交路径。编码失败同样返回 false（记日志）。
    pub fn send(&self, command: &ClientCommand) -> bool {
        let payload = match command.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("出站指令编码失败: {}", e);
                return false;
            }
        };
        let shared = self.inner.shared.lock();
        if shared.state != ChannelState::Open {
            debug!("通道未就绪（{}），发送失败", shared.state);
            return false;
        }
        match &shared.outbound {
            Some(tx) => tx.send(Outbound::Text(payload)).is_ok(),
            None => false,
        }
    }

    /// 显式关闭
    ///
    /// Open 时用正常关闭码收尾；无论当前状态如何都会清掉本地 socket
    /// 引用并取消挂起的重连排程，之后不会再有自动重连。
    pub fn close(&self) {
        self.inner.reconnect_timer.cancel();
        let notify_aborted = {
            let mut shared = self.inner.shared.lock();
            shared.manual_close = true;
            match shared.state {
                ChannelState::Open => {
                    shared.state = ChannelState::Closing;
                    if let Some(tx) = shared.outbound.take() {
                        let _ = tx.send(Outbound::Close(CLOSE_NORMAL));
                    }
                    false
                }
                ChannelState::Connecting => {
                    // 作废握手中的连接
                    shared.epoch += 1;
                    shared.state = ChannelState::Closed;
                    shared.outbound = None;
                    true
                }
                ChannelState::Closing | ChannelState::Closed => false,
            }
        };
        if notify_aborted {
            self.inner.router.dispatch(&ServerEvent::ConnectionClose {
                code: CLOSE_NORMAL,
                reason: "closed by client".to_string(),
            });
        }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.shared.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// 当前连续失败的重连尝试数
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.shared.lock().attempts
    }
}
