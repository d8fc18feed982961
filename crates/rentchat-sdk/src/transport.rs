//! 传输层抽象与 WebSocket 实现
//!
//! 连接管理只依赖这里的 `Connector` / `FrameSink` / `FrameStream` 三个
//! 接口，生产环境用 tokio-tungstenite，测试注入内存假传输。
//!
//! 认证没有独立的握手帧：bearer 令牌作为 URL 路径段随连接请求带上，
//! 见 `websocket_endpoint`。

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{RentChatSDKError, Result};

/// 正常关闭（不触发重连）
pub const CLOSE_NORMAL: u16 = 1000;
/// 异常断开（无关闭帧时的默认码，触发重连）
pub const CLOSE_ABNORMAL: u16 = 1006;
/// 策略违规：服务端主动拒绝，不触发重连
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// 入站传输帧
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// 一条文本帧（线上协议约定为 JSON）
    Text(String),
    /// 对端关闭
    Close { code: u16, reason: String },
    /// 传输层错误；随后流通常会终止
    Error(String),
}

/// 出站半边
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, text: String) -> Result<()>;
    async fn close(&mut self, code: u16) -> Result<()>;
}

/// 入站半边；返回 None 表示流已终止（未必有关闭帧）
#[async_trait]
pub trait FrameStream: Send {
    async fn next(&mut self) -> Option<Frame>;
}

/// 建连接口
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}

/// 由 REST base URL 推导消息通道地址
///
/// scheme 跟随 REST 端的安全性（https→wss、http→ws），令牌拼在路径末段。
pub fn websocket_endpoint(base_url: &str, token: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if trimmed.starts_with("wss://") || trimmed.starts_with("ws://") {
        trimmed.to_string()
    } else {
        format!("ws://{}", trimmed)
    };
    format!("{}/api/v1/messages/ws/{}", ws_base, token)
}

type WsInner = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// tokio-tungstenite 实现
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| RentChatSDKError::Transport(e.to_string()))?;
        let (sink, stream) = stream.split();
        Ok((Box::new(WsSink { inner: sink }), Box::new(WsStream { inner: stream })))
    }
}

struct WsSink {
    inner: futures_util::stream::SplitSink<WsInner, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| RentChatSDKError::Transport(e.to_string()))
    }

    async fn close(&mut self, code: u16) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        self.inner
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| RentChatSDKError::Transport(e.to_string()))?;
        self.inner
            .flush()
            .await
            .map_err(|e| RentChatSDKError::Transport(e.to_string()))
    }
}

struct WsStream {
    inner: futures_util::stream::SplitStream<WsInner>,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next(&mut self) -> Option<Frame> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Frame::Text(text.to_string())),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Frame::Text(text)),
                    Err(_) => {
                        debug!("忽略非 UTF-8 的二进制帧");
                        continue;
                    }
                },
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((CLOSE_ABNORMAL, String::new()));
                    return Some(Frame::Close { code, reason });
                }
                // 协议层 ping/pong 由 tungstenite 自动应答
                Ok(_) => continue,
                Err(e) => return Some(Frame::Error(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! 内存假传输：测试用来注入入站帧、观察出站帧和建连行为

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;

    /// 单次 connect 的脚本化结果
    pub(crate) enum ConnectScript {
        Succeed,
        Fail,
        /// 永不完成（配合连接超时测试）
        Hang,
    }

    pub(crate) struct FakeConnector {
        script: Mutex<VecDeque<ConnectScript>>,
        connects: AtomicU32,
        pub sent: Arc<Mutex<Vec<String>>>,
        pub closed_with: Arc<Mutex<Vec<u16>>>,
        pub last_url: Mutex<Option<String>>,
        server_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    }

    impl FakeConnector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                connects: AtomicU32::new(0),
                sent: Arc::new(Mutex::new(Vec::new())),
                closed_with: Arc::new(Mutex::new(Vec::new())),
                last_url: Mutex::new(None),
                server_tx: Mutex::new(None),
            })
        }

        /// 预排后续 connect 调用的结果；脚本耗尽后一律成功
        pub fn script(&self, outcomes: Vec<ConnectScript>) {
            self.script.lock().extend(outcomes);
        }

        pub fn connect_count(&self) -> u32 {
            self.connects.load(Ordering::SeqCst)
        }

        /// 服务端向客户端推一帧
        pub fn push_frame(&self, frame: Frame) {
            if let Some(tx) = self.server_tx.lock().as_ref() {
                let _ = tx.send(frame);
            }
        }

        pub fn push_json(&self, json: &str) {
            self.push_frame(Frame::Text(json.to_string()));
        }

        /// 服务端关闭通道
        pub fn close_channel(&self, code: u16, reason: &str) {
            self.push_frame(Frame::Close {
                code,
                reason: reason.to_string(),
            });
        }

        /// 不发关闭帧直接掐断流
        pub fn drop_channel(&self) {
            *self.server_tx.lock() = None;
        }

        /// 出站文本帧解析为 JSON 值
        pub fn sent_json(&self) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .iter()
                .map(|s| serde_json::from_str(s).expect("outbound frame should be JSON"))
                .collect()
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            *self.last_url.lock() = Some(url.to_string());
            let outcome = self.script.lock().pop_front().unwrap_or(ConnectScript::Succeed);
            match outcome {
                ConnectScript::Fail => {
                    Err(RentChatSDKError::Transport("connection refused".to_string()))
                }
                ConnectScript::Hang => futures::future::pending().await,
                ConnectScript::Succeed => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    *self.server_tx.lock() = Some(tx);
                    Ok((
                        Box::new(FakeSink {
                            sent: self.sent.clone(),
                            closed_with: self.closed_with.clone(),
                        }),
                        Box::new(FakeStream { rx }),
                    ))
                }
            }
        }
    }

    struct FakeSink {
        sent: Arc<Mutex<Vec<String>>>,
        closed_with: Arc<Mutex<Vec<u16>>>,
    }

    #[async_trait]
    impl FrameSink for FakeSink {
        async fn send(&mut self, text: String) -> Result<()> {
            self.sent.lock().push(text);
            Ok(())
        }

        async fn close(&mut self, code: u16) -> Result<()> {
            self.closed_with.lock().push(code);
            Ok(())
        }
    }

    struct FakeStream {
        rx: mpsc::UnboundedReceiver<Frame>,
    }

    #[async_trait]
    impl FrameStream for FakeStream {
        async fn next(&mut self) -> Option<Frame> {
            self.rx.recv().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_scheme_follows_base_url() {
        assert_eq!(
            websocket_endpoint("https://housing.example.com", "tok"),
            "wss://housing.example.com/api/v1/messages/ws/tok"
        );
        assert_eq!(
            websocket_endpoint("http://localhost:8000/", "tok"),
            "ws://localhost:8000/api/v1/messages/ws/tok"
        );
    }

    #[test]
    fn test_endpoint_accepts_ws_base() {
        assert_eq!(
            websocket_endpoint("wss://chat.example.com", "t"),
            "wss://chat.example.com/api/v1/messages/ws/t"
        );
    }
}
